#![allow(dead_code)]

use std::path::{Path, PathBuf};

use ndarray::{Array3, Array4};

use meridian_core::align::{AffineConfig, DeformableConfig};
use meridian_core::io::save_volume;
use meridian_core::pipeline::RegistrationConfig;
use meridian_core::volume::{Grid, Volume};

/// Axis-aligned volume holding an isotropic Gaussian blob.
///
/// `center` is the blob center in voxel indices, `sigma` in voxels.
pub fn blob_volume(dims: [usize; 3], center: [f64; 3], sigma: f64) -> Volume {
    blob_volume_with_spacing(dims, [1.0; 3], center, sigma)
}

pub fn blob_volume_with_spacing(
    dims: [usize; 3],
    spacing: [f64; 3],
    center: [f64; 3],
    sigma: f64,
) -> Volume {
    let data = Array3::from_shape_fn((dims[0], dims[1], dims[2]), |(i, j, k)| {
        let d2 = (i as f64 - center[0]).powi(2)
            + (j as f64 - center[1]).powi(2)
            + (k as f64 - center[2]).powi(2);
        (-d2 / (2.0 * sigma * sigma)).exp() as f32
    });
    Volume::from_array(data, spacing).unwrap()
}

/// Smooth, non-symmetric test pattern; useful where a blob's symmetry would
/// hide errors.
pub fn textured_volume(dims: [usize; 3]) -> Volume {
    let data = Array3::from_shape_fn((dims[0], dims[1], dims[2]), |(i, j, k)| {
        let (x, y, z) = (i as f64, j as f64, k as f64);
        (0.5 + 0.25 * (0.7 * x + 0.3).sin() * (0.5 * y).cos() + 0.2 * (0.4 * z + 0.2 * x).sin())
            as f32
    });
    Volume::from_array(data, [1.0; 3]).unwrap()
}

/// Volume with the same data as `volume` on a grid shifted by `offset` mm.
pub fn with_origin(volume: &Volume, origin: [f64; 3]) -> Volume {
    let g = volume.grid();
    let grid = Grid::new(
        g.dims(),
        *g.spacing(),
        origin.into(),
        *g.direction(),
    )
    .unwrap();
    Volume::new(volume.data().clone(), grid).unwrap()
}

/// Deterministic pseudo-random values in `[-scale, scale]`.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
    }

    pub fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }
}

pub fn random_field(dims: [usize; 3], scale: f64, seed: u64) -> Array4<f64> {
    let mut rng = Lcg::new(seed);
    Array4::from_shape_simple_fn((dims[0], dims[1], dims[2], 3), || rng.next_f64() * scale)
}

pub fn random_volume(dims: [usize; 3], seed: u64) -> Array3<f64> {
    let mut rng = Lcg::new(seed);
    Array3::from_shape_simple_fn((dims[0], dims[1], dims[2]), || 0.5 + 0.5 * rng.next_f64())
}

/// Save `volume` as `<dir>/<name>` and return the path.
pub fn write_volume(dir: &Path, name: &str, volume: &Volume) -> PathBuf {
    let path = dir.join(name);
    save_volume(volume, &path).unwrap();
    path
}

/// Registration settings small enough for tests on 8^3 volumes.
pub fn fast_config() -> RegistrationConfig {
    let mut config = RegistrationConfig::default();
    config.similarity.kernel_size = 3;
    config.affine = AffineConfig {
        max_iterations: 40,
        learning_rate: 0.05,
        convergence_window: 10,
        convergence_threshold: 1e-6,
        log_interval: 10,
    };
    config.deformable = DeformableConfig {
        max_iterations: 15,
        learning_rate: 0.02,
        integration_steps: 4,
        jacobian_check_interval: 5,
        convergence_window: 10,
        ..DeformableConfig::default()
    };
    config
}
