use std::sync::Arc;

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transform::interp::{FillPolicy, Interpolation};

use super::cpu::CpuBackend;

/// Which compute device a worker should use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePreference {
    /// Use an accelerator when one is available, otherwise the CPU.
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "Auto"),
            Self::Cpu => write!(f, "CPU"),
            Self::Gpu => write!(f, "GPU"),
        }
    }
}

/// Trilinear samples of a source volume together with their spatial
/// derivatives (in source voxel units).
#[derive(Clone, Debug)]
pub struct SampledGradient {
    pub values: Array3<f64>,
    /// `(nx, ny, nz, 3)` derivative of each sample with respect to its position.
    pub gradient: Array4<f64>,
    /// Whether each sample fell inside the source lattice.
    pub inside: Array3<bool>,
}

/// Numerical kernels used by the registration stages.
///
/// Sampling coordinates are `(nx, ny, nz, 3)` arrays of continuous voxel
/// indices into the source volume; the output takes the coordinate array's
/// spatial shape.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Sum over a `(2r+1)^3` box around every voxel, clipped at the borders.
    fn box_sum(&self, input: &Array3<f64>, radius: usize) -> Array3<f64>;

    /// Resample `source` at the given coordinates.
    fn resample(
        &self,
        source: &Array3<f32>,
        coords: &Array4<f64>,
        interpolation: Interpolation,
        fill: FillPolicy,
    ) -> Array3<f32>;

    /// Trilinear resample that also returns the positional derivative of every sample.
    fn resample_with_gradient(
        &self,
        source: &Array3<f32>,
        coords: &Array4<f64>,
        fill: FillPolicy,
    ) -> SampledGradient;
}

/// Resolve a device preference to a backend.
///
/// No accelerator backend ships with this build, so `Gpu` falls back to the
/// CPU with a warning and `Auto` resolves to the CPU silently.
pub fn create_backend(preference: &DevicePreference) -> Arc<dyn ComputeBackend> {
    match preference {
        DevicePreference::Gpu => {
            warn!("No GPU compute backend available, falling back to CPU");
        }
        DevicePreference::Auto | DevicePreference::Cpu => {}
    }
    let backend = CpuBackend;
    debug!(device = backend.name(), "Compute backend resolved");
    Arc::new(backend)
}
