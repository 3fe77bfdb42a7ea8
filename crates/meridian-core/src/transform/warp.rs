use ndarray::{Array4, ArrayViewMut1, Axis, Zip};

use crate::compute::ComputeBackend;
use crate::consts::PARALLEL_VOXEL_THRESHOLD;
use crate::error::Result;
use crate::volume::{Grid, Volume};

use super::interp::{FillPolicy, Interpolation};
use super::Transform;

/// Continuous `source` voxel indices sampled by each node of `reference`
/// under `transform`, as a `(nx, ny, nz, 3)` array.
pub fn sampling_coordinates(transform: &Transform, reference: &Grid, source: &Grid) -> Array4<f64> {
    let [nx, ny, nz] = reference.dims();
    let mut coords = Array4::<f64>::zeros((nx, ny, nz, 3));
    let parallel = reference.voxel_count() >= PARALLEL_VOXEL_THRESHOLD;

    let kernel = |(i, j, k): (usize, usize, usize), mut lane: ArrayViewMut1<f64>| {
        let p = reference.index_to_physical([i as f64, j as f64, k as f64]);
        let c = source.physical_to_index(&transform.map_point(&p));
        lane[0] = c[0];
        lane[1] = c[1];
        lane[2] = c[2];
    };
    let zip = Zip::indexed(coords.lanes_mut(Axis(3)));
    if parallel {
        zip.par_for_each(kernel);
    } else {
        zip.for_each(kernel);
    }
    coords
}

/// Resample `volume` onto `reference` under `transform`.
///
/// The input is left untouched; the result is a new volume on `reference`.
pub fn warp(
    backend: &dyn ComputeBackend,
    volume: &Volume,
    transform: &Transform,
    reference: &Grid,
    interpolation: Interpolation,
    fill: FillPolicy,
) -> Result<Volume> {
    let coords = sampling_coordinates(transform, reference, volume.grid());
    let data = backend.resample(volume.data(), &coords, interpolation, fill);
    Volume::new(data, reference.clone())
}
