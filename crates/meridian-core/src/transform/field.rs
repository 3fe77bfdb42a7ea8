use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::{Array3, Array4, ArrayViewMut1, Axis, Zip};

use crate::consts::PARALLEL_VOXEL_THRESHOLD;
use crate::error::{MeridianError, Result};
use crate::volume::Grid;

use super::interp::sample_vector;

/// Dense displacement field over a grid: `phi(x) = x + u(x)`, with `u` in mm.
///
/// Stored as `(nx, ny, nz, 3)`. Between grid nodes the displacement is
/// interpolated trilinearly; beyond the grid it takes the nearest edge value.
#[derive(Clone, Debug)]
pub struct DeformationField {
    grid: Grid,
    displacement: Array4<f64>,
}

impl DeformationField {
    pub fn new(grid: Grid, displacement: Array4<f64>) -> Result<Self> {
        let [nx, ny, nz] = grid.dims();
        if displacement.dim() != (nx, ny, nz, 3) {
            let shape = displacement.shape().to_vec();
            return Err(MeridianError::InvalidVolume(format!(
                "displacement shape {shape:?} does not match grid {nx}x{ny}x{nz}x3"
            )));
        }
        Ok(Self { grid, displacement })
    }

    /// The identity deformation.
    pub fn zeros(grid: Grid) -> Self {
        let [nx, ny, nz] = grid.dims();
        Self {
            grid,
            displacement: Array4::zeros((nx, ny, nz, 3)),
        }
    }

    /// Convert a displacement expressed in voxel index units of `grid` to mm.
    pub fn from_voxel_displacement(grid: Grid, voxels: &Array4<f64>) -> Result<Self> {
        let m = *grid.index_to_physical_matrix();
        let mut displacement = voxels.clone();
        for mut lane in displacement.lanes_mut(Axis(3)) {
            let v = m * Vector3::new(lane[0], lane[1], lane[2]);
            lane[0] = v.x;
            lane[1] = v.y;
            lane[2] = v.z;
        }
        Self::new(grid, displacement)
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn displacement(&self) -> &Array4<f64> {
        &self.displacement
    }

    pub fn into_parts(self) -> (Grid, Array4<f64>) {
        (self.grid, self.displacement)
    }

    pub fn displacement_at(&self, point: &Point3<f64>) -> Vector3<f64> {
        let idx = self.grid.physical_to_index(point);
        Vector3::from(sample_vector(&self.displacement, idx))
    }

    pub fn map_point(&self, point: &Point3<f64>) -> Point3<f64> {
        point + self.displacement_at(point)
    }

    /// Solve `x + u(x) = y` by the fixed-point iteration `x <- y - u(x)`.
    pub fn invert_point(
        &self,
        target: &Point3<f64>,
        tolerance_mm: f64,
        max_iterations: usize,
    ) -> Result<Point3<f64>> {
        let mut x = *target;
        for _ in 0..max_iterations {
            let next = target - self.displacement_at(&x);
            let step = (next - x).norm();
            x = next;
            if step < tolerance_mm {
                return Ok(x);
            }
        }
        Err(MeridianError::NonInvertibleTransform(format!(
            "field inversion did not converge within {max_iterations} iterations"
        )))
    }

    /// Inverse field sampled on this field's own grid.
    pub fn inverse(&self, tolerance_mm: f64, max_iterations: usize) -> Result<DeformationField> {
        sample_onto_grid(self.grid.clone(), |y| {
            self.invert_point(&y, tolerance_mm, max_iterations)
        })
    }

    /// Largest displacement magnitude, in mm.
    pub fn max_magnitude(&self) -> f64 {
        self.displacement
            .lanes(Axis(3))
            .into_iter()
            .map(|l| (l[0] * l[0] + l[1] * l[1] + l[2] * l[2]).sqrt())
            .fold(0.0, f64::max)
    }

    /// Determinant of the spatial Jacobian of `phi` at every grid node.
    ///
    /// Values at or below zero indicate folding.
    pub fn jacobian_determinant(&self) -> Array3<f64> {
        let [nx, ny, nz] = self.grid.dims();
        let to_index = *self.grid.physical_to_index_matrix();
        let disp = &self.displacement;
        let mut det = Array3::<f64>::zeros((nx, ny, nz));
        let parallel = det.len() >= PARALLEL_VOXEL_THRESHOLD;

        let kernel = |(i, j, k): (usize, usize, usize), d: &mut f64| {
            let idx = [i, j, k];
            // du_c / d index_a
            let mut du = Matrix3::<f64>::zeros();
            for a in 0..3 {
                let n = [nx, ny, nz][a];
                if n < 2 {
                    continue;
                }
                let (lo, hi) = (idx[a].saturating_sub(1), (idx[a] + 1).min(n - 1));
                let (mut lo_idx, mut hi_idx) = (idx, idx);
                lo_idx[a] = lo;
                hi_idx[a] = hi;
                let span = (hi - lo) as f64;
                for c in 0..3 {
                    let diff = disp[[hi_idx[0], hi_idx[1], hi_idx[2], c]]
                        - disp[[lo_idx[0], lo_idx[1], lo_idx[2], c]];
                    du[(c, a)] = diff / span;
                }
            }
            *d = (Matrix3::identity() + du * to_index).determinant();
        };
        let zip = Zip::indexed(&mut det);
        if parallel {
            zip.par_for_each(kernel);
        } else {
            zip.for_each(kernel);
        }
        det
    }
}

/// Fraction of `forward` grid nodes whose round trip `inverse(forward(x))`
/// returns within `tolerance_mm` of `x`.
pub fn inverse_consistency(
    forward: &DeformationField,
    inverse: &DeformationField,
    tolerance_mm: f64,
) -> f64 {
    let [nx, ny, nz] = forward.grid.dims();
    let total = nx * ny * nz;
    if total == 0 {
        return 0.0;
    }
    let mut passed = Array3::from_elem((nx, ny, nz), false);
    Zip::indexed(&mut passed).par_for_each(|(i, j, k), ok| {
        let x = forward.grid.index_to_physical([i as f64, j as f64, k as f64]);
        let back = inverse.map_point(&forward.map_point(&x));
        *ok = (back - x).norm() <= tolerance_mm;
    });
    passed.iter().filter(|&&b| b).count() as f64 / total as f64
}

/// Tabulate `map(p) - p` for every node `p` of `grid`.
///
/// Any node for which `map` fails makes the whole field non-invertible.
pub(crate) fn sample_onto_grid<F>(grid: Grid, map: F) -> Result<DeformationField>
where
    F: Fn(Point3<f64>) -> Result<Point3<f64>> + Sync,
{
    let [nx, ny, nz] = grid.dims();
    let mut displacement = Array4::<f64>::zeros((nx, ny, nz, 3));
    let mut failed = Array3::from_elem((nx, ny, nz), false);
    let parallel = grid.voxel_count() >= PARALLEL_VOXEL_THRESHOLD;

    let kernel = |(i, j, k): (usize, usize, usize), mut lane: ArrayViewMut1<f64>, bad: &mut bool| {
        let p = grid.index_to_physical([i as f64, j as f64, k as f64]);
        match map(p) {
            Ok(q) => {
                let d = q - p;
                lane[0] = d.x;
                lane[1] = d.y;
                lane[2] = d.z;
            }
            Err(_) => *bad = true,
        }
    };
    let zip = Zip::indexed(displacement.lanes_mut(Axis(3))).and(&mut failed);
    if parallel {
        zip.par_for_each(kernel);
    } else {
        zip.for_each(kernel);
    }

    let failures = failed.iter().filter(|&&b| b).count();
    if failures > 0 {
        return Err(MeridianError::NonInvertibleTransform(format!(
            "{failures} of {} grid nodes failed to converge",
            grid.voxel_count()
        )));
    }
    DeformationField::new(grid, displacement)
}
