use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::Array3;
use rayon::prelude::*;

use crate::consts::{EPSILON, PARALLEL_VOXEL_THRESHOLD, SINGULAR_DETERMINANT};
use crate::error::{MeridianError, Result};

/// Sampling grid of a volume: shape plus the index-to-physical mapping
/// `p = origin + direction * diag(spacing) * index` (physical units are mm).
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    dims: [usize; 3],
    spacing: Vector3<f64>,
    origin: Point3<f64>,
    direction: Matrix3<f64>,
    to_physical: Matrix3<f64>,
    to_index: Matrix3<f64>,
}

impl Grid {
    pub fn new(
        dims: [usize; 3],
        spacing: Vector3<f64>,
        origin: Point3<f64>,
        direction: Matrix3<f64>,
    ) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(MeridianError::InvalidVolume(format!(
                "zero-extent grid {}x{}x{}",
                dims[0], dims[1], dims[2]
            )));
        }
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(MeridianError::InvalidVolume(format!(
                "voxel spacing must be strictly positive, got [{}, {}, {}]",
                spacing.x, spacing.y, spacing.z
            )));
        }
        let to_physical = direction * Matrix3::from_diagonal(&spacing);
        if to_physical.determinant().abs() < SINGULAR_DETERMINANT {
            return Err(MeridianError::InvalidVolume(
                "direction cosines are singular".into(),
            ));
        }
        let to_index = to_physical.try_inverse().ok_or_else(|| {
            MeridianError::InvalidVolume("direction cosines are singular".into())
        })?;
        Ok(Self {
            dims,
            spacing,
            origin,
            direction,
            to_physical,
            to_index,
        })
    }

    /// Axis-aligned grid (identity direction cosines).
    pub fn axis_aligned(dims: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Result<Self> {
        Self::new(
            dims,
            Vector3::from(spacing),
            Point3::from(origin),
            Matrix3::identity(),
        )
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    pub fn origin(&self) -> &Point3<f64> {
        &self.origin
    }

    pub fn direction(&self) -> &Matrix3<f64> {
        &self.direction
    }

    /// `direction * diag(spacing)`: maps index offsets to physical offsets.
    pub fn index_to_physical_matrix(&self) -> &Matrix3<f64> {
        &self.to_physical
    }

    /// Inverse of [`Grid::index_to_physical_matrix`].
    pub fn physical_to_index_matrix(&self) -> &Matrix3<f64> {
        &self.to_index
    }

    pub fn voxel_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn min_spacing(&self) -> f64 {
        self.spacing.min()
    }

    pub fn index_to_physical(&self, index: [f64; 3]) -> Point3<f64> {
        self.origin + self.to_physical * Vector3::from(index)
    }

    /// Continuous (fractional) index of a physical point.
    pub fn physical_to_index(&self, point: &Point3<f64>) -> [f64; 3] {
        let idx = self.to_index * (point - self.origin);
        [idx.x, idx.y, idx.z]
    }

    /// Physical position of the geometric center of the voxel lattice.
    pub fn center(&self) -> Point3<f64> {
        self.index_to_physical([
            (self.dims[0] as f64 - 1.0) / 2.0,
            (self.dims[1] as f64 - 1.0) / 2.0,
            (self.dims[2] as f64 - 1.0) / 2.0,
        ])
    }

    /// Half the physical length of the lattice diagonal.
    pub fn radius(&self) -> f64 {
        let diag = Vector3::new(
            (self.dims[0] as f64 - 1.0) * self.spacing.x,
            (self.dims[1] as f64 - 1.0) * self.spacing.y,
            (self.dims[2] as f64 - 1.0) * self.spacing.z,
        );
        (diag.norm() / 2.0).max(self.min_spacing())
    }

    /// True when both grids share shape and, within `tolerance`, geometry.
    pub fn same_geometry(&self, other: &Grid, tolerance: f64) -> bool {
        self.dims == other.dims
            && (self.spacing - other.spacing).amax() <= tolerance
            && (self.origin - other.origin).amax() <= tolerance
            && (self.direction - other.direction).amax() <= tolerance
    }
}

/// A 3D intensity volume. Data is indexed `[i, j, k]` along the grid axes.
///
/// Volumes are never mutated by registration; warping produces a new one.
#[derive(Clone, Debug)]
pub struct Volume {
    data: Array3<f32>,
    grid: Grid,
}

impl Volume {
    pub fn new(data: Array3<f32>, grid: Grid) -> Result<Self> {
        let (nx, ny, nz) = data.dim();
        if [nx, ny, nz] != grid.dims() {
            return Err(MeridianError::InvalidVolume(format!(
                "data shape {}x{}x{} does not match grid {}x{}x{}",
                nx,
                ny,
                nz,
                grid.dims[0],
                grid.dims[1],
                grid.dims[2]
            )));
        }
        Ok(Self { data, grid })
    }

    /// Axis-aligned volume with its origin at zero.
    pub fn from_array(data: Array3<f32>, spacing: [f64; 3]) -> Result<Self> {
        let (nx, ny, nz) = data.dim();
        let grid = Grid::axis_aligned([nx, ny, nz], spacing, [0.0; 3])?;
        Self::new(data, grid)
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn dims(&self) -> [usize; 3] {
        self.grid.dims()
    }

    pub fn into_parts(self) -> (Array3<f32>, Grid) {
        (self.data, self.grid)
    }

    /// Minimum and maximum finite intensity.
    pub fn intensity_range(&self) -> (f32, f32) {
        self.data
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Intensity-weighted center of mass in physical coordinates.
    ///
    /// Negative intensities are ignored. An all-zero volume reports its
    /// geometric center.
    pub fn center_of_mass(&self) -> Point3<f64> {
        let [nx, ny, nz] = self.dims();
        let accumulate = |i: usize| {
            let mut acc = [0.0f64; 4];
            for j in 0..ny {
                for k in 0..nz {
                    let w = self.data[[i, j, k]].max(0.0) as f64;
                    acc[0] += w * i as f64;
                    acc[1] += w * j as f64;
                    acc[2] += w * k as f64;
                    acc[3] += w;
                }
            }
            acc
        };
        let sum = |a: [f64; 4], b: [f64; 4]| [a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]];

        let total = if self.grid.voxel_count() >= PARALLEL_VOXEL_THRESHOLD {
            (0..nx).into_par_iter().map(accumulate).reduce(|| [0.0; 4], sum)
        } else {
            (0..nx).map(accumulate).fold([0.0; 4], sum)
        };

        if total[3] <= EPSILON {
            return self.grid.center();
        }
        self.grid.index_to_physical([
            total[0] / total[3],
            total[1] / total[3],
            total[2] / total[3],
        ])
    }
}
