use nalgebra::Point3;

use crate::error::Result;
use crate::volume::Grid;

use super::field::{sample_onto_grid, DeformationField};
use super::Transform;

/// An ordered chain of transforms applied to points first-to-last.
///
/// `ComposedTransform::new(t1, t2)` maps `x` to `t2(t1(x))`. The registration
/// pipeline builds `[field, affine]`, i.e. `x -> affine(x + u(x))`.
#[derive(Clone, Debug)]
pub struct ComposedTransform {
    steps: Vec<Transform>,
}

impl ComposedTransform {
    pub fn new(first: Transform, second: Transform) -> Self {
        let mut steps = Vec::new();
        for t in [first, second] {
            match t {
                Transform::Composed(inner) => steps.extend(inner.steps),
                other => steps.push(other),
            }
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[Transform] {
        &self.steps
    }

    pub fn map_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.steps.iter().fold(*point, |p, t| t.map_point(&p))
    }

    /// Invert the chain at one point, undoing the steps last-to-first.
    pub fn invert_point(
        &self,
        target: &Point3<f64>,
        tolerance_mm: f64,
        max_iterations: usize,
    ) -> Result<Point3<f64>> {
        self.steps.iter().rev().try_fold(*target, |p, t| {
            t.invert_point(&p, tolerance_mm, max_iterations)
        })
    }

    /// Forward displacement `T(x) - x` tabulated on `grid`.
    pub fn to_field(&self, grid: &Grid) -> Result<DeformationField> {
        sample_onto_grid(grid.clone(), |p| Ok(self.map_point(&p)))
    }

    /// Inverse displacement `T^-1(y) - y` tabulated on `grid`.
    ///
    /// Fails with `NonInvertibleTransform` when any affine step is singular
    /// or the fixed-point solve does not converge at some node.
    pub fn inverse_field(
        &self,
        grid: &Grid,
        tolerance_mm: f64,
        max_iterations: usize,
    ) -> Result<DeformationField> {
        for step in &self.steps {
            if let Transform::Affine(a) = step {
                a.inverse()?;
            }
        }
        sample_onto_grid(grid.clone(), |y| {
            self.invert_point(&y, tolerance_mm, max_iterations)
        })
    }
}
