//! Spatial transforms and their algebra.
//!
//! Every transform maps a point of the fixed (reference) space to the
//! moving-space point that should be sampled there, so warping a volume by
//! `t` produces `out(x) = volume(t(x))`.

pub mod affine;
pub mod composed;
pub mod field;
pub mod interp;
pub mod warp;

use nalgebra::Point3;

use crate::error::Result;
use crate::volume::Grid;

pub use affine::AffineTransform;
pub use composed::ComposedTransform;
pub use field::{inverse_consistency, DeformationField};
pub use interp::{FillPolicy, Interpolation};
pub use warp::{sampling_coordinates, warp};

#[derive(Clone, Debug)]
pub enum Transform {
    Affine(AffineTransform),
    Field(DeformationField),
    Composed(ComposedTransform),
}

impl Transform {
    pub fn map_point(&self, point: &Point3<f64>) -> Point3<f64> {
        match self {
            Self::Affine(a) => a.apply(point),
            Self::Field(f) => f.map_point(point),
            Self::Composed(c) => c.map_point(point),
        }
    }

    pub fn invert_point(
        &self,
        target: &Point3<f64>,
        tolerance_mm: f64,
        max_iterations: usize,
    ) -> Result<Point3<f64>> {
        match self {
            Self::Affine(a) => Ok(a.inverse()?.apply(target)),
            Self::Field(f) => f.invert_point(target, tolerance_mm, max_iterations),
            Self::Composed(c) => c.invert_point(target, tolerance_mm, max_iterations),
        }
    }
}

impl From<AffineTransform> for Transform {
    fn from(t: AffineTransform) -> Self {
        Self::Affine(t)
    }
}

impl From<DeformationField> for Transform {
    fn from(f: DeformationField) -> Self {
        Self::Field(f)
    }
}

impl From<ComposedTransform> for Transform {
    fn from(c: ComposedTransform) -> Self {
        Self::Composed(c)
    }
}

/// Chain two transforms: the result maps `x` to `second(first(x))`.
pub fn compose(first: Transform, second: Transform) -> ComposedTransform {
    ComposedTransform::new(first, second)
}

/// Single field equivalent to applying `first` then `second`, tabulated on
/// `first`'s grid: `u(x) = u1(x) + u2(x + u1(x))`. The two fields may live
/// on different grids; `second` is sampled in physical space.
pub fn compose_fields(first: &DeformationField, second: &DeformationField) -> Result<DeformationField> {
    compose(Transform::Field(first.clone()), Transform::Field(second.clone())).to_field(first.grid())
}

/// Invert a transform.
///
/// Affine transforms invert in closed form. Anything containing a
/// deformation field is inverted point-wise by fixed-point iteration and
/// tabulated as a field on `domain` (the grid the inverse will be evaluated
/// on, normally the moving volume's grid).
pub fn invert(
    transform: &Transform,
    domain: &Grid,
    tolerance_mm: f64,
    max_iterations: usize,
) -> Result<Transform> {
    match transform {
        Transform::Affine(a) => Ok(Transform::Affine(a.inverse()?)),
        Transform::Field(f) => {
            let chain = ComposedTransform::new(
                Transform::Field(f.clone()),
                Transform::Affine(AffineTransform::identity()),
            );
            Ok(Transform::Field(chain.inverse_field(
                domain,
                tolerance_mm,
                max_iterations,
            )?))
        }
        Transform::Composed(c) => Ok(Transform::Field(c.inverse_field(
            domain,
            tolerance_mm,
            max_iterations,
        )?)),
    }
}
