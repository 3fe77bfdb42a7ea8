use nalgebra::{Matrix3, Matrix4, Point3, Vector3};

use crate::consts::SINGULAR_DETERMINANT;
use crate::error::{MeridianError, Result};

/// Homogeneous 4x4 affine map between physical spaces, `y = L x + b`.
///
/// Registration transforms map points of the fixed (template) space to the
/// moving space they should be sampled from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransform {
    matrix: Matrix4<f64>,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self::from_parts(&Matrix3::identity(), &translation)
    }

    pub fn from_parts(linear: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let mut matrix = Matrix4::identity();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(linear);
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
        Self { matrix }
    }

    /// Build from a full homogeneous matrix; the last row must be `[0 0 0 1]`.
    pub fn from_matrix(matrix: Matrix4<f64>) -> Result<Self> {
        let row = matrix.row(3);
        let homogeneous = row[0] == 0.0 && row[1] == 0.0 && row[2] == 0.0 && row[3] == 1.0;
        if !homogeneous || matrix.iter().any(|v| !v.is_finite()) {
            return Err(MeridianError::InvalidConfig(
                "affine matrix must be finite with last row [0 0 0 1]".into(),
            ));
        }
        Ok(Self { matrix })
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn linear(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    pub fn is_invertible(&self) -> bool {
        self.linear().determinant().abs() >= SINGULAR_DETERMINANT
    }

    pub fn apply(&self, point: &Point3<f64>) -> Point3<f64> {
        self.matrix.transform_point(point)
    }

    /// The transform that applies `self` first and `next` second.
    pub fn then(&self, next: &AffineTransform) -> AffineTransform {
        AffineTransform {
            matrix: next.matrix * self.matrix,
        }
    }

    /// Closed-form inverse. Fails when the linear block is singular.
    pub fn inverse(&self) -> Result<AffineTransform> {
        let linear = self.linear();
        let det = linear.determinant();
        if det.abs() < SINGULAR_DETERMINANT {
            return Err(MeridianError::NonInvertibleTransform(format!(
                "affine linear block is singular (det = {det:.3e})"
            )));
        }
        let inv = linear.try_inverse().ok_or_else(|| {
            MeridianError::NonInvertibleTransform("affine linear block is singular".into())
        })?;
        Ok(Self::from_parts(&inv, &(-(inv * self.translation()))))
    }
}

impl std::fmt::Display for AffineTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for r in 0..3 {
            let row = self.matrix.row(r);
            writeln!(
                f,
                "[{:>10.5} {:>10.5} {:>10.5} | {:>10.4}]",
                row[0], row[1], row[2], row[3]
            )?;
        }
        Ok(())
    }
}
