//! Trilinear and nearest-neighbour sampling on voxel lattices.
//!
//! Positions are continuous voxel indices. The linear sampler also exposes
//! its spatial derivative and the adjoint (scatter) of vector-field sampling,
//! which the optimizers use for analytic gradients.

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

/// Tolerance (in voxels) for treating a position on the lattice boundary as inside.
const BOUNDARY_TOLERANCE: f64 = 1e-6;

/// Interpolation kernel used when resampling a volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    #[default]
    Linear,
    Nearest,
}

impl std::fmt::Display for Interpolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "Linear"),
            Self::Nearest => write!(f, "Nearest"),
        }
    }
}

/// Value assigned to samples that fall outside the source lattice.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FillPolicy {
    /// Outside samples take a constant value.
    Constant(f32),
    /// Outside samples take the value of the closest boundary voxel.
    NearestEdge,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self::Constant(0.0)
    }
}

impl std::fmt::Display for FillPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constant(v) => write!(f, "Constant ({v})"),
            Self::NearestEdge => write!(f, "Nearest Edge"),
        }
    }
}

/// True when `pos` lies within the lattice spanned by `dims`.
pub fn is_inside(pos: [f64; 3], dims: [usize; 3]) -> bool {
    (0..3).all(|a| {
        pos[a] >= -BOUNDARY_TOLERANCE && pos[a] <= (dims[a] as f64 - 1.0) + BOUNDARY_TOLERANCE
    })
}

/// Trilinear interpolation stencil around a (clamped) position.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Stencil {
    base: [usize; 3],
    upper: [usize; 3],
    frac: [f64; 3],
    /// Axes along which the position was not clamped; derivatives vanish elsewhere.
    active: [bool; 3],
}

impl Stencil {
    pub(crate) fn new(pos: [f64; 3], dims: [usize; 3]) -> Self {
        let mut base = [0usize; 3];
        let mut upper = [0usize; 3];
        let mut frac = [0.0f64; 3];
        let mut active = [false; 3];
        for a in 0..3 {
            let n = dims[a];
            if n < 2 {
                continue;
            }
            let max = (n - 1) as f64;
            let p = pos[a];
            active[a] = (0.0..=max).contains(&p);
            let clamped = p.clamp(0.0, max);
            let b = (clamped.floor() as usize).min(n - 2);
            base[a] = b;
            upper[a] = b + 1;
            frac[a] = clamped - b as f64;
        }
        Self {
            base,
            upper,
            frac,
            active,
        }
    }

    /// The eight corner indices with their interpolation weights.
    pub(crate) fn corners(&self) -> [([usize; 3], f64); 8] {
        let mut out = [([0usize; 3], 0.0f64); 8];
        for (c, slot) in out.iter_mut().enumerate() {
            let mut idx = [0usize; 3];
            let mut w = 1.0;
            for a in 0..3 {
                if (c >> a) & 1 == 1 {
                    idx[a] = self.upper[a];
                    w *= self.frac[a];
                } else {
                    idx[a] = self.base[a];
                    w *= 1.0 - self.frac[a];
                }
            }
            *slot = (idx, w);
        }
        out
    }

    /// Corner indices with the derivative of each weight along every axis.
    pub(crate) fn corner_derivatives(&self) -> [([usize; 3], [f64; 3]); 8] {
        let mut out = [([0usize; 3], [0.0f64; 3]); 8];
        for (c, slot) in out.iter_mut().enumerate() {
            let mut idx = [0usize; 3];
            let mut factors = [0.0f64; 3];
            let mut signs = [0.0f64; 3];
            for a in 0..3 {
                if (c >> a) & 1 == 1 {
                    idx[a] = self.upper[a];
                    factors[a] = self.frac[a];
                    signs[a] = 1.0;
                } else {
                    idx[a] = self.base[a];
                    factors[a] = 1.0 - self.frac[a];
                    signs[a] = -1.0;
                }
            }
            let mut d = [0.0f64; 3];
            for a in 0..3 {
                if self.active[a] {
                    let (b, c2) = ((a + 1) % 3, (a + 2) % 3);
                    d[a] = signs[a] * factors[b] * factors[c2];
                }
            }
            *slot = (idx, d);
        }
        out
    }
}

/// Sample a scalar volume at a continuous index.
pub fn sample<T: Copy + Into<f64>>(
    data: &Array3<T>,
    pos: [f64; 3],
    interpolation: Interpolation,
    fill: FillPolicy,
) -> f64 {
    let (nx, ny, nz) = data.dim();
    let dims = [nx, ny, nz];
    if let FillPolicy::Constant(value) = fill {
        if !is_inside(pos, dims) {
            return value as f64;
        }
    }
    match interpolation {
        Interpolation::Nearest => {
            let idx = [
                nearest_index(pos[0], nx),
                nearest_index(pos[1], ny),
                nearest_index(pos[2], nz),
            ];
            data[idx].into()
        }
        Interpolation::Linear => Stencil::new(pos, dims)
            .corners()
            .iter()
            .map(|&(idx, w)| w * data[idx].into())
            .sum(),
    }
}

/// Trilinear sample plus its derivative with respect to the sampling position.
///
/// Returns `(value, gradient, inside)`. Under a constant fill, outside
/// samples have zero gradient.
pub fn sample_with_gradient<T: Copy + Into<f64>>(
    data: &Array3<T>,
    pos: [f64; 3],
    fill: FillPolicy,
) -> (f64, [f64; 3], bool) {
    let (nx, ny, nz) = data.dim();
    let dims = [nx, ny, nz];
    let inside = is_inside(pos, dims);
    if let FillPolicy::Constant(value) = fill {
        if !inside {
            return (value as f64, [0.0; 3], false);
        }
    }
    let stencil = Stencil::new(pos, dims);
    let value = stencil
        .corners()
        .iter()
        .map(|&(idx, w)| w * data[idx].into())
        .sum();
    let mut grad = [0.0f64; 3];
    for (idx, d) in stencil.corner_derivatives() {
        let v: f64 = data[idx].into();
        for a in 0..3 {
            grad[a] += d[a] * v;
        }
    }
    (value, grad, inside)
}

/// Sample a vector field stored as `(nx, ny, nz, 3)`; positions outside the
/// lattice take the nearest edge value.
pub fn sample_vector<T: Copy + Into<f64>>(field: &Array4<T>, pos: [f64; 3]) -> [f64; 3] {
    let (nx, ny, nz, _) = field.dim();
    let mut out = [0.0f64; 3];
    for ([i, j, k], w) in Stencil::new(pos, [nx, ny, nz]).corners() {
        if w == 0.0 {
            continue;
        }
        for (c, o) in out.iter_mut().enumerate() {
            *o += w * field[[i, j, k, c]].into();
        }
    }
    out
}

/// Vector sample plus the spatial Jacobian `jac[c][a] = d v_c / d pos_a`.
pub fn sample_vector_with_jacobian<T: Copy + Into<f64>>(
    field: &Array4<T>,
    pos: [f64; 3],
) -> ([f64; 3], [[f64; 3]; 3]) {
    let (nx, ny, nz, _) = field.dim();
    let stencil = Stencil::new(pos, [nx, ny, nz]);
    let mut value = [0.0f64; 3];
    for ([i, j, k], w) in stencil.corners() {
        for (c, v) in value.iter_mut().enumerate() {
            *v += w * field[[i, j, k, c]].into();
        }
    }
    let mut jac = [[0.0f64; 3]; 3];
    for ([i, j, k], d) in stencil.corner_derivatives() {
        for (c, row) in jac.iter_mut().enumerate() {
            let v: f64 = field[[i, j, k, c]].into();
            for a in 0..3 {
                row[a] += d[a] * v;
            }
        }
    }
    (value, jac)
}

/// Adjoint of [`sample_vector`]: distribute `value` onto the stencil corners.
pub(crate) fn scatter_vector(target: &mut Array4<f64>, pos: [f64; 3], value: [f64; 3]) {
    let (nx, ny, nz, _) = target.dim();
    for ([i, j, k], w) in Stencil::new(pos, [nx, ny, nz]).corners() {
        if w == 0.0 {
            continue;
        }
        for (c, v) in value.iter().enumerate() {
            target[[i, j, k, c]] += w * v;
        }
    }
}

fn nearest_index(pos: f64, n: usize) -> usize {
    let max = (n - 1) as f64;
    pos.round().clamp(0.0, max) as usize
}
