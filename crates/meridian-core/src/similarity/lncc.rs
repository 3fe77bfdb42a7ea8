use ndarray::{Array3, Zip};

use crate::compute::ComputeBackend;
use crate::consts::LNCC_EPSILON;

/// Per-voxel window statistics of a fixed/moving pair.
struct WindowStats {
    /// Local means of the fixed and moving images.
    fixed_mean: Array3<f64>,
    moving_mean: Array3<f64>,
    /// Local cross term and variances (sums of centred products).
    cross: Array3<f64>,
    fixed_var: Array3<f64>,
    moving_var: Array3<f64>,
}

fn window_counts(shape: (usize, usize, usize), radius: usize) -> Array3<f64> {
    let extent = |t: usize, n: usize| ((t + radius).min(n - 1) - t.saturating_sub(radius) + 1) as f64;
    Array3::from_shape_fn(shape, |(i, j, k)| {
        extent(i, shape.0) * extent(j, shape.1) * extent(k, shape.2)
    })
}

fn window_stats(
    backend: &dyn ComputeBackend,
    fixed: &Array3<f64>,
    moving: &Array3<f64>,
    radius: usize,
) -> WindowStats {
    let counts = window_counts(fixed.dim(), radius);
    let sum_f = backend.box_sum(fixed, radius);
    let sum_m = backend.box_sum(moving, radius);
    let sum_ff = backend.box_sum(&(fixed * fixed), radius);
    let sum_mm = backend.box_sum(&(moving * moving), radius);
    let sum_fm = backend.box_sum(&(fixed * moving), radius);

    let fixed_mean = &sum_f / &counts;
    let moving_mean = &sum_m / &counts;
    let cross = &sum_fm - &(&fixed_mean * &sum_m);
    let fixed_var = &sum_ff - &(&fixed_mean * &sum_f);
    let moving_var = &sum_mm - &(&moving_mean * &sum_m);
    WindowStats {
        fixed_mean,
        moving_mean,
        cross,
        fixed_var,
        moving_var,
    }
}

/// Mean local squared correlation in `[0, 1]` over windows of edge `kernel_size`.
pub fn lncc(
    backend: &dyn ComputeBackend,
    fixed: &Array3<f64>,
    moving: &Array3<f64>,
    kernel_size: usize,
) -> f64 {
    let s = window_stats(backend, fixed, moving, kernel_size / 2);
    let cc = Zip::from(&s.cross)
        .and(&s.fixed_var)
        .and(&s.moving_var)
        .map_collect(|&a, &b, &c| a * a / (b * c + LNCC_EPSILON));
    cc.mean().unwrap_or(0.0)
}

/// LNCC loss (`-lncc`) and its derivative with respect to every moving voxel.
///
/// With `A`, `B`, `C` the windowed cross term and variances, each window
/// contributes `A^2 / (BC + eps)`. Differentiating through the window sums
/// gives, per voxel `v`,
/// `dL/dJ_v = -(1/N) [ I_v S(alpha) - S(alpha Ibar) - 2 J_v S(beta) + 2 S(beta Jbar) ]`
/// where `S` is the box sum, `alpha = 2A/(BC+eps)` and `beta = A^2 B/(BC+eps)^2`.
pub fn lncc_loss_and_gradient(
    backend: &dyn ComputeBackend,
    fixed: &Array3<f64>,
    moving: &Array3<f64>,
    kernel_size: usize,
) -> (f64, Array3<f64>) {
    let radius = kernel_size / 2;
    let n = fixed.len().max(1) as f64;
    let s = window_stats(backend, fixed, moving, radius);

    let mut cc = Array3::<f64>::zeros(fixed.raw_dim());
    let mut alpha = Array3::<f64>::zeros(fixed.raw_dim());
    let mut beta = Array3::<f64>::zeros(fixed.raw_dim());
    Zip::from(&mut cc)
        .and(&mut alpha)
        .and(&mut beta)
        .and(&s.cross)
        .and(&s.fixed_var)
        .and(&s.moving_var)
        .for_each(|cc, alpha, beta, &a, &b, &c| {
            let denom = b * c + LNCC_EPSILON;
            *cc = a * a / denom;
            *alpha = 2.0 * a / denom;
            *beta = a * a * b / (denom * denom);
        });

    let s_alpha = backend.box_sum(&alpha, radius);
    let s_alpha_mean = backend.box_sum(&(&alpha * &s.fixed_mean), radius);
    let s_beta = backend.box_sum(&beta, radius);
    let s_beta_mean = backend.box_sum(&(&beta * &s.moving_mean), radius);

    let mut gradient = Array3::<f64>::zeros(fixed.raw_dim());
    Zip::from(&mut gradient)
        .and(fixed)
        .and(moving)
        .and(&s_alpha)
        .and(&s_alpha_mean)
        .and(&s_beta)
        .for_each(|g, &i, &j, &sa, &sam, &sb| {
            *g = i * sa - sam - 2.0 * j * sb;
        });
    Zip::from(&mut gradient)
        .and(&s_beta_mean)
        .for_each(|g, &sbm| *g = -(*g + 2.0 * sbm) / n);

    let loss = -cc.sum() / n;
    (loss, gradient)
}

/// Mean squared difference and its derivative with respect to the moving voxels.
pub fn mse_loss_and_gradient(fixed: &Array3<f64>, moving: &Array3<f64>) -> (f64, Array3<f64>) {
    let n = fixed.len().max(1) as f64;
    let diff = moving - fixed;
    let loss = diff.iter().map(|d| d * d).sum::<f64>() / n;
    (loss, diff.mapv(|d| 2.0 * d / n))
}
