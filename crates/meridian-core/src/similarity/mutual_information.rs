//! Global mutual information over a Parzen-windowed joint histogram.
//!
//! Each sample spreads a Gaussian over the bins around its intensity,
//! normalized to sum to one, so the histogram is smooth in the moving
//! intensities and has an analytic derivative. Bin ranges are fitted to each
//! image's own min and max and held fixed while differentiating.

use ndarray::{Array1, Array2, Array3};

use crate::consts::{EPSILON, MI_PARZEN_SIGMA_BINS};

/// Maps intensities of one image to fractional bin positions.
struct Binning {
    lo: f64,
    /// Bins per intensity unit.
    scale: f64,
    bins: usize,
    radius: isize,
}

impl Binning {
    fn fit(values: &Array3<f64>, bins: usize) -> Self {
        let (lo, hi) = values
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let span = hi - lo;
        Self {
            lo: if lo.is_finite() { lo } else { 0.0 },
            scale: if span > EPSILON { (bins - 1) as f64 / span } else { 0.0 },
            bins,
            radius: (3.0 * MI_PARZEN_SIGMA_BINS).ceil() as isize,
        }
    }

    fn width(&self) -> usize {
        2 * self.radius as usize + 1
    }

    fn position(&self, v: f64) -> f64 {
        if !v.is_finite() {
            return 0.0;
        }
        ((v - self.lo) * self.scale).clamp(0.0, (self.bins - 1) as f64)
    }

    /// Fill `weights` over the window of bins centred on `pos` and return the
    /// window's first bin. Bins outside `[0, bins)` get zero weight.
    fn window(&self, pos: f64, weights: &mut [f64]) -> isize {
        let start = pos.round() as isize - self.radius;
        let inv_var = 1.0 / (MI_PARZEN_SIGMA_BINS * MI_PARZEN_SIGMA_BINS);
        let mut sum = 0.0;
        for (offset, w) in weights.iter_mut().enumerate() {
            let bin = start + offset as isize;
            *w = if (0..self.bins as isize).contains(&bin) {
                let d = pos - bin as f64;
                (-0.5 * d * d * inv_var).exp()
            } else {
                0.0
            };
            sum += *w;
        }
        for w in weights.iter_mut() {
            *w /= sum;
        }
        start
    }
}

fn xlogx(p: f64) -> f64 {
    if p > 0.0 {
        p * p.ln()
    } else {
        0.0
    }
}

fn ln_clamped(p: f64) -> f64 {
    p.max(f64::MIN_POSITIVE).ln()
}

/// Mutual information (nats) between two equally shaped volumes.
pub fn mutual_information(fixed: &Array3<f64>, moving: &Array3<f64>, bins: usize) -> f64 {
    -mutual_information_loss_and_gradient(fixed, moving, bins).0
}

/// Negative mutual information and its derivative with respect to the
/// moving voxels.
pub fn mutual_information_loss_and_gradient(
    fixed: &Array3<f64>,
    moving: &Array3<f64>,
    bins: usize,
) -> (f64, Array3<f64>) {
    let n = fixed.len();
    let bins = bins.max(2);
    if n == 0 {
        return (0.0, Array3::zeros(moving.raw_dim()));
    }
    let fixed_bins = Binning::fit(fixed, bins);
    let moving_bins = Binning::fit(moving, bins);
    let width = fixed_bins.width();

    let mut fixed_w = vec![0.0; n * width];
    let mut moving_w = vec![0.0; n * width];
    let mut fixed_start = vec![0isize; n];
    let mut moving_start = vec![0isize; n];
    let mut moving_pos = vec![0.0; n];
    for (s, (&a, &b)) in fixed.iter().zip(moving.iter()).enumerate() {
        let lane = s * width..(s + 1) * width;
        fixed_start[s] = fixed_bins.window(fixed_bins.position(a), &mut fixed_w[lane.clone()]);
        moving_pos[s] = moving_bins.position(b);
        moving_start[s] = moving_bins.window(moving_pos[s], &mut moving_w[lane]);
    }

    let bins_in = |start: isize| {
        (0..width).filter_map(move |o| {
            let bin = start + o as isize;
            (0..bins as isize).contains(&bin).then_some((o, bin as usize))
        })
    };

    let mut joint = Array2::<f64>::zeros((bins, bins));
    let mut p_fixed = Array1::<f64>::zeros(bins);
    let mut p_moving = Array1::<f64>::zeros(bins);
    for s in 0..n {
        let wf = &fixed_w[s * width..(s + 1) * width];
        let wm = &moving_w[s * width..(s + 1) * width];
        for (oi, i) in bins_in(fixed_start[s]) {
            p_fixed[i] += wf[oi];
            for (oj, j) in bins_in(moving_start[s]) {
                joint[[i, j]] += wf[oi] * wm[oj];
            }
        }
        for (oj, j) in bins_in(moving_start[s]) {
            p_moving[j] += wm[oj];
        }
    }
    let inv_n = 1.0 / n as f64;
    joint *= inv_n;
    p_fixed *= inv_n;
    p_moving *= inv_n;

    let mi = joint.iter().copied().map(xlogx).sum::<f64>()
        - p_fixed.iter().copied().map(xlogx).sum::<f64>()
        - p_moving.iter().copied().map(xlogx).sum::<f64>();

    // dMI/db = 1/N * sum_j dw_j/db * (sum_i wf_i ln P_ij - ln Pm_j), with
    // dw_j/dpos = w_j (j - mean bin) / sigma^2 for the normalized kernel.
    let inv_var = 1.0 / (MI_PARZEN_SIGMA_BINS * MI_PARZEN_SIGMA_BINS);
    let gradient: Vec<f64> = (0..n)
        .map(|s| {
            let wf = &fixed_w[s * width..(s + 1) * width];
            let wm = &moving_w[s * width..(s + 1) * width];
            let mean_bin: f64 = bins_in(moving_start[s]).map(|(oj, j)| wm[oj] * j as f64).sum();
            let dmi: f64 = bins_in(moving_start[s])
                .map(|(oj, j)| {
                    let dw = wm[oj] * (j as f64 - mean_bin) * inv_var;
                    let log_joint: f64 = bins_in(fixed_start[s])
                        .map(|(oi, i)| wf[oi] * ln_clamped(joint[[i, j]]))
                        .sum();
                    dw * (log_joint - ln_clamped(p_moving[j]))
                })
                .sum();
            -dmi * inv_n * moving_bins.scale
        })
        .collect();

    let gradient = Array3::from_shape_vec(moving.raw_dim(), gradient)
        .unwrap_or_else(|_| Array3::zeros(moving.raw_dim()));
    (-mi, gradient)
}
