pub mod lncc;
pub mod mutual_information;
pub mod regularization;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::compute::ComputeBackend;
use crate::consts::{DEFAULT_LNCC_KERNEL_SIZE, DEFAULT_MIN_OVERLAP, DEFAULT_MI_BINS, EPSILON};
use crate::error::{MeridianError, Result};
use crate::volume::Volume;

pub use lncc::{lncc, lncc_loss_and_gradient, mse_loss_and_gradient};
pub use mutual_information::{mutual_information, mutual_information_loss_and_gradient};
pub use regularization::{gradient_penalty, regularization, smoothness_penalty};

/// Image similarity metric driving the optimizers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Local normalized cross-correlation.
    #[default]
    Lncc,
    /// Mean squared intensity difference.
    Mse,
    /// Global mutual information; suited to inputs of different contrast.
    MutualInformation,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lncc => write!(f, "LNCC"),
            Self::Mse => write!(f, "MSE"),
            Self::MutualInformation => write!(f, "MI"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub metric: Metric,
    /// LNCC window edge length in voxels (odd).
    pub kernel_size: usize,
    /// Histogram bins per intensity axis for mutual information.
    pub histogram_bins: usize,
    /// Minimum fraction of fixed voxels that must sample inside the moving volume.
    pub min_overlap: f64,
    /// Rescale intensities to `[0, 1]` between two percentiles before optimizing.
    pub normalize: bool,
    pub lower_percentile: f64,
    pub upper_percentile: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Lncc,
            kernel_size: DEFAULT_LNCC_KERNEL_SIZE,
            histogram_bins: DEFAULT_MI_BINS,
            min_overlap: DEFAULT_MIN_OVERLAP,
            normalize: true,
            lower_percentile: 0.5,
            upper_percentile: 99.5,
        }
    }
}

/// Loss and its derivative with respect to each warped-moving voxel.
#[derive(Clone, Debug)]
pub struct SimilarityValue {
    pub loss: f64,
    pub gradient: Array3<f64>,
    pub overlap: f64,
}

/// Fraction of `true` entries in an inside-mask.
pub fn overlap_fraction(inside: &Array3<bool>) -> f64 {
    if inside.is_empty() {
        return 0.0;
    }
    inside.iter().filter(|&&b| b).count() as f64 / inside.len() as f64
}

/// Evaluate the configured metric between `fixed` and `warped`.
///
/// Fails with `DegenerateOverlap` when fewer than `min_overlap` of the
/// warped samples came from inside the moving volume.
pub fn evaluate(
    backend: &dyn ComputeBackend,
    config: &SimilarityConfig,
    fixed: &Array3<f64>,
    warped: &Array3<f64>,
    inside: &Array3<bool>,
) -> Result<SimilarityValue> {
    let overlap = overlap_fraction(inside);
    if overlap < config.min_overlap.max(EPSILON) {
        return Err(MeridianError::DegenerateOverlap { overlap });
    }
    let (loss, gradient) = match config.metric {
        Metric::Lncc => lncc_loss_and_gradient(backend, fixed, warped, config.kernel_size),
        Metric::Mse => mse_loss_and_gradient(fixed, warped),
        Metric::MutualInformation => {
            mutual_information_loss_and_gradient(fixed, warped, config.histogram_bins)
        }
    };
    Ok(SimilarityValue {
        loss,
        gradient,
        overlap,
    })
}

/// Intensity at the given percentile (0-100) of the finite samples.
pub fn percentile(data: &Array3<f32>, pct: f64) -> Option<f32> {
    let mut values: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let t = (rank - lo as f64) as f32;
    Some(values[lo] * (1.0 - t) + values[hi] * t)
}

/// Window intensities to `[0, 1]` between two percentiles, clipping outside.
///
/// Non-finite samples become zero. A flat volume maps to all zeros.
pub fn normalize_intensity(volume: &Volume, lower_pct: f64, upper_pct: f64) -> Result<Volume> {
    let lo = percentile(volume.data(), lower_pct).unwrap_or(0.0);
    let hi = percentile(volume.data(), upper_pct).unwrap_or(0.0);
    let span = hi - lo;
    let data = volume.data().mapv(|v| {
        if !v.is_finite() || span <= f32::EPSILON {
            0.0
        } else {
            ((v - lo) / span).clamp(0.0, 1.0)
        }
    });
    Volume::new(data, volume.grid().clone())
}
