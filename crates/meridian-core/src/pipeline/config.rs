use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::align::{AffineConfig, DeformableConfig};
use crate::compute::DevicePreference;
use crate::consts::{
    DEFAULT_FILE_PATTERN, DEFAULT_INVERSION_ITERATIONS, DEFAULT_INVERSION_TOLERANCE_MM,
    DEFAULT_WORKERS,
};
use crate::error::{MeridianError, Result};
use crate::similarity::SimilarityConfig;
use crate::transform::{FillPolicy, Interpolation};

use super::template::TemplateStrategy;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InversionConfig {
    /// Fixed-point convergence tolerance, in mm.
    pub tolerance_mm: f64,
    pub max_iterations: usize,
    /// Keep the registered volume and forward field when inversion fails.
    pub keep_forward_on_failure: bool,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            tolerance_mm: DEFAULT_INVERSION_TOLERANCE_MM,
            max_iterations: DEFAULT_INVERSION_ITERATIONS,
            keep_forward_on_failure: true,
        }
    }
}

/// Settings for registering one moving volume to a template.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub device: DevicePreference,
    pub similarity: SimilarityConfig,
    pub affine: AffineConfig,
    pub deformable: DeformableConfig,
    pub inversion: InversionConfig,
    /// Interpolation used for the final registered volume.
    pub interpolation: Interpolation,
    pub fill: FillPolicy,
}

impl RegistrationConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(MeridianError::InvalidConfig(msg));
        let s = &self.similarity;
        if s.kernel_size == 0 || s.kernel_size % 2 == 0 {
            return invalid(format!("kernel_size must be odd and positive, got {}", s.kernel_size));
        }
        if s.histogram_bins < 4 {
            return invalid(format!("histogram_bins must be at least 4, got {}", s.histogram_bins));
        }
        if !(0.0..=1.0).contains(&s.min_overlap) {
            return invalid(format!("min_overlap must lie in [0, 1], got {}", s.min_overlap));
        }
        if !(0.0..=100.0).contains(&s.lower_percentile)
            || !(0.0..=100.0).contains(&s.upper_percentile)
            || s.lower_percentile >= s.upper_percentile
        {
            return invalid(format!(
                "percentiles must satisfy 0 <= lower < upper <= 100, got {} and {}",
                s.lower_percentile, s.upper_percentile
            ));
        }
        if self.affine.max_iterations == 0 {
            return invalid("affine.max_iterations must be positive".into());
        }
        if !(self.affine.learning_rate > 0.0) {
            return invalid(format!(
                "affine.learning_rate must be positive, got {}",
                self.affine.learning_rate
            ));
        }
        let d = &self.deformable;
        if d.enabled {
            if d.max_iterations == 0 {
                return invalid("deformable.max_iterations must be positive".into());
            }
            if !(d.learning_rate > 0.0) {
                return invalid(format!(
                    "deformable.learning_rate must be positive, got {}",
                    d.learning_rate
                ));
            }
        }
        if d.smoothness_weight < 0.0 || d.gradient_weight < 0.0 {
            return invalid("penalty weights must be non-negative".into());
        }
        if d.integration_steps > 16 {
            return invalid(format!(
                "deformable.integration_steps must be at most 16, got {}",
                d.integration_steps
            ));
        }
        if !(self.inversion.tolerance_mm > 0.0) || self.inversion.max_iterations == 0 {
            return invalid("inversion tolerance and iteration cap must be positive".into());
        }
        Ok(())
    }
}

fn default_file_pattern() -> String {
    DEFAULT_FILE_PATTERN.to_string()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_sort_results() -> bool {
    true
}

/// Settings for one directory-level registration run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub template: TemplateStrategy,
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Stop starting new files once this many seconds have elapsed.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Report outcomes sorted by input path.
    #[serde(default = "default_sort_results")]
    pub sort_results: bool,
    #[serde(default)]
    pub registration: RegistrationConfig,
}

impl OrchestratorConfig {
    pub fn new(input_dir: impl AsRef<Path>, output_dir: impl AsRef<Path>) -> Self {
        Self {
            input_dir: input_dir.as_ref().to_path_buf(),
            output_dir: output_dir.as_ref().to_path_buf(),
            template: TemplateStrategy::default(),
            file_pattern: default_file_pattern(),
            workers: default_workers(),
            timeout_secs: None,
            sort_results: true,
            registration: RegistrationConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(MeridianError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        if self.file_pattern.is_empty() {
            return Err(MeridianError::InvalidConfig(
                "file_pattern must not be empty".into(),
            ));
        }
        self.registration.validate()
    }
}
