use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::align::{center_align, register_affine, register_deformable};
use crate::compute::ComputeBackend;
use crate::consts::{
    FORWARD_FIELD_SUFFIX, INVERSE_FIELD_SUFFIX, REGISTERED_SUFFIX, ROUND_TRIP_MIN_FRACTION,
    ROUND_TRIP_TOLERANCE_VOXELS,
};
use crate::error::{FailureKind, MeridianError, Result};
use crate::io::{load_volume, save_field, save_volume, split_volume_name, with_suffix};
use crate::similarity::normalize_intensity;
use crate::transform::{
    compose, inverse_consistency, warp, DeformationField, Interpolation, Transform,
};
use crate::volume::Volume;

use super::config::RegistrationConfig;
use super::lock::OutputClaim;
use super::types::{
    NoOpReporter, OutcomeStatus, PipelineStage, ProgressReporter, RegistrationOutcome,
    RegistrationState, SkipReason,
};

/// Artifacts written for one registered input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub registered: PathBuf,
    pub forward_field: PathBuf,
    pub inverse_field: PathBuf,
}

impl OutputPaths {
    /// `<output_dir>/<stem>.reg<ext>` and its fields, where `<ext>` follows the
    /// input (`.nii.gz` when the input extension is not a volume extension).
    pub fn for_input(input: &Path, output_dir: &Path) -> Self {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = if split_volume_name(&name).1.is_empty() {
            output_dir.join(format!("{name}.nii.gz"))
        } else {
            output_dir.join(&name)
        };
        Self::for_output(&with_suffix(&target, REGISTERED_SUFFIX))
    }

    /// Field paths that accompany a registered-volume path.
    pub fn for_output(registered: &Path) -> Self {
        let name = registered
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (stem, ext) = split_volume_name(&name);
        let ext = if ext.is_empty() { ".nii.gz" } else { ext };
        let base = stem
            .strip_suffix(&format!(".{REGISTERED_SUFFIX}"))
            .unwrap_or(stem);
        let sibling = |suffix: &str| registered.with_file_name(format!("{base}.{suffix}{ext}"));
        Self {
            registered: registered.to_path_buf(),
            forward_field: sibling(FORWARD_FIELD_SUFFIX),
            inverse_field: sibling(INVERSE_FIELD_SUFFIX),
        }
    }
}

/// Mutable bookkeeping of one run of the state machine.
struct Progress<'a> {
    state: RegistrationState,
    warnings: Vec<String>,
    inverse_consistency: Option<f64>,
    reporter: &'a dyn ProgressReporter,
}

impl Progress<'_> {
    fn stage<T>(&mut self, stage: PipelineStage, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.reporter.begin_stage(stage, None);
        let out = f();
        self.reporter.finish_stage();
        out
    }

    fn enter(&mut self, state: RegistrationState, input: &Path) {
        self.state = state;
        info!(input = %input.display(), state = %state, "Registration state");
    }
}

/// Register `input` to `template`, writing `output` and its two fields.
///
/// Never returns an error: every failure, including a panic inside a stage,
/// becomes a `Failed` outcome. An output that is claimed by another worker,
/// or already exists, yields a `Skipped` outcome.
pub fn register_one(
    input: &Path,
    template: &Volume,
    output: &Path,
    config: &RegistrationConfig,
    backend: &dyn ComputeBackend,
) -> RegistrationOutcome {
    register_one_reported(input, template, output, config, backend, &NoOpReporter)
}

/// [`register_one`] with progress reporting.
pub fn register_one_reported(
    input: &Path,
    template: &Volume,
    output: &Path,
    config: &RegistrationConfig,
    backend: &dyn ComputeBackend,
    reporter: &dyn ProgressReporter,
) -> RegistrationOutcome {
    let start = Instant::now();
    let claim = match OutputClaim::try_acquire(output) {
        Ok(Some(claim)) => claim,
        Ok(None) => {
            info!(output = %output.display(), "Output claimed by another worker, skipping");
            return RegistrationOutcome::skipped(
                input.to_path_buf(),
                output.to_path_buf(),
                SkipReason::LockContention,
                start.elapsed(),
            );
        }
        Err(e) => {
            return failed_outcome(input, output, &e, RegistrationState::Init, start, Vec::new())
        }
    };
    if output.exists() {
        claim.complete();
        info!(output = %output.display(), "Output already exists, skipping");
        return RegistrationOutcome::skipped(
            input.to_path_buf(),
            output.to_path_buf(),
            SkipReason::AlreadyRegistered,
            start.elapsed(),
        );
    }

    let mut progress = Progress {
        state: RegistrationState::Init,
        warnings: Vec::new(),
        inverse_consistency: None,
        reporter,
    };
    let paths = OutputPaths::for_output(output);
    let result = catch_unwind(AssertUnwindSafe(|| {
        execute(input, template, &paths, config, backend, &mut progress)
    }))
    .unwrap_or_else(|payload| Err(MeridianError::Pipeline(panic_message(payload.as_ref()))));

    if output.exists() {
        claim.complete();
    } else {
        drop(claim);
    }

    match result {
        Ok(()) => {
            let elapsed = start.elapsed();
            info!(
                input = %input.display(),
                elapsed_secs = elapsed.as_secs_f64(),
                "Registration complete"
            );
            RegistrationOutcome {
                input: input.to_path_buf(),
                output: output.to_path_buf(),
                status: OutcomeStatus::Success,
                failure_kind: None,
                skip_reason: None,
                message: if progress.warnings.is_empty() {
                    "registered".into()
                } else {
                    format!("registered with {} warning(s)", progress.warnings.len())
                },
                elapsed,
                state: RegistrationState::Persisted,
                warnings: progress.warnings,
                inverse_consistency: progress.inverse_consistency,
            }
        }
        Err(e) => {
            let mut outcome =
                failed_outcome(input, output, &e, progress.state, start, progress.warnings);
            outcome.inverse_consistency = progress.inverse_consistency;
            outcome
        }
    }
}

fn failed_outcome(
    input: &Path,
    output: &Path,
    error: &MeridianError,
    state: RegistrationState,
    start: Instant,
    warnings: Vec<String>,
) -> RegistrationOutcome {
    warn!(input = %input.display(), state = %state, error = %error, "Registration failed");
    RegistrationOutcome {
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        status: OutcomeStatus::Failed,
        failure_kind: Some(error.kind()),
        skip_reason: None,
        message: error.to_string(),
        elapsed: start.elapsed(),
        state,
        warnings,
        inverse_consistency: None,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic during registration: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic during registration: {s}")
    } else {
        "panic during registration".into()
    }
}

/// Any failure to turn the input file into a volume counts as an invalid volume.
fn load_moving(input: &Path) -> Result<Volume> {
    load_volume(input).map_err(|e| match e.kind() {
        FailureKind::InvalidVolume => e,
        _ => MeridianError::InvalidVolume(format!("{}: {e}", input.display())),
    })
}

fn execute(
    input: &Path,
    template: &Volume,
    paths: &OutputPaths,
    config: &RegistrationConfig,
    backend: &dyn ComputeBackend,
    progress: &mut Progress<'_>,
) -> Result<()> {
    let moving = progress.stage(PipelineStage::Loading, || load_moving(input))?;

    let (fixed_n, moving_n) = if config.similarity.normalize {
        let s = &config.similarity;
        (
            normalize_intensity(template, s.lower_percentile, s.upper_percentile)?,
            normalize_intensity(&moving, s.lower_percentile, s.upper_percentile)?,
        )
    } else {
        (template.clone(), moving.clone())
    };

    // Init -> CenterAligned
    let center = progress.stage(PipelineStage::CenterAlignment, || {
        center_align(&fixed_n, &moving_n)
    })?;
    progress.enter(RegistrationState::CenterAligned, input);

    // CenterAligned -> AffineRegistered
    let affine = progress.stage(PipelineStage::AffineRegistration, || {
        register_affine(
            backend,
            &fixed_n,
            &moving_n,
            &center,
            &config.similarity,
            &config.affine,
            config.fill,
        )
    })?;
    if !affine.converged {
        progress.warnings.push(format!(
            "ConvergenceWarning: affine stage stopped after {} iterations without converging",
            affine.iterations
        ));
    }
    progress.enter(RegistrationState::AffineRegistered, input);

    // AffineRegistered -> DeformableRegistered
    let field = if config.deformable.enabled {
        let deformable = progress.stage(PipelineStage::DeformableRegistration, || {
            let pre_warped = warp(
                backend,
                &moving_n,
                &Transform::Affine(affine.transform),
                fixed_n.grid(),
                Interpolation::Linear,
                config.fill,
            )?;
            register_deformable(
                backend,
                &fixed_n,
                &pre_warped,
                &config.similarity,
                &config.deformable,
                config.fill,
            )
        })?;
        if !deformable.converged {
            progress.warnings.push(format!(
                "ConvergenceWarning: deformable stage stopped after {} iterations without converging",
                deformable.iterations
            ));
        }
        if deformable.folding_fraction > 0.0 {
            progress.warnings.push(format!(
                "deformation folds at {:.3}% of voxels (min Jacobian {:.4})",
                deformable.folding_fraction * 100.0,
                deformable.min_jacobian
            ));
        }
        deformable.field
    } else {
        DeformationField::zeros(template.grid().clone())
    };
    progress.enter(RegistrationState::DeformableRegistered, input);

    // DeformableRegistered -> Composed
    let composed = compose(
        Transform::Field(field),
        Transform::Affine(affine.transform),
    );
    progress.enter(RegistrationState::Composed, input);

    // Composed -> Persisted
    let registered = progress.stage(PipelineStage::Composing, || {
        warp(
            backend,
            &moving,
            &Transform::Composed(composed.clone()),
            template.grid(),
            config.interpolation,
            config.fill,
        )
    })?;
    let forward = composed.to_field(template.grid())?;

    let inversion = &config.inversion;
    let inverse = progress.stage(PipelineStage::Inverting, || {
        composed.inverse_field(moving.grid(), inversion.tolerance_mm, inversion.max_iterations)
    });
    let inverse = match inverse {
        Ok(inverse) => inverse,
        Err(e) => {
            if inversion.keep_forward_on_failure {
                warn!(input = %input.display(), "Inversion failed, keeping forward outputs");
                progress.stage(PipelineStage::Writing, || {
                    save_field(&forward, &paths.forward_field)?;
                    save_volume(&registered, &paths.registered)
                })?;
            }
            return Err(e);
        }
    };

    let tolerance = ROUND_TRIP_TOLERANCE_VOXELS * template.grid().min_spacing();
    let consistency = inverse_consistency(&forward, &inverse, tolerance);
    progress.inverse_consistency = Some(consistency);
    if consistency < ROUND_TRIP_MIN_FRACTION {
        warn!(input = %input.display(), consistency, "Inverse round trip below tolerance");
        progress.warnings.push(format!(
            "inverse round trip within {tolerance:.3} mm at only {:.1}% of voxels",
            consistency * 100.0
        ));
    } else {
        info!(input = %input.display(), consistency, "Inverse round trip check passed");
    }

    progress.stage(PipelineStage::Writing, || {
        save_field(&forward, &paths.forward_field)?;
        save_field(&inverse, &paths.inverse_field)?;
        // Written last: its presence marks the input as registered.
        save_volume(&registered, &paths.registered)
    })?;
    progress.enter(RegistrationState::Persisted, input);
    Ok(())
}
