use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Stage of a registration run, used for progress reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Discovering,
    BuildingTemplate,
    Loading,
    CenterAlignment,
    AffineRegistration,
    DeformableRegistration,
    Composing,
    Inverting,
    Writing,
    Registering,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovering => write!(f, "Discovering inputs"),
            Self::BuildingTemplate => write!(f, "Building template"),
            Self::Loading => write!(f, "Loading volume"),
            Self::CenterAlignment => write!(f, "Aligning centers"),
            Self::AffineRegistration => write!(f, "Affine registration"),
            Self::DeformableRegistration => write!(f, "Deformable registration"),
            Self::Composing => write!(f, "Composing transforms"),
            Self::Inverting => write!(f, "Inverting transform"),
            Self::Writing => write!(f, "Writing outputs"),
            Self::Registering => write!(f, "Registering volumes"),
        }
    }
}

/// Thread-safe progress reporting.
///
/// Implementors can use this to drive progress bars, logging, or any other
/// UI feedback. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    /// A new stage has started. `total_items` is the number of work items in
    /// this stage (e.g., file count), if known.
    fn begin_stage(&self, _stage: PipelineStage, _total_items: Option<usize>) {}

    /// One work item within the current stage has completed.
    fn advance(&self, _items_done: usize) {}

    /// The current stage is finished.
    fn finish_stage(&self) {}
}

/// No-op progress reporter, used when a caller does not supply one.
pub struct NoOpReporter;
impl ProgressReporter for NoOpReporter {}

/// States of the per-volume registration state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Init,
    CenterAligned,
    AffineRegistered,
    DeformableRegistered,
    Composed,
    Persisted,
    Failed,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::CenterAligned => write!(f, "CenterAligned"),
            Self::AffineRegistered => write!(f, "AffineRegistered"),
            Self::DeformableRegistered => write!(f, "DeformableRegistered"),
            Self::Composed => write!(f, "Composed"),
            Self::Persisted => write!(f, "Persisted"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a file was not processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Another worker holds the claim on the output.
    LockContention,
    /// The output already exists.
    AlreadyRegistered,
    /// The run deadline passed before the file was started.
    DeadlineReached,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockContention => write!(f, "output claimed by another worker"),
            Self::AlreadyRegistered => write!(f, "output already exists"),
            Self::DeadlineReached => write!(f, "run deadline reached"),
        }
    }
}

/// Result of one per-volume registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    pub input: PathBuf,
    pub output: PathBuf,
    pub status: OutcomeStatus,
    pub failure_kind: Option<FailureKind>,
    pub skip_reason: Option<SkipReason>,
    pub message: String,
    pub elapsed: Duration,
    /// Last state the state machine reached.
    pub state: RegistrationState,
    /// Non-fatal conditions such as optimizer non-convergence.
    pub warnings: Vec<String>,
    /// Fraction of voxels passing the forward/inverse round trip, when computed.
    pub inverse_consistency: Option<f64>,
}

impl RegistrationOutcome {
    pub fn success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub(crate) fn skipped(
        input: PathBuf,
        output: PathBuf,
        reason: SkipReason,
        elapsed: Duration,
    ) -> Self {
        Self {
            input,
            output,
            status: OutcomeStatus::Skipped,
            failure_kind: None,
            skip_reason: Some(reason),
            message: reason.to_string(),
            elapsed,
            state: RegistrationState::Init,
            warnings: Vec::new(),
            inverse_consistency: None,
        }
    }
}
