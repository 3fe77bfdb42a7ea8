pub mod config;
mod lock;
mod orchestrator;
mod register;
mod report;
mod template;
mod types;

pub use config::{InversionConfig, OrchestratorConfig, RegistrationConfig};
pub use lock::{lock_path_for, OutputClaim};
pub use orchestrator::{register_directory, register_directory_reported};
pub use register::{register_one, register_one_reported, OutputPaths};
pub use report::Report;
pub use template::{
    build_average_template, discover_inputs, generated_template_path, is_excluded,
    matches_pattern, save_template, select_template, Template, TemplateStrategy,
};
pub use types::{
    NoOpReporter, OutcomeStatus, PipelineStage, ProgressReporter, RegistrationOutcome,
    RegistrationState, SkipReason,
};
