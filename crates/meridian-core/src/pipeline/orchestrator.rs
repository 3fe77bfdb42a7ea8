use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::compute::create_backend;
use crate::consts::SUMMARY_FILE_NAME;
use crate::error::Result;
use crate::volume::Volume;

use super::config::OrchestratorConfig;
use super::register::{register_one, OutputPaths};
use super::report::Report;
use super::template::{discover_inputs, save_template, select_template};
use super::types::{NoOpReporter, PipelineStage, ProgressReporter, RegistrationOutcome, SkipReason};

/// Register every matching volume in `config.input_dir` to a common template.
pub fn register_directory(config: &OrchestratorConfig) -> Result<Report> {
    register_directory_reported(config, Arc::new(NoOpReporter))
}

/// [`register_directory`] with a thread-safe progress reporter.
///
/// Per-file failures never abort the run; they are recorded in the report.
/// Errors are returned only for run-level problems: an invalid configuration,
/// a missing input directory or a template that cannot be produced.
pub fn register_directory_reported(
    config: &OrchestratorConfig,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<Report> {
    config.validate()?;
    let start = Instant::now();

    reporter.begin_stage(PipelineStage::Discovering, None);
    let candidates = discover_inputs(&config.input_dir, &config.file_pattern)?;
    reporter.finish_stage();
    info!(
        input_dir = %config.input_dir.display(),
        pattern = %config.file_pattern,
        candidates = candidates.len(),
        "Discovered inputs"
    );

    if candidates.is_empty() {
        warn!(input_dir = %config.input_dir.display(), "No input files to register");
        let mut report = Report::from_outcomes(
            Vec::new(),
            None,
            config.template.to_string(),
            start.elapsed(),
        );
        report.errors.push(format!(
            "no files matching '{}' in {}",
            config.file_pattern,
            config.input_dir.display()
        ));
        return Ok(report);
    }

    std::fs::create_dir_all(&config.output_dir)?;

    reporter.begin_stage(PipelineStage::BuildingTemplate, None);
    let template = {
        let backend = create_backend(&config.registration.device);
        select_template(backend.as_ref(), &config.template, &candidates)?
    };
    let template_path = match &template.source {
        Some(source) => source.clone(),
        None => save_template(&template, &config.output_dir, &config.template)?,
    };
    reporter.finish_stage();

    let deadline = config.timeout_secs.map(Duration::from_secs);
    let outcomes = run_workers(config, &template.volume, &candidates, start, deadline, &reporter);

    let mut report = Report::from_outcomes(
        outcomes,
        Some(template_path),
        config.template.to_string(),
        start.elapsed(),
    );
    if config.sort_results {
        report.sort_by_input();
    }
    report.write_summary(&config.output_dir.join(SUMMARY_FILE_NAME))?;

    info!(
        total = report.total,
        successful = report.successful,
        failed = report.failed,
        skipped = report.skipped,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "Directory registration complete"
    );
    Ok(report)
}

/// Fan the candidates out over `config.workers` threads and collect one
/// outcome per candidate.
fn run_workers(
    config: &OrchestratorConfig,
    template: &Volume,
    candidates: &[PathBuf],
    start: Instant,
    deadline: Option<Duration>,
    reporter: &Arc<dyn ProgressReporter>,
) -> Vec<RegistrationOutcome> {
    let total = candidates.len();
    let workers = config.workers.min(total).max(1);
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<RegistrationOutcome>();

    reporter.begin_stage(PipelineStage::Registering, Some(total));
    info!(files = total, workers, "Registering volumes");

    let outcomes = std::thread::scope(|scope| {
        for worker in 0..workers {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || {
                let backend = create_backend(&config.registration.device);
                info!(worker, device = backend.name(), "Worker started");
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(input) = candidates.get(index) else {
                        break;
                    };
                    let output = OutputPaths::for_input(input, &config.output_dir).registered;
                    let outcome = if deadline.is_some_and(|d| start.elapsed() >= d) {
                        RegistrationOutcome::skipped(
                            input.clone(),
                            output,
                            SkipReason::DeadlineReached,
                            Duration::ZERO,
                        )
                    } else {
                        register_one(
                            input,
                            template,
                            &output,
                            &config.registration,
                            backend.as_ref(),
                        )
                    };
                    if tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut collected = Vec::with_capacity(total);
        for outcome in rx {
            info!(
                input = %outcome.input.display(),
                status = %outcome.status,
                elapsed_secs = outcome.elapsed.as_secs_f64(),
                "File finished"
            );
            collected.push(outcome);
            reporter.advance(collected.len());
        }
        collected
    });

    reporter.finish_stage();
    outcomes
}
