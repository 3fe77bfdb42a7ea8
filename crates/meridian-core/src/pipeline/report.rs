use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::write_atomically;

use super::types::{OutcomeStatus, RegistrationOutcome};

/// Aggregate result of a directory run. Every candidate appears exactly once
/// in `file_results`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Report {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// One line per failed file, plus run-level problems.
    pub errors: Vec<String>,
    pub file_results: Vec<RegistrationOutcome>,
    pub template: Option<PathBuf>,
    pub template_strategy: String,
    pub elapsed: Duration,
}

impl Report {
    pub fn from_outcomes(
        outcomes: Vec<RegistrationOutcome>,
        template: Option<PathBuf>,
        template_strategy: String,
        elapsed: Duration,
    ) -> Self {
        let count = |status: OutcomeStatus| outcomes.iter().filter(|o| o.status == status).count();
        let errors = outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .map(|o| {
                let kind = o
                    .failure_kind
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "Error".into());
                format!("{}: {kind}: {}", o.input.display(), o.message)
            })
            .collect();
        Self {
            total: outcomes.len(),
            successful: count(OutcomeStatus::Success),
            failed: count(OutcomeStatus::Failed),
            skipped: count(OutcomeStatus::Skipped),
            errors,
            file_results: outcomes,
            template,
            template_strategy,
            elapsed,
        }
    }

    /// Sort the per-file results by input path.
    pub fn sort_by_input(&mut self) {
        self.file_results.sort_by(|a, b| a.input.cmp(&b.input));
    }

    /// Human-readable run summary.
    pub fn render_summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Registration summary");
        let _ = writeln!(s, "====================");
        let template = self
            .template
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".into());
        let _ = writeln!(s, "Template:    {template} [{}]", self.template_strategy);
        let _ = writeln!(s, "Total:       {}", self.total);
        let _ = writeln!(s, "Successful:  {}", self.successful);
        let _ = writeln!(s, "Failed:      {}", self.failed);
        let _ = writeln!(s, "Skipped:     {}", self.skipped);
        let _ = writeln!(s, "Elapsed:     {:.1}s", self.elapsed.as_secs_f64());
        let _ = writeln!(s);
        for o in &self.file_results {
            let name = o
                .input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| o.input.display().to_string());
            let detail = match o.status {
                OutcomeStatus::Success => o.output.display().to_string(),
                OutcomeStatus::Failed => {
                    let kind = o.failure_kind.map(|k| k.to_string()).unwrap_or_default();
                    format!("{kind}: {}", o.message)
                }
                OutcomeStatus::Skipped => o.message.clone(),
            };
            let _ = writeln!(
                s,
                "{:<8} {:>8.1}s  {name}  {detail}",
                o.status.to_string().to_uppercase(),
                o.elapsed.as_secs_f64()
            );
            for w in &o.warnings {
                let _ = writeln!(s, "{:>19}{w}", "warning: ");
            }
        }
        if !self.errors.is_empty() {
            let _ = writeln!(s);
            let _ = writeln!(s, "Errors:");
            for e in &self.errors {
                let _ = writeln!(s, "  {e}");
            }
        }
        s
    }

    /// Write [`Report::render_summary`] to `path`.
    pub fn write_summary(&self, path: &Path) -> Result<()> {
        let text = self.render_summary();
        write_atomically(path, |file| {
            file.write_all(text.as_bytes())?;
            Ok(())
        })
    }
}
