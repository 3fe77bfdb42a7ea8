use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use meridian_core::pipeline::{register_directory_reported, OrchestratorConfig, TemplateStrategy};

use super::{load_orchestrator_config, DeviceArg};
use crate::progress::BarReporter;
use crate::summary::{print_registration_summary, print_report};

#[derive(Clone, Copy, ValueEnum)]
pub enum TemplateArg {
    Central,
    Average,
    Specified,
    Index,
}

#[derive(Args)]
pub struct RegisterArgs {
    /// Directory of input volumes
    pub input_dir: PathBuf,

    /// Directory for registered volumes and deformation fields
    pub output_dir: PathBuf,

    /// Run config file (TOML); command-line flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Template strategy
    #[arg(long, value_enum)]
    pub template: Option<TemplateArg>,

    /// Template volume (with --template specified)
    #[arg(long)]
    pub template_path: Option<PathBuf>,

    /// Candidate index (with --template index)
    #[arg(long)]
    pub template_index: Option<usize>,

    /// Glob pattern selecting input files
    #[arg(long)]
    pub pattern: Option<String>,

    /// Number of parallel workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Stop starting new files after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Compute device
    #[arg(long, value_enum)]
    pub device: Option<DeviceArg>,

    /// Affine iteration cap
    #[arg(long)]
    pub affine_iterations: Option<usize>,

    /// Deformable iteration cap
    #[arg(long)]
    pub deformable_iterations: Option<usize>,

    /// Skip the deformable stage
    #[arg(long)]
    pub no_deformable: bool,

    /// Write the full report as JSON to this path
    #[arg(long)]
    pub json: Option<PathBuf>,
}

pub fn run(args: &RegisterArgs) -> Result<()> {
    let config = build_config(args)?;
    print_registration_summary(&config);

    let reporter = Arc::new(BarReporter::new());
    let report = register_directory_reported(&config, reporter)
        .context("Directory registration failed")?;

    print_report(&report);

    if let Some(ref path) = args.json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        println!("Report saved to {}", path.display());
    }

    if report.failed > 0 {
        bail!("{} of {} file(s) failed", report.failed, report.total);
    }
    Ok(())
}

fn build_config(args: &RegisterArgs) -> Result<OrchestratorConfig> {
    let mut config = match args.config {
        Some(ref path) => load_orchestrator_config(path)?,
        None => OrchestratorConfig::new(&args.input_dir, &args.output_dir),
    };
    config.input_dir = args.input_dir.clone();
    config.output_dir = args.output_dir.clone();

    if let Some(template) = args.template {
        config.template = match template {
            TemplateArg::Central => TemplateStrategy::Central,
            TemplateArg::Average => TemplateStrategy::Average,
            TemplateArg::Specified => {
                let Some(ref path) = args.template_path else {
                    bail!("--template specified requires --template-path");
                };
                TemplateStrategy::Specified { path: path.clone() }
            }
            TemplateArg::Index => {
                let Some(index) = args.template_index else {
                    bail!("--template index requires --template-index");
                };
                TemplateStrategy::Index { index }
            }
        };
    }
    if let Some(ref pattern) = args.pattern {
        config.file_pattern = pattern.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.timeout.is_some() {
        config.timeout_secs = args.timeout;
    }
    let registration = &mut config.registration;
    if let Some(device) = args.device {
        registration.device = device.into();
    }
    if let Some(n) = args.affine_iterations {
        registration.affine.max_iterations = n;
    }
    if let Some(n) = args.deformable_iterations {
        registration.deformable.max_iterations = n;
    }
    if args.no_deformable {
        registration.deformable.enabled = false;
    }

    config.validate().context("Invalid registration config")?;
    Ok(config)
}
