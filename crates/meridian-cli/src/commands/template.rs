use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use meridian_core::compute::create_backend;
use meridian_core::consts::DEFAULT_FILE_PATTERN;
use meridian_core::io::save_volume;
use meridian_core::pipeline::{discover_inputs, generated_template_path, select_template, TemplateStrategy};

use super::register::TemplateArg;
use super::DeviceArg;

#[derive(Args)]
pub struct TemplateArgs {
    /// Directory of input volumes
    pub input_dir: PathBuf,

    /// Template strategy
    #[arg(long, value_enum, default_value = "average")]
    pub strategy: TemplateArg,

    /// Candidate index (with --strategy index)
    #[arg(long)]
    pub index: Option<usize>,

    /// Glob pattern selecting input files
    #[arg(long, default_value = DEFAULT_FILE_PATTERN)]
    pub pattern: String,

    /// Compute device
    #[arg(long, value_enum, default_value = "auto")]
    pub device: DeviceArg,

    /// Output file path (defaults to auto_generated_template_<strategy>.nii.gz
    /// in the input directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn run(args: &TemplateArgs) -> Result<()> {
    let strategy = match args.strategy {
        TemplateArg::Central => TemplateStrategy::Central,
        TemplateArg::Average => TemplateStrategy::Average,
        TemplateArg::Index => {
            let Some(index) = args.index else {
                bail!("--strategy index requires --index");
            };
            TemplateStrategy::Index { index }
        }
        TemplateArg::Specified => bail!("--strategy specified is only meaningful for `register`"),
    };

    let candidates = discover_inputs(&args.input_dir, &args.pattern)
        .with_context(|| format!("Failed to scan {}", args.input_dir.display()))?;
    if candidates.is_empty() {
        bail!(
            "No files matching '{}' in {}",
            args.pattern,
            args.input_dir.display()
        );
    }
    println!("Candidates: {}", candidates.len());
    println!("Strategy:   {strategy}");

    let backend = create_backend(&args.device.into());
    let template = select_template(backend.as_ref(), &strategy, &candidates)?;
    if let Some(ref source) = template.source {
        println!("Selected:   {}", source.display());
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| generated_template_path(&args.input_dir, &strategy));
    save_volume(&template.volume, &output)
        .with_context(|| format!("Failed to write template to {}", output.display()))?;
    println!("Template saved to {}", output.display());
    Ok(())
}
