use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use meridian_core::compute::create_backend;
use meridian_core::io::load_volume;
use meridian_core::pipeline::{register_one_reported, OutputPaths, RegistrationConfig};

use super::{load_registration_config, DeviceArg};
use crate::progress::BarReporter;
use crate::summary::print_outcome;

#[derive(Args)]
pub struct RegisterOneArgs {
    /// Moving volume
    pub moving: PathBuf,

    /// Template (fixed) volume
    pub template: PathBuf,

    /// Registered output volume; fields are written next to it
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Registration config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Compute device
    #[arg(long, value_enum)]
    pub device: Option<DeviceArg>,

    /// Skip the deformable stage
    #[arg(long)]
    pub no_deformable: bool,
}

pub fn run(args: &RegisterOneArgs) -> Result<()> {
    let mut config = match args.config {
        Some(ref path) => load_registration_config(path)?,
        None => RegistrationConfig::default(),
    };
    if let Some(device) = args.device {
        config.device = device.into();
    }
    if args.no_deformable {
        config.deformable.enabled = false;
    }
    config.validate().context("Invalid registration config")?;

    let output = match args.output {
        Some(ref path) => path.clone(),
        None => {
            let dir = args
                .moving
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default();
            OutputPaths::for_input(&args.moving, &dir).registered
        }
    };

    let template = load_volume(&args.template)
        .with_context(|| format!("Failed to load template {}", args.template.display()))?;
    let backend = create_backend(&config.device);
    println!("Device:   {}", backend.name());

    let reporter = BarReporter::new();
    let outcome = register_one_reported(
        &args.moving,
        &template,
        &output,
        &config,
        backend.as_ref(),
        &reporter,
    );
    print_outcome(&outcome);

    if !outcome.success() && outcome.skip_reason.is_none() {
        bail!("Registration of {} failed", args.moving.display());
    }
    Ok(())
}
