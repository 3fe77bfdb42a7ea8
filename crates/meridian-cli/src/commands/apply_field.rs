use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use meridian_core::compute::{create_backend, DevicePreference};
use meridian_core::io::{load_field, load_volume, save_volume};
use meridian_core::transform::{warp, FillPolicy, Interpolation, Transform};

use super::DeviceArg;

#[derive(Args)]
pub struct ApplyFieldArgs {
    /// Volume to deform
    pub volume: PathBuf,

    /// Deformation field (NIfTI vector image, mm displacements)
    pub field: PathBuf,

    /// Output volume
    #[arg(short, long)]
    pub output: PathBuf,

    /// Volume whose grid the output is sampled on [default: the field's grid]
    #[arg(long)]
    pub reference: Option<PathBuf>,

    /// Nearest-neighbour interpolation, for label maps
    #[arg(long)]
    pub nearest: bool,

    /// Compute device
    #[arg(long, value_enum)]
    pub device: Option<DeviceArg>,
}

pub fn run(args: &ApplyFieldArgs) -> Result<()> {
    let volume = load_volume(&args.volume)
        .with_context(|| format!("Failed to load volume {}", args.volume.display()))?;
    let field = load_field(&args.field)
        .with_context(|| format!("Failed to load field {}", args.field.display()))?;
    let grid = match args.reference {
        Some(ref path) => load_volume(path)
            .with_context(|| format!("Failed to load reference {}", path.display()))?
            .grid()
            .clone(),
        None => field.grid().clone(),
    };
    let interpolation = if args.nearest {
        Interpolation::Nearest
    } else {
        Interpolation::Linear
    };

    let device: DevicePreference = args.device.map(Into::into).unwrap_or_default();
    let backend = create_backend(&device);
    let warped = warp(
        backend.as_ref(),
        &volume,
        &Transform::Field(field),
        &grid,
        interpolation,
        FillPolicy::default(),
    )?;
    save_volume(&warped, &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    let [nx, ny, nz] = grid.dims();
    println!("Deformed:    {} ({}x{}x{}, {})", args.volume.display(), nx, ny, nz, interpolation);
    println!("Saved to     {}", args.output.display());
    Ok(())
}
