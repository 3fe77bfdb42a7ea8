use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use meridian_core::io::{load_field, save_volume};
use meridian_core::volume::Volume;

#[derive(Args)]
pub struct JacobianArgs {
    /// Deformation field (NIfTI vector image, mm displacements)
    pub field: PathBuf,

    /// Output Jacobian determinant volume
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn run(args: &JacobianArgs) -> Result<()> {
    let field = load_field(&args.field)
        .with_context(|| format!("Failed to load field {}", args.field.display()))?;
    let det = field.jacobian_determinant();

    let total = det.len().max(1);
    let folding = det.iter().filter(|&&d| d <= 0.0).count();
    let (min, max) = det
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &d| (lo.min(d), hi.max(d)));
    let mean = det.sum() / total as f64;

    println!("Field:       {}", args.field.display());
    println!("Max |u|:     {:.3} mm", field.max_magnitude());
    println!("Jacobian:    min {:.4}  mean {:.4}  max {:.4}", min, mean, max);
    println!(
        "Folding:     {} voxel(s) ({:.3}%)",
        folding,
        100.0 * folding as f64 / total as f64
    );

    if let Some(ref path) = args.output {
        let volume = Volume::new(det.mapv(|d| d as f32), field.grid().clone())?;
        save_volume(&volume, path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Jacobian map saved to {}", path.display());
    }
    Ok(())
}
