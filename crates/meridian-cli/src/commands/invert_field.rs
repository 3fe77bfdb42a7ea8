use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use meridian_core::consts::{
    DEFAULT_INVERSION_ITERATIONS, DEFAULT_INVERSION_TOLERANCE_MM, ROUND_TRIP_TOLERANCE_VOXELS,
};
use meridian_core::io::{load_field, save_field, with_suffix};
use meridian_core::transform::inverse_consistency;

#[derive(Args)]
pub struct InvertFieldArgs {
    /// Deformation field (NIfTI vector image, mm displacements)
    pub field: PathBuf,

    /// Output inverse field [default: <field>.inverse.nii.gz next to the input]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Per-point convergence tolerance in mm
    #[arg(long, default_value_t = DEFAULT_INVERSION_TOLERANCE_MM)]
    pub tolerance: f64,

    /// Fixed-point iterations per point
    #[arg(long, default_value_t = DEFAULT_INVERSION_ITERATIONS)]
    pub max_iterations: usize,
}

pub fn run(args: &InvertFieldArgs) -> Result<()> {
    let field = load_field(&args.field)
        .with_context(|| format!("Failed to load field {}", args.field.display()))?;
    let inverse = field
        .inverse(args.tolerance, args.max_iterations)
        .with_context(|| format!("Failed to invert {}", args.field.display()))?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| with_suffix(&args.field, "inverse"));
    save_field(&inverse, &output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let tolerance = ROUND_TRIP_TOLERANCE_VOXELS * field.grid().min_spacing();
    let consistency = inverse_consistency(&field, &inverse, tolerance);
    println!("Field:       {}", args.field.display());
    println!("Round trip:  {:.1}% within {:.3} mm", 100.0 * consistency, tolerance);
    println!("Inverse saved to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::transform::DeformationField;
    use meridian_core::volume::Grid;
    use ndarray::Array4;

    #[test]
    fn test_inverse_undoes_smooth_field() {
        let dir = tempfile::tempdir().unwrap();
        let grid = Grid::axis_aligned([8, 8, 8], [1.0, 1.5, 1.0], [0.0; 3]).unwrap();
        // Vanishes on the x and y faces, so no point is pushed off the grid.
        let disp = Array4::from_shape_fn((8, 8, 8, 3), |(i, j, _, c)| {
            let bump = (std::f64::consts::PI * i as f64 / 7.0).sin()
                * (std::f64::consts::PI * j as f64 / 7.0).sin();
            match c {
                0 => 0.4 * bump,
                1 => -0.3 * bump,
                _ => 0.0,
            }
        });
        let field = DeformationField::new(grid, disp).unwrap();
        let path = dir.path().join("sub01.forward_field.nii.gz");
        save_field(&field, &path).unwrap();

        run(&InvertFieldArgs {
            field: path.clone(),
            output: None,
            tolerance: 0.001,
            max_iterations: 200,
        })
        .unwrap();

        let output = dir.path().join("sub01.forward_field.inverse.nii.gz");
        let inverse = load_field(&output).unwrap();
        assert_eq!(inverse.grid().dims(), [8, 8, 8]);
        let forward = load_field(&path).unwrap();
        assert!(inverse_consistency(&forward, &inverse, 0.05) > 0.9);
    }
}
