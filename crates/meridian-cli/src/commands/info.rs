use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use meridian_core::io::read_header;

#[derive(Args)]
pub struct InfoArgs {
    /// Input NIfTI file
    pub file: PathBuf,
}

pub fn run(args: &InfoArgs) -> Result<()> {
    let header = read_header(&args.file)?;
    let grid = header.grid()?;
    let [nx, ny, nz] = grid.dims();
    let spacing = grid.spacing();
    let origin = grid.origin();

    println!("File:        {}", args.file.display());
    println!("Dimensions:  {}x{}x{}", nx, ny, nz);
    if header.ndim() > 3 {
        let extra: Vec<String> = (4..=header.ndim())
            .map(|a| header.extent(a).to_string())
            .collect();
        println!("Extra dims:  {}", extra.join("x"));
    }
    println!(
        "Spacing:     {:.3} x {:.3} x {:.3} mm",
        spacing.x, spacing.y, spacing.z
    );
    println!(
        "Origin:      ({:.2}, {:.2}, {:.2}) mm",
        origin.x, origin.y, origin.z
    );
    println!("Datatype:    {}", header.datatype);
    println!(
        "Byte order:  {}",
        if header.little_endian { "little-endian" } else { "big-endian" }
    );
    println!("Geometry:    sform {} / qform {}", header.sform_code, header.qform_code);
    if header.intent_code != 0 {
        println!("Intent:      {}", header.intent_code);
    }
    if header.scl_slope != 0.0 && (header.scl_slope != 1.0 || header.scl_inter != 0.0) {
        println!(
            "Scaling:     {} * x + {}",
            header.scl_slope, header.scl_inter
        );
    }
    if !header.descrip.is_empty() {
        println!("Description: {}", header.descrip);
    }

    let voxels = header.voxel_count()?;
    let data_mb = voxels as f64 * header.datatype.byte_size() as f64 / (1024.0 * 1024.0);
    println!("Data size:   {:.1} MB", data_mb);

    Ok(())
}
