//! Single-file NIfTI-1 codec (`.nii` and `.nii.gz`).

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::{Array3, Array4, ShapeBuilder};
use tracing::{debug, warn};

use crate::error::{MeridianError, Result};
use crate::transform::DeformationField;
use crate::volume::{Grid, Volume};

use super::{is_gzip_path, write_atomically};

pub const NIFTI1_HEADER_SIZE: usize = 348;
const NIFTI1_MAGIC: &[u8; 4] = b"n+1\0";
const VOX_OFFSET: usize = 352;
const INTENT_VECTOR: i16 = 1007;
const NIFTI_UNITS_MM: u8 = 2;
const XFORM_SCANNER_ANAT: i16 = 1;

/// Voxel storage types understood by the reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datatype {
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Datatype {
    pub fn from_code(code: i16) -> Result<Self> {
        Ok(match code {
            2 => Self::U8,
            256 => Self::I8,
            4 => Self::I16,
            512 => Self::U16,
            8 => Self::I32,
            768 => Self::U32,
            16 => Self::F32,
            64 => Self::F64,
            other => {
                return Err(MeridianError::UnsupportedFormat(format!(
                    "NIfTI datatype code {other}"
                )))
            }
        })
    }

    pub fn code(self) -> i16 {
        match self {
            Self::U8 => 2,
            Self::I8 => 256,
            Self::I16 => 4,
            Self::U16 => 512,
            Self::I32 => 8,
            Self::U32 => 768,
            Self::F32 => 16,
            Self::F64 => 64,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::U8 => "uint8",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::U16 => "uint16",
            Self::I32 => "int32",
            Self::U32 => "uint32",
            Self::F32 => "float32",
            Self::F64 => "float64",
        };
        write!(f, "{name}")
    }
}

/// The subset of the NIfTI-1 header this codec reads and writes.
#[derive(Clone, Debug)]
pub struct NiftiHeader {
    pub little_endian: bool,
    pub dim: [i16; 8],
    pub intent_code: i16,
    pub datatype: Datatype,
    pub pixdim: [f32; 8],
    pub vox_offset: f32,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub xyzt_units: u8,
    pub descrip: String,
    pub qform_code: i16,
    pub sform_code: i16,
    pub quatern: [f32; 3],
    pub qoffset: [f32; 3],
    pub srow: [[f32; 4]; 3],
}

impl NiftiHeader {
    /// Number of dimensions actually used (`dim[0]`).
    pub fn ndim(&self) -> usize {
        self.dim[0].clamp(0, 7) as usize
    }

    /// Extent along axis `a` (1-based as in the header), 1 when unused.
    pub fn extent(&self, a: usize) -> usize {
        if a <= self.ndim() && self.dim[a] > 0 {
            self.dim[a] as usize
        } else {
            1
        }
    }

    pub fn spatial_dims(&self) -> [usize; 3] {
        [self.extent(1), self.extent(2), self.extent(3)]
    }

    /// Total stored voxel count over all used dimensions.
    ///
    /// Fails with `InvalidVolume` when the extents overflow `usize`.
    pub fn voxel_count(&self) -> Result<usize> {
        (1..=self.ndim().max(1))
            .try_fold(1usize, |acc, a| acc.checked_mul(self.extent(a)))
            .ok_or_else(|| {
                MeridianError::InvalidVolume(format!(
                    "dimensions {:?} overflow the addressable voxel count",
                    &self.dim[1..=self.ndim()]
                ))
            })
    }

    /// Sampling grid from the sform, else the qform, else pixdim alone.
    pub fn grid(&self) -> Result<Grid> {
        let dims = self.spatial_dims();
        if self.sform_code > 0 {
            let m = Matrix3::from_fn(|r, c| self.srow[r][c] as f64);
            let spacing = Vector3::new(m.column(0).norm(), m.column(1).norm(), m.column(2).norm());
            if spacing.iter().all(|s| *s > 0.0) {
                let direction = Matrix3::from_fn(|r, c| m[(r, c)] / spacing[c]);
                let origin = Point3::new(
                    self.srow[0][3] as f64,
                    self.srow[1][3] as f64,
                    self.srow[2][3] as f64,
                );
                return Grid::new(dims, spacing, origin, direction);
            }
        }
        let spacing = Vector3::new(
            self.pixdim[1].abs() as f64,
            self.pixdim[2].abs() as f64,
            self.pixdim[3].abs() as f64,
        );
        if self.qform_code > 0 {
            let [b, c, d] = self.quatern.map(|v| v as f64);
            let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
            let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
            let r = Matrix3::new(
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            );
            let mut direction = r;
            direction.column_mut(2).scale_mut(qfac);
            let origin = Point3::from(self.qoffset.map(|v| v as f64));
            return Grid::new(dims, spacing, origin, direction);
        }
        Grid::new(dims, spacing, Point3::origin(), Matrix3::identity())
    }

    /// Header for a float32 image on `grid`, with `extra` trailing extents.
    ///
    /// NIfTI-1 stores extents as `i16`; larger grids are rejected.
    fn for_grid(grid: &Grid, extra: &[usize], intent_code: i16, descrip: &str) -> Result<Self> {
        let mut dim = [1i16; 8];
        dim[0] = (3 + extra.len()) as i16;
        for (slot, &extent) in dim[1..].iter_mut().zip(grid.dims().iter().chain(extra)) {
            *slot = i16::try_from(extent).map_err(|_| {
                MeridianError::InvalidVolume(format!(
                    "extent {extent} exceeds the NIfTI-1 limit of {}",
                    i16::MAX
                ))
            })?;
        }
        let spacing = grid.spacing();
        let mut pixdim = [1.0f32; 8];
        pixdim[1] = spacing.x as f32;
        pixdim[2] = spacing.y as f32;
        pixdim[3] = spacing.z as f32;
        let m = grid.index_to_physical_matrix();
        let o = grid.origin();
        let mut srow = [[0.0f32; 4]; 3];
        for (r, row) in srow.iter_mut().enumerate() {
            for c in 0..3 {
                row[c] = m[(r, c)] as f32;
            }
            row[3] = o[r] as f32;
        }
        Ok(Self {
            little_endian: true,
            dim,
            intent_code,
            datatype: Datatype::F32,
            pixdim,
            vox_offset: VOX_OFFSET as f32,
            scl_slope: 1.0,
            scl_inter: 0.0,
            xyzt_units: NIFTI_UNITS_MM,
            descrip: descrip.to_string(),
            qform_code: 0,
            sform_code: XFORM_SCANNER_ANAT,
            quatern: [0.0; 3],
            qoffset: [0.0; 3],
            srow,
        })
    }
}

fn check_extension(path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".nii") || name.ends_with(".nii.gz") {
        Ok(())
    } else {
        Err(MeridianError::UnsupportedFormat(format!(
            "{} is not a .nii or .nii.gz file",
            path.display()
        )))
    }
}

/// Read the whole file, transparently inflating gzip content.
fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    check_extension(path)?;
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MeridianError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        let mut inflated = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| {
                MeridianError::InvalidVolume(format!("{}: corrupt gzip stream: {e}", path.display()))
            })?;
        Ok(inflated)
    } else {
        Ok(raw)
    }
}

fn parse_header(bytes: &[u8]) -> Result<NiftiHeader> {
    if bytes.len() < NIFTI1_HEADER_SIZE {
        return Err(MeridianError::InvalidVolume(format!(
            "file too small for a NIfTI-1 header ({} bytes)",
            bytes.len()
        )));
    }
    if &bytes[344..348] != NIFTI1_MAGIC {
        return Err(MeridianError::UnsupportedFormat(
            "missing single-file NIfTI-1 magic \"n+1\"".into(),
        ));
    }
    if LittleEndian::read_i32(&bytes[0..4]) == NIFTI1_HEADER_SIZE as i32 {
        parse_header_as::<LittleEndian>(bytes, true)
    } else if BigEndian::read_i32(&bytes[0..4]) == NIFTI1_HEADER_SIZE as i32 {
        parse_header_as::<BigEndian>(bytes, false)
    } else {
        Err(MeridianError::UnsupportedFormat(
            "sizeof_hdr is not 348 in either byte order".into(),
        ))
    }
}

fn parse_header_as<E: ByteOrder>(bytes: &[u8], little_endian: bool) -> Result<NiftiHeader> {
    let mut cursor = Cursor::new(&bytes[40..]);
    let mut dim = [0i16; 8];
    for d in dim.iter_mut() {
        *d = cursor.read_i16::<E>()?;
    }
    // intent_p1..p3
    for _ in 0..3 {
        cursor.read_f32::<E>()?;
    }
    let intent_code = cursor.read_i16::<E>()?;
    let datatype = Datatype::from_code(cursor.read_i16::<E>()?)?;
    let _bitpix = cursor.read_i16::<E>()?;
    let _slice_start = cursor.read_i16::<E>()?;
    let mut pixdim = [0.0f32; 8];
    for p in pixdim.iter_mut() {
        *p = cursor.read_f32::<E>()?;
    }
    let vox_offset = cursor.read_f32::<E>()?;
    let scl_slope = cursor.read_f32::<E>()?;
    let scl_inter = cursor.read_f32::<E>()?;

    let xyzt_units = bytes[123];
    let descrip = read_fixed_string(&bytes[148..228]);

    let mut cursor = Cursor::new(&bytes[252..]);
    let qform_code = cursor.read_i16::<E>()?;
    let sform_code = cursor.read_i16::<E>()?;
    let mut quatern = [0.0f32; 3];
    for q in quatern.iter_mut() {
        *q = cursor.read_f32::<E>()?;
    }
    let mut qoffset = [0.0f32; 3];
    for q in qoffset.iter_mut() {
        *q = cursor.read_f32::<E>()?;
    }
    let mut srow = [[0.0f32; 4]; 3];
    for row in srow.iter_mut() {
        for v in row.iter_mut() {
            *v = cursor.read_f32::<E>()?;
        }
    }

    if dim[0] < 1 || dim[0] > 7 || dim[1..=dim[0] as usize].iter().any(|&d| d < 1) {
        return Err(MeridianError::InvalidVolume(format!(
            "invalid NIfTI dimensions {:?}",
            &dim[..]
        )));
    }

    Ok(NiftiHeader {
        little_endian,
        dim,
        intent_code,
        datatype,
        pixdim,
        vox_offset,
        scl_slope,
        scl_inter,
        xyzt_units,
        descrip,
        qform_code,
        sform_code,
        quatern,
        qoffset,
        srow,
    })
}

fn read_fixed_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim().to_string()
}

/// Decode `count` scaled samples stored after the header.
fn read_samples(header: &NiftiHeader, bytes: &[u8], count: usize) -> Result<Vec<f32>> {
    let offset = (header.vox_offset.max(NIFTI1_HEADER_SIZE as f32)) as usize;
    let size = header.datatype.byte_size();
    let needed = count
        .checked_mul(size)
        .and_then(|n| n.checked_add(offset))
        .ok_or_else(|| MeridianError::InvalidVolume("voxel count overflows".into()))?;
    if bytes.len() < needed {
        return Err(MeridianError::InvalidVolume(format!(
            "truncated voxel data: expected {needed} bytes, got {}",
            bytes.len()
        )));
    }
    let raw = &bytes[offset..needed];
    let values = if header.little_endian {
        decode::<LittleEndian>(raw, header.datatype, count)?
    } else {
        decode::<BigEndian>(raw, header.datatype, count)?
    };

    let slope = if header.scl_slope == 0.0 || !header.scl_slope.is_finite() {
        1.0
    } else {
        header.scl_slope as f64
    };
    let inter = if header.scl_inter.is_finite() {
        header.scl_inter as f64
    } else {
        0.0
    };
    Ok(values.into_iter().map(|v| (v * slope + inter) as f32).collect())
}

fn decode<E: ByteOrder>(raw: &[u8], datatype: Datatype, count: usize) -> Result<Vec<f64>> {
    let mut cursor = Cursor::new(raw);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let v = match datatype {
            Datatype::U8 => cursor.read_u8()? as f64,
            Datatype::I8 => cursor.read_i8()? as f64,
            Datatype::I16 => cursor.read_i16::<E>()? as f64,
            Datatype::U16 => cursor.read_u16::<E>()? as f64,
            Datatype::I32 => cursor.read_i32::<E>()? as f64,
            Datatype::U32 => cursor.read_u32::<E>()? as f64,
            Datatype::F32 => cursor.read_f32::<E>()? as f64,
            Datatype::F64 => cursor.read_f64::<E>()?,
        };
        out.push(v);
    }
    Ok(out)
}

/// Read only the header of a NIfTI file.
pub fn read_header(path: &Path) -> Result<NiftiHeader> {
    let bytes = read_bytes(path)?;
    parse_header(&bytes).map_err(|e| annotate(path, e))
}

fn annotate(path: &Path, err: MeridianError) -> MeridianError {
    match err {
        MeridianError::InvalidVolume(msg) => {
            MeridianError::InvalidVolume(format!("{}: {msg}", path.display()))
        }
        MeridianError::UnsupportedFormat(msg) => {
            MeridianError::UnsupportedFormat(format!("{}: {msg}", path.display()))
        }
        other => other,
    }
}

/// Load a scalar volume. For 4-D and higher inputs only the first volume is kept.
pub fn load_volume(path: &Path) -> Result<Volume> {
    let bytes = read_bytes(path)?;
    let load = || -> Result<Volume> {
        let header = parse_header(&bytes)?;
        let grid = header.grid()?;
        let [nx, ny, nz] = grid.dims();
        if header.voxel_count()? > nx * ny * nz {
            warn!(
                path = %path.display(),
                ndim = header.ndim(),
                "Multi-volume NIfTI, using the first volume"
            );
        }
        let samples = read_samples(&header, &bytes, nx * ny * nz)?;
        let data = Array3::from_shape_vec((nx, ny, nz).f(), samples)
            .map_err(|e| MeridianError::InvalidVolume(e.to_string()))?
            .as_standard_layout()
            .into_owned();
        debug!(path = %path.display(), nx, ny, nz, datatype = %header.datatype, "Loaded volume");
        Volume::new(data, grid)
    };
    load().map_err(|e| annotate(path, e))
}

/// Load a displacement field stored as `(nx, ny, nz, 1, 3)` or `(nx, ny, nz, 3)`.
pub fn load_field(path: &Path) -> Result<DeformationField> {
    let bytes = read_bytes(path)?;
    let load = || -> Result<DeformationField> {
        let header = parse_header(&bytes)?;
        let components = match header.ndim() {
            5 if header.extent(4) == 1 => header.extent(5),
            4 => header.extent(4),
            n => {
                return Err(MeridianError::InvalidVolume(format!(
                    "expected a 4-D or 5-D vector image, got {n}-D"
                )))
            }
        };
        if components != 3 {
            return Err(MeridianError::InvalidVolume(format!(
                "displacement field needs 3 components, got {components}"
            )));
        }
        let grid = header.grid()?;
        let [nx, ny, nz] = grid.dims();
        let samples = read_samples(&header, &bytes, nx * ny * nz * 3)?;
        let data = Array4::from_shape_vec((nx, ny, nz, 3).f(), samples)
            .map_err(|e| MeridianError::InvalidVolume(e.to_string()))?
            .mapv(f64::from);
        DeformationField::new(grid, data.as_standard_layout().into_owned())
    };
    load().map_err(|e| annotate(path, e))
}

fn write_header(w: &mut impl Write, header: &NiftiHeader) -> Result<()> {
    w.write_i32::<LittleEndian>(NIFTI1_HEADER_SIZE as i32)?;
    // data_type, db_name, extents, session_error, regular, dim_info
    w.write_all(&[0u8; 35])?;
    w.write_u8(0)?;
    for d in header.dim {
        w.write_i16::<LittleEndian>(d)?;
    }
    for _ in 0..3 {
        w.write_f32::<LittleEndian>(0.0)?;
    }
    w.write_i16::<LittleEndian>(header.intent_code)?;
    w.write_i16::<LittleEndian>(header.datatype.code())?;
    w.write_i16::<LittleEndian>((header.datatype.byte_size() * 8) as i16)?;
    w.write_i16::<LittleEndian>(0)?;
    for p in header.pixdim {
        w.write_f32::<LittleEndian>(p)?;
    }
    w.write_f32::<LittleEndian>(header.vox_offset)?;
    w.write_f32::<LittleEndian>(header.scl_slope)?;
    w.write_f32::<LittleEndian>(header.scl_inter)?;
    // slice_end, slice_code
    w.write_i16::<LittleEndian>(0)?;
    w.write_u8(0)?;
    w.write_u8(header.xyzt_units)?;
    // cal_max, cal_min, slice_duration, toffset, glmax, glmin
    w.write_all(&[0u8; 24])?;
    write_fixed_string(w, &header.descrip, 80)?;
    write_fixed_string(w, "", 24)?;
    w.write_i16::<LittleEndian>(header.qform_code)?;
    w.write_i16::<LittleEndian>(header.sform_code)?;
    for q in header.quatern.iter().chain(header.qoffset.iter()) {
        w.write_f32::<LittleEndian>(*q)?;
    }
    for row in header.srow {
        for v in row {
            w.write_f32::<LittleEndian>(v)?;
        }
    }
    write_fixed_string(w, "", 16)?;
    w.write_all(NIFTI1_MAGIC)?;
    // No header extensions.
    w.write_all(&[0u8; VOX_OFFSET - NIFTI1_HEADER_SIZE])?;
    Ok(())
}

fn write_fixed_string(w: &mut impl Write, s: &str, len: usize) -> Result<()> {
    let bytes = s.as_bytes();
    let to_write = bytes.len().min(len);
    w.write_all(&bytes[..to_write])?;
    w.write_all(&vec![0u8; len - to_write])?;
    Ok(())
}

/// Serialize header + float32 samples (x fastest) to `w`.
fn encode(w: &mut impl Write, header: &NiftiHeader, samples: impl Iterator<Item = f32>) -> Result<()> {
    write_header(w, header)?;
    for v in samples {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn write_nifti(path: &Path, header: &NiftiHeader, samples: impl Iterator<Item = f32>) -> Result<()> {
    check_extension(path)?;
    let gzip = is_gzip_path(path);
    write_atomically(path, |file: &mut File| {
        let mut writer = BufWriter::new(file);
        if gzip {
            let mut encoder = GzEncoder::new(&mut writer, Compression::default());
            encode(&mut encoder, header, samples)?;
            encoder.finish()?;
        } else {
            encode(&mut writer, header, samples)?;
        }
        writer.flush()?;
        Ok(())
    })
}

/// Write a volume as little-endian float32 NIfTI-1 (gzip when the name ends in `.gz`).
pub fn save_volume(volume: &Volume, path: &Path) -> Result<()> {
    let header = NiftiHeader::for_grid(volume.grid(), &[], 0, "meridian volume")?;
    let data = volume.data();
    let [nx, ny, nz] = volume.dims();
    let samples = (0..nz).flat_map(move |k| {
        (0..ny).flat_map(move |j| (0..nx).map(move |i| data[[i, j, k]]))
    });
    write_nifti(path, &header, samples)?;
    debug!(path = %path.display(), "Saved volume");
    Ok(())
}

/// Write a displacement field (mm) as a 5-D vector image `(nx, ny, nz, 1, 3)`.
pub fn save_field(field: &DeformationField, path: &Path) -> Result<()> {
    let header =
        NiftiHeader::for_grid(field.grid(), &[1, 3], INTENT_VECTOR, "meridian displacement")?;
    let disp = field.displacement();
    let [nx, ny, nz] = field.grid().dims();
    let samples = (0..3).flat_map(move |c| {
        (0..nz).flat_map(move |k| {
            (0..ny).flat_map(move |j| (0..nx).map(move |i| disp[[i, j, k, c]] as f32))
        })
    });
    write_nifti(path, &header, samples)?;
    debug!(path = %path.display(), "Saved displacement field");
    Ok(())
}
