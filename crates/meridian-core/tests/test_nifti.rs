mod common;

use std::io::Write;

use approx::assert_abs_diff_eq;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::{Array3, Array4};

use meridian_core::error::MeridianError;
use meridian_core::io::nifti::Datatype;
use meridian_core::io::{
    load_field, load_volume, read_header, save_field, save_volume, split_volume_name, with_suffix,
};
use meridian_core::transform::DeformationField;
use meridian_core::volume::{Grid, Volume};

use common::{random_field, textured_volume};

/// Minimal single-file NIfTI-1 image with pixdim-only geometry.
fn build_nifti(dims: &[i16], datatype: i16, bitpix: i16, payload: &[u8], big_endian: bool) -> Vec<u8> {
    let i16b = |v: i16| if big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
    let i32b = |v: i32| if big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
    let f32b = |v: f32| if big_endian { v.to_be_bytes() } else { v.to_le_bytes() };

    let mut buf = vec![0u8; 352];
    buf[0..4].copy_from_slice(&i32b(348));
    let mut dim = [1i16; 8];
    dim[0] = dims.len() as i16;
    dim[1..=dims.len()].copy_from_slice(dims);
    for (n, d) in dim.iter().enumerate() {
        buf[40 + 2 * n..42 + 2 * n].copy_from_slice(&i16b(*d));
    }
    buf[70..72].copy_from_slice(&i16b(datatype));
    buf[72..74].copy_from_slice(&i16b(bitpix));
    let pixdim = [1.0f32, 2.0, 1.5, 3.0, 1.0, 1.0, 1.0, 1.0];
    for (n, p) in pixdim.iter().enumerate() {
        buf[76 + 4 * n..80 + 4 * n].copy_from_slice(&f32b(*p));
    }
    buf[108..112].copy_from_slice(&f32b(352.0));
    buf[344..348].copy_from_slice(b"n+1\0");
    buf.extend_from_slice(payload);
    buf
}

fn set_scaling(buf: &mut [u8], slope: f32, inter: f32) {
    buf[112..116].copy_from_slice(&slope.to_le_bytes());
    buf[116..120].copy_from_slice(&inter.to_le_bytes());
}

fn oblique_volume() -> Volume {
    let angle: f64 = 0.3;
    let direction = Matrix3::new(
        angle.cos(), -angle.sin(), 0.0,
        angle.sin(), angle.cos(), 0.0,
        0.0, 0.0, 1.0,
    );
    let grid = Grid::new(
        [6, 7, 5],
        Vector3::new(1.5, 0.8, 2.0),
        Point3::new(-12.0, 30.5, 4.25),
        direction,
    )
    .unwrap();
    Volume::new(textured_volume([6, 7, 5]).data().clone(), grid).unwrap()
}

fn assert_same_volume(a: &Volume, b: &Volume) {
    assert!(a.grid().same_geometry(b.grid(), 1e-5), "{:?} vs {:?}", a.grid(), b.grid());
    for (x, y) in a.data().iter().zip(b.data().iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
    }
}

// ---------------------------------------------------------------------------
// Volume round trips
// ---------------------------------------------------------------------------

#[test]
fn test_volume_round_trip_gzip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.nii.gz");
    let v = oblique_volume();
    save_volume(&v, &path).unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);
    assert_same_volume(&v, &load_volume(&path).unwrap());
}

#[test]
fn test_volume_round_trip_plain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("vol.nii");
    let v = oblique_volume();
    save_volume(&v, &path).unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(raw.len(), 352 + 6 * 7 * 5 * 4);
    assert_same_volume(&v, &load_volume(&path).unwrap());
}

#[test]
fn test_saved_header_describes_float_volume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.nii.gz");
    save_volume(&oblique_volume(), &path).unwrap();
    let header = read_header(&path).unwrap();
    assert_eq!(header.datatype, Datatype::F32);
    assert_eq!(header.spatial_dims(), [6, 7, 5]);
    assert_eq!(header.sform_code, 1);
    assert!(header.little_endian);
}

#[test]
fn test_save_leaves_no_temporary_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.nii.gz");
    save_volume(&oblique_volume(), &path).unwrap();
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("vol.nii.gz")]);
}

// ---------------------------------------------------------------------------
// Foreign encodings
// ---------------------------------------------------------------------------

#[test]
fn test_load_int16_with_scaling_and_pixdim_geometry() {
    let values: Vec<i16> = (0..24).collect();
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let mut bytes = build_nifti(&[2, 3, 4], 4, 16, &payload, false);
    set_scaling(&mut bytes, 0.5, 10.0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("int16.nii");
    std::fs::write(&path, &bytes).unwrap();
    let v = load_volume(&path).unwrap();

    assert_eq!(v.dims(), [2, 3, 4]);
    assert_eq!(v.grid().spacing(), &Vector3::new(2.0, 1.5, 3.0));
    // x fastest on disk: value index = i + 2 j + 6 k
    assert_abs_diff_eq!(v.data()[[1, 2, 3]], (1 + 4 + 18) as f32 * 0.5 + 10.0);
    assert_abs_diff_eq!(v.data()[[0, 1, 0]], 2.0 * 0.5 + 10.0);
}

#[test]
fn test_load_big_endian_float() {
    let values: Vec<f32> = (0..8).map(|v| v as f32 * 1.25).collect();
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    let bytes = build_nifti(&[2, 2, 2], 16, 32, &payload, true);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("be.nii");
    std::fs::write(&path, &bytes).unwrap();
    let header = read_header(&path).unwrap();
    assert!(!header.little_endian);
    let v = load_volume(&path).unwrap();
    assert_abs_diff_eq!(v.data()[[1, 1, 1]], 7.0 * 1.25);
}

#[test]
fn test_load_gzip_detected_by_magic() {
    let payload: Vec<u8> = (0..8u8).collect();
    let bytes = build_nifti(&[2, 2, 2], 2, 8, &payload, false);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes).unwrap();
    let gz = encoder.finish().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("u8.nii.gz");
    std::fs::write(&path, gz).unwrap();
    let v = load_volume(&path).unwrap();
    assert_eq!(v.data()[[1, 0, 1]], 5.0);
}

#[test]
fn test_load_multi_volume_keeps_first() {
    let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let bytes = build_nifti(&[2, 2, 2, 2], 16, 32, &payload, false);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("4d.nii");
    std::fs::write(&path, &bytes).unwrap();
    let v = load_volume(&path).unwrap();
    assert_eq!(v.dims(), [2, 2, 2]);
    assert_eq!(v.data()[[1, 1, 1]], 7.0);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[test]
fn test_missing_file_is_file_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_volume(&dir.path().join("absent.nii.gz")).unwrap_err();
    assert!(matches!(err, MeridianError::FileNotFound(_)));
}

#[test]
fn test_unknown_extension_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.mat");
    std::fs::write(&path, b"whatever").unwrap();
    assert!(matches!(
        load_volume(&path),
        Err(MeridianError::UnsupportedFormat(_))
    ));
}

#[test]
fn test_garbage_content_is_invalid_volume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.nii.gz");
    std::fs::write(&path, b"definitely not a nifti file").unwrap();
    let err = load_volume(&path).unwrap_err();
    assert!(matches!(err, MeridianError::InvalidVolume(_)), "{err:?}");
}

#[test]
fn test_truncated_data_is_invalid_volume() {
    let payload = vec![0u8; 10];
    let bytes = build_nifti(&[4, 4, 4], 16, 32, &payload, false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.nii");
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        load_volume(&path),
        Err(MeridianError::InvalidVolume(_))
    ));
}

#[test]
fn test_unknown_datatype_is_unsupported() {
    let bytes = build_nifti(&[2, 2, 2], 128, 24, &[0u8; 24], false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rgb.nii");
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        load_volume(&path),
        Err(MeridianError::UnsupportedFormat(_))
    ));
}

#[test]
fn test_zero_extent_is_invalid_volume() {
    let bytes = build_nifti(&[2, 0, 2], 16, 32, &[], false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.nii");
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        load_volume(&path),
        Err(MeridianError::InvalidVolume(_))
    ));
}

#[test]
fn test_overflowing_extents_are_invalid_volume() {
    let bytes = build_nifti(&[i16::MAX; 7], 16, 32, &[], false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huge.nii");
    std::fs::write(&path, &bytes).unwrap();

    let header = read_header(&path).unwrap();
    assert!(matches!(header.voxel_count(), Err(MeridianError::InvalidVolume(_))));
    assert!(matches!(
        load_volume(&path),
        Err(MeridianError::InvalidVolume(_))
    ));
}

#[test]
fn test_extent_beyond_header_range_is_not_saved() {
    let grid = Grid::axis_aligned([40_000, 1, 1], [1.0; 3], [0.0; 3]).unwrap();
    let volume = Volume::new(Array3::zeros((40_000, 1, 1)), grid.clone()).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("long.nii.gz");
    let err = save_volume(&volume, &path).unwrap_err();
    assert!(matches!(err, MeridianError::InvalidVolume(_)), "{err:?}");
    assert!(!path.exists());

    let field_path = dir.path().join("long_field.nii.gz");
    let err = save_field(&DeformationField::zeros(grid), &field_path).unwrap_err();
    assert!(matches!(err, MeridianError::InvalidVolume(_)), "{err:?}");
    assert!(!field_path.exists());
}

// ---------------------------------------------------------------------------
// Deformation fields
// ---------------------------------------------------------------------------

#[test]
fn test_field_round_trip_is_five_dimensional() {
    let grid = oblique_volume().grid().clone();
    let field = DeformationField::new(grid, random_field([6, 7, 5], 2.0, 7)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sub.forward_field.nii.gz");
    save_field(&field, &path).unwrap();

    let header = read_header(&path).unwrap();
    assert_eq!(header.ndim(), 5);
    assert_eq!(header.extent(5), 3);
    assert_eq!(header.intent_code, 1007);

    let loaded = load_field(&path).unwrap();
    assert!(loaded.grid().same_geometry(field.grid(), 1e-5));
    for (a, b) in loaded.displacement().iter().zip(field.displacement().iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
}

#[test]
fn test_load_four_dimensional_field() {
    // Components stored as the slowest axis.
    let mut values = Vec::new();
    for c in 0..3 {
        for n in 0..8 {
            values.push((c * 100 + n) as f32);
        }
    }
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let bytes = build_nifti(&[2, 2, 2, 3], 16, 32, &payload, false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy_field.nii");
    std::fs::write(&path, &bytes).unwrap();

    let field = load_field(&path).unwrap();
    let disp = field.displacement();
    assert_eq!(disp.dim(), (2, 2, 2, 3));
    assert_eq!(disp[[1, 0, 0, 0]], 1.0);
    assert_eq!(disp[[0, 1, 1, 2]], 206.0);
}

#[test]
fn test_scalar_volume_is_not_a_field() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scalar.nii.gz");
    save_volume(&oblique_volume(), &path).unwrap();
    assert!(matches!(
        load_field(&path),
        Err(MeridianError::InvalidVolume(_))
    ));
}

// ---------------------------------------------------------------------------
// Naming helpers
// ---------------------------------------------------------------------------

#[test]
fn test_split_volume_name() {
    assert_eq!(split_volume_name("sub01.nii.gz"), ("sub01", ".nii.gz"));
    assert_eq!(split_volume_name("sub01.NII"), ("sub01", ".NII"));
    assert_eq!(split_volume_name("notes.txt"), ("notes.txt", ""));
}

#[test]
fn test_with_suffix() {
    let p = with_suffix(std::path::Path::new("/data/sub01.nii.gz"), "reg");
    assert_eq!(p, std::path::PathBuf::from("/data/sub01.reg.nii.gz"));
}

#[test]
fn test_volume_rejects_mismatched_grid() {
    let grid = Grid::axis_aligned([2, 2, 2], [1.0; 3], [0.0; 3]).unwrap();
    assert!(Volume::new(Array3::zeros((3, 2, 2)), grid.clone()).is_err());
    assert!(DeformationField::new(grid, Array4::zeros((2, 2, 2, 2))).is_err());
}
