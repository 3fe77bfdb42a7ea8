pub mod nifti;

use std::fs::File;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::Result;

pub use nifti::{load_field, load_volume, read_header, save_field, save_volume, NiftiHeader};

/// Recognized volume file extensions, longest first.
pub const VOLUME_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

pub(crate) fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

/// Split a file name into its stem and volume extension, e.g.
/// `"sub01.nii.gz"` into `("sub01", ".nii.gz")`. Unknown extensions keep the
/// whole name as the stem and an empty extension.
pub fn split_volume_name(name: &str) -> (&str, &str) {
    let lower = name.to_ascii_lowercase();
    for ext in VOLUME_EXTENSIONS {
        if lower.ends_with(ext) && name.len() > ext.len() {
            let cut = name.len() - ext.len();
            return (&name[..cut], &name[cut..]);
        }
    }
    (name, "")
}

/// Sibling path `<stem>.<suffix><ext>` of a volume path.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = split_volume_name(&name);
    path.with_file_name(format!("{stem}.{suffix}{ext}"))
}

/// Write `path` through a temporary file in the same directory, renamed into
/// place only once `write` succeeds. Parent directories are created as needed.
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut tmp = NamedTempFile::new_in(&parent)?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
