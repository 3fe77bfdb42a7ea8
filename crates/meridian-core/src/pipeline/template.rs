use std::path::{Path, PathBuf};

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::compute::ComputeBackend;
use crate::consts::{FORWARD_FIELD_SUFFIX, INVERSE_FIELD_SUFFIX, LOCK_EXTENSION, REGISTERED_SUFFIX};
use crate::error::{MeridianError, Result};
use crate::io::{load_volume, save_volume};
use crate::transform::{warp, AffineTransform, FillPolicy, Interpolation, Transform};
use crate::volume::Volume;

/// How the fixed reference volume of a run is chosen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStrategy {
    /// The middle file of the sorted candidates (index `n / 2`).
    #[default]
    Central,
    /// Voxelwise mean of all candidates on the first candidate's grid.
    Average,
    /// A caller-provided volume.
    Specified { path: PathBuf },
    /// The sorted candidate at a given index.
    Index { index: usize },
}

impl std::fmt::Display for TemplateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Central => write!(f, "central"),
            Self::Average => write!(f, "average"),
            Self::Specified { path } => write!(f, "specified ({})", path.display()),
            Self::Index { index } => write!(f, "index {index}"),
        }
    }
}

impl TemplateStrategy {
    /// Short name used in generated file names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Central => "central",
            Self::Average => "average",
            Self::Specified { .. } => "specified",
            Self::Index { .. } => "index",
        }
    }
}

/// The template of a run and where it came from.
#[derive(Clone, Debug)]
pub struct Template {
    pub volume: Volume,
    /// The file the template was read from; `None` when synthesized.
    pub source: Option<PathBuf>,
}

/// Shell-style wildcard match supporting `*` and `?`.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut n, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            n += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = backtrack {
            p = star_p + 1;
            n = star_n + 1;
            backtrack = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// True for files that are outputs or bookkeeping of a previous run and must
/// never be registered again. Templates are recognised by a word starting
/// with `template`, so `contemplate01.nii.gz` is still an input.
pub fn is_excluded(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains(&format!(".{REGISTERED_SUFFIX}."))
        || lower.contains(&format!(".{FORWARD_FIELD_SUFFIX}."))
        || lower.contains(&format!(".{INVERSE_FIELD_SUFFIX}."))
        || lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word.starts_with("template"))
        || lower.ends_with(&format!(".{LOCK_EXTENSION}"))
}

/// Regular files in `dir` matching `pattern`, minus excluded names, sorted.
pub fn discover_inputs(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(MeridianError::FileNotFound(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if matches_pattern(&name, pattern) && !is_excluded(&name) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Voxelwise mean of `inputs`, each resampled onto the first loadable input's grid.
///
/// Inputs that fail to load are skipped with a warning.
pub fn build_average_template(backend: &dyn ComputeBackend, inputs: &[PathBuf]) -> Result<Volume> {
    let mut reference: Option<Volume> = None;
    let mut sum: Option<Array3<f64>> = None;
    let mut count = 0usize;
    for path in inputs {
        let volume = match load_volume(path) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable template input");
                continue;
            }
        };
        let target = reference.get_or_insert_with(|| volume.clone());
        let resampled = if volume.grid().same_geometry(target.grid(), 1e-6) {
            volume
        } else {
            warp(
                backend,
                &volume,
                &Transform::Affine(AffineTransform::identity()),
                target.grid(),
                Interpolation::Linear,
                FillPolicy::Constant(0.0),
            )?
        };
        let data = resampled.data().mapv(f64::from);
        match sum.as_mut() {
            Some(acc) => *acc += &data,
            None => sum = Some(data),
        }
        count += 1;
    }
    let (Some(reference), Some(sum)) = (reference, sum) else {
        return Err(MeridianError::EmptySequence);
    };
    info!(inputs = count, "Average template built");
    let mean = sum.mapv(|v| (v / count as f64) as f32);
    Volume::new(mean, reference.grid().clone())
}

/// Candidate indices ordered by distance from `preferred`, upper neighbour first.
fn nearest_first(preferred: usize, len: usize) -> impl Iterator<Item = usize> {
    (0..len).flat_map(move |offset| {
        let above = preferred.checked_add(offset).filter(|&i| i < len);
        let below = preferred.checked_sub(offset).filter(|&i| offset > 0 && i < len);
        above.into_iter().chain(below)
    })
}

/// Load the candidate at `preferred`, falling back to the nearest candidate
/// that loads. Unreadable candidates stay in the run and fail on their own
/// when their registration is attempted.
fn pick_loadable(candidates: &[PathBuf], preferred: usize) -> Result<Template> {
    let mut last_error = None;
    for index in nearest_first(preferred, candidates.len()) {
        let path = &candidates[index];
        match load_volume(path) {
            Ok(volume) => {
                if index == preferred {
                    info!(template = %path.display(), index, "Template selected");
                } else {
                    info!(template = %path.display(), index, preferred, "Fallback template selected");
                }
                return Ok(Template {
                    volume,
                    source: Some(path.clone()),
                });
            }
            Err(e) => {
                warn!(path = %path.display(), index, error = %e, "Template candidate unreadable");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(MeridianError::EmptySequence))
}

/// Select or build the template for a run over the sorted `candidates`.
pub fn select_template(
    backend: &dyn ComputeBackend,
    strategy: &TemplateStrategy,
    candidates: &[PathBuf],
) -> Result<Template> {
    match strategy {
        TemplateStrategy::Central => {
            if candidates.is_empty() {
                return Err(MeridianError::EmptySequence);
            }
            pick_loadable(candidates, candidates.len() / 2)
        }
        TemplateStrategy::Index { index } => {
            if *index >= candidates.len() {
                return Err(MeridianError::InvalidConfig(format!(
                    "template index {index} out of range for {} candidates",
                    candidates.len()
                )));
            }
            pick_loadable(candidates, *index)
        }
        TemplateStrategy::Average => Ok(Template {
            volume: build_average_template(backend, candidates)?,
            source: None,
        }),
        TemplateStrategy::Specified { path } => {
            info!(template = %path.display(), "Using specified template");
            Ok(Template {
                volume: load_volume(path)?,
                source: Some(path.clone()),
            })
        }
    }
}

/// `<output_dir>/auto_generated_template_<strategy>.nii.gz`
pub fn generated_template_path(output_dir: &Path, strategy: &TemplateStrategy) -> PathBuf {
    output_dir.join(format!("auto_generated_template_{}.nii.gz", strategy.name()))
}

/// Persist a synthesized template next to the run outputs.
pub fn save_template(template: &Template, output_dir: &Path, strategy: &TemplateStrategy) -> Result<PathBuf> {
    let path = generated_template_path(output_dir, strategy);
    save_volume(&template.volume, &path)?;
    info!(path = %path.display(), "Template saved");
    Ok(path)
}
