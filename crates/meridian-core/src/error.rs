use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeridianError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Fixed and moving volumes do not overlap (overlap fraction {overlap:.4})")]
    DegenerateOverlap { overlap: f64 },

    #[error("Transform is not invertible: {0}")]
    NonInvertibleTransform(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Empty volume sequence")]
    EmptySequence,
}

pub type Result<T> = std::result::Result<T, MeridianError>;

/// Classification of a per-file failure, as recorded in outcomes and reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    InvalidVolume,
    DegenerateOverlap,
    NonInvertibleTransform,
    Io,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidVolume => write!(f, "InvalidVolumeError"),
            Self::DegenerateOverlap => write!(f, "DegenerateOverlapError"),
            Self::NonInvertibleTransform => write!(f, "NonInvertibleTransformError"),
            Self::Io => write!(f, "IoError"),
            Self::Other => write!(f, "Error"),
        }
    }
}

impl MeridianError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::FileNotFound(_) | Self::UnsupportedFormat(_) | Self::InvalidVolume(_) => {
                FailureKind::InvalidVolume
            }
            Self::DegenerateOverlap { .. } => FailureKind::DegenerateOverlap,
            Self::NonInvertibleTransform(_) => FailureKind::NonInvertibleTransform,
            Self::Io(_) => FailureKind::Io,
            Self::InvalidConfig(_) | Self::Pipeline(_) | Self::EmptySequence => FailureKind::Other,
        }
    }
}
