use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while building image stacks and paired datasets.
///
/// These surface before training starts; nothing downstream tries to recover
/// from them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DatasetError {
    #[error("no '{extension}' files found under {}", directory.display())]
    Empty {
        directory: PathBuf,
        extension: String,
    },

    #[error(
        "image {} has shape {actual:?}, expected {expected:?} (first image: {})",
        path.display(),
        first.display()
    )]
    ShapeMismatch {
        path: PathBuf,
        first: PathBuf,
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("clean dataset has {clean} samples but noisy dataset has {noisy}")]
    LengthMismatch { clean: usize, noisy: usize },

    #[error(
        "crop needs height and width above {margin} px, got {height}x{width}"
    )]
    CropSize {
        height: usize,
        width: usize,
        margin: usize,
    },

    #[error("sample index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}
