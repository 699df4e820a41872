use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = GiftError> = std::result::Result<T, E>;

/// Errors raised by the descriptor pipeline.
///
/// Shape and configuration failures are detected before any expensive work and are never
/// retried. An empty model directory is not an error, see [`crate::LoadOutcome`].
#[derive(Debug, Error)]
pub enum GiftError {
    #[error("shape mismatch in {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no embedder configured, aggregated descriptors are unavailable")]
    MissingEmbedder,

    #[error("negative grid of the second observation is required for mining")]
    MissingGrid,

    #[error("checkpoint {step} not found in {}", dir.display())]
    CheckpointNotFound { dir: PathBuf, step: i64 },

    #[error("parameter {name}: {reason}")]
    Parameter { name: String, reason: String },

    /// Tensor data could not be read back from the compute device.
    #[error("tensor data: {0}")]
    TensorData(String),

    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl GiftError {
    pub fn shape_mismatch(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Fails with [`GiftError::ShapeMismatch`] unless `actual == expected`.
pub fn ensure_shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(GiftError::shape_mismatch(what, expected, actual))
    }
}

/// Single-dimension variant of [`ensure_shape`].
pub fn ensure_dim(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    ensure_shape(what, &[expected], &[actual])
}
