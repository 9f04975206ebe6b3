// file: error.rs
// desc: error types for model loading and digit prediction

use thiserror::Error;

/// Failure to fetch or decode the model.
///
/// Cloneable so that one failed load can be handed to every caller that
/// was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("failed to fetch model from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("model source {url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("timed out fetching model from {url}")]
    TimedOut { url: String },

    #[error("failed to decode model: {0}")]
    Decode(String),

    #[error("model load was cancelled")]
    Cancelled,

    #[error("model loader panicked: {0}")]
    Panicked(String),
}

/// Input buffer does not hold one 28x28 image.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected {expected} pixel values, got {actual}")]
pub struct ShapeError {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredictError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("inference failed: {0}")]
    Inference(String),
}

pub type Result<T> = std::result::Result<T, PredictError>;
