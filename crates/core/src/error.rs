//! Typed failures surfaced by the upscale engine.
//!
//! Every variant is terminal for the operation that produced it only; the
//! engine keeps its loaded model and accepts the next request.

use thiserror::Error;

/// Grid axis a tiling guard tripped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Height,
    Width,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Height => write!(f, "height"),
            Self::Width => write!(f, "width"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpscaleError {
    /// Configuration violates a geometric invariant (non-positive tile step, zero scale, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("too many tiles along {axis}: {blocks} exceeds the limit of {max}")]
    TooManyTiles { axis: Axis, blocks: usize, max: usize },

    #[error("image {width}x{height} exceeds the maximum dimension of {max}")]
    ImageTooLarge {
        width: usize,
        height: usize,
        max: usize,
    },

    #[error("output buffer of {elements} elements exceeds the limit of {max}")]
    OutputTooLarge { elements: u128, max: usize },

    /// Crop region or tile index outside its source.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Tensor rank or shape unsupported by the requested operation.
    #[error("invalid tensor: {0}")]
    InvalidTensor(String),

    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("no model loaded")]
    ModelNotLoaded,

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("upscale cancelled")]
    Cancelled,

    /// The engine worker is gone; no further requests can be served.
    #[error("engine is shut down")]
    EngineClosed,
}

impl UpscaleError {
    /// Wraps a collaborator error, keeping the whole context chain in the message.
    pub fn model_load(error: &anyhow::Error) -> Self {
        Self::ModelLoadFailed(format!("{error:#}"))
    }

    pub fn inference(error: &anyhow::Error) -> Self {
        Self::InferenceFailed(format!("{error:#}"))
    }
}

impl From<ndarray::ShapeError> for UpscaleError {
    fn from(error: ndarray::ShapeError) -> Self {
        Self::InvalidTensor(error.to_string())
    }
}

pub type UpscaleResult<T> = std::result::Result<T, UpscaleError>;
