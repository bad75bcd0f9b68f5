//! Error types shared by the collectives, routing kernels and configuration.

use candle_core::DType;
use thiserror::Error;

/// Errors that can occur while moving tokens or gradients between ranks.
///
/// Everything except [`MoeCommError::Transport`], [`MoeCommError::Kernel`] and
/// [`MoeCommError::Tensor`] is a broken caller contract: the call is aborted and
/// nothing is coerced.
#[derive(Error, Debug)]
pub enum MoeCommError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A group size or expert count that must be positive was zero.
    #[error("{what} must be > 0")]
    InvalidGroupSize { what: &'static str },

    /// A dimension cannot be split into equal parts.
    #[error("dimension {dim} ({size}) is not divisible by {parts}")]
    IndivisibleDimension {
        dim: usize,
        size: usize,
        parts: usize,
    },

    /// Dimension index past the tensor rank.
    #[error("dim {dim} out of range for a {rank}-d tensor")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Split-size list does not sum to the row count it describes.
    #[error("split sizes sum to {actual}, expected {expected} rows")]
    SplitSizeMismatch { expected: usize, actual: usize },

    /// Split-size list does not have one entry per rank.
    #[error("expected {expected} split sizes (one per rank), got {actual}")]
    InvalidSplitCount { expected: usize, actual: usize },

    /// Tensor shape mismatch for a collective or routing call.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Tensor dtype is not the one the operation requires.
    #[error("dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },

    /// A routing index points outside the capacity buffer.
    #[error("{what} index {index} out of range (limit {limit})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },

    /// The transport failed to move data between ranks.
    #[error("transport error: {0}")]
    Transport(String),

    /// The row-permutation kernel provider failed.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MoeCommError>;
