//! Error types for the shared data model.

use thiserror::Error;

/// Errors raised by dataset and array operations.
#[derive(Error, Debug)]
pub enum DataError {
    /// Array buffer length does not match the declared shape.
    #[error("data length {len} does not match shape {shape:?}")]
    ShapeMismatch { len: usize, shape: Vec<usize> },

    /// The requested dimension does not exist on the array.
    #[error("dimension '{0}' not found")]
    DimNotFound(String),

    /// Index outside the dimension extent.
    #[error("index {index} out of bounds for dimension '{dim}' of size {size}")]
    IndexOutOfBounds {
        dim: String,
        index: usize,
        size: usize,
    },

    /// Two arrays that must be congruent have different dims or shapes.
    #[error("arrays '{left}' and '{right}' are not aligned: {reason}")]
    NotAligned {
        left: String,
        right: String,
        reason: String,
    },

    /// The variable does not exist in the dataset.
    #[error("variable '{0}' not found in dataset")]
    VarNotFound(String),

    /// Operation requires a time axis but none is present.
    #[error("dataset has no time axis")]
    NoTimeAxis,

    /// Cannot concatenate incompatible datasets.
    #[error("cannot concatenate datasets: {0}")]
    ConcatError(String),

    /// Time parsing error.
    #[error("invalid time format: {0}")]
    InvalidTime(String),

    /// Frequency string could not be interpreted.
    #[error("unknown frequency: {0}")]
    UnknownFrequency(String),
}

/// Result type for data model operations.
pub type Result<T> = std::result::Result<T, DataError>;
