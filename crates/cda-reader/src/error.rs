//! Error types for catalog resolution, retrieval and aggregation.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the reader layer.
#[derive(Error, Debug)]
pub enum ReaderError {
    /// The (model, experiment, source) triplet is not in any catalog.
    #[error("no catalog entry for {model}/{exp}/{src}")]
    TripletNotFound {
        model: String,
        exp: String,
        src: String,
    },

    /// An explicitly named catalog is not installed.
    #[error("catalog '{0}' not found")]
    CatalogNotFound(String),

    /// Archive sources require an explicit variable list.
    #[error("source '{0}' is archive-based: an explicit variable list is required")]
    VarsRequired(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The streaming cursor has reached the end of the declared range.
    #[error("stream exhausted: no data left in the requested range")]
    StreamExhausted,

    /// No area field is available for spatial averaging.
    #[error("no area field available for '{0}': cannot area-weight")]
    NoAreaField(String),

    /// A source file could not be read or parsed.
    #[error("cannot read source data at {path}: {reason}")]
    SourceRead { path: PathBuf, reason: String },

    /// Underlying data model error.
    #[error(transparent)]
    Data(#[from] cda_common::DataError),

    /// Fixer failure.
    #[error(transparent)]
    Fixer(#[from] cda_fixer::FixerError),

    /// Regridding failure.
    #[error(transparent)]
    Regrid(#[from] cda_regrid::RegridError),
}

impl From<serde_yaml::Error> for ReaderError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for reader operations.
pub type Result<T> = std::result::Result<T, ReaderError>;
