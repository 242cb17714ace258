//! Error types for grid handling and regridding.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the grid registry, weight generation and regridding.
#[derive(Error, Debug)]
pub enum RegridError {
    /// No cached weight matrix for the requested key and rebuild was not
    /// requested.
    #[error("no weights found for level '{level}' at {path} (rebuild not requested)")]
    MissingWeights { level: String, path: PathBuf },

    /// A grid name could not be interpreted.
    #[error("cannot parse grid '{0}'")]
    GridParse(String),

    /// A named grid is absent from the registry.
    #[error("grid '{0}' not found in registry")]
    GridNotFound(String),

    /// Weight generation is not possible for this grid pair without an
    /// external remap engine.
    #[error("no builtin weight generation for {src} -> {tgt}; remap engine not configured")]
    EngineNotConfigured { src: String, tgt: String },

    /// The external remap engine failed.
    #[error("remap engine failed ({status}): {stderr}")]
    EngineFailure { status: String, stderr: String },

    /// A cache or registry file could not be read or written.
    #[error("cache io error at {path}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A cache or registry file holds malformed content.
    #[error("malformed cache or registry file at {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Matrix and input dimensions do not agree.
    #[error("weight matrix expects {expected} source cells, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Underlying data model error.
    #[error(transparent)]
    Data(#[from] cda_common::DataError),
}

/// Result type for regrid operations.
pub type Result<T> = std::result::Result<T, RegridError>;
