//! Error types for the fixer.

use thiserror::Error;

/// Errors raised while resolving or applying fix specifications.
#[derive(Error, Debug)]
pub enum FixerError {
    /// Two fix rules claim the same canonical coordinate.
    #[error("fix spec conflict: coordinates {claimants:?} both map to canonical '{canonical}'")]
    FixSpecConflict {
        canonical: String,
        claimants: Vec<String>,
    },

    /// A derived variable references source variables that are absent.
    #[error("cannot derive '{var}' from '{formula}': variable '{missing}' not available")]
    DerivationError {
        var: String,
        formula: String,
        missing: String,
    },

    /// A derived formula references variables that are themselves fixer
    /// targets. Not supported when selecting variables.
    #[error("recursive fix definition: {refs:?} are themselves defined in the fixes for '{var}'")]
    RecursiveDerivation { var: String, refs: Vec<String> },

    /// Formula text could not be parsed.
    #[error("invalid formula '{formula}': {reason}")]
    FormulaParse { formula: String, reason: String },

    /// A unit string could not be interpreted.
    #[error("cannot parse unit '{0}'")]
    UnitParse(String),

    /// A parent referenced by a fix spec does not exist.
    #[error("fix spec parent '{0}' not found")]
    MissingParent(String),

    /// Parent chain loops back on itself.
    #[error("fix spec parent chain contains a cycle at '{0}'")]
    ParentCycle(String),

    /// Fix specification file could not be read or parsed.
    #[error("failed to load fix specification: {0}")]
    SpecLoad(String),

    /// Underlying data model error.
    #[error(transparent)]
    Data(#[from] cda_common::DataError),
}

impl From<serde_yaml::Error> for FixerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::SpecLoad(err.to_string())
    }
}

/// Result type for fixer operations.
pub type Result<T> = std::result::Result<T, FixerError>;
