//! Rule-driven normalization of raw model output.
//!
//! Raw climate model output arrives with model-specific variable names,
//! units and coordinate conventions. This crate resolves a fix
//! specification for a (model, experiment, source) triplet from a YAML
//! catalog and applies it: variable renames, derived variables,
//! decumulation of accumulated fluxes, unit conversion with physical
//! corrections, and coordinate normalization against a target data model.

pub mod coords;
pub mod decumulate;
pub mod error;
pub mod fixer;
pub mod formula;
pub mod spec;
pub mod units;

pub use coords::{CoordDef, DataModel, Direction};
pub use decumulate::{decumulate, Jump};
pub use error::{FixerError, Result};
pub use fixer::{apply_unit_fixes, Fixer};
pub use formula::Expr;
pub use spec::{FixCatalog, FixDefaults, FixSpec, MergeMethod, VarFix};
pub use units::{convert_units, normalize_units, parse_unit, Conversion, UnitSpec};
