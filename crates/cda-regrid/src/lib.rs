//! Grid-to-grid interpolation with cached sparse weights.
//!
//! The crate covers the regridding half of the access layer: a registry
//! of named grids, CSR weight matrices with builtin generation for
//! regular lon-lat pairs and delegation to an external remap engine
//! otherwise, a deterministic on-disk cache with atomic writes, per-cell
//! area fields for spatial averaging, and the `Regridder` that applies
//! per-level weight matrices with stable level identity.

pub mod error;
pub mod grid;
pub mod regridder;
pub mod sparse;
pub mod weights;

pub use error::{RegridError, Result};
pub use grid::{Grid, GridDefinition, GridRegistry, RegularGrid, EARTH_RADIUS};
pub use regridder::Regridder;
pub use sparse::CsrMatrix;
pub use weights::{
    generate_regular, AreaField, LevelKey, Method, RemapEngine, WeightKey, WeightStore,
    CACHE_DIR_ENV,
};
