//! Shared data model for the climate data access layer.
//!
//! This crate defines the in-memory representation used across the
//! workspace: n-dimensional arrays with named dimensions (`DataArray`),
//! collections of them (`Dataset`), time axes with calendar-aware period
//! grouping (`TimeAxis`, `Frequency`), and geographic selection boxes.

pub mod bbox;
pub mod dataset;
pub mod error;
pub mod time;

pub use bbox::BoundingBox;
pub use dataset::{Coordinate, DataArray, Dataset, VarAttrs};
pub use error::{DataError, Result};
pub use time::{days_in_month, parse_date, shift_date, Frequency, TimeAxis, TimeUnit};
