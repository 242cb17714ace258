//! Unified access to heterogeneous climate datasets.
//!
//! Catalogs resolve a (model, experiment, source) triplet to a data
//! driver; a [`Reader`] bound to that triplet hands out lazily evaluated
//! datasets with fixing and regridding deferred to materialization, plus
//! streaming access and post-processing statistics.

pub mod catalog;
pub mod error;
pub mod fldmean;
pub mod lazy;
pub mod reader;
pub mod source;
pub mod streaming;
pub mod testdata;
pub mod timmean;
pub mod vertinterp;

pub use catalog::{Catalog, CatalogStack, DatasetHandle, DriverSpec, SourceEntry};
pub use error::{ReaderError, Result};
pub use fldmean::{fldmean, FldmeanOptions};
pub use lazy::LazyDataset;
pub use reader::{Reader, ReaderConfig};
pub use source::{open_source, ArchiveSource, DataSource, FileSource};
pub use streaming::{ChunkIterator, StreamState, StreamStep, Streamer};
pub use timmean::{timmean, Stat, TimmeanOptions};
pub use vertinterp::vertinterp;
