//! Data source drivers.
//!
//! A driver turns a catalog entry into datasets. The file driver reads
//! every serialized dataset file under a directory in name order and
//! concatenates them along time; the archive driver models request-based
//! access with one file per variable, where the caller must say exactly
//! which variables it wants.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use cda_common::{Dataset, TimeAxis};

use crate::catalog::DriverSpec;
use crate::error::{ReaderError, Result};

/// Access to one source's data.
pub trait DataSource: Send + Sync {
    /// The full time axis of the source.
    fn time_axis(&self) -> Result<TimeAxis>;

    /// Load data, optionally restricted to some variables and to a
    /// half-open index window along time.
    fn load(&self, vars: Option<&[String]>, window: Option<(usize, usize)>) -> Result<Dataset>;

    /// Human-readable description for `info()`.
    fn describe(&self) -> String;
}

/// Build the driver for a catalog entry. `vert_coords` are the names of
/// vertical coordinates that get a stable identity index assigned at
/// load time.
pub fn open_source(
    source_name: &str,
    spec: &DriverSpec,
    vert_coords: Vec<String>,
) -> Box<dyn DataSource> {
    match spec {
        DriverSpec::FileGlob { path, extension } => Box::new(FileSource {
            dir: path.clone(),
            extension: extension.clone(),
            vert_coords,
        }),
        DriverSpec::Archive { path } => Box::new(ArchiveSource {
            name: source_name.to_string(),
            dir: path.clone(),
            vert_coords,
        }),
    }
}

fn read_dataset(path: &Path) -> Result<Dataset> {
    let text = fs::read_to_string(path).map_err(|e| ReaderError::SourceRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&text).map_err(|e| ReaderError::SourceRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Assign the identity source index to vertical coordinates that do not
/// carry one yet; required for level-selection-invariant regridding.
fn index_vert_coords(ds: &mut Dataset, vert_coords: &[String]) {
    for name in vert_coords {
        if let Some(coord) = ds.coords.get_mut(name) {
            if coord.source_index.is_none() {
                coord.source_index = Some((0..coord.values.len()).collect());
            }
        }
    }
}

fn apply_window(ds: Dataset, window: Option<(usize, usize)>) -> Result<Dataset> {
    match window {
        Some((lo, hi)) => Ok(ds.slice_time(lo, hi)?),
        None => Ok(ds),
    }
}

/// Directory of serialized dataset files, one chunk per file.
pub struct FileSource {
    dir: PathBuf,
    extension: String,
    vert_coords: Vec<String>,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>, extension: &str, vert_coords: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.to_string(),
            vert_coords,
        }
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.dir).sort_by_file_name() {
            let entry = entry.map_err(|e| ReaderError::SourceRead {
                path: self.dir.clone(),
                reason: e.to_string(),
            })?;
            if entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == self.extension.as_str())
            {
                out.push(entry.path().to_path_buf());
            }
        }
        if out.is_empty() {
            return Err(ReaderError::SourceRead {
                path: self.dir.clone(),
                reason: format!("no .{} files found", self.extension),
            });
        }
        Ok(out)
    }
}

impl DataSource for FileSource {
    fn time_axis(&self) -> Result<TimeAxis> {
        let mut times = Vec::new();
        for path in self.files()? {
            let ds = read_dataset(&path)?;
            if let Some(axis) = ds.time {
                times.extend(axis.times);
            }
        }
        Ok(TimeAxis { times })
    }

    fn load(&self, vars: Option<&[String]>, window: Option<(usize, usize)>) -> Result<Dataset> {
        let mut parts = Vec::new();
        for path in self.files()? {
            debug!("reading {}", path.display());
            let mut ds = read_dataset(&path)?;
            index_vert_coords(&mut ds, &self.vert_coords);
            if let Some(vars) = vars {
                ds = ds.subset_vars(vars)?;
            }
            parts.push(ds);
        }
        let ds = if parts.len() == 1 {
            parts.into_iter().next().ok_or_else(|| {
                ReaderError::SourceRead {
                    path: self.dir.clone(),
                    reason: "empty source".to_string(),
                }
            })?
        } else {
            Dataset::concat_time(parts)?
        };
        apply_window(ds, window)
    }

    fn describe(&self) -> String {
        format!("file source at {}", self.dir.display())
    }
}

/// Request-based archive modeled as one file per variable. Variable
/// selection is mandatory.
pub struct ArchiveSource {
    name: String,
    dir: PathBuf,
    vert_coords: Vec<String>,
}

impl ArchiveSource {
    pub fn new(name: &str, dir: impl Into<PathBuf>, vert_coords: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            dir: dir.into(),
            vert_coords,
        }
    }

    fn var_path(&self, var: &str) -> PathBuf {
        self.dir.join(format!("{var}.json"))
    }
}

impl DataSource for ArchiveSource {
    fn time_axis(&self) -> Result<TimeAxis> {
        // Any variable file carries the shared time axis.
        let first = WalkDir::new(&self.dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| {
                e.file_type().is_file()
                    && e.path().extension().is_some_and(|ext| ext == "json")
            })
            .ok_or_else(|| ReaderError::SourceRead {
                path: self.dir.clone(),
                reason: "archive holds no variable files".to_string(),
            })?;
        let ds = read_dataset(first.path())?;
        Ok(ds.time.unwrap_or(TimeAxis { times: Vec::new() }))
    }

    fn load(&self, vars: Option<&[String]>, window: Option<(usize, usize)>) -> Result<Dataset> {
        let Some(vars) = vars else {
            return Err(ReaderError::VarsRequired(self.name.clone()));
        };
        if vars.is_empty() {
            return Err(ReaderError::VarsRequired(self.name.clone()));
        }
        let mut merged: Option<Dataset> = None;
        for var in vars {
            let path = self.var_path(var);
            debug!("requesting '{var}' from {}", path.display());
            let mut ds = read_dataset(&path)?;
            index_vert_coords(&mut ds, &self.vert_coords);
            match &mut merged {
                None => merged = Some(ds),
                Some(base) => {
                    let base_len = base.time.as_ref().map(|t| t.times.len());
                    let this_len = ds.time.as_ref().map(|t| t.times.len());
                    if base_len != this_len {
                        return Err(ReaderError::Config(format!(
                            "archive variable '{var}' has a different time axis"
                        )));
                    }
                    for (_, arr) in std::mem::take(&mut ds.vars) {
                        base.insert_var(arr);
                    }
                    for (name, coord) in ds.coords {
                        base.coords.entry(name).or_insert(coord);
                    }
                }
            }
        }
        let ds = merged.ok_or_else(|| ReaderError::VarsRequired(self.name.clone()))?;
        apply_window(ds, window)
    }

    fn describe(&self) -> String {
        format!("archive source '{}' at {}", self.name, self.dir.display())
    }
}
