//! Catalog resolution.
//!
//! A catalog maps model -> experiment -> source to a driver descriptor
//! plus per-source metadata (grid name, fix toggles). Several catalogs
//! can be installed at once; lookups walk them in order unless narrowed
//! to one by name. A missing source name falls back to the entry called
//! `default`, then to the first source of the experiment in name order
//! (entries are held in a sorted map, so the tie-break is alphabetical
//! rather than declaration order).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReaderError, Result};

/// How a source's data is accessed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DriverSpec {
    /// Files under a directory, one serialized dataset per file,
    /// concatenated along time in filename order.
    FileGlob {
        path: PathBuf,
        /// Filename extension to accept, default "json".
        #[serde(default = "default_extension")]
        extension: String,
    },
    /// Request-based archive: one file per variable, explicit variable
    /// selection mandatory.
    Archive { path: PathBuf },
}

fn default_extension() -> String {
    "json".to_string()
}

/// One source entry in a catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(flatten)]
    pub driver: DriverSpec,
    /// Name of the source grid in the grid registry.
    pub grid: Option<String>,
    /// Whether fixes apply to this source by default.
    #[serde(default = "default_true")]
    pub fixable: bool,
}

fn default_true() -> bool {
    true
}

/// A single named catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub name: String,
    /// model -> experiment -> source -> entry.
    pub models: BTreeMap<String, BTreeMap<String, BTreeMap<String, SourceEntry>>>,
}

impl Catalog {
    pub fn from_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| ReaderError::SourceRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_str(&text)
    }

    fn sources(&self, model: &str, exp: &str) -> Option<&BTreeMap<String, SourceEntry>> {
        self.models.get(model)?.get(exp)
    }
}

/// The resolved identity of one dataset, fixed at reader construction.
#[derive(Debug, Clone)]
pub struct DatasetHandle {
    pub catalog: String,
    pub model: String,
    pub exp: String,
    pub source: String,
    pub entry: SourceEntry,
}

/// An ordered stack of installed catalogs.
#[derive(Debug, Clone, Default)]
pub struct CatalogStack {
    catalogs: Vec<Catalog>,
}

impl CatalogStack {
    pub fn new(catalogs: Vec<Catalog>) -> Self {
        Self { catalogs }
    }

    pub fn push(&mut self, catalog: Catalog) {
        self.catalogs.push(catalog);
    }

    pub fn names(&self) -> Vec<String> {
        self.catalogs.iter().map(|c| c.name.clone()).collect()
    }

    /// Resolve a triplet to a handle. `catalog` narrows the search to one
    /// installed catalog; `source` may be omitted, in which case the
    /// `default` source (or the alphabetically first one) is picked.
    pub fn resolve(
        &self,
        catalog: Option<&str>,
        model: &str,
        exp: &str,
        source: Option<&str>,
    ) -> Result<DatasetHandle> {
        let candidates: Vec<&Catalog> = match catalog {
            Some(name) => {
                let found = self
                    .catalogs
                    .iter()
                    .find(|c| c.name == name)
                    .ok_or_else(|| ReaderError::CatalogNotFound(name.to_string()))?;
                vec![found]
            }
            None => self.catalogs.iter().collect(),
        };

        for cat in candidates {
            let Some(sources) = cat.sources(model, exp) else {
                continue;
            };
            let resolved = match source {
                Some(name) => sources.get(name).map(|e| (name.to_string(), e)),
                None => sources
                    .get_key_value("default")
                    .or_else(|| sources.iter().next())
                    .map(|(k, v)| (k.clone(), v)),
            };
            if let Some((source_name, entry)) = resolved {
                debug!(
                    "resolved {model}/{exp}/{source_name} in catalog '{}'",
                    cat.name
                );
                return Ok(DatasetHandle {
                    catalog: cat.name.clone(),
                    model: model.to_string(),
                    exp: exp.to_string(),
                    source: source_name,
                    entry: entry.clone(),
                });
            }
        }
        Err(ReaderError::TripletNotFound {
            model: model.to_string(),
            exp: exp.to_string(),
            src: source.unwrap_or("default").to_string(),
        })
    }
}
