//! Grid descriptors and the named grid registry.
//!
//! Grids come in two flavors: regular global lon-lat grids, describable
//! by a compact name like `r360x180` (nlon x nlat), and unstructured or
//! curvilinear grids that carry an explicit cell count and rely on a
//! geometry file plus an external remap engine for weights. The registry
//! maps names to descriptors and is read-only after load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RegridError, Result};

/// Mean Earth radius in meters, used for spherical cell areas.
pub const EARTH_RADIUS: f64 = 6_371_000.0;

/// A regular global lon-lat grid with equally spaced centers.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularGrid {
    pub name: String,
    pub lons: Vec<f64>,
    pub lats: Vec<f64>,
}

impl RegularGrid {
    /// Build the global grid with `nlon` x `nlat` cells. Longitude
    /// centers start at 0, latitude centers are offset half a cell from
    /// the poles.
    pub fn global(nlon: usize, nlat: usize) -> Self {
        let dx = 360.0 / nlon as f64;
        let dy = 180.0 / nlat as f64;
        Self {
            name: format!("r{nlon}x{nlat}"),
            lons: (0..nlon).map(|i| i as f64 * dx).collect(),
            lats: (0..nlat).map(|j| -90.0 + (j as f64 + 0.5) * dy).collect(),
        }
    }

    /// Parse a compact grid name of the form `rNNNxMMM`.
    pub fn parse(name: &str) -> Result<Self> {
        let err = || RegridError::GridParse(name.to_string());
        let rest = name.strip_prefix('r').ok_or_else(err)?;
        let (nlon, nlat) = rest.split_once('x').ok_or_else(err)?;
        let nlon: usize = nlon.parse().map_err(|_| err())?;
        let nlat: usize = nlat.parse().map_err(|_| err())?;
        if nlon == 0 || nlat == 0 {
            return Err(err());
        }
        Ok(Self::global(nlon, nlat))
    }

    pub fn nlon(&self) -> usize {
        self.lons.len()
    }

    pub fn nlat(&self) -> usize {
        self.lats.len()
    }

    /// Total cell count; the flattened horizontal space is lat-major.
    pub fn ncells(&self) -> usize {
        self.lons.len() * self.lats.len()
    }

    /// Cell edges along longitude, length nlon + 1.
    pub fn lon_edges(&self) -> Vec<f64> {
        let dx = 360.0 / self.nlon() as f64;
        (0..=self.nlon())
            .map(|i| self.lons[0] - dx / 2.0 + i as f64 * dx)
            .collect()
    }

    /// Cell edges along latitude, length nlat + 1, clamped to the poles.
    pub fn lat_edges(&self) -> Vec<f64> {
        let dy = 180.0 / self.nlat() as f64;
        (0..=self.nlat())
            .map(|j| (-90.0 + j as f64 * dy).clamp(-90.0, 90.0))
            .collect()
    }

    /// Spherical cell areas in square meters, flattened lat-major.
    pub fn cell_areas(&self) -> Vec<f64> {
        let lon_edges = self.lon_edges();
        let lat_edges = self.lat_edges();
        let mut areas = Vec::with_capacity(self.ncells());
        for j in 0..self.nlat() {
            let band = (lat_edges[j + 1].to_radians().sin()
                - lat_edges[j].to_radians().sin())
                * EARTH_RADIUS
                * EARTH_RADIUS;
            for i in 0..self.nlon() {
                let dlon = (lon_edges[i + 1] - lon_edges[i]).to_radians();
                areas.push(band * dlon);
            }
        }
        areas
    }
}

/// Registry entry describing one named grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridDefinition {
    /// Compact regular-grid name (`rNNNxMMM`); set for regular grids.
    pub cdo_name: Option<String>,
    /// Geometry sample file for grids the engine needs to inspect.
    pub path: Option<PathBuf>,
    /// Cell count for unstructured grids.
    pub ncells: Option<usize>,
    /// Names of vertical coordinates present in data on this grid.
    pub vert_coords: Vec<String>,
    /// Extra options passed through to the remap engine.
    pub remap_options: Vec<String>,
}

/// A resolved grid: either regular (builtin weight generation possible)
/// or unstructured (external engine required).
#[derive(Debug, Clone)]
pub enum Grid {
    Regular(RegularGrid),
    Unstructured {
        name: String,
        ncells: usize,
        path: Option<PathBuf>,
    },
}

impl Grid {
    pub fn name(&self) -> &str {
        match self {
            Grid::Regular(g) => &g.name,
            Grid::Unstructured { name, .. } => name,
        }
    }

    pub fn ncells(&self) -> usize {
        match self {
            Grid::Regular(g) => g.ncells(),
            Grid::Unstructured { ncells, .. } => *ncells,
        }
    }
}

/// Named grid definitions loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridRegistry {
    pub grids: BTreeMap<String, GridDefinition>,
}

impl GridRegistry {
    pub fn from_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| RegridError::Malformed {
            path: PathBuf::from("<registry>"),
            reason: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| RegridError::CacheIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|e| RegridError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn definition(&self, name: &str) -> Option<&GridDefinition> {
        self.grids.get(name)
    }

    /// Resolve a grid by name. Compact `rNNNxMMM` names resolve without a
    /// registry entry; anything else must be registered.
    pub fn resolve(&self, name: &str) -> Result<Grid> {
        if let Some(def) = self.grids.get(name) {
            if let Some(cdo_name) = &def.cdo_name {
                let mut g = RegularGrid::parse(cdo_name)?;
                g.name = name.to_string();
                return Ok(Grid::Regular(g));
            }
            let ncells = def
                .ncells
                .ok_or_else(|| RegridError::GridParse(format!("{name}: no ncells or cdo_name")))?;
            return Ok(Grid::Unstructured {
                name: name.to_string(),
                ncells,
                path: def.path.clone(),
            });
        }
        if name.starts_with('r') && name.contains('x') {
            return Ok(Grid::Regular(RegularGrid::parse(name)?));
        }
        Err(RegridError::GridNotFound(name.to_string()))
    }
}
