//! Coordinate normalization against a target data model.
//!
//! A data model names the canonical coordinates (lon, lat, time, plev, ...)
//! together with the spellings they appear under in raw output and the
//! orientation their values must have. Normalization renames matching
//! coordinates, flips monotonically decreasing axes where the model wants
//! increasing ones, and sets canonical units attributes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cda_common::Dataset;

use crate::error::{FixerError, Result};

/// Required orientation of a coordinate's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Any orientation is acceptable.
    #[default]
    Any,
    Increasing,
    Decreasing,
}

/// Canonical definition of one coordinate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordDef {
    /// Alternative spellings recognized in raw data.
    pub aliases: Vec<String>,
    /// Units to record on the normalized coordinate.
    pub units: Option<String>,
    pub direction: Direction,
}

/// A named set of canonical coordinates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataModel {
    pub name: String,
    /// canonical name -> definition.
    pub coords: BTreeMap<String, CoordDef>,
}

impl DataModel {
    /// The conventional model used when a catalog names "cf" or nothing.
    pub fn cf() -> Self {
        let def = |aliases: &[&str], units: Option<&str>, direction: Direction| CoordDef {
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            units: units.map(|s| s.to_string()),
            direction,
        };
        let mut coords = BTreeMap::new();
        coords.insert(
            "lon".to_string(),
            def(&["longitude", "nav_lon", "x"], Some("degrees_east"), Direction::Any),
        );
        coords.insert(
            "lat".to_string(),
            def(
                &["latitude", "nav_lat", "y"],
                Some("degrees_north"),
                Direction::Increasing,
            ),
        );
        coords.insert("time".to_string(), def(&["time_counter", "valid_time"], None, Direction::Increasing));
        coords.insert(
            "plev".to_string(),
            def(&["pressure_level", "lev", "isobaricInhPa"], Some("Pa"), Direction::Any),
        );
        coords.insert(
            "depth".to_string(),
            def(&["deptht", "depth_below_sea"], Some("m"), Direction::Any),
        );
        DataModel {
            name: "cf".to_string(),
            coords,
        }
    }

    /// Look up a model by name; unknown names fall back to cf.
    pub fn by_name(name: &str) -> Self {
        match name {
            "cf" | "" => Self::cf(),
            other => {
                debug!("unknown data model '{other}', using cf conventions");
                let mut m = Self::cf();
                m.name = other.to_string();
                m
            }
        }
    }

    /// Rename, reorient and re-unit coordinates of `ds` in place.
    ///
    /// `extra_renames` come from the fix spec and take precedence over the
    /// model's aliases. Two different source coordinates resolving to the
    /// same canonical name is a configuration error.
    pub fn normalize(
        &self,
        ds: &mut Dataset,
        extra_renames: &BTreeMap<String, String>,
    ) -> Result<()> {
        // canonical -> source names claiming it
        let mut claims: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let present: Vec<String> = ds.coords.keys().cloned().collect();

        for (src, canonical) in extra_renames {
            if present.contains(src) {
                claims.entry(canonical.clone()).or_default().push(src.clone());
            }
        }
        for (canonical, def) in &self.coords {
            for alias in &def.aliases {
                if present.contains(alias)
                    && !claims
                        .values()
                        .any(|sources| sources.contains(alias))
                {
                    claims.entry(canonical.clone()).or_default().push(alias.clone());
                }
            }
        }

        for (canonical, sources) in &claims {
            if sources.len() > 1 {
                return Err(FixerError::FixSpecConflict {
                    canonical: canonical.clone(),
                    claimants: sources.clone(),
                });
            }
        }

        for (canonical, sources) in claims {
            let src = &sources[0];
            if src != &canonical {
                debug!("renaming coordinate '{src}' to '{canonical}'");
                ds.rename_dim(src, &canonical);
            }
        }

        for (canonical, def) in &self.coords {
            let Some(coord) = ds.coords.get(canonical) else {
                continue;
            };
            let flip = match def.direction {
                Direction::Increasing => coord.is_decreasing(),
                Direction::Decreasing => !coord.is_decreasing() && coord.values.len() > 1,
                Direction::Any => false,
            };
            if flip {
                debug!("reversing coordinate '{canonical}'");
                ds.reverse_dim(canonical)?;
            }
            if let Some(units) = &def.units {
                if let Some(coord) = ds.coords.get_mut(canonical) {
                    coord.units = Some(units.clone());
                }
            }
        }
        Ok(())
    }
}
