//! Geographic bounding box used for spatial sub-selection.

use serde::{Deserialize, Serialize};

/// A rectangular lon/lat selection box in degrees.
///
/// Used by `fldmean` to restrict the averaging domain before applying the
/// area weights. Longitudes may be given in either [-180, 180] or [0, 360]
/// conventions; `contains_lon` checks both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Global coverage box.
    pub fn global() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    /// Check whether a latitude falls inside the box.
    ///
    /// `include_border` decides if coordinates exactly on the edge count.
    pub fn contains_lat(&self, lat: f64, include_border: bool) -> bool {
        if include_border {
            lat >= self.min_lat && lat <= self.max_lat
        } else {
            lat > self.min_lat && lat < self.max_lat
        }
    }

    /// Check whether a longitude falls inside the box, tolerant of the
    /// [-180, 180] vs [0, 360] convention mismatch between box and data.
    pub fn contains_lon(&self, lon: f64, include_border: bool) -> bool {
        for candidate in [lon, lon - 360.0, lon + 360.0] {
            let inside = if include_border {
                candidate >= self.min_lon && candidate <= self.max_lon
            } else {
                candidate > self.min_lon && candidate < self.max_lon
            };
            if inside {
                return true;
            }
        }
        false
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::global()
    }
}
