//! Application of cached weight matrices to datasets.
//!
//! Weights can differ per vertical level (masked ocean grids), so the
//! regridder selects the sub-matrix for each level through the
//! coordinate's original-position index, never through its current
//! position. Regridding a level-selected array therefore matches
//! selecting the same level after regridding.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use cda_common::{Coordinate, DataArray, Dataset};

use crate::error::{RegridError, Result};
use crate::grid::{Grid, RegularGrid};
use crate::sparse::CsrMatrix;
use crate::weights::{LevelKey, WeightKey, WeightStore};

/// A resolved regridding operator for one source and one target grid.
#[derive(Debug, Clone)]
pub struct Regridder {
    target: RegularGrid,
    weights: BTreeMap<LevelKey, Arc<CsrMatrix>>,
    /// Vertical coordinate whose levels carry per-level weights.
    vert_coord: Option<String>,
    cache_dir: PathBuf,
}

impl Regridder {
    /// Load (or generate) all weights needed for a source. `vert` names
    /// the vertical coordinate and the original level positions for which
    /// per-level weights exist.
    pub fn new(
        store: &WeightStore,
        key: &WeightKey,
        src: &Grid,
        vert: Option<(&str, &[usize])>,
        rebuild: bool,
    ) -> Result<Self> {
        let target = RegularGrid::parse(&key.target)?;
        let mut weights = BTreeMap::new();
        weights.insert(
            LevelKey::Surface,
            store.get_or_generate(key, LevelKey::Surface, src, rebuild)?,
        );
        let mut vert_coord = None;
        if let Some((coord, levels)) = vert {
            vert_coord = Some(coord.to_string());
            for &lvl in levels {
                let lk = LevelKey::Level(lvl);
                weights.insert(lk, store.get_or_generate(key, lk, src, rebuild)?);
            }
        }
        Ok(Self {
            target,
            weights,
            vert_coord,
            cache_dir: store.dir().to_path_buf(),
        })
    }

    /// Build directly from matrices, for callers that manage their own
    /// weight files.
    pub fn from_parts(
        target: RegularGrid,
        weights: BTreeMap<LevelKey, Arc<CsrMatrix>>,
        vert_coord: Option<String>,
    ) -> Self {
        Self {
            target,
            weights,
            vert_coord,
            cache_dir: PathBuf::new(),
        }
    }

    pub fn target(&self) -> &RegularGrid {
        &self.target
    }

    fn source_cells(&self) -> usize {
        self.weights
            .values()
            .next()
            .map(|m| m.ncols)
            .unwrap_or(0)
    }

    fn matrix(&self, level: LevelKey) -> Result<&CsrMatrix> {
        self.weights
            .get(&level)
            .map(|m| m.as_ref())
            .ok_or_else(|| RegridError::MissingWeights {
                level: level.to_string(),
                path: self.cache_dir.clone(),
            })
    }

    /// Regrid every variable of a dataset onto the target grid.
    ///
    /// Horizontal coordinates are replaced by the target lon/lat; all
    /// other coordinates and the time axis are carried over.
    pub fn regrid(&self, ds: &Dataset) -> Result<Dataset> {
        let mut out = Dataset::new();
        out.time = ds.time.clone();
        out.attrs = ds.attrs.clone();

        let ncells = self.source_cells();
        let mut horiz_dims: Vec<String> = Vec::new();
        let has_3d = ds.vars.values().any(|v| self.vert_dim_of(v).is_some());

        for (name, var) in &ds.vars {
            let dims = self.horizontal_dims(var, ncells)?;
            if horiz_dims.is_empty() {
                horiz_dims = dims.clone();
            }
            let regridded = self.regrid_array(var, ds, &dims, has_3d)?;
            out.insert_var(regridded);
            debug!("regridded '{name}' onto {}", self.target.name);
        }

        for (name, coord) in &ds.coords {
            if !horiz_dims.contains(name) {
                out.insert_coord(coord.clone());
            }
        }
        out.insert_coord(
            Coordinate::new("lat", self.target.lats.clone()).with_units("degrees_north"),
        );
        out.insert_coord(
            Coordinate::new("lon", self.target.lons.clone()).with_units("degrees_east"),
        );
        Ok(out)
    }

    fn vert_dim_of(&self, var: &DataArray) -> Option<usize> {
        let coord = self.vert_coord.as_deref()?;
        var.dim_index(coord)
    }

    /// Trailing dimensions making up the flattened horizontal space.
    fn horizontal_dims(&self, var: &DataArray, ncells: usize) -> Result<Vec<String>> {
        let n = var.dims.len();
        if n >= 1 && var.shape[n - 1] == ncells {
            return Ok(vec![var.dims[n - 1].clone()]);
        }
        if n >= 2 && var.shape[n - 2] * var.shape[n - 1] == ncells {
            return Ok(vec![var.dims[n - 2].clone(), var.dims[n - 1].clone()]);
        }
        Err(RegridError::ShapeMismatch {
            expected: ncells,
            actual: var.shape.last().copied().unwrap_or(0),
        })
    }

    fn regrid_array(
        &self,
        var: &DataArray,
        ds: &Dataset,
        horiz_dims: &[String],
        dataset_has_3d: bool,
    ) -> Result<DataArray> {
        let n_outer_dims = var.dims.len() - horiz_dims.len();
        let outer_shape = &var.shape[..n_outer_dims];
        let outer: usize = outer_shape.iter().product();
        let space: usize = var.shape[n_outer_dims..].iter().product();

        // Original level position for each index along the vertical dim,
        // via the hidden index coordinate rather than position.
        let vert = self.vert_dim_of(var).and_then(|d| {
            let coord = ds.coords.get(&var.dims[d])?;
            let ids = coord
                .source_index
                .clone()
                .unwrap_or_else(|| (0..coord.len()).collect());
            let stride: usize = outer_shape[d + 1..].iter().product();
            Some((d, stride, ids))
        });

        if vert.is_none() && dataset_has_3d && self.weights.len() > 1 {
            warn!(
                "'{}' has no vertical dimension while others do; \
                 cannot tell a selected level from a surface field, using surface weights",
                var.name
            );
        }

        let tgt_space = self.target.ncells();
        let mut values = Vec::with_capacity(outer.max(1) * tgt_space);
        for o in 0..outer.max(1) {
            let level = match &vert {
                Some((d, stride, ids)) => {
                    let pos = (o / stride) % var.shape[*d];
                    LevelKey::Level(ids[pos])
                }
                None => LevelKey::Surface,
            };
            let matrix = self.matrix(level)?;
            let slice = &var.values[o * space..(o + 1) * space];
            values.extend(matrix.apply(slice)?);
        }

        let mut dims: Vec<String> = var.dims[..n_outer_dims].to_vec();
        dims.push("lat".to_string());
        dims.push("lon".to_string());
        let mut shape: Vec<usize> = outer_shape.to_vec();
        shape.push(self.target.nlat());
        shape.push(self.target.nlon());

        let mut out = DataArray::new(var.name.clone(), dims, shape, values)?;
        out.attrs = var.attrs.clone();
        out.attrs.regridded = true;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{generate_regular, Method};

    fn target() -> RegularGrid {
        RegularGrid::global(4, 2)
    }

    fn surface_regridder() -> Regridder {
        let src = RegularGrid::global(8, 4);
        let m = generate_regular(&src, &target(), Method::Conservative);
        let mut weights = BTreeMap::new();
        weights.insert(LevelKey::Surface, Arc::new(m));
        Regridder::from_parts(target(), weights, None)
    }

    /// Two-level regridder whose level matrices scale by 1x and 10x, so
    /// tests can tell which matrix was applied.
    fn leveled_regridder() -> Regridder {
        let src = RegularGrid::global(8, 4);
        let base = generate_regular(&src, &target(), Method::Conservative);
        let mut scaled = base.clone();
        for v in scaled.values.iter_mut() {
            *v *= 10.0;
        }
        let mut weights = BTreeMap::new();
        weights.insert(LevelKey::Surface, Arc::new(base.clone()));
        weights.insert(LevelKey::Level(0), Arc::new(base));
        weights.insert(LevelKey::Level(1), Arc::new(scaled));
        Regridder::from_parts(target(), weights, Some("plev".to_string()))
    }

    fn dataset_3d() -> Dataset {
        let mut ds = Dataset::new();
        ds.insert_coord(
            Coordinate::new("plev", vec![100000.0, 85000.0]).with_identity_index(),
        );
        let ncells = 8 * 4;
        let mut values = Vec::new();
        for lvl in 0..2 {
            for _ in 0..ncells {
                values.push((lvl + 1) as f64);
            }
        }
        ds.insert_var(
            DataArray::new(
                "ta",
                vec!["plev".to_string(), "cell".to_string()],
                vec![2, ncells],
                values,
            )
            .unwrap(),
        );
        ds
    }

    #[test]
    fn test_surface_regrid() {
        let mut ds = Dataset::new();
        let values: Vec<f64> = vec![3.0; 32];
        ds.insert_var(
            DataArray::new("sst", vec!["cell".to_string()], vec![32], values).unwrap(),
        );
        let out = surface_regridder().regrid(&ds).unwrap();
        let sst = out.var("sst").unwrap();
        assert_eq!(sst.dims, vec!["lat".to_string(), "lon".to_string()]);
        assert_eq!(sst.shape, vec![2, 4]);
        assert!(sst.attrs.regridded);
        for v in &sst.values {
            assert!((v - 3.0).abs() < 1e-9);
        }
        assert_eq!(out.coords["lon"].values.len(), 4);
        assert_eq!(out.coords["lat"].values.len(), 2);
    }

    #[test]
    fn test_per_level_matrices() {
        let out = leveled_regridder().regrid(&dataset_3d()).unwrap();
        let ta = out.var("ta").unwrap();
        assert_eq!(ta.shape, vec![2, 2, 4]);
        // Level 0: constant 1 through the 1x matrix; level 1: constant 2
        // through the 10x matrix
        assert!((ta.values[0] - 1.0).abs() < 1e-9);
        assert!((ta.values[8] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_selection_order_invariance() {
        let rg = leveled_regridder();
        let ds = dataset_3d();

        // Select level 1 first, then regrid
        let selected = ds.select_dim("plev", &[1]).unwrap();
        let a = rg.regrid(&selected).unwrap();

        // Regrid first, then select level 1
        let regridded = rg.regrid(&ds).unwrap();
        let b = regridded.select_dim("plev", &[1]).unwrap();

        let va = &a.var("ta").unwrap().values;
        let vb = &b.var("ta").unwrap().values;
        assert_eq!(va.len(), vb.len());
        for (x, y) in va.iter().zip(vb.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_missing_level_weights() {
        let rg = leveled_regridder();
        let mut ds = dataset_3d();
        // Pretend the data carries a third level the cache knows nothing of
        ds.coords.get_mut("plev").unwrap().source_index = Some(vec![0, 7]);
        let err = rg.regrid(&ds).unwrap_err();
        match err {
            RegridError::MissingWeights { level, .. } => assert_eq!(level, "7"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_horizontal_size() {
        let mut ds = Dataset::new();
        ds.insert_var(
            DataArray::new("sst", vec!["cell".to_string()], vec![7], vec![0.0; 7]).unwrap(),
        );
        assert!(matches!(
            surface_regridder().regrid(&ds),
            Err(RegridError::ShapeMismatch { .. })
        ));
    }
}
