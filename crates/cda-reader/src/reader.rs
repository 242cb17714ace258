//! The user-facing access layer.
//!
//! A `Reader` is bound to one catalog triplet at construction: it
//! resolves the source entry, sets up the fixer (unless fixing is
//! disabled for the entry or by the caller) and the weight store, and
//! hands out lazy datasets whose operation chain applies fixing and
//! regridding at materialization time. Post-processing (temporal and
//! spatial statistics, vertical interpolation) runs on materialized
//! datasets.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use cda_common::{Dataset, Frequency};
use cda_fixer::{FixCatalog, Fixer};
use cda_regrid::{
    AreaField, Grid, GridRegistry, Method, Regridder, RegularGrid, WeightKey, WeightStore,
};

use crate::catalog::{CatalogStack, DatasetHandle};
use crate::error::{ReaderError, Result};
use crate::fldmean::{fldmean, FldmeanOptions};
use crate::lazy::LazyDataset;
use crate::source::{open_source, DataSource};
use crate::streaming::{ChunkIterator, StreamState, StreamStep, Streamer};
use crate::timmean::{timmean, TimmeanOptions};
use crate::vertinterp::vertinterp;

/// Construction-time options for a [`Reader`].
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Restrict triplet resolution to one installed catalog.
    pub catalog: Option<String>,
    /// Source name; omitted picks `default`, then the first source.
    pub source: Option<String>,
    /// Apply fixes (also requires the catalog entry to be fixable).
    pub fix: bool,
    /// Convert units during fixing. When false, conversions are stashed
    /// in variable attributes and applied later by
    /// [`cda_fixer::apply_unit_fixes`].
    pub apply_unit_fix: bool,
    /// Target grid for regridding, e.g. `r360x180`. None disables.
    pub regrid: Option<String>,
    /// Interpolation method for weight generation.
    pub method: Method,
    /// Step for stateful streaming via [`Reader::retrieve_next`].
    pub stream: Option<StreamStep>,
    /// Regenerate weights and areas even when cached.
    pub rebuild: bool,
    /// Weight cache directory; None honors `CDA_CACHE_DIR`.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            catalog: None,
            source: None,
            fix: true,
            apply_unit_fix: true,
            regrid: None,
            method: Method::Conservative,
            stream: None,
            rebuild: false,
            cache_dir: None,
        }
    }
}

/// Access to one dataset triplet.
pub struct Reader {
    handle: DatasetHandle,
    source: Arc<dyn DataSource>,
    fixer: Option<Arc<Fixer>>,
    registry: GridRegistry,
    store: Arc<WeightStore>,
    config: ReaderConfig,
    streamer: Option<Streamer>,
}

impl Reader {
    pub fn new(
        catalogs: &CatalogStack,
        fixes: &FixCatalog,
        registry: GridRegistry,
        model: &str,
        exp: &str,
        config: ReaderConfig,
    ) -> Result<Self> {
        let handle = catalogs.resolve(
            config.catalog.as_deref(),
            model,
            exp,
            config.source.as_deref(),
        )?;

        let vert_coords = handle
            .entry
            .grid
            .as_deref()
            .and_then(|g| registry.definition(g))
            .map(|def| def.vert_coords.clone())
            .unwrap_or_default();
        let source: Arc<dyn DataSource> =
            Arc::from(open_source(&handle.source, &handle.entry.driver, vert_coords));

        let fixer = if config.fix && handle.entry.fixable {
            Fixer::new(fixes, model, exp, &handle.source)?.map(Arc::new)
        } else {
            None
        };
        if fixer.is_none() {
            info!("fixing disabled for {model}/{exp}/{}", handle.source);
        }

        let store = Arc::new(match &config.cache_dir {
            Some(dir) => WeightStore::new(dir.clone()),
            None => WeightStore::from_env("cda_cache"),
        });
        let streamer = config.stream.map(Streamer::new);

        Ok(Self {
            handle,
            source,
            fixer,
            registry,
            store,
            config,
            streamer,
        })
    }

    pub fn handle(&self) -> &DatasetHandle {
        &self.handle
    }

    /// Build the lazy dataset for the requested variables (canonical
    /// names; the fixer maps them back to what the source stores).
    pub fn retrieve(&self, vars: Option<&[String]>) -> Result<LazyDataset> {
        let source_vars = match (&self.fixer, vars) {
            (Some(fixer), Some(vars)) => Some(fixer.source_vars_for(vars)?),
            (None, Some(vars)) => Some(vars.to_vec()),
            (_, None) => None,
        };
        let mut lazy = LazyDataset::new(self.source.clone(), source_vars)?;

        if let Some(fixer) = &self.fixer {
            let fixer = fixer.clone();
            let apply_unit = self.config.apply_unit_fix;
            lazy = lazy.with_op(move |ds| Ok(fixer.apply(ds, apply_unit)?));
        }
        if let Some(target) = &self.config.regrid {
            let key = self.weight_key(target);
            let src = self.source_grid()?;
            let vert_names = self.vert_coord_names();
            let store = self.store.clone();
            let rebuild = self.config.rebuild;
            lazy = lazy.with_op(move |ds| {
                regrid_dataset(&store, &key, &src, &vert_names, rebuild, &ds)
            });
            debug!("regridding deferred onto '{}'", target);
        }
        Ok(lazy)
    }

    /// One-shot regrid of an already materialized dataset.
    pub fn regrid(&self, ds: &Dataset) -> Result<Dataset> {
        let target = self.config.regrid.as_deref().ok_or_else(|| {
            ReaderError::Config("no regrid target configured".to_string())
        })?;
        let key = self.weight_key(target);
        let src = self.source_grid()?;
        regrid_dataset(
            &self.store,
            &key,
            &src,
            &self.vert_coord_names(),
            self.config.rebuild,
            ds,
        )
    }

    /// Temporal resampling of a materialized dataset.
    pub fn timmean(&self, ds: &Dataset, freq: Frequency, opts: &TimmeanOptions) -> Result<Dataset> {
        timmean(ds, freq, opts)
    }

    /// Area-weighted spatial mean of a materialized dataset. The area
    /// field matches the grid the data is currently on.
    pub fn fldmean(&self, ds: &Dataset, opts: &FldmeanOptions) -> Result<Dataset> {
        let area = self.area_for(ds)?;
        fldmean(ds, &area, opts)
    }

    /// Linear interpolation to `levels` along the source's vertical
    /// coordinate.
    pub fn vertinterp(
        &self,
        ds: &Dataset,
        levels: &[f64],
        units: Option<&str>,
    ) -> Result<Dataset> {
        let coord = self
            .vert_coord_names()
            .into_iter()
            .find(|name| ds.coords.contains_key(name))
            .ok_or_else(|| {
                ReaderError::Config("no vertical coordinate in the dataset".to_string())
            })?;
        vertinterp(ds, &coord, levels, units)
    }

    /// Materialize the next streaming chunk. Requires a stream step in
    /// the configuration; fails with `StreamExhausted` past the end.
    pub fn retrieve_next(&mut self, vars: Option<&[String]>) -> Result<Dataset> {
        let lazy = self.retrieve(vars)?;
        let streamer = self.streamer.as_mut().ok_or_else(|| {
            ReaderError::Config("no stream step configured".to_string())
        })?;
        let (lo, hi) = streamer.next_window(&lazy.times())?;
        lazy.materialize_range(lo, hi)
    }

    /// Rewind the stream to the beginning of the range.
    pub fn reset_stream(&mut self) {
        if let Some(streamer) = &mut self.streamer {
            streamer.reset();
        }
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        self.streamer.as_ref().map(|s| s.state())
    }

    /// A finite iterator over all streaming chunks, independent of the
    /// stateful cursor.
    pub fn chunks(&self, vars: Option<&[String]>) -> Result<ChunkIterator> {
        let step = self.config.stream.ok_or_else(|| {
            ReaderError::Config("no stream step configured".to_string())
        })?;
        Ok(ChunkIterator::new(self.retrieve(vars)?, step))
    }

    /// Human-readable summary of what this reader is bound to.
    pub fn info(&self) -> String {
        let mut lines = vec![
            format!(
                "{}/{}/{} (catalog '{}')",
                self.handle.model, self.handle.exp, self.handle.source, self.handle.catalog
            ),
            self.source.describe(),
            format!(
                "source grid: {}",
                self.handle.entry.grid.as_deref().unwrap_or("unknown")
            ),
            format!(
                "fixes: {}",
                if self.fixer.is_some() { "on" } else { "off" }
            ),
        ];
        if let Some(target) = &self.config.regrid {
            lines.push(format!(
                "regrid: {} ({})",
                target,
                self.config.method.as_str()
            ));
        }
        if let Some(state) = self.stream_state() {
            lines.push(format!("stream: {state:?}"));
        }
        lines.join("\n")
    }

    fn weight_key(&self, target: &str) -> WeightKey {
        WeightKey {
            model: self.handle.model.clone(),
            exp: self.handle.exp.clone(),
            source: self.handle.source.clone(),
            method: self.config.method,
            target: target.to_string(),
        }
    }

    fn source_grid(&self) -> Result<Grid> {
        let name = self.handle.entry.grid.as_deref().ok_or_else(|| {
            ReaderError::Config(format!(
                "source '{}' declares no grid",
                self.handle.source
            ))
        })?;
        Ok(self.registry.resolve(name)?)
    }

    fn vert_coord_names(&self) -> Vec<String> {
        self.handle
            .entry
            .grid
            .as_deref()
            .and_then(|g| self.registry.definition(g))
            .map(|def| def.vert_coords.clone())
            .unwrap_or_default()
    }

    /// The area field matching the data's current horizontal grid: the
    /// regrid target if the data already sits on it, otherwise the
    /// source grid (cached on disk next to the weights).
    fn area_for(&self, ds: &Dataset) -> Result<AreaField> {
        if let Some(target) = &self.config.regrid {
            let tg = RegularGrid::parse(target)?;
            let on_target = ds
                .coords
                .get("lon")
                .is_some_and(|c| c.values == tg.lons);
            if on_target {
                return Ok(AreaField::for_regular(&tg));
            }
        }
        let src = self.source_grid()?;
        let key = self.weight_key(self.config.regrid.as_deref().unwrap_or(""));
        let mut area = self
            .store
            .area(&key.area_filename(), &src, self.config.rebuild)?;
        if let Some(fixer) = &self.fixer {
            // Source areas may come back with raw coordinate names.
            if let (Some(lons), Some(lats)) = (&area.lons, &area.lats) {
                let mut probe = Dataset::new();
                probe.insert_coord(cda_common::Coordinate::new("lon", lons.clone()));
                probe.insert_coord(cda_common::Coordinate::new("lat", lats.clone()));
                fixer.fix_coords(&mut probe)?;
                area.lons = probe.coords.get("lon").map(|c| c.values.clone());
                area.lats = probe.coords.get("lat").map(|c| c.values.clone());
            }
        }
        Ok(area)
    }
}

/// Regrid `ds`, selecting per-level weights from whichever vertical
/// coordinate of the source is present in the data.
fn regrid_dataset(
    store: &WeightStore,
    key: &WeightKey,
    src: &Grid,
    vert_names: &[String],
    rebuild: bool,
    ds: &Dataset,
) -> Result<Dataset> {
    let vert: Option<(String, Vec<usize>)> = vert_names.iter().find_map(|name| {
        ds.coords
            .get(name)
            .and_then(|c| c.source_index.clone())
            .map(|ids| (name.clone(), ids))
    });
    let vert_ref = vert.as_ref().map(|(name, ids)| (name.as_str(), ids.as_slice()));
    let regridder = Regridder::new(store, key, src, vert_ref, rebuild)?;
    Ok(regridder.regrid(ds)?)
}
