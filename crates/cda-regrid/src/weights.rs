//! Weight and area generation with an on-disk cache.
//!
//! Weight matrices are cached one file per (model, experiment, source,
//! method, target, level) key under a deterministic filename, so that
//! parallel workers asking for the same weights converge on the same
//! file. Writes go through a temp file in the cache directory followed
//! by an atomic rename; a caller that loses a generation race simply
//! re-reads the winner's file.
//!
//! For pairs of regular lon-lat grids, weights are generated in-process
//! (conservative, bilinear, nearest). Anything else is delegated to an
//! external remap engine configured by command name.

use std::fmt;
use std::fs;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RegridError, Result};
use crate::grid::{Grid, RegularGrid};
use crate::sparse::CsrMatrix;

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "CDA_CACHE_DIR";

const MEMORY_CACHE_SIZE: usize = 16;

/// Interpolation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Conservative,
    Bilinear,
    Nearest,
}

impl Method {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "con" | "ycon" | "conservative" => Ok(Method::Conservative),
            "bil" | "bilinear" => Ok(Method::Bilinear),
            "nn" | "nearest" => Ok(Method::Nearest),
            other => Err(RegridError::GridParse(format!("unknown method '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Conservative => "con",
            Method::Bilinear => "bil",
            Method::Nearest => "nn",
        }
    }
}

/// Vertical level a weight matrix applies to. Data without a vertical
/// dimension uses the surface key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LevelKey {
    Surface,
    /// Original level position along the full vertical axis.
    Level(usize),
}

impl fmt::Display for LevelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelKey::Surface => write!(f, "2d"),
            LevelKey::Level(i) => write!(f, "{i}"),
        }
    }
}

/// Identity of a weight set, used to derive cache filenames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightKey {
    pub model: String,
    pub exp: String,
    pub source: String,
    pub method: Method,
    pub target: String,
}

impl WeightKey {
    pub fn filename(&self, level: LevelKey) -> String {
        format!(
            "weights_{}_{}_{}_{}_{}_{}.json",
            self.model,
            self.exp,
            self.source,
            self.method.as_str(),
            self.target,
            level
        )
    }

    pub fn area_filename(&self) -> String {
        format!("areas_{}_{}_{}.json", self.model, self.exp, self.source)
    }
}

/// Per-cell areas for a grid, cached alongside the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaField {
    pub grid: String,
    /// Present for regular lon-lat grids; cell values are lat-major.
    pub lons: Option<Vec<f64>>,
    pub lats: Option<Vec<f64>>,
    pub values: Vec<f64>,
}

impl AreaField {
    pub fn for_regular(grid: &RegularGrid) -> Self {
        Self {
            grid: grid.name.clone(),
            lons: Some(grid.lons.clone()),
            lats: Some(grid.lats.clone()),
            values: grid.cell_areas(),
        }
    }
}

/// External conservative remapping tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemapEngine {
    pub command: String,
    pub extra_args: Vec<String>,
}

impl RemapEngine {
    /// Run the engine and read back the matrix it writes.
    fn generate(
        &self,
        src: &Grid,
        target: &str,
        method: Method,
        level: LevelKey,
        output: &Path,
    ) -> Result<CsrMatrix> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--method").arg(method.as_str());
        match src {
            Grid::Regular(g) => {
                cmd.arg("--source-grid").arg(&g.name);
            }
            Grid::Unstructured { name, path, .. } => {
                cmd.arg("--source-grid").arg(name);
                if let Some(path) = path {
                    cmd.arg("--source-file").arg(path);
                }
            }
        }
        cmd.arg("--target-grid").arg(target);
        if let LevelKey::Level(i) = level {
            cmd.arg("--level").arg(i.to_string());
        }
        // Masks must be recomputed per level for stepped ocean grids.
        cmd.arg("--recompute-mask");
        cmd.arg("--output").arg(output);
        cmd.args(&self.extra_args);

        info!("running remap engine: {:?}", cmd);
        let out = cmd.output().map_err(|source| RegridError::CacheIo {
            path: PathBuf::from(&self.command),
            source,
        })?;
        if !out.status.success() {
            return Err(RegridError::EngineFailure {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        load_matrix(output)
    }
}

fn load_matrix(path: &Path) -> Result<CsrMatrix> {
    let text = fs::read_to_string(path).map_err(|source| RegridError::CacheIo {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|e| RegridError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write JSON to `path` atomically via a temp file in the same directory.
fn atomic_write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| RegridError::CacheIo {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    let text = serde_json::to_string(value).map_err(|e| RegridError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    tmp.write_all(text.as_bytes()).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Disk-backed weight and area store with a small in-memory cache.
pub struct WeightStore {
    dir: PathBuf,
    memory: Mutex<LruCache<String, Arc<CsrMatrix>>>,
    pub engine: Option<RemapEngine>,
}

impl WeightStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memory: Mutex::new(LruCache::new(
                NonZeroUsize::new(MEMORY_CACHE_SIZE).unwrap(),
            )),
            engine: None,
        }
    }

    /// Use the directory from the environment, or the given default.
    pub fn from_env(default_dir: impl Into<PathBuf>) -> Self {
        let dir = std::env::var(CACHE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_dir.into());
        Self::new(dir)
    }

    pub fn with_engine(mut self, engine: RemapEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn weights_path(&self, key: &WeightKey, level: LevelKey) -> PathBuf {
        self.dir.join(key.filename(level))
    }

    /// Load cached weights, generating them on a miss (or always, with
    /// `rebuild`). Returns a shared handle; repeated calls for the same
    /// key hit the in-memory cache.
    pub fn get_or_generate(
        &self,
        key: &WeightKey,
        level: LevelKey,
        src: &Grid,
        rebuild: bool,
    ) -> Result<Arc<CsrMatrix>> {
        let path = self.weights_path(key, level);
        let cache_key = key.filename(level);

        if !rebuild {
            if let Some(m) = self.memory.lock().ok().and_then(|mut c| c.get(&cache_key).cloned()) {
                return Ok(m);
            }
            if path.exists() {
                debug!("loading cached weights from {}", path.display());
                let m = Arc::new(load_matrix(&path)?);
                if let Ok(mut c) = self.memory.lock() {
                    c.put(cache_key, m.clone());
                }
                return Ok(m);
            }
        }

        fs::create_dir_all(&self.dir).map_err(|source| RegridError::CacheIo {
            path: self.dir.clone(),
            source,
        })?;
        let matrix = self.generate(key, level, src, &path)?;
        atomic_write(&path, &matrix)?;
        info!("wrote weights to {}", path.display());
        let m = Arc::new(matrix);
        if let Ok(mut c) = self.memory.lock() {
            c.put(cache_key, m.clone());
        }
        Ok(m)
    }

    fn generate(
        &self,
        key: &WeightKey,
        level: LevelKey,
        src: &Grid,
        path: &Path,
    ) -> Result<CsrMatrix> {
        match src {
            Grid::Regular(src_grid) => {
                let target = RegularGrid::parse(&key.target)?;
                info!(
                    "generating {} weights {} -> {}",
                    key.method.as_str(),
                    src_grid.name,
                    key.target
                );
                Ok(generate_regular(src_grid, &target, key.method))
            }
            Grid::Unstructured { name, .. } => match &self.engine {
                Some(engine) => engine.generate(src, &key.target, key.method, level, path),
                None => Err(RegridError::EngineNotConfigured {
                    src: name.clone(),
                    tgt: key.target.clone(),
                }),
            },
        }
    }

    /// Load or compute the cell-area field for a grid.
    pub fn area(&self, filename: &str, grid: &Grid, rebuild: bool) -> Result<AreaField> {
        let path = self.dir.join(filename);
        if !rebuild && path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| RegridError::CacheIo {
                path: path.clone(),
                source,
            })?;
            return serde_json::from_str(&text).map_err(|e| RegridError::Malformed {
                path,
                reason: e.to_string(),
            });
        }
        let field = match grid {
            Grid::Regular(g) => AreaField::for_regular(g),
            Grid::Unstructured { name, path: geom, .. } => {
                let Some(geom) = geom else {
                    return Err(RegridError::GridParse(format!(
                        "{name}: unstructured grid has no geometry file for areas"
                    )));
                };
                load_area_file(geom, name)?
            }
        };
        fs::create_dir_all(&self.dir).map_err(|source| RegridError::CacheIo {
            path: self.dir.clone(),
            source,
        })?;
        atomic_write(&path, &field)?;
        Ok(field)
    }
}

/// Read an area field from a grid geometry file (JSON with a
/// `cell_area` variable).
fn load_area_file(path: &Path, grid: &str) -> Result<AreaField> {
    #[derive(Deserialize)]
    struct Geometry {
        cell_area: Vec<f64>,
        #[serde(default)]
        lon: Option<Vec<f64>>,
        #[serde(default)]
        lat: Option<Vec<f64>>,
    }
    let text = fs::read_to_string(path).map_err(|source| RegridError::CacheIo {
        path: path.to_path_buf(),
        source,
    })?;
    let geom: Geometry = serde_json::from_str(&text).map_err(|e| RegridError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(AreaField {
        grid: grid.to_string(),
        lons: geom.lon,
        lats: geom.lat,
        values: geom.cell_area,
    })
}

/// Generate weights between two regular lon-lat grids.
pub fn generate_regular(src: &RegularGrid, tgt: &RegularGrid, method: Method) -> CsrMatrix {
    match method {
        Method::Conservative => conservative(src, tgt),
        Method::Bilinear => bilinear(src, tgt),
        Method::Nearest => nearest(src, tgt),
    }
}

/// Fractional overlap of target intervals with source intervals along
/// one axis. Each row holds the fraction of target interval `i` covered
/// by each source interval, in the given measure.
fn axis_overlaps(
    tgt_edges: &[f64],
    src_edges: &[f64],
    wrap: Option<f64>,
    measure: impl Fn(f64, f64) -> f64,
) -> Vec<Vec<(usize, f64)>> {
    let ntgt = tgt_edges.len() - 1;
    let nsrc = src_edges.len() - 1;
    let shifts: Vec<f64> = match wrap {
        Some(period) => vec![-period, 0.0, period],
        None => vec![0.0],
    };
    let mut rows = Vec::with_capacity(ntgt);
    for i in 0..ntgt {
        let (a, b) = (tgt_edges[i], tgt_edges[i + 1]);
        let total = measure(a, b);
        let mut row = Vec::new();
        for j in 0..nsrc {
            let mut overlap = 0.0;
            for &shift in &shifts {
                let lo = (src_edges[j] + shift).max(a);
                let hi = (src_edges[j + 1] + shift).min(b);
                if hi > lo {
                    overlap += measure(lo, hi);
                }
            }
            if overlap > 0.0 {
                row.push((j, overlap / total));
            }
        }
        rows.push(row);
    }
    rows
}

/// First-order conservative remapping, separable in lon and sin(lat).
fn conservative(src: &RegularGrid, tgt: &RegularGrid) -> CsrMatrix {
    let lon_rows = axis_overlaps(&tgt.lon_edges(), &src.lon_edges(), Some(360.0), |a, b| b - a);
    let lat_rows = axis_overlaps(&tgt.lat_edges(), &src.lat_edges(), None, |a, b| {
        b.to_radians().sin() - a.to_radians().sin()
    });
    let mut triplets = Vec::new();
    for (tj, lat_row) in lat_rows.iter().enumerate() {
        for (ti, lon_row) in lon_rows.iter().enumerate() {
            let row = tj * tgt.nlon() + ti;
            for &(sj, wlat) in lat_row {
                for &(si, wlon) in lon_row {
                    triplets.push((row, sj * src.nlon() + si, wlat * wlon));
                }
            }
        }
    }
    CsrMatrix::from_triplets(tgt.ncells(), src.ncells(), &triplets)
}

/// Neighbor indices and interpolation fractions along one periodic or
/// clamped axis of source centers.
fn axis_neighbors(centers: &[f64], x: f64, period: Option<f64>) -> ((usize, f64), (usize, f64)) {
    let n = centers.len();
    if n == 1 {
        return ((0, 1.0), (0, 0.0));
    }
    match period {
        Some(p) => {
            let x = x.rem_euclid(p);
            // Find the bracketing pair on the circle
            for i in 0..n {
                let a = centers[i];
                let b = centers[(i + 1) % n];
                let span = (b - a).rem_euclid(p);
                let off = (x - a).rem_euclid(p);
                if off <= span && span > 0.0 {
                    let f = off / span;
                    return ((i, 1.0 - f), ((i + 1) % n, f));
                }
            }
            ((0, 1.0), (0, 0.0))
        }
        None => {
            if x <= centers[0] {
                return ((0, 1.0), (0, 0.0));
            }
            if x >= centers[n - 1] {
                return ((n - 1, 1.0), (n - 1, 0.0));
            }
            let i = centers.partition_point(|&c| c < x) - 1;
            let f = (x - centers[i]) / (centers[i + 1] - centers[i]);
            ((i, 1.0 - f), (i + 1, f))
        }
    }
}

fn bilinear(src: &RegularGrid, tgt: &RegularGrid) -> CsrMatrix {
    let mut triplets = Vec::new();
    for (tj, &lat) in tgt.lats.iter().enumerate() {
        let ((j0, wj0), (j1, wj1)) = axis_neighbors(&src.lats, lat, None);
        for (ti, &lon) in tgt.lons.iter().enumerate() {
            let ((i0, wi0), (i1, wi1)) = axis_neighbors(&src.lons, lon, Some(360.0));
            let row = tj * tgt.nlon() + ti;
            for &(j, wj) in &[(j0, wj0), (j1, wj1)] {
                for &(i, wi) in &[(i0, wi0), (i1, wi1)] {
                    let w = wj * wi;
                    if w > 0.0 {
                        triplets.push((row, j * src.nlon() + i, w));
                    }
                }
            }
        }
    }
    CsrMatrix::from_triplets(tgt.ncells(), src.ncells(), &triplets)
}

fn nearest(src: &RegularGrid, tgt: &RegularGrid) -> CsrMatrix {
    let nearest_idx = |centers: &[f64], x: f64, period: Option<f64>| -> usize {
        let dist = |c: f64| match period {
            Some(p) => {
                let d = (c - x).rem_euclid(p);
                d.min(p - d)
            }
            None => (c - x).abs(),
        };
        let mut best = 0;
        for (i, &c) in centers.iter().enumerate() {
            if dist(c) < dist(centers[best]) {
                best = i;
            }
        }
        best
    };
    let mut triplets = Vec::new();
    for (tj, &lat) in tgt.lats.iter().enumerate() {
        let j = nearest_idx(&src.lats, lat, None);
        for (ti, &lon) in tgt.lons.iter().enumerate() {
            let i = nearest_idx(&src.lons, lon, Some(360.0));
            triplets.push((tj * tgt.nlon() + ti, j * src.nlon() + i, 1.0));
        }
    }
    CsrMatrix::from_triplets(tgt.ncells(), src.ncells(), &triplets)
}
