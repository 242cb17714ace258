//! Deferred dataset evaluation.
//!
//! `retrieve()` returns a `LazyDataset`: a loader plus an ordered chain
//! of operations (fixing, regridding) that only run when the caller
//! materializes. Materialization can cover the whole window, a sub-range,
//! or run chunked in parallel with the results concatenated along time.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use cda_common::{Dataset, TimeAxis};

use crate::error::Result;
use crate::source::DataSource;

type Op = Arc<dyn Fn(Dataset) -> Result<Dataset> + Send + Sync>;

/// A dataset whose loading and transformation are deferred.
#[derive(Clone)]
pub struct LazyDataset {
    source: Arc<dyn DataSource>,
    vars: Option<Vec<String>>,
    /// Half-open index window along the source time axis.
    window: (usize, usize),
    times: TimeAxis,
    ops: Vec<Op>,
}

impl LazyDataset {
    pub fn new(source: Arc<dyn DataSource>, vars: Option<Vec<String>>) -> Result<Self> {
        let times = source.time_axis()?;
        let window = (0, times.len());
        Ok(Self {
            source,
            vars,
            window,
            times,
            ops: Vec::new(),
        })
    }

    /// Append a deferred operation to the chain.
    pub fn with_op(mut self, op: impl Fn(Dataset) -> Result<Dataset> + Send + Sync + 'static) -> Self {
        self.ops.push(Arc::new(op));
        self
    }

    /// Narrow the evaluation window (indices relative to the current
    /// window start).
    pub fn narrowed(&self, lo: usize, hi: usize) -> Self {
        let (base, end) = self.window;
        let lo = (base + lo).min(end);
        let hi = (base + hi).min(end);
        let mut out = self.clone();
        out.window = (lo, hi);
        out
    }

    /// Times covered by the current window.
    pub fn times(&self) -> TimeAxis {
        let (lo, hi) = self.window;
        TimeAxis {
            times: self.times.times[lo..hi].to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.window.1 - self.window.0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run(&self, window: (usize, usize)) -> Result<Dataset> {
        let mut ds = self
            .source
            .load(self.vars.as_deref(), Some(window))?;
        for op in &self.ops {
            ds = op(ds)?;
        }
        Ok(ds)
    }

    /// Load and transform the whole window.
    pub fn materialize(&self) -> Result<Dataset> {
        debug!("materializing window {:?}", self.window);
        self.run(self.window)
    }

    /// Load and transform a sub-range of the window.
    pub fn materialize_range(&self, lo: usize, hi: usize) -> Result<Dataset> {
        self.narrowed(lo, hi).materialize()
    }

    /// Materialize in `chunks` independent time sub-ranges in parallel
    /// and concatenate the results along time.
    pub fn materialize_parallel(&self, chunks: usize) -> Result<Dataset> {
        let n = self.len();
        let chunks = chunks.clamp(1, n.max(1));
        if chunks <= 1 {
            return self.materialize();
        }
        let per = n.div_ceil(chunks);
        let ranges: Vec<(usize, usize)> = (0..n)
            .step_by(per)
            .map(|lo| (lo, (lo + per).min(n)))
            .collect();
        debug!("materializing {n} steps in {} parallel chunks", ranges.len());
        let parts: Vec<Dataset> = ranges
            .into_par_iter()
            .map(|(lo, hi)| self.materialize_range(lo, hi))
            .collect::<Result<Vec<_>>>()?;
        Ok(Dataset::concat_time(parts)?)
    }
}
