//! Temporal resampling.
//!
//! Groups timesteps into calendar periods at a target frequency and
//! reduces each group with a chosen statistic. Reductions skip NaN
//! values (a fully-NaN group yields NaN). Incomplete boundary periods
//! can be excluded: a period counts as complete when its samples cover
//! the full canonical period length, which for months and years depends
//! on the calendar (leap years included).

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use cda_common::{DataArray, Dataset, Frequency, TimeAxis};

use crate::error::{ReaderError, Result};

/// Reduction statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Mean,
    Std,
    Max,
    Min,
}

impl Stat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Stat::Mean),
            "std" => Ok(Stat::Std),
            "max" => Ok(Stat::Max),
            "min" => Ok(Stat::Min),
            other => Err(ReaderError::Config(format!("unknown statistic '{other}'"))),
        }
    }

    /// Reduce a sample of values, skipping NaN.
    fn reduce(&self, samples: &[f64]) -> f64 {
        let valid: Vec<f64> = samples.iter().copied().filter(|v| !v.is_nan()).collect();
        if valid.is_empty() {
            return f64::NAN;
        }
        let n = valid.len() as f64;
        match self {
            Stat::Mean => valid.iter().sum::<f64>() / n,
            Stat::Std => {
                let mean = valid.iter().sum::<f64>() / n;
                (valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
            }
            Stat::Max => valid.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Stat::Min => valid.iter().cloned().fold(f64::INFINITY, f64::min),
        }
    }
}

/// Options for [`timmean`].
#[derive(Debug, Clone, Copy)]
pub struct TimmeanOptions {
    pub stat: Stat,
    /// Drop boundary periods whose samples do not span the canonical
    /// period length.
    pub exclude_incomplete: bool,
    /// Attach a CF-style `time_bnds` variable with period bounds.
    pub time_bnds: bool,
    /// Stamp each period at its midpoint instead of its start.
    pub center_time: bool,
}

impl Default for TimmeanOptions {
    fn default() -> Self {
        Self {
            stat: Stat::Mean,
            exclude_incomplete: false,
            time_bnds: false,
            center_time: false,
        }
    }
}

/// Whether the samples at `indices` cover the full period starting at
/// `start`, given the axis step.
fn is_complete(
    axis: &TimeAxis,
    freq: Frequency,
    start: DateTime<Utc>,
    indices: &[usize],
) -> bool {
    let Some(step) = axis.step() else {
        // A single sample cannot prove coverage; treat as incomplete.
        return false;
    };
    let step_secs = step.num_seconds().max(1);
    let covered = indices.len() as i64 * step_secs;
    covered >= freq.period_seconds(start)
}

/// Resample a dataset along time to `freq`.
pub fn timmean(ds: &Dataset, freq: Frequency, opts: &TimmeanOptions) -> Result<Dataset> {
    let axis = ds.time_axis()?.clone();
    let mut groups = axis.group_by_period(freq);
    if opts.exclude_incomplete {
        let before = groups.len();
        groups.retain(|(start, idxs)| is_complete(&axis, freq, *start, idxs));
        if groups.len() < before {
            info!(
                "excluding {} incomplete {freq} period(s)",
                before - groups.len()
            );
        }
    }
    if groups.is_empty() {
        return Err(ReaderError::Config(format!(
            "no complete {freq} periods in the requested range"
        )));
    }

    let stamps: Vec<DateTime<Utc>> = groups
        .iter()
        .map(|(start, _)| {
            if opts.center_time {
                freq.period_center(*start)
            } else {
                *start
            }
        })
        .collect();

    let mut out = Dataset::new();
    out.attrs = ds.attrs.clone();
    for coord in ds.coords.values() {
        out.insert_coord(coord.clone());
    }

    for (name, var) in &ds.vars {
        let Some(0) = var.dim_index("time") else {
            out.insert_var(var.clone());
            continue;
        };
        let space: usize = var.shape[1..].iter().product();
        let mut values = Vec::with_capacity(groups.len() * space);
        let mut samples = Vec::new();
        for (_, idxs) in &groups {
            for k in 0..space {
                samples.clear();
                samples.extend(idxs.iter().map(|&t| var.values[t * space + k]));
                values.push(opts.stat.reduce(&samples));
            }
        }
        let mut dims = var.dims.clone();
        let mut shape = var.shape.clone();
        shape[0] = groups.len();
        dims[0] = "time".to_string();
        let mut arr = DataArray::new(name.clone(), dims, shape, values)?;
        arr.attrs = var.attrs.clone();
        out.insert_var(arr);
        debug!("resampled '{name}' to {} {freq} period(s)", groups.len());
    }

    if opts.time_bnds {
        let mut bnds = Vec::with_capacity(groups.len() * 2);
        for (start, _) in &groups {
            bnds.push(start.timestamp() as f64);
            bnds.push(freq.next_period(*start).timestamp() as f64);
        }
        let arr = DataArray::new(
            "time_bnds",
            vec!["time".to_string(), "bnds".to_string()],
            vec![groups.len(), 2],
            bnds,
        )?
        .with_units("seconds since 1970-01-01T00:00:00");
        out.insert_var(arr);
    }

    out.time = Some(TimeAxis { times: stamps });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata;
    use cda_common::parse_date;

    fn opts() -> TimmeanOptions {
        TimmeanOptions::default()
    }

    #[test]
    fn test_daily_mean_of_hourly() {
        // Two full days of hourly data
        let ds = testdata::surface_dataset("2020-05-01T00:00:00", 48);
        let out = timmean(&ds, Frequency::Daily, &opts()).unwrap();
        assert_eq!(out.time.as_ref().unwrap().times.len(), 2);
        let t2m = out.var("t2m").unwrap();
        assert_eq!(t2m.shape[0], 2);
        assert!((t2m.values[0] - 285.0).abs() < 1e-12);
    }

    #[test]
    fn test_exclude_incomplete_monthly() {
        // Hourly from Jan 31 18:00 through all of February 2020: January
        // is incomplete, leap February is complete
        let jan_hours = 6;
        let feb_hours = 29 * 24;
        let ds = testdata::surface_dataset("2020-01-31T18:00:00", jan_hours + feb_hours);

        let keep_all = timmean(&ds, Frequency::Monthly, &opts()).unwrap();
        assert_eq!(keep_all.time.as_ref().unwrap().times.len(), 2);

        let strict = timmean(
            &ds,
            Frequency::Monthly,
            &TimmeanOptions {
                exclude_incomplete: true,
                ..opts()
            },
        )
        .unwrap();
        let times = &strict.time.as_ref().unwrap().times;
        assert_eq!(times.len(), 1);
        assert_eq!(times[0], parse_date("2020-02-01").unwrap());
    }

    #[test]
    fn test_no_complete_periods_is_error() {
        let ds = testdata::surface_dataset("2020-05-10T00:00:00", 12);
        let err = timmean(
            &ds,
            Frequency::Monthly,
            &TimmeanOptions {
                exclude_incomplete: true,
                ..opts()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ReaderError::Config(_)));
    }

    #[test]
    fn test_statistics() {
        let ds = testdata::surface_dataset("2020-05-01T00:00:00", 24);
        for (stat, expect) in [(Stat::Max, 285.0), (Stat::Min, 285.0), (Stat::Std, 0.0)] {
            let out = timmean(
                &ds,
                Frequency::Daily,
                &TimmeanOptions { stat, ..opts() },
            )
            .unwrap();
            assert!((out.var("t2m").unwrap().values[0] - expect).abs() < 1e-12);
        }
    }

    #[test]
    fn test_time_bnds_and_centering() {
        let ds = testdata::surface_dataset("2020-05-01T00:00:00", 48);
        let out = timmean(
            &ds,
            Frequency::Daily,
            &TimmeanOptions {
                time_bnds: true,
                center_time: true,
                ..opts()
            },
        )
        .unwrap();
        let times = &out.time.as_ref().unwrap().times;
        assert_eq!(times[0], parse_date("2020-05-01T12:00:00").unwrap());
        let bnds = out.var("time_bnds").unwrap();
        assert_eq!(bnds.shape, vec![2, 2]);
        let day = 86400.0;
        assert!((bnds.values[1] - bnds.values[0] - day).abs() < 1e-9);
    }
}
