//! Decumulation of accumulated variables.
//!
//! Some model outputs accumulate fluxes since the start of a forecast or
//! calendar period, resetting the counter at a boundary. Decumulation
//! takes the timestep difference along the time axis; at a reset boundary
//! the raw value is already the per-step amount and is kept as is.

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use cda_common::{DataArray, DataError, Result, TimeAxis};

/// Where the accumulation counter resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jump {
    None,
    Day,
    Month,
}

impl Jump {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("day") => Jump::Day,
            Some("month") | Some("mon") => Jump::Month,
            _ => Jump::None,
        }
    }

    /// Whether `cur` starts a new accumulation period relative to `prev`.
    fn crossed(self, prev: DateTime<Utc>, cur: DateTime<Utc>) -> bool {
        match self {
            Jump::None => false,
            Jump::Day => prev.date_naive() != cur.date_naive(),
            Jump::Month => prev.year() != cur.year() || prev.month() != cur.month(),
        }
    }
}

/// Differentiate `arr` along its leading time dimension.
///
/// At indices where `jump` detects a period boundary the raw value is kept
/// instead of the difference; boundaries whose timestamp falls strictly
/// inside `nan_window` are masked to NaN instead (known artifact windows
/// in some experiments). The first timestep is set to NaN unless
/// `keep_first` is true. Negative differences (counter wrap not captured
/// by the jump rule) are clamped to the raw value as well.
pub fn decumulate(
    arr: &DataArray,
    time: &TimeAxis,
    jump: Jump,
    keep_first: bool,
    nan_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Result<DataArray> {
    let t_idx = arr
        .dim_index("time")
        .ok_or_else(|| DataError::DimNotFound("time".to_string()))?;
    if t_idx != 0 {
        return Err(DataError::NotAligned {
            left: arr.name.clone(),
            right: "time".to_string(),
            reason: "time must be the leading dimension".to_string(),
        });
    }
    let nt = arr.shape[0];
    if nt != time.len() {
        return Err(DataError::NotAligned {
            left: arr.name.clone(),
            right: "time".to_string(),
            reason: format!("{nt} steps vs {} time values", time.len()),
        });
    }
    let step: usize = arr.shape[1..].iter().product();

    let in_window = |t: chrono::DateTime<Utc>| match nan_window {
        Some((start, end)) => t > start && t < end,
        None => false,
    };

    let mut out = arr.clone();
    debug!("decumulating '{}' over {nt} timesteps", arr.name);
    for t in (1..nt).rev() {
        let boundary = jump.crossed(time.times[t - 1], time.times[t]);
        for k in 0..step {
            let i = t * step + k;
            if boundary {
                out.values[i] = if in_window(time.times[t]) {
                    f64::NAN
                } else {
                    arr.values[i]
                };
            } else {
                let diff = arr.values[i] - arr.values[i - step];
                out.values[i] = if diff < 0.0 { arr.values[i] } else { diff };
            }
        }
    }
    if nt > 0 && (!keep_first || in_window(time.times[0])) {
        for k in 0..step {
            out.values[k] = f64::NAN;
        }
    }
    out.attrs.decumulated = true;
    Ok(out)
}
