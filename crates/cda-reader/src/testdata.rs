//! Synthetic dataset builders backing the test suites.
//!
//! Data lives on the small regular `r8x4` grid so builtin weight
//! generation applies. The accumulated precipitation variable mimics an
//! hourly model output whose counter resets at the start of each month.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use cda_common::{parse_date, Coordinate, DataArray, Dataset, TimeAxis};
use cda_regrid::RegularGrid;

use crate::error::{ReaderError, Result};

pub const NLON: usize = 8;
pub const NLAT: usize = 4;

pub fn hourly_axis(start: &str, n: usize) -> TimeAxis {
    let t0 = parse_date(start).unwrap();
    TimeAxis {
        times: (0..n).map(|i| t0 + Duration::hours(i as i64)).collect(),
    }
}

/// Accumulated value at a timestep: 1 mm (0.001 m) per hour since the
/// start of the month.
fn accumulated_tp(t: DateTime<Utc>) -> f64 {
    let hours_into_month = t.day0() as f64 * 24.0 + t.hour() as f64;
    0.001 * (hours_into_month + 1.0)
}

fn grid_coords(ds: &mut Dataset) {
    let grid = RegularGrid::global(NLON, NLAT);
    ds.insert_coord(Coordinate::new("lat", grid.lats.clone()).with_units("degrees_north"));
    ds.insert_coord(Coordinate::new("lon", grid.lons.clone()).with_units("degrees_east"));
}

fn surface_var(name: &str, ntime: usize, f: impl Fn(usize, usize) -> f64) -> DataArray {
    let mut values = Vec::with_capacity(ntime * NLAT * NLON);
    for t in 0..ntime {
        for c in 0..NLAT * NLON {
            values.push(f(t, c));
        }
    }
    DataArray::new(
        name,
        vec!["time".to_string(), "lat".to_string(), "lon".to_string()],
        vec![ntime, NLAT, NLON],
        values,
    )
    .unwrap()
}

/// A surface dataset with accumulated `tp` (meters) and constant `t2m`.
pub fn surface_dataset(start: &str, ntime: usize) -> Dataset {
    let axis = hourly_axis(start, ntime);
    let mut ds = Dataset::new();
    grid_coords(&mut ds);
    let tp_at: Vec<f64> = axis.times.iter().map(|&t| accumulated_tp(t)).collect();
    let mut tp = surface_var("tp", ntime, |t, _| tp_at[t]);
    tp.attrs.units = Some("m".to_string());
    ds.insert_var(tp);
    let mut t2m = surface_var("t2m", ntime, |_, _| 285.0);
    t2m.attrs.units = Some("K".to_string());
    ds.insert_var(t2m);
    ds.time = Some(axis);
    ds
}

/// A dataset with a vertical dimension: `ta` over `nlev` pressure levels.
pub fn pressure_dataset(start: &str, ntime: usize, nlev: usize) -> Dataset {
    let axis = hourly_axis(start, ntime);
    let mut ds = Dataset::new();
    grid_coords(&mut ds);
    let levels: Vec<f64> = (0..nlev).map(|k| 100000.0 - 15000.0 * k as f64).collect();
    ds.insert_coord(Coordinate::new("plev", levels).with_units("Pa"));
    let space = NLAT * NLON;
    let mut values = Vec::with_capacity(ntime * nlev * space);
    for _t in 0..ntime {
        for k in 0..nlev {
            for _ in 0..space {
                values.push(280.0 - 10.0 * k as f64);
            }
        }
    }
    let mut ta = DataArray::new(
        "ta",
        vec![
            "time".to_string(),
            "plev".to_string(),
            "lat".to_string(),
            "lon".to_string(),
        ],
        vec![ntime, nlev, NLAT, NLON],
        values,
    )
    .unwrap();
    ta.attrs.units = Some("K".to_string());
    ds.insert_var(ta);
    ds.time = Some(axis);
    ds
}

fn write_json(path: &Path, ds: &Dataset) -> Result<()> {
    let text = serde_json::to_string(ds).map_err(|e| ReaderError::SourceRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, text).map_err(|e| ReaderError::SourceRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write a file-glob source: `ntime` hourly steps split over `nfiles`
/// chunk files in name order.
pub fn write_file_source(dir: &Path, start: &str, ntime: usize, nfiles: usize) -> Result<()> {
    let full = surface_dataset(start, ntime);
    let per_file = ntime.div_ceil(nfiles);
    for (i, lo) in (0..ntime).step_by(per_file).enumerate() {
        let hi = (lo + per_file).min(ntime);
        let chunk = full.slice_time(lo, hi)?;
        write_json(&dir.join(format!("chunk_{i:03}.json")), &chunk)?;
    }
    Ok(())
}

/// Write an archive source: one file per variable.
pub fn write_archive_source(dir: &Path, start: &str, ntime: usize) -> Result<()> {
    let full = surface_dataset(start, ntime);
    for name in full.var_names() {
        let single = full.subset_vars(&[name.clone()])?;
        write_json(&dir.join(format!("{name}.json")), &single)?;
    }
    Ok(())
}

/// Write a file-glob source with a vertical dimension.
pub fn write_3d_file_source(dir: &Path, start: &str, ntime: usize, nlev: usize) -> Result<()> {
    let ds = pressure_dataset(start, ntime, nlev);
    write_json(&dir.join("chunk_000.json"), &ds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulation_resets_monthly() {
        // Last hour of January vs first hour of February
        let jan = parse_date("2020-01-31T23:00:00").unwrap();
        let feb = parse_date("2020-02-01T00:00:00").unwrap();
        assert!(accumulated_tp(jan) > accumulated_tp(feb));
        assert!((accumulated_tp(feb) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_surface_dataset_shape() {
        let ds = surface_dataset("2020-05-01T00:00:00", 5);
        let tp = ds.var("tp").unwrap();
        assert_eq!(tp.shape, vec![5, NLAT, NLON]);
        assert_eq!(ds.time.as_ref().unwrap().times.len(), 5);
    }
}
