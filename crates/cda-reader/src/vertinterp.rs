//! Linear interpolation along a vertical coordinate.
//!
//! Variables carrying the vertical dimension are interpolated to
//! arbitrary target levels; anything else passes through unchanged.
//! Targets outside the source range become NaN. Targets may be given in
//! different units than the stored coordinate, in which case the
//! coordinate is converted first.

use tracing::debug;

use cda_common::{Coordinate, DataArray, Dataset};
use cda_fixer::{convert_units, parse_unit, Conversion};

use crate::error::{ReaderError, Result};

/// Interpolation plan for one target level: bracketing source positions
/// and the fractional weight of the upper one.
type Bracket = Option<(usize, usize, f64)>;

fn brackets(levels: &[f64], targets: &[f64]) -> Vec<Bracket> {
    // Positions sorted by level value; the axis itself may be decreasing.
    let mut order: Vec<usize> = (0..levels.len()).collect();
    order.sort_by(|&a, &b| levels[a].total_cmp(&levels[b]));
    let sorted: Vec<f64> = order.iter().map(|&i| levels[i]).collect();

    targets
        .iter()
        .map(|&t| {
            if sorted.is_empty() || t < sorted[0] || t > sorted[sorted.len() - 1] {
                return None;
            }
            let k = sorted.partition_point(|&v| v < t);
            if k < sorted.len() && sorted[k] == t {
                return Some((order[k], order[k], 0.0));
            }
            let (lo, hi) = (k - 1, k);
            let w = (t - sorted[lo]) / (sorted[hi] - sorted[lo]);
            Some((order[lo], order[hi], w))
        })
        .collect()
}

/// Interpolate all variables carrying `coord` to `target_levels`.
///
/// `target_units` converts the stored coordinate before matching, e.g.
/// targets in hPa against a coordinate stored in Pa.
pub fn vertinterp(
    ds: &Dataset,
    coord: &str,
    target_levels: &[f64],
    target_units: Option<&str>,
) -> Result<Dataset> {
    let source = ds
        .coords
        .get(coord)
        .ok_or_else(|| ReaderError::Config(format!("no vertical coordinate '{coord}'")))?;

    let mut levels = source.values.clone();
    if let Some(tgt_units) = target_units {
        let src_units = source.units.as_deref().unwrap_or(tgt_units);
        if src_units != tgt_units {
            let (src, dst) = (parse_unit(src_units)?, parse_unit(tgt_units)?);
            match convert_units(&src, &dst, 1.0, coord) {
                Conversion::Linear { factor, offset } => {
                    for v in levels.iter_mut() {
                        *v = *v * factor + offset;
                    }
                    debug!("converted '{coord}' from {src_units} to {tgt_units}");
                }
                Conversion::NotConvertible => {
                    return Err(ReaderError::Config(format!(
                        "cannot convert '{coord}' from {src_units} to {tgt_units}"
                    )));
                }
            }
        }
    }

    let plan = brackets(&levels, target_levels);
    let mut out = Dataset::new();
    out.time = ds.time.clone();
    out.attrs = ds.attrs.clone();

    for (name, var) in &ds.vars {
        let Some(d) = var.dim_index(coord) else {
            out.insert_var(var.clone());
            continue;
        };
        let nlev = var.shape[d];
        let inner: usize = var.shape[d + 1..].iter().product();
        let outer: usize = var.shape[..d].iter().product();
        let ntgt = target_levels.len();

        let mut values = Vec::with_capacity(outer * ntgt * inner);
        for o in 0..outer {
            let base = o * nlev * inner;
            for bracket in &plan {
                match bracket {
                    Some((lo, hi, w)) => {
                        for k in 0..inner {
                            let a = var.values[base + lo * inner + k];
                            let b = var.values[base + hi * inner + k];
                            values.push(a + (b - a) * w);
                        }
                    }
                    None => values.extend(std::iter::repeat(f64::NAN).take(inner)),
                }
            }
        }
        let mut shape = var.shape.clone();
        shape[d] = ntgt;
        let mut arr = DataArray::new(name.clone(), var.dims.clone(), shape, values)?;
        arr.attrs = var.attrs.clone();
        out.insert_var(arr);
        debug!("interpolated '{name}' to {ntgt} level(s)");
    }

    for (name, c) in &ds.coords {
        if name != coord {
            out.insert_coord(c.clone());
        }
    }
    let mut new_coord = Coordinate::new(coord, target_levels.to_vec());
    new_coord.units = target_units
        .map(|s| s.to_string())
        .or_else(|| source.units.clone());
    out.insert_coord(new_coord);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata;

    #[test]
    fn test_linear_interpolation() {
        // Levels 100000, 85000, 70000 with ta = 280, 270, 260
        let ds = testdata::pressure_dataset("2020-05-01T00:00:00", 1, 3);
        let out = vertinterp(&ds, "plev", &[92500.0], None).unwrap();
        let ta = out.var("ta").unwrap();
        assert_eq!(ta.shape[1], 1);
        assert!((ta.values[0] - 275.0).abs() < 1e-9);
        assert_eq!(out.coords["plev"].values, vec![92500.0]);
    }

    #[test]
    fn test_exact_level_passthrough() {
        let ds = testdata::pressure_dataset("2020-05-01T00:00:00", 1, 3);
        let out = vertinterp(&ds, "plev", &[85000.0], None).unwrap();
        assert!((out.var("ta").unwrap().values[0] - 270.0).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_is_nan() {
        let ds = testdata::pressure_dataset("2020-05-01T00:00:00", 1, 3);
        let out = vertinterp(&ds, "plev", &[110000.0, 85000.0], None).unwrap();
        let ta = out.var("ta").unwrap();
        assert!(ta.values[0..testdata::NLAT * testdata::NLON]
            .iter()
            .all(|v| v.is_nan()));
    }

    #[test]
    fn test_unit_conversion_of_coordinate() {
        let ds = testdata::pressure_dataset("2020-05-01T00:00:00", 1, 3);
        // Targets in hPa against a coordinate stored in Pa
        let out = vertinterp(&ds, "plev", &[925.0], Some("hPa")).unwrap();
        assert!((out.var("ta").unwrap().values[0] - 275.0).abs() < 1e-9);
        assert_eq!(out.coords["plev"].units.as_deref(), Some("hPa"));
    }

    #[test]
    fn test_vars_without_level_untouched() {
        let mut ds = testdata::pressure_dataset("2020-05-01T00:00:00", 1, 3);
        let sfc = testdata::surface_dataset("2020-05-01T00:00:00", 1);
        ds.insert_var(sfc.var("t2m").unwrap().clone());
        let out = vertinterp(&ds, "plev", &[92500.0], None).unwrap();
        assert_eq!(out.var("t2m").unwrap().shape, vec![1, 4, 8]);
    }

    #[test]
    fn test_missing_coordinate() {
        let ds = testdata::surface_dataset("2020-05-01T00:00:00", 1);
        assert!(matches!(
            vertinterp(&ds, "plev", &[85000.0], None),
            Err(ReaderError::Config(_))
        ));
    }
}
