//! Area-weighted spatial averaging.
//!
//! Collapses the horizontal dimensions of every variable to a single
//! weighted mean per remaining index, using a cell-area field as
//! weights. The area field must align exactly with the data's
//! horizontal coordinates; a silent mismatch would weight the wrong
//! cells. An optional lon/lat box restricts the average to a region.

use tracing::debug;

use cda_common::{BoundingBox, DataArray, DataError, Dataset};
use cda_regrid::AreaField;

use crate::error::{ReaderError, Result};

/// Options for [`fldmean`].
#[derive(Debug, Clone, Default)]
pub struct FldmeanOptions {
    /// Restrict averaging to this lon/lat box.
    pub bbox: Option<BoundingBox>,
    /// Count cells sitting exactly on the box border as inside.
    pub include_border: bool,
}

fn check_alignment(ds: &Dataset, area: &AreaField) -> Result<()> {
    let pairs = [("lon", &area.lons), ("lat", &area.lats)];
    for (name, expected) in pairs {
        let Some(expected) = expected else { continue };
        let coord = ds
            .coords
            .get(name)
            .ok_or_else(|| DataError::DimNotFound(name.to_string()))?;
        if coord.values != *expected {
            return Err(ReaderError::Data(DataError::NotAligned {
                left: name.to_string(),
                right: format!("area field '{}'", area.grid),
                reason: "coordinate values differ from the area field".to_string(),
            }));
        }
    }
    Ok(())
}

/// Indices along a coordinate that fall inside the box.
fn box_indices(
    values: &[f64],
    contains: impl Fn(f64) -> bool,
) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, &v)| contains(v))
        .map(|(i, _)| i)
        .collect()
}

/// Area-weighted mean over the horizontal dimensions.
pub fn fldmean(ds: &Dataset, area: &AreaField, opts: &FldmeanOptions) -> Result<Dataset> {
    check_alignment(ds, area)?;

    let mut ds = ds.clone();
    let mut weights = area.values.clone();

    if let Some(bbox) = &opts.bbox {
        let (Some(lons), Some(lats)) = (&area.lons, &area.lats) else {
            return Err(ReaderError::NoAreaField(format!(
                "'{}' has no lon/lat coordinates for box selection",
                area.grid
            )));
        };
        let lat_idx = box_indices(lats, |v| bbox.contains_lat(v, opts.include_border));
        let lon_idx = box_indices(lons, |v| bbox.contains_lon(v, opts.include_border));
        if lat_idx.is_empty() || lon_idx.is_empty() {
            return Err(ReaderError::Config(
                "selection box contains no grid cells".to_string(),
            ));
        }
        debug!(
            "box selection keeps {}x{} of {}x{} cells",
            lat_idx.len(),
            lon_idx.len(),
            lats.len(),
            lons.len()
        );
        ds = ds.select_dim("lat", &lat_idx)?;
        ds = ds.select_dim("lon", &lon_idx)?;
        let nlon = lons.len();
        let mut subset = Vec::with_capacity(lat_idx.len() * lon_idx.len());
        for &j in &lat_idx {
            for &i in &lon_idx {
                subset.push(area.values[j * nlon + i]);
            }
        }
        weights = subset;
    }

    let ncells = weights.len();
    let mut out = Dataset::new();
    out.time = ds.time.clone();
    out.attrs = ds.attrs.clone();

    let mut horiz: Vec<String> = Vec::new();
    for (name, var) in &ds.vars {
        let n = var.dims.len();
        let nhoriz = if n >= 1 && var.shape[n - 1] == ncells {
            1
        } else if n >= 2 && var.shape[n - 2] * var.shape[n - 1] == ncells {
            2
        } else {
            return Err(ReaderError::Data(DataError::NotAligned {
                left: name.clone(),
                right: format!("area field '{}'", area.grid),
                reason: format!("{ncells} weights do not match the trailing dims"),
            }));
        };
        if horiz.is_empty() {
            horiz = var.dims[n - nhoriz..].to_vec();
        }
        let outer: usize = var.shape[..n - nhoriz].iter().product();
        let mut values = Vec::with_capacity(outer.max(1));
        for o in 0..outer.max(1) {
            let slice = &var.values[o * ncells..(o + 1) * ncells];
            let mut num = 0.0;
            let mut den = 0.0;
            for (v, w) in slice.iter().zip(weights.iter()) {
                if !v.is_nan() {
                    num += v * w;
                    den += w;
                }
            }
            values.push(if den > 0.0 { num / den } else { f64::NAN });
        }
        let dims = var.dims[..n - nhoriz].to_vec();
        let shape = var.shape[..n - nhoriz].to_vec();
        let mut arr = DataArray::new(name.clone(), dims, shape, values)?;
        arr.attrs = var.attrs.clone();
        out.insert_var(arr);
    }

    for (name, coord) in &ds.coords {
        if !horiz.contains(name) {
            out.insert_coord(coord.clone());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata;
    use cda_regrid::RegularGrid;

    fn area() -> AreaField {
        AreaField::for_regular(&RegularGrid::global(testdata::NLON, testdata::NLAT))
    }

    #[test]
    fn test_constant_field_mean() {
        let ds = testdata::surface_dataset("2020-05-01T00:00:00", 3);
        let out = fldmean(&ds, &area(), &FldmeanOptions::default()).unwrap();
        let t2m = out.var("t2m").unwrap();
        assert_eq!(t2m.shape, vec![3]);
        for v in &t2m.values {
            assert!((v - 285.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_weighting_differs_from_plain_mean() {
        // A field equal to latitude: area weighting pulls the average
        // toward the (larger) equatorial cells, i.e. toward zero
        let mut ds = testdata::surface_dataset("2020-05-01T00:00:00", 1);
        let lats = ds.coords["lat"].values.clone();
        let t2m = ds.var_mut("t2m").unwrap();
        for (i, v) in t2m.values.iter_mut().enumerate() {
            *v = lats[i / testdata::NLON].abs();
        }
        let out = fldmean(&ds, &area(), &FldmeanOptions::default()).unwrap();
        let weighted = out.var("t2m").unwrap().values[0];
        let plain: f64 =
            lats.iter().map(|l| l.abs()).sum::<f64>() / lats.len() as f64;
        assert!(weighted < plain);
    }

    #[test]
    fn test_box_selection() {
        let mut ds = testdata::surface_dataset("2020-05-01T00:00:00", 1);
        // Northern hemisphere warmer
        let lats = ds.coords["lat"].values.clone();
        let t2m = ds.var_mut("t2m").unwrap();
        for (i, v) in t2m.values.iter_mut().enumerate() {
            *v = if lats[i / testdata::NLON] > 0.0 { 300.0 } else { 280.0 };
        }
        let north = FldmeanOptions {
            bbox: Some(BoundingBox::new(-180.0, 0.0, 180.0, 90.0)),
            include_border: false,
        };
        let out = fldmean(&ds, &area(), &north).unwrap();
        assert!((out.var("t2m").unwrap().values[0] - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_misaligned_area_rejected() {
        let ds = testdata::surface_dataset("2020-05-01T00:00:00", 1);
        let wrong = AreaField::for_regular(&RegularGrid::global(16, 8));
        assert!(matches!(
            fldmean(&ds, &wrong, &FldmeanOptions::default()),
            Err(ReaderError::Data(DataError::NotAligned { .. }))
        ));
    }

    #[test]
    fn test_empty_box_rejected() {
        let ds = testdata::surface_dataset("2020-05-01T00:00:00", 1);
        let opts = FldmeanOptions {
            bbox: Some(BoundingBox::new(0.0, 89.0, 1.0, 89.5)),
            include_border: false,
        };
        assert!(matches!(
            fldmean(&ds, &area(), &opts),
            Err(ReaderError::Config(_))
        ));
    }
}
