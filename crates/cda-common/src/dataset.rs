//! In-memory dataset representation.
//!
//! A `Dataset` is an ordered collection of named n-dimensional arrays
//! sharing dimension coordinates, plus an optional time axis. Arrays are
//! row-major `Vec<f64>` buffers with explicit dimension names; by
//! convention time is the leading dimension and the horizontal
//! (spatial) dimensions are trailing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};
use crate::time::TimeAxis;

/// Attributes attached to a variable.
///
/// Besides the CF-style descriptive fields, this carries the bookkeeping
/// the fixer leaves behind: pending unit conversions (`tgt_units`,
/// `factor`, `offset`) and flags recording what was already done.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarAttrs {
    pub units: Option<String>,
    pub standard_name: Option<String>,
    pub long_name: Option<String>,
    /// Units before a unit fix was applied.
    pub src_units: Option<String>,
    /// Formula this variable was derived from, if any.
    pub derived: Option<String>,
    /// Pending target units, set by the fixer, consumed by apply_unit_fix.
    pub tgt_units: Option<String>,
    /// Pending multiplicative conversion factor.
    pub factor: Option<f64>,
    /// Pending additive conversion offset.
    pub offset: Option<f64>,
    pub decumulated: bool,
    pub regridded: bool,
    /// Free-form extra attributes.
    pub extra: BTreeMap<String, String>,
}

/// A 1-D coordinate for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub name: String,
    pub values: Vec<f64>,
    pub units: Option<String>,
    /// Original positions of each entry along the full (unselected) axis.
    ///
    /// Assigned 0..n when a dataset is loaded and carried through any
    /// selection, so that level-dependent weight matrices can be matched
    /// by original level rather than by position.
    pub source_index: Option<Vec<usize>>,
}

impl Coordinate {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
            units: None,
            source_index: None,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Assign the identity source index (0..n).
    pub fn with_identity_index(mut self) -> Self {
        self.source_index = Some((0..self.values.len()).collect());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether values are strictly decreasing.
    pub fn is_decreasing(&self) -> bool {
        self.values.windows(2).all(|w| w[0] > w[1]) && self.values.len() > 1
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            name: self.name.clone(),
            values: indices.iter().map(|&i| self.values[i]).collect(),
            units: self.units.clone(),
            source_index: self
                .source_index
                .as_ref()
                .map(|idx| indices.iter().map(|&i| idx[i]).collect()),
        }
    }

    fn reversed(&self) -> Self {
        let n = self.values.len();
        self.select(&(0..n).rev().collect::<Vec<_>>())
    }
}

/// A named n-dimensional array with row-major storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArray {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
    pub attrs: VarAttrs,
}

impl DataArray {
    pub fn new(
        name: impl Into<String>,
        dims: Vec<String>,
        shape: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(DataError::ShapeMismatch {
                len: values.len(),
                shape,
            });
        }
        Ok(Self {
            name: name.into(),
            dims,
            shape,
            values,
            attrs: VarAttrs::default(),
        })
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.attrs.units = Some(units.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Position of a dimension by name.
    pub fn dim_index(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.dim_index(dim).is_some()
    }

    /// Size of a named dimension.
    pub fn dim_size(&self, dim: &str) -> Option<usize> {
        self.dim_index(dim).map(|i| self.shape[i])
    }

    /// Row-major strides for the current shape.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.shape.len()];
        for i in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.shape[i + 1];
        }
        strides
    }

    /// Select a set of indices along one dimension, keeping the dimension.
    pub fn select(&self, dim: &str, indices: &[usize]) -> Result<Self> {
        let axis = self
            .dim_index(dim)
            .ok_or_else(|| DataError::DimNotFound(dim.to_string()))?;
        let size = self.shape[axis];
        for &i in indices {
            if i >= size {
                return Err(DataError::IndexOutOfBounds {
                    dim: dim.to_string(),
                    index: i,
                    size,
                });
            }
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let mut values = Vec::with_capacity(outer * indices.len() * inner);
        for o in 0..outer {
            let base = o * size * inner;
            for &i in indices {
                let start = base + i * inner;
                values.extend_from_slice(&self.values[start..start + inner]);
            }
        }
        let mut shape = self.shape.clone();
        shape[axis] = indices.len();
        Ok(Self {
            name: self.name.clone(),
            dims: self.dims.clone(),
            shape,
            values,
            attrs: self.attrs.clone(),
        })
    }

    /// Select a single index along a dimension and drop that dimension.
    pub fn isel(&self, dim: &str, index: usize) -> Result<Self> {
        let mut out = self.select(dim, &[index])?;
        let axis = out.dim_index(dim).ok_or_else(|| DataError::DimNotFound(dim.to_string()))?;
        out.dims.remove(axis);
        out.shape.remove(axis);
        Ok(out)
    }

    /// Contiguous slice [start, end) along a dimension.
    pub fn slice(&self, dim: &str, start: usize, end: usize) -> Result<Self> {
        let indices: Vec<usize> = (start..end).collect();
        self.select(dim, &indices)
    }

    /// Reverse the array along one dimension.
    pub fn reverse(&self, dim: &str) -> Result<Self> {
        let axis = self
            .dim_index(dim)
            .ok_or_else(|| DataError::DimNotFound(dim.to_string()))?;
        let indices: Vec<usize> = (0..self.shape[axis]).rev().collect();
        self.select(dim, &indices)
    }

    /// Apply a function to every element.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        let mut out = self.clone();
        for v in &mut out.values {
            *v = f(*v);
        }
        out
    }

    /// Elementwise combination of two congruent arrays.
    pub fn zip_with(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        if self.dims != other.dims || self.shape != other.shape {
            return Err(DataError::NotAligned {
                left: self.name.clone(),
                right: other.name.clone(),
                reason: format!(
                    "dims {:?}{:?} vs {:?}{:?}",
                    self.dims, self.shape, other.dims, other.shape
                ),
            });
        }
        let mut out = self.clone();
        for (v, w) in out.values.iter_mut().zip(other.values.iter()) {
            *v = f(*v, *w);
        }
        Ok(out)
    }

    /// Concatenate along an existing leading dimension.
    pub fn concat(parts: &[Self], dim: &str) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| DataError::ConcatError("empty input".to_string()))?;
        if first.dim_index(dim) != Some(0) {
            return Err(DataError::ConcatError(format!(
                "'{dim}' must be the leading dimension of '{}'",
                first.name
            )));
        }
        let mut total = 0usize;
        let mut values = Vec::new();
        for p in parts {
            if p.dims != first.dims || p.shape[1..] != first.shape[1..] {
                return Err(DataError::ConcatError(format!(
                    "variable '{}' has inconsistent shape across parts",
                    p.name
                )));
            }
            total += p.shape[0];
            values.extend_from_slice(&p.values);
        }
        let mut shape = first.shape.clone();
        shape[0] = total;
        let mut out = first.clone();
        out.shape = shape;
        out.values = values;
        Ok(out)
    }
}

/// A collection of variables and coordinates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub coords: BTreeMap<String, Coordinate>,
    pub vars: BTreeMap<String, DataArray>,
    pub time: Option<TimeAxis>,
    pub attrs: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var_names(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    pub fn var(&self, name: &str) -> Result<&DataArray> {
        self.vars
            .get(name)
            .ok_or_else(|| DataError::VarNotFound(name.to_string()))
    }

    pub fn var_mut(&mut self, name: &str) -> Result<&mut DataArray> {
        self.vars
            .get_mut(name)
            .ok_or_else(|| DataError::VarNotFound(name.to_string()))
    }

    pub fn insert_var(&mut self, var: DataArray) {
        self.vars.insert(var.name.clone(), var);
    }

    pub fn insert_coord(&mut self, coord: Coordinate) {
        self.coords.insert(coord.name.clone(), coord);
    }

    pub fn time_axis(&self) -> Result<&TimeAxis> {
        self.time.as_ref().ok_or(DataError::NoTimeAxis)
    }

    /// Keep only the listed variables (coordinates are always kept).
    pub fn subset_vars(&self, names: &[String]) -> Result<Self> {
        let mut out = self.clone();
        out.vars.clear();
        for name in names {
            out.insert_var(self.var(name)?.clone());
        }
        Ok(out)
    }

    /// Rename a variable, preserving its attributes.
    pub fn rename_var(&mut self, from: &str, to: &str) -> Result<()> {
        let mut var = self
            .vars
            .remove(from)
            .ok_or_else(|| DataError::VarNotFound(from.to_string()))?;
        var.name = to.to_string();
        self.vars.insert(to.to_string(), var);
        Ok(())
    }

    /// Rename a dimension (and its coordinate) everywhere.
    pub fn rename_dim(&mut self, from: &str, to: &str) {
        if let Some(mut coord) = self.coords.remove(from) {
            coord.name = to.to_string();
            self.coords.insert(to.to_string(), coord);
        }
        for var in self.vars.values_mut() {
            for d in &mut var.dims {
                if d == from {
                    *d = to.to_string();
                }
            }
        }
    }

    pub fn drop_var(&mut self, name: &str) {
        self.vars.remove(name);
        self.coords.remove(name);
    }

    /// Select indices along a dimension across all variables carrying it.
    /// The coordinate (and its source index) is subset accordingly.
    pub fn select_dim(&self, dim: &str, indices: &[usize]) -> Result<Self> {
        let mut out = self.clone();
        if let Some(coord) = self.coords.get(dim) {
            out.coords.insert(dim.to_string(), coord.select(indices));
        }
        for (name, var) in &self.vars {
            if var.has_dim(dim) {
                out.vars.insert(name.clone(), var.select(dim, indices)?);
            }
        }
        if dim == "time" {
            if let Some(axis) = &self.time {
                let times = indices.iter().map(|&i| axis.times[i]).collect();
                out.time = Some(TimeAxis::new(times));
            }
        }
        Ok(out)
    }

    /// Slice [lo, hi) along the time dimension.
    pub fn slice_time(&self, lo: usize, hi: usize) -> Result<Self> {
        let indices: Vec<usize> = (lo..hi).collect();
        self.select_dim("time", &indices)
    }

    /// Reverse one dimension: coordinate values and every variable
    /// indexed by it.
    pub fn reverse_dim(&mut self, dim: &str) -> Result<()> {
        if let Some(coord) = self.coords.get(dim) {
            let rev = coord.reversed();
            self.coords.insert(dim.to_string(), rev);
        }
        let names: Vec<String> = self
            .vars
            .iter()
            .filter(|(_, v)| v.has_dim(dim))
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            let rev = self.var(&name)?.reverse(dim)?;
            self.vars.insert(name, rev);
        }
        Ok(())
    }

    /// Concatenate datasets along time, in the given order.
    pub fn concat_time(parts: Vec<Self>) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| DataError::ConcatError("empty input".to_string()))?;
        let mut out = first.clone();
        let mut times = Vec::new();
        for p in &parts {
            times.extend(p.time_axis()?.times.iter().copied());
        }
        out.time = Some(TimeAxis::new(times));
        for name in first.var_names() {
            let pieces: Vec<DataArray> = parts
                .iter()
                .map(|p| p.var(&name).cloned())
                .collect::<Result<_>>()?;
            if pieces[0].has_dim("time") {
                out.vars.insert(name.clone(), DataArray::concat(&pieces, "time")?);
            }
        }
        Ok(out)
    }
}
