//! Compressed sparse row matrices for interpolation weights.
//!
//! A weight matrix has one row per target cell and one column per source
//! cell; applying it is a sparse matrix-vector product. Matrices are
//! small relative to the data they act on and are serialized to the
//! on-disk cache as-is.

use serde::{Deserialize, Serialize};

use crate::error::{RegridError, Result};

/// A sparse matrix in CSR layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrMatrix {
    pub nrows: usize,
    pub ncols: usize,
    /// Length nrows + 1; row i spans `col_idx[row_ptr[i]..row_ptr[i+1]]`.
    pub row_ptr: Vec<usize>,
    pub col_idx: Vec<usize>,
    pub values: Vec<f64>,
}

impl CsrMatrix {
    /// Build from (row, col, value) triplets; rows need not be sorted.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> Self {
        let mut counts = vec![0usize; nrows + 1];
        for &(r, _, _) in triplets {
            counts[r + 1] += 1;
        }
        for i in 1..=nrows {
            counts[i] += counts[i - 1];
        }
        let row_ptr = counts.clone();
        let mut cursor = counts;
        let nnz = triplets.len();
        let mut col_idx = vec![0usize; nnz];
        let mut values = vec![0.0f64; nnz];
        for &(r, c, v) in triplets {
            let slot = cursor[r];
            col_idx[slot] = c;
            values[slot] = v;
            cursor[r] += 1;
        }
        Self {
            nrows,
            ncols,
            row_ptr,
            col_idx,
            values,
        }
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// y = A x for a single source field.
    pub fn apply(&self, x: &[f64]) -> Result<Vec<f64>> {
        if x.len() != self.ncols {
            return Err(RegridError::ShapeMismatch {
                expected: self.ncols,
                actual: x.len(),
            });
        }
        let mut y = vec![0.0; self.nrows];
        for (r, out) in y.iter_mut().enumerate() {
            let mut acc = 0.0;
            for k in self.row_ptr[r]..self.row_ptr[r + 1] {
                acc += self.values[k] * x[self.col_idx[k]];
            }
            *out = acc;
        }
        Ok(y)
    }

    /// Apply to each of `count` consecutive fields stored back to back.
    pub fn apply_batched(&self, x: &[f64], count: usize) -> Result<Vec<f64>> {
        if x.len() != self.ncols * count {
            return Err(RegridError::ShapeMismatch {
                expected: self.ncols * count,
                actual: x.len(),
            });
        }
        let mut out = Vec::with_capacity(self.nrows * count);
        for field in x.chunks_exact(self.ncols) {
            out.extend(self.apply(field)?);
        }
        Ok(out)
    }

    /// Per-row coefficient sums. Conservative and bilinear operators sum
    /// to 1 on every row whose target cell is not fully masked.
    pub fn row_sums(&self) -> Vec<f64> {
        (0..self.nrows)
            .map(|r| self.values[self.row_ptr[r]..self.row_ptr[r + 1]].iter().sum())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> CsrMatrix {
        // [[0.5, 0.5, 0, 0], [0, 0, 0.5, 0.5]]
        CsrMatrix::from_triplets(
            2,
            4,
            &[(0, 0, 0.5), (0, 1, 0.5), (1, 2, 0.5), (1, 3, 0.5)],
        )
    }

    #[test]
    fn test_apply() {
        let m = example();
        let y = m.apply(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(y, vec![1.5, 3.5]);
    }

    #[test]
    fn test_apply_batched() {
        let m = example();
        let x = [1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let y = m.apply_batched(&x, 2).unwrap();
        assert_eq!(y, vec![1.5, 3.5, 15.0, 35.0]);
    }

    #[test]
    fn test_unsorted_triplets() {
        let m = CsrMatrix::from_triplets(2, 2, &[(1, 1, 2.0), (0, 0, 1.0), (1, 0, 3.0)]);
        assert_eq!(m.apply(&[1.0, 1.0]).unwrap(), vec![1.0, 5.0]);
    }

    #[test]
    fn test_row_sums() {
        let m = example();
        for s in m.row_sums() {
            assert!((s - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let m = example();
        assert!(matches!(
            m.apply(&[1.0, 2.0]),
            Err(RegridError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let m = example();
        let text = serde_json::to_string(&m).unwrap();
        let back: CsrMatrix = serde_json::from_str(&text).unwrap();
        assert_eq!(m, back);
    }
}
