//! Sparse matrix storage.
//!
//! `SparseMatrixBlock` is the caller's process-local slice of a row- or
//! column-partitioned matrix, validated on construction. `CsrMatrix` is the
//! assembled global matrix the symbolic and numeric phases work on.

use crate::error::{Result, SolverError};
use crate::scalar::Scalar;

/// Which dimension the compressed pointers run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Pointers index rows, indices are column numbers.
    Row,
    /// Pointers index columns, indices are row numbers.
    Column,
}

/// A participant's slice of a square sparse matrix.
///
/// Holds `n_local` consecutive rows (or columns) starting at global index
/// `local_offset`. All indices are 0-based.
#[derive(Debug, Clone)]
pub struct SparseMatrixBlock<T> {
    compression: Compression,
    n_global: usize,
    local_offset: usize,
    values: Vec<T>,
    indices: Vec<usize>,
    pointers: Vec<usize>,
}

impl<T: Scalar> SparseMatrixBlock<T> {
    /// Validate and wrap compressed arrays.
    pub fn build(
        compression: Compression,
        n_global: usize,
        local_offset: usize,
        values: Vec<T>,
        indices: Vec<usize>,
        pointers: Vec<usize>,
    ) -> Result<Self> {
        if pointers.is_empty() {
            return Err(SolverError::MalformedInput(
                "pointer array must hold at least one entry".into(),
            ));
        }
        let n_local = pointers.len() - 1;
        if local_offset + n_local > n_global {
            return Err(SolverError::MalformedInput(format!(
                "local range {}..{} exceeds global dimension {}",
                local_offset,
                local_offset + n_local,
                n_global
            )));
        }
        if pointers[0] != 0 {
            return Err(SolverError::MalformedInput(format!(
                "pointer array must start at 0, starts at {}",
                pointers[0]
            )));
        }
        if let Some(pos) = pointers.windows(2).position(|w| w[1] < w[0]) {
            return Err(SolverError::MalformedInput(format!(
                "pointer array decreases at position {}",
                pos + 1
            )));
        }
        let nnz = pointers[n_local];
        if nnz != values.len() || nnz != indices.len() {
            return Err(SolverError::MalformedInput(format!(
                "pointer array ends at {} but there are {} values and {} indices",
                nnz,
                values.len(),
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= n_global) {
            return Err(SolverError::MalformedInput(format!(
                "index {bad} out of range for dimension {n_global}"
            )));
        }
        if values.iter().any(|v| !v.is_finite_val()) {
            return Err(SolverError::MalformedInput(
                "matrix values contain NaN/Inf".into(),
            ));
        }
        Ok(Self {
            compression,
            n_global,
            local_offset,
            values,
            indices,
            pointers,
        })
    }

    /// Rows `row_offset..row_offset + row_pointers.len() - 1` in CSR form.
    pub fn from_csr(
        n_global: usize,
        row_offset: usize,
        values: Vec<T>,
        col_indices: Vec<usize>,
        row_pointers: Vec<usize>,
    ) -> Result<Self> {
        Self::build(Compression::Row, n_global, row_offset, values, col_indices, row_pointers)
    }

    /// Columns `col_offset..col_offset + col_pointers.len() - 1` in CSC form.
    pub fn from_csc(
        n_global: usize,
        col_offset: usize,
        values: Vec<T>,
        row_indices: Vec<usize>,
        col_pointers: Vec<usize>,
    ) -> Result<Self> {
        Self::build(Compression::Column, n_global, col_offset, values, row_indices, col_pointers)
    }

    /// Build from 1-based offset, indices and pointers.
    pub fn from_one_based(
        compression: Compression,
        n_global: usize,
        first_index: usize,
        values: Vec<T>,
        indices: &[i64],
        pointers: &[i64],
    ) -> Result<Self> {
        let local_offset = first_index.checked_sub(1).ok_or_else(|| {
            SolverError::MalformedInput("1-based offset must be at least 1".into())
        })?;
        let shift = |v: i64, what: &str| -> Result<usize> {
            if v < 1 {
                return Err(SolverError::MalformedInput(format!(
                    "1-based {what} value {v} is below 1"
                )));
            }
            Ok((v - 1) as usize)
        };
        let indices = indices
            .iter()
            .map(|&i| shift(i, "index"))
            .collect::<Result<Vec<_>>>()?;
        let pointers = pointers
            .iter()
            .map(|&p| shift(p, "pointer"))
            .collect::<Result<Vec<_>>>()?;
        Self::build(compression, n_global, local_offset, values, indices, pointers)
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn n_global(&self) -> usize {
        self.n_global
    }

    pub fn n_local(&self) -> usize {
        self.pointers.len() - 1
    }

    pub fn local_offset(&self) -> usize {
        self.local_offset
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn pointers(&self) -> &[usize] {
        &self.pointers
    }

    /// Entries as global `(row, col, value)` triplets.
    pub fn global_triplets(&self) -> Vec<(usize, usize, T)> {
        let mut triplets = Vec::with_capacity(self.nnz());
        for local in 0..self.n_local() {
            let major = self.local_offset + local;
            for idx in self.pointers[local]..self.pointers[local + 1] {
                let minor = self.indices[idx];
                match self.compression {
                    Compression::Row => triplets.push((major, minor, self.values[idx])),
                    Compression::Column => triplets.push((minor, major, self.values[idx])),
                }
            }
        }
        triplets
    }

    /// Assemble a square global matrix from a single block that covers it.
    pub fn to_global(&self) -> Result<CsrMatrix<T>> {
        check_coverage(&[(self.local_offset, self.n_local())], self.n_global)?;
        Ok(CsrMatrix::from_triplets(
            self.n_global,
            self.n_global,
            &self.global_triplets(),
        ))
    }
}

/// Verify that `(offset, len)` ranges tile `0..n` exactly once.
pub fn check_coverage(ranges: &[(usize, usize)], n: usize) -> Result<()> {
    let mut sorted: Vec<(usize, usize)> = ranges.iter().copied().filter(|r| r.1 > 0).collect();
    sorted.sort_unstable();
    let mut next = 0;
    for (offset, len) in sorted {
        if offset != next {
            return Err(SolverError::MalformedInput(format!(
                "local blocks {} at index {} (expected {})",
                if offset < next { "overlap" } else { "leave a gap" },
                offset,
                next
            )));
        }
        next = offset + len;
    }
    if next != n {
        return Err(SolverError::MalformedInput(format!(
            "local blocks cover {next} of {n} rows/columns"
        )));
    }
    Ok(())
}

/// Sparse matrix in Compressed Sparse Row format.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    pub nrows: usize,
    pub ncols: usize,
    /// Non-zero values, stored row by row.
    pub values: Vec<T>,
    /// Column index for each non-zero value.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]` is the index into values/col_indices where row i starts.
    /// `row_pointers[nrows]` = total number of non-zeros.
    pub row_pointers: Vec<usize>,
}

impl<T: Scalar> CsrMatrix<T> {
    /// Create an empty matrix with no non-zero entries.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_pointers: vec![0; nrows + 1],
        }
    }

    /// Number of non-zero entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Build CSR matrix from (row, col, value) triplets.
    /// Duplicate entries at the same (row, col) are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, T)]) -> Self {
        if triplets.is_empty() {
            return Self::new(nrows, ncols);
        }

        // Sort indices by (row, col) without requiring T: Ord
        let mut indices: Vec<usize> = (0..triplets.len()).collect();
        indices.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut values = Vec::with_capacity(triplets.len());
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut row_pointers = vec![0usize; nrows + 1];

        let first = indices[0];
        let mut cur_row = triplets[first].0;
        let mut cur_col = triplets[first].1;
        let mut cur_val = triplets[first].2;

        for &idx in &indices[1..] {
            let (row, col, val) = triplets[idx];
            if row == cur_row && col == cur_col {
                cur_val += val;
            } else {
                values.push(cur_val);
                col_indices.push(cur_col);
                row_pointers[cur_row + 1] += 1;
                cur_row = row;
                cur_col = col;
                cur_val = val;
            }
        }
        values.push(cur_val);
        col_indices.push(cur_col);
        row_pointers[cur_row + 1] += 1;

        for i in 1..=nrows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Column indices of row `i`.
    pub fn row_pattern(&self, i: usize) -> &[usize] {
        &self.col_indices[self.row_pointers[i]..self.row_pointers[i + 1]]
    }

    /// True when both matrices have identical dimensions and nonzero positions.
    pub fn same_pattern<U>(&self, other: &CsrMatrix<U>) -> bool {
        self.nrows == other.nrows
            && self.ncols == other.ncols
            && self.row_pointers == other.row_pointers
            && self.col_indices == other.col_indices
    }

    /// Convert to dense matrix (row-major). For testing and small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<T>> {
        let mut dense = vec![vec![T::zero(); self.ncols]; self.nrows];
        for row in 0..self.nrows {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                dense[row][self.col_indices[idx]] = self.values[idx];
            }
        }
        dense
    }

    /// Transpose, optionally conjugating every entry.
    pub fn transpose(&self, conjugate: bool) -> Self {
        let mut triplets = Vec::with_capacity(self.nnz());
        for row in 0..self.nrows {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                let v = self.values[idx];
                triplets.push((self.col_indices[idx], row, if conjugate { v.conj() } else { v }));
            }
        }
        Self::from_triplets(self.ncols, self.nrows, &triplets)
    }

    /// `B(i, j) = A(row_perm[i], col_perm[j])`, both permutations new→old.
    pub fn permute(&self, row_perm: &[usize], col_perm: &[usize]) -> Self {
        let mut col_inv = vec![0usize; self.ncols];
        for (new, &old) in col_perm.iter().enumerate() {
            col_inv[old] = new;
        }
        let mut triplets = Vec::with_capacity(self.nnz());
        for (new_row, &old_row) in row_perm.iter().enumerate() {
            for idx in self.row_pointers[old_row]..self.row_pointers[old_row + 1] {
                triplets.push((new_row, col_inv[self.col_indices[idx]], self.values[idx]));
            }
        }
        Self::from_triplets(self.nrows, self.ncols, &triplets)
    }

    /// Sparse matrix-vector multiply: y = A * x
    pub fn spmv(&self, x: &[T]) -> Vec<T> {
        assert_eq!(x.len(), self.ncols, "spmv dimension mismatch");
        let mut y = vec![T::zero(); self.nrows];
        for row in 0..self.nrows {
            let mut sum = T::zero();
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                sum += self.values[idx] * x[self.col_indices[idx]];
            }
            y[row] = sum;
        }
        y
    }

    /// y = Aᵀ x, or y = Aᴴ x when `conjugate` is set.
    pub fn spmv_transpose(&self, x: &[T], conjugate: bool) -> Vec<T> {
        assert_eq!(x.len(), self.nrows, "spmv dimension mismatch");
        let mut y = vec![T::zero(); self.ncols];
        for row in 0..self.nrows {
            let xr = x[row];
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                let v = self.values[idx];
                let v = if conjugate { v.conj() } else { v };
                y[self.col_indices[idx]] += v * xr;
            }
        }
        y
    }

    /// Row sums of |A| weighted by |x| (or column sums for the transpose).
    pub fn abs_spmv(&self, x: &[T], transpose: bool) -> Vec<f64> {
        if transpose {
            let mut y = vec![0.0; self.ncols];
            for row in 0..self.nrows {
                let xr = x[row].abs_val();
                for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                    y[self.col_indices[idx]] += self.values[idx].abs_val() * xr;
                }
            }
            y
        } else {
            (0..self.nrows)
                .map(|row| {
                    (self.row_pointers[row]..self.row_pointers[row + 1])
                        .map(|idx| self.values[idx].abs_val() * x[self.col_indices[idx]].abs_val())
                        .sum()
                })
                .collect()
        }
    }

    /// Maximum absolute column sum.
    pub fn norm_one(&self) -> f64 {
        let mut sums = vec![0.0f64; self.ncols];
        for (idx, &col) in self.col_indices.iter().enumerate() {
            sums[col] += self.values[idx].abs_val();
        }
        sums.into_iter().fold(0.0, f64::max)
    }

    /// Largest entry magnitude.
    pub fn max_abs(&self) -> f64 {
        self.values.iter().map(|v| v.abs_val()).fold(0.0, f64::max)
    }
}
