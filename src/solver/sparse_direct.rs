//! Sparse LU through faer, for real double-precision systems on one process.
//!
//! Selected with `Backend::Faer`. faer performs its own ordering and
//! pivoting, so the symbolic plan and block layout of the native engine are
//! not used on this path.

use crate::error::{Phase, Result, SolverError};
use crate::sparse::CsrMatrix;
use faer::prelude::*;
use faer::sparse::linalg::solvers::Lu;
use faer::sparse::{SparseColMat, Triplet};

use super::TransposeMode;

/// faer sparse LU factors of an `n × n` matrix.
pub struct FaerFactors {
    n: usize,
    lu: Option<Lu<usize, f64>>,
}

impl std::fmt::Debug for FaerFactors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaerFactors").field("n", &self.n).finish_non_exhaustive()
    }
}

/// Factor `a` with faer's sparse LU.
pub fn factor(a: &CsrMatrix<f64>) -> Result<FaerFactors> {
    let n = a.nrows;
    if a.ncols != n {
        return Err(SolverError::MalformedInput(format!(
            "matrix must be square, got {}x{}",
            a.nrows, a.ncols
        )));
    }
    if n == 0 {
        return Ok(FaerFactors { n, lu: None });
    }

    let mut triplets = Vec::with_capacity(a.values.len());
    for row in 0..n {
        for idx in a.row_pointers[row]..a.row_pointers[row + 1] {
            triplets.push(Triplet::new(row, a.col_indices[idx], a.values[idx]));
        }
    }

    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets).map_err(|e| {
        SolverError::PhaseFailure {
            phase: Phase::Symbolic,
            message: format!("sparse matrix build failed: {e:?}"),
        }
    })?;

    let lu = a_sp.sp_lu().map_err(|e| SolverError::PhaseFailure {
        phase: Phase::Numeric,
        message: format!("sparse LU factorization failed: {e:?}"),
    })?;

    Ok(FaerFactors { n, lu: Some(lu) })
}

impl FaerFactors {
    pub fn n(&self) -> usize {
        self.n
    }

    /// Solve for every column of `rhs`. Conjugate transpose equals transpose
    /// for real data.
    pub fn solve(&self, rhs: &[Vec<f64>], mode: TransposeMode) -> Result<Vec<Vec<f64>>> {
        let n = self.n;
        if let Some(bad) = rhs.iter().find(|c| c.len() != n) {
            return Err(SolverError::DimensionMismatch {
                expected: n,
                actual: bad.len(),
            });
        }
        let Some(lu) = &self.lu else {
            return Ok(rhs.to_vec());
        };

        let b = faer::Mat::<f64>::from_fn(n, rhs.len(), |i, j| rhs[j][i]);
        let x = match mode {
            TransposeMode::None => lu.solve(b),
            TransposeMode::Transpose | TransposeMode::ConjugateTranspose => lu.solve_transpose(b),
        };

        let mut out = vec![vec![0.0; n]; rhs.len()];
        for (j, col) in out.iter_mut().enumerate() {
            for (i, v) in col.iter_mut().enumerate() {
                let xi = x[(i, j)];
                if !xi.is_finite() {
                    return Err(SolverError::PhaseFailure {
                        phase: Phase::Numeric,
                        message: "sparse LU produced NaN/Inf solution".into(),
                    });
                }
                *v = xi;
            }
        }
        Ok(out)
    }
}
