//! The factorization pipeline and the factor set a handle owns.
//!
//! `FactorSet::build` runs: matrix assembly over the grid, symbolic analysis
//! (or plan reuse), numeric factorization. Each phase is timed into
//! `FactorStats`. Solves add optional iterative refinement on top of the
//! triangular sweeps.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use super::grid::ProcessGrid;
use super::numeric::{self, BlockFactors};
use super::symbolic::{self, SymbolicPlan};
use super::{triangular, Backend, Capabilities, SolverOptions, TransposeMode};
use crate::error::{Result, SolverError};
use crate::scalar::{decode_values, encode_values, Scalar, ScalarKind};
use crate::sparse::{CsrMatrix, SparseMatrixBlock};
use crate::stats::FactorStats;

/// Factors held by one of the engines.
#[derive(Debug)]
pub enum FactorStorage<T> {
    Native {
        plan: Arc<SymbolicPlan>,
        factors: BlockFactors<T>,
    },
    #[cfg(feature = "faer")]
    Faer(super::sparse_direct::FaerFactors),
}

/// Outcome of one solve beyond the solution itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    /// Refinement corrections applied.
    pub refinement_steps: usize,
    /// Componentwise backward error after the last step, if refinement ran.
    pub backward_error: Option<f64>,
}

/// Everything a ready handle owns.
#[derive(Debug)]
pub struct FactorSet<T> {
    matrix: CsrMatrix<T>,
    storage: FactorStorage<T>,
    grid: ProcessGrid,
    /// (offset, length) of every participant's slice, by rank.
    slices: Vec<(usize, usize)>,
    rank: usize,
    refinement: usize,
    stats: FactorStats,
}

impl<T: Scalar> FactorSet<T> {
    /// Assemble, analyze and factor.
    ///
    /// Collective over `grid`. `plan`, when given, must have been built for
    /// the same sparsity pattern.
    pub fn build(
        block: &SparseMatrixBlock<T>,
        grid: ProcessGrid,
        options: &SolverOptions,
        capabilities: &Capabilities,
        plan: Option<Arc<SymbolicPlan>>,
    ) -> Result<Self> {
        let _span = tracing::info_span!(
            "factorization",
            n = block.n_global(),
            rank = grid.rank(),
            backend = ?options.backend
        )
        .entered();
        let mut stats = FactorStats::new();

        let t = Instant::now();
        let matrix = numeric::gather_global_matrix(block, &grid)?;
        let slices = grid
            .comm()
            .all_gather_indices(&[block.local_offset(), block.n_local()])?
            .into_iter()
            .map(|s| (s[0], s[1]))
            .collect();
        stats.add_phase("assembly", t.elapsed());
        stats.n = matrix.nrows;
        stats.nnz_a = matrix.nnz();

        let storage = match options.backend {
            Backend::Native => {
                let t = Instant::now();
                let plan = match plan {
                    Some(plan) if plan.matches(&matrix) => plan,
                    Some(_) => {
                        return Err(SolverError::MalformedInput(
                            "symbolic plan was built for a different sparsity pattern".into(),
                        ))
                    }
                    None => Arc::new(symbolic::analyze(&matrix, &options.symbolic)?),
                };
                stats.add_phase("symbolic", t.elapsed());

                let t = Instant::now();
                let factors = numeric::factorize(&matrix, &plan, &grid, &options.numeric())?;
                stats.add_phase("numeric", t.elapsed());

                stats.nnz_l = plan.nnz_l;
                stats.nnz_u = plan.nnz_u;
                stats.fill = plan.fill_count();
                stats.blocks = plan.n_factor_blocks();
                stats.owned_blocks = factors.owned_blocks();
                stats.tiny_pivots = factors.tiny_pivots;
                stats.cross_block_swaps = factors.cross_block_swaps;
                stats.equilibrated = !factors.scaling.is_identity();
                stats.pivot_growth = factors.pivot_growth;
                FactorStorage::Native { plan, factors }
            }
            Backend::Faer => Self::build_faer(&matrix, &grid, capabilities, &mut stats)?,
        };
        stats.log();

        Ok(Self {
            matrix,
            storage,
            rank: grid.rank(),
            grid,
            slices,
            refinement: options.refinement(),
            stats,
        })
    }

    #[cfg(feature = "faer")]
    fn build_faer(
        matrix: &CsrMatrix<T>,
        grid: &ProcessGrid,
        capabilities: &Capabilities,
        stats: &mut FactorStats,
    ) -> Result<FactorStorage<T>> {
        capabilities.require(Backend::Faer)?;
        Self::check_faer_target(grid)?;
        let real = CsrMatrix {
            nrows: matrix.nrows,
            ncols: matrix.ncols,
            values: to_f64(&matrix.values),
            col_indices: matrix.col_indices.clone(),
            row_pointers: matrix.row_pointers.clone(),
        };
        let t = Instant::now();
        let factors = super::sparse_direct::factor(&real)?;
        stats.add_phase("numeric", t.elapsed());
        Ok(FactorStorage::Faer(factors))
    }

    #[cfg(not(feature = "faer"))]
    fn build_faer(
        _matrix: &CsrMatrix<T>,
        _grid: &ProcessGrid,
        capabilities: &Capabilities,
        _stats: &mut FactorStats,
    ) -> Result<FactorStorage<T>> {
        capabilities.require(Backend::Faer)?;
        Err(SolverError::BackendUnavailable(
            "Faer backend was not compiled into this build".into(),
        ))
    }

    /// The faer engine handles real double precision on a 1×1 grid only.
    pub fn check_faer_target(grid: &ProcessGrid) -> Result<()> {
        if T::KIND != ScalarKind::RealDouble {
            return Err(SolverError::BackendUnavailable(format!(
                "Faer backend is not available for {:?}",
                T::KIND
            )));
        }
        if grid.shape().size() != 1 {
            return Err(SolverError::InvalidGrid(format!(
                "Faer backend runs on a 1x1 grid, got {}x{}",
                grid.shape().nprow,
                grid.shape().npcol
            )));
        }
        Ok(())
    }

    pub fn n(&self) -> usize {
        self.matrix.nrows
    }

    /// First zero pivot as a 0-based original column.
    pub fn singular_position(&self) -> Option<usize> {
        match &self.storage {
            FactorStorage::Native { factors, .. } => factors.singular_position,
            #[cfg(feature = "faer")]
            FactorStorage::Faer(_) => None,
        }
    }

    pub fn plan(&self) -> Option<Arc<SymbolicPlan>> {
        match &self.storage {
            FactorStorage::Native { plan, .. } => Some(Arc::clone(plan)),
            #[cfg(feature = "faer")]
            FactorStorage::Faer(_) => None,
        }
    }

    pub fn stats(&self) -> &FactorStats {
        &self.stats
    }

    pub fn grid(&self) -> &ProcessGrid {
        &self.grid
    }

    pub fn matrix(&self) -> &CsrMatrix<T> {
        &self.matrix
    }

    /// Rows of the solution this participant contributes and receives.
    pub fn local_range(&self) -> Range<usize> {
        let (offset, len) = self.slices[self.rank];
        offset..offset + len
    }

    fn apply_inverse(&self, rhs: &[Vec<T>], mode: TransposeMode) -> Result<Vec<Vec<T>>> {
        match &self.storage {
            FactorStorage::Native { plan, factors } => {
                triangular::solve(factors, plan, &self.grid, rhs, mode)
            }
            #[cfg(feature = "faer")]
            FactorStorage::Faer(f) => {
                let real: Vec<Vec<f64>> = rhs.iter().map(|c| to_f64(c)).collect();
                f.solve(&real, mode)?.iter().map(|c| from_f64(c)).collect()
            }
        }
    }

    /// Residuals `b - op(A) x` and the componentwise backward error.
    fn residuals(&self, rhs: &[Vec<T>], x: &[Vec<T>], mode: TransposeMode) -> (Vec<Vec<T>>, f64) {
        let a = &self.matrix;
        let transpose = mode != TransposeMode::None;
        let conjugate = mode == TransposeMode::ConjugateTranspose;
        let per_column: Vec<(Vec<T>, f64)> = rhs
            .par_iter()
            .zip(x.par_iter())
            .map(|(b, x)| {
                let ax = if transpose { a.spmv_transpose(x, conjugate) } else { a.spmv(x) };
                let scale = a.abs_spmv(x, transpose);
                let mut berr = 0.0f64;
                let r: Vec<T> = b
                    .iter()
                    .zip(&ax)
                    .zip(&scale)
                    .map(|((&bi, &axi), &si)| {
                        let ri = bi - axi;
                        let denom = si + bi.abs_val();
                        let mag = ri.abs_val();
                        if denom > 0.0 {
                            berr = berr.max(mag / denom);
                        } else if mag > 0.0 {
                            berr = f64::INFINITY;
                        }
                        ri
                    })
                    .collect();
                (r, berr)
            })
            .collect();
        let berr = per_column.iter().map(|c| c.1).fold(0.0, f64::max);
        (per_column.into_iter().map(|c| c.0).collect(), berr)
    }

    /// Solve `op(A) X = B` for global-length columns.
    ///
    /// Collective over the grid. Every participant passes the same `rhs` and
    /// receives the same solution. A wrong length on any participant fails
    /// the solve everywhere before the sweeps start.
    pub fn solve(&self, rhs: &[Vec<T>], mode: TransposeMode) -> Result<(Vec<Vec<T>>, SolveReport)> {
        let _guard = self.grid.exclusive()?;
        let n = self.n();
        let local_check = match rhs.iter().find(|c| c.len() != n) {
            Some(bad) => Err(SolverError::DimensionMismatch {
                expected: n,
                actual: bad.len(),
            }),
            None => Ok(()),
        };
        self.grid.agree(local_check)?;
        self.solve_locked(rhs, mode)
    }

    /// Callers hold the grid lock and have agreed on `rhs` lengths.
    fn solve_locked(&self, rhs: &[Vec<T>], mode: TransposeMode) -> Result<(Vec<Vec<T>>, SolveReport)> {
        let mut x = self.apply_inverse(rhs, mode)?;
        let mut report = SolveReport {
            refinement_steps: 0,
            backward_error: None,
        };
        if self.refinement == 0 {
            return Ok((x, report));
        }

        let eps = T::epsilon();
        for step in 0..=self.refinement {
            let (r, berr) = self.residuals(rhs, &x, mode);
            report.backward_error = Some(berr);
            if berr <= eps || step == self.refinement {
                break;
            }
            let d = self.apply_inverse(&r, mode)?;
            for (xc, dc) in x.iter_mut().zip(&d) {
                for (xi, &di) in xc.iter_mut().zip(dc) {
                    *xi += di;
                }
            }
            report.refinement_steps += 1;
        }
        tracing::debug!(
            steps = report.refinement_steps,
            backward_error = report.backward_error,
            "iterative refinement finished"
        );
        Ok((x, report))
    }

    /// Solve with right-hand sides and solutions split by participant.
    ///
    /// `local_rhs` holds this participant's rows of each column, matching the
    /// slice of the matrix it supplied at factorization time.
    pub fn solve_distributed(
        &self,
        local_rhs: &[Vec<T>],
        mode: TransposeMode,
    ) -> Result<(Vec<Vec<T>>, SolveReport)> {
        let _guard = self.grid.exclusive()?;
        let range = self.local_range();
        let local_check = match local_rhs.iter().find(|c| c.len() != range.len()) {
            Some(bad) => Err(SolverError::DimensionMismatch {
                expected: range.len(),
                actual: bad.len(),
            }),
            None => Ok(()),
        };
        self.grid.agree(local_check)?;

        let rhs = if self.grid.num_ranks() == 1 {
            local_rhs.to_vec()
        } else {
            self.gather_columns(local_rhs)?
        };
        let (x, report) = self.solve_locked(&rhs, mode)?;
        let local = x.into_iter().map(|c| c[range.clone()].to_vec()).collect();
        Ok((local, report))
    }

    fn gather_columns(&self, local_rhs: &[Vec<T>]) -> Result<Vec<Vec<T>>> {
        let mut words = Vec::new();
        for c in local_rhs {
            encode_values(c, &mut words);
        }
        let parts = self.grid.comm().all_gather(&words)?;
        let nrhs = local_rhs.len();
        let n = self.n();
        let mut rhs = vec![vec![T::zero(); n]; nrhs];
        for (rank, words) in parts.iter().enumerate() {
            let (offset, len) = self.slices[rank];
            if words.len() != nrhs * len * T::PARTS {
                return Err(SolverError::DimensionMismatch {
                    expected: nrhs * len,
                    actual: words.len() / T::PARTS.max(1),
                });
            }
            let (vals, _) = decode_values::<T>(words, nrhs * len)
                .ok_or_else(|| SolverError::Communication("short right-hand side payload".into()))?;
            for (c, chunk) in vals.chunks(len.max(1)).enumerate().take(nrhs) {
                if len > 0 {
                    rhs[c][offset..offset + len].copy_from_slice(chunk);
                }
            }
        }
        Ok(rhs)
    }
}

#[cfg(feature = "faer")]
fn to_f64<T: Scalar>(values: &[T]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    encode_values(values, &mut out);
    out
}

#[cfg(feature = "faer")]
fn from_f64<T: Scalar>(words: &[f64]) -> Result<Vec<T>> {
    decode_values::<T>(words, words.len() / T::PARTS)
        .map(|(v, _)| v)
        .ok_or_else(|| SolverError::Communication("solution payload has the wrong width".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::comm_thread::ThreadComm;
    use crate::solver::grid::GridShape;
    use approx::assert_abs_diff_eq;

    fn single() -> ProcessGrid {
        ProcessGrid::init(GridShape::single(), Arc::new(SingleProcessComm)).unwrap()
    }

    fn hilbert_like(n: usize) -> CsrMatrix<f64> {
        let mut t = Vec::new();
        for i in 0..n {
            for j in 0..n {
                if i.abs_diff(j) <= 2 {
                    t.push((i, j, 1.0 / (i + j + 1) as f64 + if i == j { 1e-3 } else { 0.0 }));
                }
            }
        }
        CsrMatrix::from_triplets(n, n, &t)
    }

    fn whole(a: &CsrMatrix<f64>) -> SparseMatrixBlock<f64> {
        SparseMatrixBlock::from_csr(
            a.nrows,
            0,
            a.values.clone(),
            a.col_indices.clone(),
            a.row_pointers.clone(),
        )
        .unwrap()
    }

    #[test]
    fn build_records_phases_and_counts() {
        let a = hilbert_like(8);
        let f = FactorSet::build(&whole(&a), single(), &SolverOptions::default(), &Capabilities::detect(), None)
            .unwrap();
        assert!(f.stats().phase("symbolic").is_some());
        assert!(f.stats().phase("numeric").is_some());
        assert_eq!(f.stats().nnz_a, a.nnz());
        assert!(f.singular_position().is_none());
        assert_eq!(f.local_range(), 0..8);
    }

    #[test]
    fn refinement_reduces_backward_error() {
        let a = hilbert_like(10);
        let b = vec![1.0; 10];
        let options = SolverOptions {
            refinement_steps: 3,
            pivot_threshold: 0.01,
            ..Default::default()
        };
        let f = FactorSet::build(&whole(&a), single(), &options, &Capabilities::detect(), None).unwrap();
        let (x, report) = f.solve(&[b.clone()], TransposeMode::None).unwrap();
        let berr = report.backward_error.unwrap();
        assert!(berr < 1e-10, "backward error {berr}");
        assert!(report.refinement_steps <= 3);
        let r = a.spmv(&x[0]);
        for i in 0..10 {
            assert_abs_diff_eq!(r[i], 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn no_refinement_by_default() {
        let a = hilbert_like(4);
        let f = FactorSet::build(&whole(&a), single(), &SolverOptions::default(), &Capabilities::detect(), None)
            .unwrap();
        let (_, report) = f.solve(&[vec![1.0; 4]], TransposeMode::Transpose).unwrap();
        assert_eq!(report, SolveReport { refinement_steps: 0, backward_error: None });
    }

    #[test]
    fn reused_plan_must_match() {
        let a = hilbert_like(6);
        let f = FactorSet::build(&whole(&a), single(), &SolverOptions::default(), &Capabilities::detect(), None)
            .unwrap();
        let plan = f.plan().unwrap();
        let again = FactorSet::build(
            &whole(&a),
            single(),
            &SolverOptions::default(),
            &Capabilities::detect(),
            Some(Arc::clone(&plan)),
        )
        .unwrap();
        assert!(Arc::ptr_eq(&again.plan().unwrap(), &plan));

        let other = hilbert_like(5);
        let err = FactorSet::build(&whole(&other), single(), &SolverOptions::default(), &Capabilities::detect(), Some(plan))
            .unwrap_err();
        assert!(matches!(err, SolverError::MalformedInput(_)));
    }

    #[test]
    fn faer_unavailable_without_capability() {
        let a = hilbert_like(3);
        let options = SolverOptions { backend: Backend::Faer, ..Default::default() };
        let caps = Capabilities { faer: false, mpi: false };
        let err = FactorSet::build(&whole(&a), single(), &options, &caps, None).unwrap_err();
        assert_eq!(err.status_code(), -1);
    }

    #[test]
    fn short_rhs_on_one_rank_fails_every_rank() {
        let a = hilbert_like(6);
        let codes = ThreadComm::run(2, |comm| {
            let grid = ProcessGrid::init(GridShape::new(1, 2), Arc::new(comm)).unwrap();
            let block = if grid.rank() == 0 {
                whole(&a)
            } else {
                SparseMatrixBlock::from_csr(6, 6, vec![], vec![], vec![0]).unwrap()
            };
            let f = FactorSet::build(&block, grid, &SolverOptions::default(), &Capabilities::detect(), None)
                .unwrap();
            let len = if f.grid().rank() == 0 { 6 } else { 5 };
            let err = f.solve(&[vec![1.0; len]], TransposeMode::None).unwrap_err();
            // The grid must still be usable afterwards.
            let (x, _) = f.solve(&[a.spmv(&[1.0; 6])], TransposeMode::None).unwrap();
            (err.status_code(), x)
        });
        assert_eq!(codes[0].0, SolverError::MalformedInput(String::new()).status_code());
        assert_eq!(codes[1].0, SolverError::DimensionMismatch { expected: 6, actual: 5 }.status_code());
        for (_, x) in &codes {
            for v in &x[0] {
                assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn distributed_rows_in_distributed_rows_out() {
        let a = hilbert_like(6);
        let x_true: Vec<f64> = (0..6).map(|i| i as f64 - 2.0).collect();
        let b = a.spmv(&x_true);
        let pieces = ThreadComm::run(2, |comm| {
            let grid = ProcessGrid::init(GridShape::new(1, 2), Arc::new(comm)).unwrap();
            let rows = if grid.rank() == 0 { 0..4 } else { 4..6 };
            let mut ptr = vec![0];
            let (mut idx, mut val) = (Vec::new(), Vec::new());
            for r in rows.clone() {
                for k in a.row_pointers[r]..a.row_pointers[r + 1] {
                    idx.push(a.col_indices[k]);
                    val.push(a.values[k]);
                }
                ptr.push(idx.len());
            }
            let block = SparseMatrixBlock::from_csr(6, rows.start, val, idx, ptr).unwrap();
            let options = SolverOptions {
                symbolic: symbolic::SymbolicOptions { block_size: 2, ..Default::default() },
                ..Default::default()
            };
            let f = FactorSet::build(&block, grid, &options, &Capabilities::detect(), None).unwrap();
            let (x, _) = f.solve_distributed(&[b[rows.clone()].to_vec()], TransposeMode::None).unwrap();
            (rows, x.into_iter().next().unwrap())
        });
        for (rows, x) in pieces {
            for (k, i) in rows.enumerate() {
                assert_abs_diff_eq!(x[k], x_true[i], epsilon = 1e-10);
            }
        }
    }
}
