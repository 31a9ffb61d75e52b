//! Status-code boundary: `factor`, `solve`, `free`.
//!
//! Takes 1-based compressed arrays and integer transpose codes, and reports
//! outcomes as integer status codes instead of `Result`s. Everything is
//! shifted to 0-based on the way in and positions are shifted back to
//! 1-based on the way out.

use std::sync::Arc;

use crate::error::{Result, SolverError};
use crate::scalar::Scalar;
use crate::solver::comm::{CommunicationBackend, SingleProcessComm};
use crate::solver::grid::{GridShape, ProcessGrid};
use crate::solver::handle::{FactorHandle, Registry};
use crate::solver::{Capabilities, SolverOptions, TransposeMode};
use crate::sparse::{Compression, SparseMatrixBlock};

/// Boundary status codes. Positive values `k` report a zero pivot at
/// original column `k` (1-based) of an otherwise usable factorization.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const BACKEND_UNAVAILABLE: i32 = -1;
    pub const MALFORMED_INPUT: i32 = -2;
    pub const DIMENSION_MISMATCH: i32 = -3;
    pub const HANDLE_NOT_READY: i32 = -4;
    pub const USE_AFTER_FREE: i32 = -5;
    pub const COMMUNICATION: i32 = -6;
    pub const INVALID_GRID: i32 = -7;
    pub const SYMBOLIC_FAILURE: i32 = -11;
    pub const NUMERIC_FAILURE: i32 = -12;

    pub fn describe(code: i32) -> &'static str {
        match code {
            SUCCESS => "success",
            k if k > 0 => "singular pivot",
            BACKEND_UNAVAILABLE => "backend not available",
            MALFORMED_INPUT => "malformed input",
            DIMENSION_MISMATCH => "dimension mismatch",
            HANDLE_NOT_READY => "handle not ready",
            USE_AFTER_FREE => "use after free",
            COMMUNICATION => "communication failure",
            INVALID_GRID => "invalid process grid",
            SYMBOLIC_FAILURE => "symbolic phase failure",
            NUMERIC_FAILURE => "numeric phase failure",
            _ => "unknown status",
        }
    }
}

/// One participant's view of the boundary.
///
/// Every participant of the communicator creates its own session and issues
/// the same sequence of calls.
pub struct Session<T> {
    registry: Registry<T>,
    comm: Arc<dyn CommunicationBackend>,
    options: SolverOptions,
}

fn non_negative(v: i64, what: &str) -> Result<usize> {
    usize::try_from(v)
        .map_err(|_| SolverError::MalformedInput(format!("{what} must be non-negative, got {v}")))
}

fn grid_shape((nprow, npcol): (i64, i64)) -> Result<GridShape> {
    match (usize::try_from(nprow), usize::try_from(npcol)) {
        (Ok(r), Ok(c)) => Ok(GridShape::new(r, c)),
        _ => Err(SolverError::InvalidGrid(format!(
            "grid dimensions must be positive, got {nprow}x{npcol}"
        ))),
    }
}

impl<T: Scalar> Session<T> {
    pub fn new(comm: Arc<dyn CommunicationBackend>) -> Self {
        Self::with_options(comm, SolverOptions::default(), Capabilities::detect())
    }

    /// Session over a single process.
    pub fn single() -> Self {
        Self::new(Arc::new(SingleProcessComm))
    }

    pub fn with_options(
        comm: Arc<dyn CommunicationBackend>,
        options: SolverOptions,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            registry: Registry::with_capabilities(capabilities),
            comm,
            options,
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut SolverOptions {
        &mut self.options
    }

    pub fn registry(&self) -> &Registry<T> {
        &self.registry
    }

    /// Factor from 1-based compressed-row input.
    ///
    /// `row_offset` is the 1-based global index of this participant's first
    /// row. Returns no handle when the input, grid or backend is rejected;
    /// a failure during factorization leaves a failed handle to be freed.
    #[allow(clippy::too_many_arguments)]
    pub fn factor(
        &mut self,
        n: i64,
        local_nnz: i64,
        row_offset: i64,
        values: &[T],
        row_ptr: &[i64],
        col_ind: &[i64],
        grid: (i64, i64),
    ) -> (Option<FactorHandle<T>>, i32) {
        self.factor_compressed(Compression::Row, n, local_nnz, row_offset, values, row_ptr, col_ind, grid)
    }

    /// Factor from 1-based compressed-column input.
    #[allow(clippy::too_many_arguments)]
    pub fn factor_csc(
        &mut self,
        n: i64,
        local_nnz: i64,
        col_offset: i64,
        values: &[T],
        col_ptr: &[i64],
        row_ind: &[i64],
        grid: (i64, i64),
    ) -> (Option<FactorHandle<T>>, i32) {
        self.factor_compressed(Compression::Column, n, local_nnz, col_offset, values, col_ptr, row_ind, grid)
    }

    #[allow(clippy::too_many_arguments)]
    fn factor_compressed(
        &mut self,
        compression: Compression,
        n: i64,
        local_nnz: i64,
        offset: i64,
        values: &[T],
        pointers: &[i64],
        indices: &[i64],
        grid: (i64, i64),
    ) -> (Option<FactorHandle<T>>, i32) {
        let grid = match grid_shape(grid).and_then(|shape| ProcessGrid::init(shape, Arc::clone(&self.comm))) {
            Ok(g) => g,
            Err(e) => return (None, e.status_code()),
        };

        let local = self.options.validate().and_then(|()| {
            let n = non_negative(n, "dimension")?;
            let nnz = non_negative(local_nnz, "nonzero count")?;
            if nnz != values.len() {
                return Err(SolverError::MalformedInput(format!(
                    "declared {nnz} nonzeros but {} values were passed",
                    values.len()
                )));
            }
            let first = non_negative(offset, "offset")?;
            SparseMatrixBlock::from_one_based(compression, n, first, values.to_vec(), indices, pointers)
        });
        let block = match grid.agree(local) {
            Ok(b) => b,
            Err(e) => return (None, e.status_code()),
        };

        let handle = self.registry.allocate();
        match self.registry.factor(handle, &block, grid, &self.options) {
            Ok(()) => {
                let code = self
                    .registry
                    .get(handle)
                    .ok()
                    .and_then(|set| set.singular_position())
                    .map(|position| SolverError::SingularMatrix { position }.status_code())
                    .unwrap_or(status::SUCCESS);
                (Some(handle), code)
            }
            Err(e) => {
                let code = e.status_code();
                if matches!(
                    e,
                    SolverError::MalformedInput(_)
                        | SolverError::InvalidGrid(_)
                        | SolverError::BackendUnavailable(_)
                        | SolverError::DimensionMismatch { .. }
                ) {
                    self.registry.discard(handle);
                    (None, code)
                } else {
                    (Some(handle), code)
                }
            }
        }
    }

    /// Solve with this participant's rows of each right-hand-side column.
    ///
    /// `trans` is 0 (A), 1 (Aᵀ) or 2 (Aᴴ); other values mean 0.
    pub fn solve(&self, handle: FactorHandle<T>, rhs: &[Vec<T>], trans: i32) -> (Vec<Vec<T>>, i32) {
        match self
            .registry
            .solve_distributed(handle, rhs, TransposeMode::from_code(trans))
        {
            Ok((x, _)) => (x, status::SUCCESS),
            Err(e) => (Vec::new(), e.status_code()),
        }
    }

    pub fn free(&mut self, handle: FactorHandle<T>) -> i32 {
        match self.registry.free(handle) {
            Ok(()) => status::SUCCESS,
            Err(e) => e.status_code(),
        }
    }
}
