//! Sparse direct solver: symbolic analysis, distributed block LU,
//! triangular solves and the handle registry that owns the factors.

pub mod comm;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod comm_thread;
pub mod dense;
pub mod factor;
pub mod grid;
pub mod handle;
pub mod numeric;
pub mod ordering;
pub mod scaling;
#[cfg(feature = "faer")]
pub mod sparse_direct;
pub mod symbolic;
pub mod triangular;

use crate::error::{Result, SolverError};
use numeric::NumericOptions;
use symbolic::SymbolicOptions;

/// Upper bound on iterative refinement steps per solve.
pub const MAX_REFINEMENT_STEPS: usize = 5;

/// Which operator a solve applies the inverse of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransposeMode {
    /// A x = b
    #[default]
    None,
    /// Aᵀ x = b
    Transpose,
    /// Aᴴ x = b; same as `Transpose` for real scalars.
    ConjugateTranspose,
}

impl TransposeMode {
    /// Integer boundary code: 0 none, 1 transpose, 2 conjugate transpose.
    /// Anything else falls back to `None`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => TransposeMode::Transpose,
            2 => TransposeMode::ConjugateTranspose,
            _ => TransposeMode::None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            TransposeMode::None => 0,
            TransposeMode::Transpose => 1,
            TransposeMode::ConjugateTranspose => 2,
        }
    }
}

/// Factorization engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Block LU over the process grid.
    #[default]
    Native,
    /// faer's sparse LU; real double precision on a 1×1 grid only.
    Faer,
}

/// Which optional engines this build carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub faer: bool,
    pub mpi: bool,
}

impl Capabilities {
    /// What the crate was compiled with.
    pub fn detect() -> Self {
        Self {
            faer: cfg!(feature = "faer"),
            mpi: cfg!(feature = "distributed"),
        }
    }

    pub fn supports(&self, backend: Backend) -> bool {
        match backend {
            Backend::Native => true,
            Backend::Faer => self.faer,
        }
    }

    /// Fail with `BackendUnavailable` when `backend` is missing.
    pub fn require(&self, backend: Backend) -> Result<()> {
        if self.supports(backend) {
            Ok(())
        } else {
            Err(SolverError::BackendUnavailable(format!(
                "{backend:?} backend was not compiled into this build"
            )))
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect()
    }
}

/// Factorization and solve configuration.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub symbolic: SymbolicOptions,
    /// Threshold τ in (0, 1]; 1.0 is classic partial pivoting.
    pub pivot_threshold: f64,
    pub replace_tiny_pivots: bool,
    /// Equilibrate rows and columns before factoring when they are badly
    /// scaled.
    pub equilibrate: bool,
    /// Refinement steps per solve, clamped to `MAX_REFINEMENT_STEPS`.
    pub refinement_steps: usize,
    pub backend: Backend,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            symbolic: SymbolicOptions::default(),
            pivot_threshold: 1.0,
            replace_tiny_pivots: false,
            equilibrate: true,
            refinement_steps: 0,
            backend: Backend::Native,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.pivot_threshold > 0.0 && self.pivot_threshold <= 1.0) {
            return Err(SolverError::MalformedInput(format!(
                "pivot threshold must lie in (0, 1], got {}",
                self.pivot_threshold
            )));
        }
        if self.symbolic.block_size == 0 {
            return Err(SolverError::MalformedInput("block size must be positive".into()));
        }
        Ok(())
    }

    pub fn numeric(&self) -> NumericOptions {
        NumericOptions {
            pivot_threshold: self.pivot_threshold,
            replace_tiny_pivots: self.replace_tiny_pivots,
            equilibrate: self.equilibrate,
        }
    }

    pub fn refinement(&self) -> usize {
        self.refinement_steps.min(MAX_REFINEMENT_STEPS)
    }
}
