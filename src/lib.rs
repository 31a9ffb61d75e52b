//! gridlu: distributed sparse direct LU factorization.
//!
//! Factor a sparse matrix split across the participants of a communicator,
//! keep the factors behind a handle, and solve with them as often as needed:
//!
//! ```
//! use gridlu::interface::Session;
//!
//! let mut session = Session::<f64>::single();
//! // 1-based CSR: diag(2, 4).
//! let (handle, status) = session.factor(2, 2, 1, &[2.0, 4.0], &[1, 2, 3], &[1, 2], (1, 1));
//! assert_eq!(status, 0);
//! let handle = handle.unwrap();
//! let (x, status) = session.solve(handle, &[vec![2.0, 2.0]], 0);
//! assert_eq!((x, status), (vec![vec![1.0, 0.5]], 0));
//! assert_eq!(session.free(handle), 0);
//! ```

pub mod error;
pub mod interface;
pub mod scalar;
pub mod solver;
pub mod sparse;
pub mod stats;

pub use error::{Phase, Result, SolverError};
pub use interface::{status, Session};
pub use scalar::{Scalar, ScalarKind};
pub use solver::comm::{CommunicationBackend, SingleProcessComm};
pub use solver::comm_thread::ThreadComm;
pub use solver::factor::{FactorSet, SolveReport};
pub use solver::grid::{GridShape, ProcessGrid};
pub use solver::handle::{FactorHandle, HandleState, Registry};
pub use solver::ordering::OrderingMethod;
pub use solver::symbolic::{SymbolicOptions, SymbolicPlan};
pub use solver::{Backend, Capabilities, SolverOptions, TransposeMode, MAX_REFINEMENT_STEPS};
pub use sparse::{Compression, CsrMatrix, SparseMatrixBlock};
pub use stats::FactorStats;
