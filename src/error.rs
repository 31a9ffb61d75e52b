use thiserror::Error;

/// Which half of a factorization failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Symbolic,
    Numeric,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Symbolic => write!(f, "symbolic"),
            Phase::Numeric => write!(f, "numeric"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolverError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The sparsity pattern admits no zero-free diagonal (0-based column).
    #[error("Structurally singular matrix: column {column} cannot be matched to a pivot row")]
    StructuralSingularity { column: usize },

    /// Exactly-zero pivot at a 0-based original column index.
    #[error("Singular matrix: zero pivot at column {position}")]
    SingularMatrix { position: usize },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Handle not ready: {0}")]
    HandleNotReady(String),

    #[error("Use after free: {0}")]
    UseAfterFree(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Invalid process grid: {0}")]
    InvalidGrid(String),

    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    #[error("{phase} phase failed: {message}")]
    PhaseFailure { phase: Phase, message: String },
}

impl SolverError {
    /// Boundary status code for this error.
    ///
    /// `SingularMatrix` maps to the positive 1-based position; everything else
    /// is a negative, fatal code. A position too large for the code falls
    /// back to the numeric-failure code.
    pub fn status_code(&self) -> i32 {
        match self {
            SolverError::SingularMatrix { position } => position
                .checked_add(1)
                .and_then(|p| i32::try_from(p).ok())
                .unwrap_or(-12),
            SolverError::BackendUnavailable(_) => -1,
            SolverError::MalformedInput(_) => -2,
            SolverError::DimensionMismatch { .. } => -3,
            SolverError::HandleNotReady(_) => -4,
            SolverError::UseAfterFree(_) => -5,
            SolverError::Communication(_) => -6,
            SolverError::InvalidGrid(_) => -7,
            SolverError::StructuralSingularity { .. } => -11,
            SolverError::PhaseFailure { phase: Phase::Symbolic, .. } => -11,
            SolverError::PhaseFailure { phase: Phase::Numeric, .. } => -12,
        }
    }

    /// True for errors that describe the caller's use of the API rather than
    /// a property of the matrix.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SolverError::DimensionMismatch { .. }
                | SolverError::HandleNotReady(_)
                | SolverError::UseAfterFree(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_boundary_table() {
        assert_eq!(SolverError::BackendUnavailable("faer".into()).status_code(), -1);
        assert_eq!(SolverError::MalformedInput("x".into()).status_code(), -2);
        assert_eq!(
            SolverError::DimensionMismatch { expected: 3, actual: 2 }.status_code(),
            -3
        );
        assert_eq!(SolverError::StructuralSingularity { column: 0 }.status_code(), -11);
        assert_eq!(
            SolverError::PhaseFailure { phase: Phase::Numeric, message: "x".into() }
                .status_code(),
            -12
        );
    }

    #[test]
    fn singular_position_is_one_based() {
        assert_eq!(SolverError::SingularMatrix { position: 0 }.status_code(), 1);
        assert_eq!(SolverError::SingularMatrix { position: 6 }.status_code(), 7);
    }

    #[test]
    fn unrepresentable_singular_position_is_numeric_failure() {
        let last = i32::MAX as usize - 1;
        assert_eq!(SolverError::SingularMatrix { position: last }.status_code(), i32::MAX);
        assert_eq!(SolverError::SingularMatrix { position: last + 1 }.status_code(), -12);
        assert_eq!(SolverError::SingularMatrix { position: usize::MAX }.status_code(), -12);
    }

    #[test]
    fn display_mentions_kind() {
        let err = SolverError::UseAfterFree("handle 3".into());
        assert!(err.to_string().contains("Use after free"));
        assert!(err.is_contract_violation());
        assert!(!SolverError::Communication("x".into()).is_contract_violation());
    }
}
