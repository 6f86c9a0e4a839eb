// src/error.rs

use std::error::Error as StdError;
use thiserror::Error;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
/// Distributed-matrix collaborators and linear-algebra backends report failures with it.
pub type ThreadSafeStdError = Box<dyn StdError + Send + Sync + 'static>;

/// Every failure the CX pipeline can surface.
///
/// Variants fall into three groups: parameter validation (rejected before any
/// distributed work happens), collaborator/dimension problems (the matrix behind
/// the `DistributedMatrix` trait disagreed with what it declared), and numerical
/// failures. Numerical degeneracy of a selection is normally reported as a flag on
/// `ReconstructionError`; `SingularSelection` only appears in strict mode.
#[derive(Error, Debug)]
pub enum CxError {
    #[error("target rank k={k} is out of range, expected 0 < k <= {n}")]
    InvalidRank { k: usize, n: usize },

    #[error("sample size r={r} is out of range, expected 0 < r <= {n}")]
    InvalidSampleSize { r: usize, n: usize },

    #[error("unknown selection scheme '{0}', expected 'deterministic' or 'randomized'")]
    UnknownScheme(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid leverage scores: {0}")]
    InvalidScores(String),

    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("dimension mismatch in {operation}: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        operation: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("no indices were selected")]
    EmptySelection,

    #[error("row keys missing from the distributed matrix: {missing:?}")]
    MissingKey { missing: Vec<usize> },

    #[error("selected rows have numerical rank {rank}, below the {requested} rows gathered")]
    SingularSelection { rank: usize, requested: usize },

    #[error("distributed matrix operation '{operation}' failed")]
    Collaborator {
        operation: &'static str,
        #[source]
        source: ThreadSafeStdError,
    },

    #[error("linear algebra backend failed during {operation}")]
    Linalg {
        operation: &'static str,
        #[source]
        source: ThreadSafeStdError,
    },
}

pub type Result<T> = std::result::Result<T, CxError>;

impl CxError {
    pub(crate) fn collaborator(operation: &'static str) -> impl FnOnce(ThreadSafeStdError) -> CxError {
        move |source| CxError::Collaborator { operation, source }
    }

    pub(crate) fn linalg(operation: &'static str) -> impl FnOnce(ThreadSafeStdError) -> CxError {
        move |source| CxError::Linalg { operation, source }
    }

    /// True for errors caused by the caller's parameters rather than by the data or a backend.
    pub fn is_parameter_error(&self) -> bool {
        matches!(
            self,
            CxError::InvalidRank { .. }
                | CxError::InvalidSampleSize { .. }
                | CxError::UnknownScheme(_)
                | CxError::InvalidConfig(_)
        )
    }
}
