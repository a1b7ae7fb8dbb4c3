//! Error types shared by the distributed data structures and solvers.
use std::fmt;

/// The error type reported by distributed vectors, matrices and assemblers.
///
/// Collective operations report errors locally: every rank that participates
/// in a failing collective call observes an error, but the variants are not
/// guaranteed to be identical across ranks (for example, a singular pivot is
/// detected on the rank that owns the offending block row).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A setup call was invalid or issued in the wrong order.
    Configuration(String),
    /// Two objects that must agree on a dimension did not.
    DimensionMismatch(String),
    /// A pivot block could not be inverted during factorization.
    SingularPivot { block_row: usize },
    /// A node or entry index was outside the valid range.
    IndexOutOfRange { index: usize, bound: usize },
    /// A communication protocol was violated, e.g. overlapping exchanges on
    /// the same vector or completing an exchange that was never begun.
    CommunicationDeadlock(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(message) => {
                write!(f, "Invalid configuration: {}", message)
            }
            Self::DimensionMismatch(message) => {
                write!(f, "Dimension mismatch: {}", message)
            }
            Self::SingularPivot { block_row } => {
                write!(f, "Singular pivot block in block row {}", block_row)
            }
            Self::IndexOutOfRange { index, bound } => {
                write!(f, "Index {} out of range (bound {})", index, bound)
            }
            Self::CommunicationDeadlock(message) => {
                write!(f, "Communication protocol violation: {}", message)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<sleipnir_sparse::SingularBlock> for Error {
    fn from(error: sleipnir_sparse::SingularBlock) -> Self {
        Self::SingularPivot {
            block_row: error.block_row,
        }
    }
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn dimension_mismatch(message: impl Into<String>) -> Self {
        Self::DimensionMismatch(message.into())
    }

    pub(crate) fn deadlock(message: impl Into<String>) -> Self {
        Self::CommunicationDeadlock(message.into())
    }
}
