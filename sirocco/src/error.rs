//! Error types for Sirocco

use thiserror::Error;

/// Result type alias using Sirocco's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sirocco operations
///
/// Every failure is fatal to the call that raised it; nothing is retried
/// or recovered internally.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller input: wrong rank, batch mismatch, unknown
    /// attention kind, incompatible device placement, conflicting flags,
    /// or a head count that does not divide the hidden size.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A cache entry violates the pairing rules, e.g. `memory_keys` live
    /// without `memory_values`.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Allocation or kernel failure reported by a backend, propagated
    /// unchanged.
    #[error("resource failure: {0}")]
    ResourceFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
