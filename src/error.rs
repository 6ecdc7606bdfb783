//! Error types for cloudtree.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CloudtreeError>;

/// Errors surfaced by the index, the query engine, and the storage seam.
#[derive(Debug, Error)]
pub enum CloudtreeError {
    /// A structure or query parameter failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A programming error: a cursor or block was driven outside its
    /// contract. Not recoverable; the operation must be aborted.
    #[error("invariant violated: {0}")]
    InvariantViolated(&'static str),

    /// A persisted block or chunk failed to deserialize.
    #[error("malformed block: {0}")]
    MalformedBlock(String),

    /// The storage endpoint has no value for the requested key.
    #[error("not found: {0}")]
    NotFound(String),

    /// An I/O failure from the storage endpoint.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    /// The cache budget cannot hold the requested fetch set.
    #[error("cache exhausted: {needed} bytes needed, budget is {budget}")]
    CacheExhausted { needed: u64, budget: u64 },
}

impl CloudtreeError {
    /// True for absent-key results, which callers may recover from when
    /// probing optional data.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudtreeError::NotFound(_))
    }
}
