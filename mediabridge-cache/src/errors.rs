//! Error types.
use thiserror::Error;

/// Error used by the entire cache crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Disk I/O failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// There is no chunk under the requested key.
    #[error("chunk not found")]
    NotFound,

    /// The index file is truncated or otherwise unreadable past its
    /// leading record count.
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),

    /// A parameter violates the cache's contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The cache has already been closed.
    #[error("cache is closed")]
    Closed,
}
