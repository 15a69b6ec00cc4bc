//! Error types.
use thiserror::Error;

use crate::api::UpstreamError;

/// Error used by the entire streaming crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A cache error other than a miss.
    #[error("cache error: {0}")]
    Cache(#[from] mediabridge_cache::errors::Error),

    /// The upstream call failed for good: a fatal error, or a transient
    /// one that survived the whole retry budget.
    #[error("{0}")]
    Upstream(#[from] UpstreamError),

    /// The message doesn't exist or carries no streamable media.
    #[error("message {0} has no streamable media")]
    MessageNotFound(i64),

    /// The upstream object ended before the requested range did.
    #[error("upstream stream ended prematurely")]
    UnexpectedEof,
}
