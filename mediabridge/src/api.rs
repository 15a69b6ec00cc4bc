//! The upstream media API contract.
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::location::Location;

/// An error reported by, or on the way to, the upstream media endpoint.
///
/// This is a closed set: implementations classify their transport's
/// failures into one of these kinds at the boundary, so the retry layer
/// never has to inspect error strings.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream asks us to back off for this many seconds before
    /// retrying. Doesn't consume retry budget.
    #[error("flood wait ({0} s)")]
    FloodWait(u64),

    /// A failure worth retrying: connection reset/refused/aborted or a
    /// temporary network condition.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// The per-call deadline elapsed, either locally or as an upstream
    /// timeout response. Retryable, and feeds adaptive block sizing.
    #[error("upstream deadline exceeded")]
    Timeout,

    /// Anything else. Surfaced immediately.
    #[error("fatal upstream error: {0}")]
    Fatal(String),
}

static FLOOD_WAIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"FLOOD_WAIT \((\d+)\)").unwrap());

impl UpstreamError {
    /// Classify an RPC-level error message.
    ///
    /// `FLOOD_WAIT (n)` is decoded into [`UpstreamError::FloodWait`];
    /// upstream timeout shapes (`-503`, `Timeout`) become
    /// [`UpstreamError::Timeout`]; everything else is fatal.
    #[must_use]
    pub fn from_rpc_message(message: &str) -> Self {
        if let Some(seconds) = flood_wait_seconds(message) {
            Self::FloodWait(seconds)
        } else if message.contains("-503") || message.contains("Timeout") {
            Self::Timeout
        } else {
            Self::Fatal(message.to_owned())
        }
    }

    /// Classify a transport-level I/O error.
    #[must_use]
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted => Self::Transient(error.to_string()),
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Fatal(error.to_string()),
        }
    }

    /// Whether the retry loop may try again after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Decode the wait duration out of an upstream `FLOOD_WAIT (n)` message.
#[must_use]
pub fn flood_wait_seconds(message: &str) -> Option<u64> {
    FLOOD_WAIT
        .captures(message)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Collaborator that fetches raw bytes from the platform's media
/// endpoint.
///
/// `offset` and `limit` are always multiples of 4096, with
/// `limit = 4096 * 2^k` and at most 512 KiB; callers uphold this. A
/// response shorter than `limit` is not an error, it means the object
/// ends inside the requested window. The per-call deadline is enforced
/// by the caller, which drops the future when it elapses.
#[async_trait]
pub trait MediaApi: Send + Sync {
    /// Fetch up to `limit` bytes of `location` starting at `offset`.
    async fn fetch(
        &self,
        location: &Location,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, UpstreamError>;
}
