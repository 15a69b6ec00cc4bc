use actix_web::{http::StatusCode, ResponseError};
use mediabridge::errors::Error as BridgeError;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request")]
    BadRequest,
    #[error("invalid authentication hash")]
    InvalidHash,
    #[error("not found")]
    NotFound,
    #[error("range not satisfiable")]
    RangeNotSatisfiable,
    #[error("internal server error")]
    Internal,
}

impl From<BridgeError> for AppError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::MessageNotFound(_) => Self::NotFound,
            BridgeError::Cache(_) | BridgeError::Upstream(_) | BridgeError::UnexpectedEof => {
                Self::Internal
            }
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest | AppError::InvalidHash => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Does this error message look like the far end hung up?
///
/// Streaming to a seeking video player means half-read responses are
/// routine; those must not show up as server faults in the logs.
fn is_disconnect_message(message: &str) -> bool {
    const FRAGMENTS: &[&str] = &[
        "broken pipe",
        "connection reset",
        "connection aborted",
        "epipe",
        "econnreset",
        "econnaborted",
    ];

    let message = message.to_lowercase();
    FRAGMENTS.iter().any(|f| message.contains(f))
}

pub(crate) fn is_client_disconnect(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    ) || is_disconnect_message(&error.to_string())
}

/// Log a failure that happened after the response headers went out.
/// Headers can't be rewritten at that point; all we choose is the log
/// level.
pub(crate) fn log_body_error(error: &BridgeError) {
    let disconnectish = match error {
        BridgeError::Cache(mediabridge_cache::errors::Error::Io(io)) => is_client_disconnect(io),
        _ => is_disconnect_message(&error.to_string()),
    };

    if disconnectish {
        debug!("client went away mid-body: {error}");
    } else {
        error!("body streaming failed: {error}");
    }
}
