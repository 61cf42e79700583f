use thiserror::Error;

/// Failure taxonomy for every call made through the [`Gateway`](super::gateway::Gateway).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Request rejected before anything was sent.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Remote answered with a non-2xx status other than 429.
    #[error("remote rejected request (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    /// Remote answered with 429. `retry_after` is the hint in seconds, if any.
    #[error("rate limited by remote service")]
    RateLimited { retry_after: Option<u64> },

    /// Network failure, timeout or an unparseable response.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<hyper::Error> for GatewayError {
    fn from(e: hyper::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

impl From<hyper::http::Error> for GatewayError {
    fn from(e: hyper::http::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

impl From<hyper::http::uri::InvalidUri> for GatewayError {
    fn from(e: hyper::http::uri::InvalidUri) -> Self {
        GatewayError::Transport(format!("invalid uri: {e}"))
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(e: url::ParseError) -> Self {
        GatewayError::Transport(format!("invalid url: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Transport("request timed out".to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Transport(format!("malformed response: {e}"))
    }
}

impl From<serde_path_to_error::Error<serde_json::Error>> for GatewayError {
    fn from(e: serde_path_to_error::Error<serde_json::Error>) -> Self {
        GatewayError::Transport(format!("malformed response at {}: {}", e.path(), e.inner()))
    }
}
