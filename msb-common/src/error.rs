//! Common error types for msb

use thiserror::Error;

/// Common result type for msb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the msb crates
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is worth retrying after a backoff delay.
    ///
    /// Validation and auth errors are not transient: retrying them without
    /// operator intervention produces the same result.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Upstream(e) => !e.show_stopper,
            _ => false,
        }
    }
}

/// A failure reported by (or on the way to) an upstream scrobble service.
///
/// `show_stopper` separates the two fates a failed scrobble can have:
/// - `false`: per-call failure (rate limit, transient 5xx, timeout); the
///   scrobble moves to the dead-letter queue and the worker continues.
/// - `true`: the service refuses a shape it will always refuse; the scrobble
///   is requeued at the front and the worker surfaces the error.
#[derive(Error, Debug, Clone)]
#[error("upstream error: {message}")]
pub struct UpstreamError {
    pub message: String,
    pub show_stopper: bool,
    /// HTTP status when the failure came from an HTTP response.
    pub status: Option<u16>,
}

impl UpstreamError {
    /// A retryable (non-show-stopping) upstream failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            show_stopper: false,
            status: None,
        }
    }

    /// A show-stopping upstream failure.
    pub fn show_stopper(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            show_stopper: true,
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether the upstream has revoked our credentials.
    pub fn is_auth_revoked(&self) -> bool {
        matches!(self.status, Some(401) | Some(403))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Network("refused".into()).is_transient());
        assert!(Error::Upstream(UpstreamError::retryable("503")).is_transient());
        assert!(!Error::Upstream(UpstreamError::show_stopper("bad shape")).is_transient());
        assert!(!Error::Config("missing name".into()).is_transient());
        assert!(!Error::Auth("revoked".into()).is_transient());
    }

    #[test]
    fn auth_revocation_by_status() {
        assert!(UpstreamError::retryable("unauthorized")
            .with_status(401)
            .is_auth_revoked());
        assert!(!UpstreamError::retryable("rate limited")
            .with_status(429)
            .is_auth_revoked());
    }
}
