//! Error classification at the transport boundary.
//!
//! Everything above the HTTP layer sees either a success or a classified
//! failure: transient errors are retried by the transport helpers, permanent
//! errors surface to the caller, and precondition errors (a sink row that no
//! longer exists) get their own variant so the pipeline can schedule repair.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level failure: connect error, timeout, broken stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote asked us to slow down (HTTP 429 or an explicit
    /// rate-limit code in the response envelope), possibly carrying a
    /// `Retry-After` hint in seconds.
    #[error("throttled by remote service")]
    Throttled { retry_after: Option<u64> },

    /// The remote rejected the request (4xx other than 429, or an error
    /// code in the response envelope).
    #[error("api error (status {status}): {message}")]
    Protocol { status: u16, message: String },

    /// The remote answered but the body did not parse as expected.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// An update referenced a sink row that no longer exists.
    #[error("record {0} not found in sink table")]
    RecordNotFound(String),

    /// A paginated fetch could not produce the complete result set.
    /// The partial data is discarded; callers never see a truncated set.
    #[error("incomplete result set: expected {expected}, fetched {fetched}")]
    Incomplete { expected: usize, fetched: usize },
}

impl ApiError {
    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Throttled { .. } => true,
            ApiError::Protocol { status, .. } => *status >= 500,
            ApiError::Malformed(_) | ApiError::RecordNotFound(_) | ApiError::Incomplete { .. } => {
                false
            }
        }
    }

    /// The server's own wait hint, if it sent one.
    pub fn retry_after_hint(&self) -> Option<u64> {
        match self {
            ApiError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify a plain HTTP status with its error body and optional
    /// `Retry-After` hint.
    pub fn from_status(status: u16, retry_after: Option<u64>, message: impl Into<String>) -> Self {
        if status == 429 {
            ApiError::Throttled { retry_after }
        } else {
            ApiError::Protocol {
                status,
                message: message.into(),
            }
        }
    }
}

/// Parse a response's `Retry-After` header as whole seconds.
pub fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        // Callers classify non-2xx statuses themselves, so anything arriving
        // here is a connection, timeout or body-read problem.
        ApiError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Transport("connection reset".into()).is_transient());
        assert!(ApiError::Throttled { retry_after: None }.is_transient());
        assert!(ApiError::Protocol {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(!ApiError::Protocol {
            status: 400,
            message: "bad jql".into()
        }
        .is_transient());
        assert!(!ApiError::Malformed("truncated json".into()).is_transient());
        assert!(!ApiError::RecordNotFound("rec_x".into()).is_transient());
        assert!(!ApiError::Incomplete {
            expected: 100,
            fetched: 50
        }
        .is_transient());
    }

    #[test]
    fn test_from_status_maps_429_to_throttled() {
        assert!(matches!(
            ApiError::from_status(429, Some(30), "slow down"),
            ApiError::Throttled {
                retry_after: Some(30)
            }
        ));
        assert!(matches!(
            ApiError::from_status(404, None, "missing"),
            ApiError::Protocol { status: 404, .. }
        ));
    }

    #[test]
    fn test_retry_after_hint() {
        assert_eq!(
            ApiError::Throttled {
                retry_after: Some(7)
            }
            .retry_after_hint(),
            Some(7)
        );
        assert_eq!(
            ApiError::Transport("down".into()).retry_after_hint(),
            None
        );
    }
}
