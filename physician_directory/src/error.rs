use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single request against an external service.
///
/// Every variant maps to one [`Outcome`] class used by the adaptive rate
/// limiter, and decides on its own whether the request may be retried.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("rate limited upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream server error: HTTP {status}")]
    ServerError { status: u16 },

    #[error("blocked by upstream anti-automation: {0}")]
    Blocked(String),

    #[error("not found upstream: {0}")]
    NotFound(String),

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("unexpected upstream status: HTTP {status}")]
    UnexpectedStatus { status: u16 },
}

/// Outcome class of one request, as seen by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    RateLimited,
    ServerError,
    Blocked,
    OtherError,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::TransientNetwork(_)
                | FetchError::RateLimited { .. }
                | FetchError::ServerError { .. }
                | FetchError::Blocked(_)
        )
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            FetchError::RateLimited { .. } => Outcome::RateLimited,
            FetchError::ServerError { .. } => Outcome::ServerError,
            FetchError::Blocked(_) => Outcome::Blocked,
            FetchError::TransientNetwork(_)
            | FetchError::NotFound(_)
            | FetchError::Malformed(_)
            | FetchError::UnexpectedStatus { .. } => Outcome::OtherError,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-friendly label, used in failure lists and the store.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::TransientNetwork(_) => "transient_network",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::ServerError { .. } => "server_error",
            FetchError::Blocked(_) => "blocked",
            FetchError::NotFound(_) => "not_found",
            FetchError::Malformed(_) => "malformed",
            FetchError::UnexpectedStatus { .. } => "unexpected_status",
        }
    }

    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited { retry_after },
            StatusCode::FORBIDDEN => FetchError::Blocked(format!("HTTP 403: {body}")),
            StatusCode::NOT_FOUND => FetchError::NotFound(format!("HTTP 404: {body}")),
            s if s.is_server_error() => FetchError::ServerError { status: s.as_u16() },
            s => FetchError::UnexpectedStatus { status: s.as_u16() },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return FetchError::Malformed(err.to_string());
        }
        if let Some(status) = err.status() {
            return FetchError::from_status(status, None, "");
        }
        FetchError::TransientNetwork(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            FetchError::from_status(StatusCode::TOO_MANY_REQUESTS, None, ""),
            FetchError::RateLimited { retry_after: None }
        );
        assert_eq!(
            FetchError::from_status(StatusCode::BAD_GATEWAY, None, "").outcome(),
            Outcome::ServerError
        );
        assert_eq!(
            FetchError::from_status(StatusCode::FORBIDDEN, None, "").outcome(),
            Outcome::Blocked
        );
        assert!(matches!(
            FetchError::from_status(StatusCode::NOT_FOUND, None, ""),
            FetchError::NotFound(_)
        ));
        assert_eq!(
            FetchError::from_status(StatusCode::BAD_REQUEST, None, ""),
            FetchError::UnexpectedStatus { status: 400 }
        );
    }

    #[test]
    fn retryability() {
        assert!(FetchError::TransientNetwork("reset".into()).is_retryable());
        assert!(FetchError::Blocked("captcha".into()).is_retryable());
        assert!(FetchError::ServerError { status: 503 }.is_retryable());
        assert!(!FetchError::NotFound("x".into()).is_retryable());
        assert!(!FetchError::Malformed("x".into()).is_retryable());
        assert!(!FetchError::UnexpectedStatus { status: 400 }.is_retryable());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(FetchError::ServerError { status: 500 }.retry_after(), None);
    }
}
