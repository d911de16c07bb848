//! Retry classification.
//!
//! An extension trait deciding whether a failed attempt is worth
//! retrying. Modeled on `Retryable` from [reqwest-middleware]; vendored
//! so the logic can be tailored to this crate's error taxonomy.
//!
//! [reqwest-middleware]: https://github.com/TrueLayer/reqwest-middleware

use http::StatusCode;

use crate::error::ErrorKind;

pub(crate) trait RetryExt {
    fn should_retry(&self) -> bool;
}

impl RetryExt for StatusCode {
    /// Transient statuses: request timeout, rate limiting and every
    /// server error. Other client errors are judgements about the
    /// request itself; repeating them verbatim cannot help.
    fn should_retry(&self) -> bool {
        if self.is_server_error() {
            true
        } else {
            *self == StatusCode::REQUEST_TIMEOUT || *self == StatusCode::TOO_MANY_REQUESTS
        }
    }
}

impl RetryExt for reqwest::Error {
    fn should_retry(&self) -> bool {
        if self.is_timeout() || self.is_connect() {
            true
        } else if self.is_body() || self.is_decode() || self.is_builder() || self.is_redirect() {
            false
        } else if let Some(status) = self.status() {
            status.should_retry()
        } else {
            // remaining request errors are connection-shaped; give the
            // next attempt (through a different proxy) a chance
            self.is_request()
        }
    }
}

impl RetryExt for ErrorKind {
    fn should_retry(&self) -> bool {
        match self {
            Self::Network(e) => e.should_retry(),
            Self::Timeout(_) => true,
            Self::HttpStatus(code) => code.should_retry(),
            // ban handling swaps the resource; the retry decision is
            // made by the coordinator, not here
            Self::BanDetected { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_statuses() {
        assert!(StatusCode::REQUEST_TIMEOUT.should_retry());
        assert!(StatusCode::TOO_MANY_REQUESTS.should_retry());
        assert!(StatusCode::INTERNAL_SERVER_ERROR.should_retry());
        assert!(StatusCode::BAD_GATEWAY.should_retry());
        assert!(StatusCode::SERVICE_UNAVAILABLE.should_retry());
    }

    #[test]
    fn test_non_retryable_statuses() {
        assert!(!StatusCode::OK.should_retry());
        assert!(!StatusCode::MOVED_PERMANENTLY.should_retry());
        assert!(!StatusCode::BAD_REQUEST.should_retry());
        assert!(!StatusCode::FORBIDDEN.should_retry());
        assert!(!StatusCode::NOT_FOUND.should_retry());
    }

    #[test]
    fn test_error_kind_classification() {
        assert!(ErrorKind::Timeout(Duration::from_secs(30)).should_retry());
        assert!(ErrorKind::HttpStatus(StatusCode::BAD_GATEWAY).should_retry());
        assert!(ErrorKind::BanDetected { status: 403 }.should_retry());
        assert!(!ErrorKind::HttpStatus(StatusCode::NOT_FOUND).should_retry());
        assert!(!ErrorKind::PoolExhausted("proxy").should_retry());
        assert!(!ErrorKind::InvalidCandidate("x".into()).should_retry());
        assert!(
            !ErrorKind::RetriesExhausted {
                url: "https://x".into(),
                attempts: 3
            }
            .should_retry()
        );
    }
}
