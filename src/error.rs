use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Possible errors when interacting with `remora`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Network error raised by the underlying HTTP transport
    #[error("network error while talking to an endpoint")]
    Network(#[from] reqwest::Error),
    /// A request (or probe) exceeded its per-attempt deadline
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The endpoint answered, but with a status we do not accept
    #[error("endpoint answered with status {0}")]
    HttpStatus(StatusCode),
    /// The response matched a known ban signature
    #[error("ban signature detected (status {status})")]
    BanDetected {
        /// Status code of the response that tripped the signature
        status: u16,
    },
    /// An extracted candidate URL failed validation
    #[error("candidate failed validation: {0}")]
    InvalidCandidate(String),
    /// Every candidate in a pool failed or is cooling down
    #[error("every candidate in the {0} pool failed or is cooling down")]
    PoolExhausted(&'static str),
    /// All retry attempts for a fetch were used up
    #[error("retries exhausted after {attempts} attempts for {url}")]
    RetriesExhausted {
        /// The URL that could not be fetched
        url: String,
        /// Number of attempts made, including the first
        attempts: u32,
    },
    /// A relay template is missing (or repeats) its `{url}` placeholder
    #[error("relay template must contain exactly one {{url}} placeholder: {0}")]
    InvalidTemplate(String),
    /// A resource with the same id is already registered
    #[error("a resource with id `{0}` is already registered")]
    DuplicateResource(String),
    /// The given string cannot be parsed as a URL
    #[error("invalid URL")]
    InvalidUrl(#[from] url::ParseError),
    /// Any form of I/O error, e.g. while reading or writing a ledger file
    #[error("I/O error{loc}: {1}", loc = match .0 {
        Some(p) => format!(" at `{}`", p.display()),
        None => String::new(),
    })]
    Io(Option<PathBuf>, #[source] std::io::Error),
    /// A persisted ledger could not be parsed
    #[error("malformed ledger")]
    LedgerFormat(#[from] serde_json::Error),
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        Self::Io(None, e)
    }
}

impl From<(PathBuf, std::io::Error)> for ErrorKind {
    fn from(value: (PathBuf, std::io::Error)) -> Self {
        Self::Io(Some(value.0), value.1)
    }
}
