use std::time::Duration;

use thiserror::Error;

/// Failure talking to one upstream source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - credentials rejected")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited by upstream")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl TransportError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 => TransportError::Unauthorized,
            403 => TransportError::AccessDenied(truncated),
            404 => TransportError::NotFound(truncated),
            429 => TransportError::RateLimited,
            500..=599 => TransportError::ServerError(truncated),
            _ => TransportError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(Duration::ZERO)
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// A source answered, but its payload could not be decoded.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    Transport(TransportError),
    Decode(DecodeError),
    /// Fetched and decoded fine, but rejected by the freshness/validity check.
    Invalid(String),
}

/// Why one source in a fallback chain was passed over.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFailure {
    pub source: String,
    pub kind: FailureKind,
}

impl std::fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Transport(e) => write!(f, "{}: {}", self.source, e),
            FailureKind::Decode(e) => write!(f, "{}: decode failed: {}", self.source, e),
            FailureKind::Invalid(reason) => write!(f, "{}: rejected: {}", self.source, reason),
        }
    }
}

/// What a resolve or fetch hands back to callers when there is no value.
///
/// Individual transport and validation failures never escape on their own;
/// they are collected into [`FetchError::NoFreshData`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("No fresh data for {key} ({} sources tried)", attempts.len())]
    NoFreshData {
        key: String,
        attempts: Vec<SourceFailure>,
    },

    #[error("Fetch for {key} deferred by rate limit, retry in {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },

    #[error("Fetch for {key} aborted: {reason}")]
    Aborted { key: String, reason: String },
}

impl FetchError {
    pub fn is_no_fresh_data(&self) -> bool {
        matches!(self, FetchError::NoFreshData { .. })
    }

    pub fn attempts(&self) -> &[SourceFailure] {
        match self {
            FetchError::NoFreshData { attempts, .. } => attempts,
            _ => &[],
        }
    }

    /// True when every source answered but all answers failed validation,
    /// i.e. upstreams are reachable and simply have nothing recent.
    pub fn all_stale(&self) -> bool {
        let attempts = self.attempts();
        !attempts.is_empty()
            && attempts
                .iter()
                .all(|a| matches!(a.kind, FailureKind::Invalid(_)))
    }
}
