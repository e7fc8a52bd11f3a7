//! Provider error taxonomy

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by a `MailProvider`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider asked us to slow down
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The stored history marker expired or cannot be resolved
    #[error("sync cursor expired or invalid")]
    CursorInvalid,

    /// The access token was rejected
    #[error("access token rejected")]
    Unauthorized,

    /// The refresh token was revoked; user action required
    #[error("refresh token rejected: {0}")]
    RefreshDenied(String),

    /// The requested resource does not exist (anymore)
    #[error("resource not found")]
    NotFound,

    /// Network failure or 5xx; worth retrying
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Anything else; retrying will not help
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Whether a later attempt may succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }

    /// Classify a non-success HTTP response.
    ///
    /// Gmail reports per-user quota exhaustion as 403 with a
    /// `rateLimitExceeded` reason, so the body is inspected for 403s.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        match status {
            401 => ProviderError::Unauthorized,
            403 if body.contains("rateLimitExceeded") => {
                ProviderError::RateLimited { retry_after }
            }
            404 => ProviderError::NotFound,
            429 => ProviderError::RateLimited { retry_after },
            500..=599 => ProviderError::Transient(format!("HTTP {}: {}", status, redact(body))),
            _ => ProviderError::Permanent(format!("HTTP {}: {}", status, redact(body))),
        }
    }
}

const REDACTED_BODY_MAX_LEN: usize = 200;

/// Truncate a response body before it lands in logs or account status
fn redact(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }
    let mut end = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
