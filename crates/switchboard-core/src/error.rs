//! Shared error taxonomy for registry and client operations
//!
//! Client code never lets a raw transport error escape: everything is
//! normalized into [`Error`] before crossing the crate boundary.

use reqwest::StatusCode;
use thiserror::Error;

/// Error type shared by the provider registry and the provider client
#[derive(Debug, Error)]
pub enum Error {
    /// No provider registered under the given name
    #[error("unknown provider: {0}")]
    NotFound(String),

    /// Target provider is disabled or lacks credentials
    #[error("provider '{0}' is disabled")]
    Disabled(String),

    /// Missing or rejected API key
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed request rejected by the provider
    #[error("invalid request: {0}")]
    Validation(String),

    /// Provider-side rate limiting
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// Request deadline fired before a response arrived
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Host unreachable, connection refused, DNS failure
    #[error("network error: {0}")]
    Network(String),

    /// Upstream 5xx / service unavailable
    #[error("upstream server error: {0}")]
    Upstream(String),

    /// Registry could not be written to disk
    #[error("failed to persist registry: {0}")]
    Persistence(String),

    /// Anything we could not classify more precisely
    #[error("api error: {0}")]
    Api(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Map a non-success HTTP status plus response body to the taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> Error {
    let detail = format!("status {}: {}", status.as_u16(), snippet(body));
    match status.as_u16() {
        401 => Error::Authentication(detail),
        429 => Error::RateLimit(detail),
        400 => Error::Validation(detail),
        s if s >= 500 => Error::Upstream(detail),
        _ => classify_message(&detail),
    }
}

/// Map a transport-level failure to the taxonomy. `timeout_ms` is the
/// configured deadline, reported when the client itself timed the request out.
pub(crate) fn classify_transport(err: &reqwest::Error, timeout_ms: u64) -> Error {
    if err.is_timeout() {
        return Error::Timeout(timeout_ms);
    }
    if err.is_connect() {
        return Error::Network(err.to_string());
    }
    classify_message(&err.to_string())
}

/// Best-effort substring classification of an error message. This mirrors
/// what providers actually put in their error bodies today; if a provider
/// rephrases, the fallback is the generic [`Error::Api`].
pub(crate) fn classify_message(msg: &str) -> Error {
    let lower = msg.to_lowercase();
    if lower.contains("unauthorized") || lower.contains("invalid api key") || lower.contains("401")
    {
        Error::Authentication(msg.to_string())
    } else if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429")
    {
        Error::RateLimit(msg.to_string())
    } else if lower.contains("bad request") || lower.contains("400") {
        Error::Validation(msg.to_string())
    } else if lower.contains("internal server")
        || lower.contains("service unavailable")
        || lower.contains("bad gateway")
        || lower.contains("overloaded")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        Error::Upstream(msg.to_string())
    } else if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("dns error")
        || lower.contains("host not found")
        || lower.contains("unreachable")
    {
        Error::Network(msg.to_string())
    } else {
        Error::Api(msg.to_string())
    }
}

fn snippet(body: &str) -> &str {
    let trimmed = body.trim();
    let end = trimmed
        .char_indices()
        .nth(200)
        .map_or(trimmed.len(), |(i, _)| i);
    &trimmed[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_auth() {
        let err = classify_status(StatusCode::UNAUTHORIZED, "invalid key");
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_classify_status_rate_limit() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, Error::RateLimit(_)));
    }

    #[test]
    fn test_classify_status_validation() {
        let err = classify_status(StatusCode::BAD_REQUEST, "missing field");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_classify_status_upstream() {
        for code in [500u16, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status(status, "boom");
            assert!(matches!(err, Error::Upstream(_)), "status {code}");
        }
    }

    #[test]
    fn test_classify_message_network() {
        let err = classify_message("tcp connect error: connection refused");
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn test_classify_message_fallback() {
        let err = classify_message("something strange happened");
        assert!(matches!(err, Error::Api(_)));
    }

    #[test]
    fn test_classify_message_overloaded_is_upstream() {
        let err = classify_message("API temporarily overloaded");
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let body = "é".repeat(300);
        let s = snippet(&body);
        assert!(s.chars().count() <= 200);
    }
}
