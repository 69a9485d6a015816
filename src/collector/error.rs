//! Fetch outcome classification.
//!
//! Kept free of `anyhow` deliberately: this is pure, unit-testable logic
//! that the loop owner calls on every failed fetch, so it stays cheap and
//! has no I/O or allocation beyond the regex fallback path.

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

use super::venue::FetchError;

lazy_static! {
    static ref STATUS_TOKEN_RE: Regex = Regex::new(r"\[(\d{3})\]").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    ClientError,
    ServerError,
    Timeout,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::ClientError => write!(f, "client_error"),
            Self::ServerError => write!(f, "server_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Best-effort status extraction: prefer the structured field on the
/// error, falling back to a bracketed `[NNN]` token in its message.
pub fn extract_status_code(err: &FetchError) -> Option<u16> {
    if let Some(code) = err.status_code {
        return Some(code);
    }
    STATUS_TOKEN_RE
        .captures(&err.message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn is_timeout(err: &FetchError) -> bool {
    let msg = err.message.to_lowercase();
    msg.contains("timed out") || msg.contains("timeout")
}

pub fn classify_failure(err: &FetchError) -> FailureKind {
    match extract_status_code(err) {
        Some(429) => return FailureKind::RateLimited,
        Some(code) if (400..500).contains(&code) => return FailureKind::ClientError,
        Some(code) if (500..600).contains(&code) => return FailureKind::ServerError,
        _ => {}
    }
    if is_timeout(err) {
        return FailureKind::Timeout;
    }
    FailureKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(message: &str, status_code: Option<u16>) -> FetchError {
        FetchError {
            message: message.to_string(),
            status_code,
            source: None,
        }
    }

    #[test]
    fn structured_status_wins_over_message() {
        let e = err("boom [500]", Some(429));
        assert_eq!(extract_status_code(&e), Some(429));
        assert_eq!(classify_failure(&e), FailureKind::RateLimited);
    }

    #[test]
    fn bracketed_token_fallback() {
        let e = err("RuntimeError: request failed [503]", None);
        assert_eq!(extract_status_code(&e), Some(503));
        assert_eq!(classify_failure(&e), FailureKind::ServerError);
    }

    #[test]
    fn client_error_bucket() {
        let e = err("not found [404]", None);
        assert_eq!(classify_failure(&e), FailureKind::ClientError);
    }

    #[test]
    fn timeout_without_status() {
        let e = err("request timed out after 5s", None);
        assert_eq!(classify_failure(&e), FailureKind::Timeout);
    }

    #[test]
    fn unclassifiable_is_other() {
        let e = err("connection reset by peer", None);
        assert_eq!(classify_failure(&e), FailureKind::Other);
    }
}
