//! Provider failure classification.
//!
//! Decides whether a failed provider call is worth retrying on the next tier
//! or must be returned to the caller as-is.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    ConnectionRefused,
    NetworkUnreachable,
    Transient,
    Unavailable,
    RateLimited,
    QuotaExhausted,
    Authentication,
    InvalidRequest,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::ConnectionRefused => "connection_refused",
            ErrorClass::NetworkUnreachable => "network_unreachable",
            ErrorClass::Transient => "transient",
            ErrorClass::Unavailable => "unavailable",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::QuotaExhausted => "quota_exhausted",
            ErrorClass::Authentication => "authentication",
            ErrorClass::InvalidRequest => "invalid_request",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Whether another provider tier may succeed where this one failed.
    ///
    /// Quota, credential and request-shape failures are fatal: the caller has
    /// to fix something, so they are returned immediately. Unknown failures
    /// are treated conservatively and also stop the walk.
    pub fn is_fallbackable(&self) -> bool {
        match self {
            ErrorClass::Timeout
            | ErrorClass::ConnectionRefused
            | ErrorClass::NetworkUnreachable
            | ErrorClass::Transient
            | ErrorClass::Unavailable
            | ErrorClass::RateLimited => true,
            ErrorClass::QuotaExhausted
            | ErrorClass::Authentication
            | ErrorClass::InvalidRequest
            | ErrorClass::Unknown => false,
        }
    }

    /// Map an upstream HTTP status to a class.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 404 | 413 | 422 => ErrorClass::InvalidRequest,
            401 | 403 => ErrorClass::Authentication,
            402 => ErrorClass::QuotaExhausted,
            408 | 504 => ErrorClass::Timeout,
            429 => ErrorClass::RateLimited,
            502 | 503 => ErrorClass::Unavailable,
            500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Unknown,
        }
    }

    /// Classify a free-form failure message from a provider SDK or transport.
    pub fn from_message(message: &str) -> Self {
        MESSAGE_PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(message))
            .map(|(_, class)| *class)
            .unwrap_or(ErrorClass::Unknown)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Order matters: quota and auth are checked before the generic 429 / 5xx rules.
static MESSAGE_PATTERNS: Lazy<Vec<(Regex, ErrorClass)>> = Lazy::new(|| {
    let rules: &[(&str, ErrorClass)] = &[
        (r"(?i)quota|insufficient[_ ]credit|billing|\b402\b", ErrorClass::QuotaExhausted),
        (
            r"(?i)unauthori[sz]ed|forbidden|invalid[_ ]api[_ ]key|authenticat|permission denied|\b40[13]\b",
            ErrorClass::Authentication,
        ),
        (
            r"(?i)invalid[_ ]request|bad request|malformed|context length|validation|\b4(00|22)\b",
            ErrorClass::InvalidRequest,
        ),
        (r"(?i)rate[_ -]?limit|too many requests|\b429\b", ErrorClass::RateLimited),
        (r"(?i)timed? ?out|deadline|\b(408|504)\b", ErrorClass::Timeout),
        (r"(?i)connection refused|econnrefused", ErrorClass::ConnectionRefused),
        (
            r"(?i)network is unreachable|no route to host|dns|name resolution|enetunreach",
            ErrorClass::NetworkUnreachable,
        ),
        (
            r"(?i)service unavailable|overloaded|\b50[23]\b",
            ErrorClass::Unavailable,
        ),
        (
            r"(?i)connection reset|broken pipe|temporar|try again|internal server error|\b5\d\d\b",
            ErrorClass::Transient,
        ),
    ];
    rules
        .iter()
        .filter_map(|(pattern, class)| Regex::new(pattern).ok().map(|re| (re, *class)))
        .collect()
});
