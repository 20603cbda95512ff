//! Error classification for capture and model failures.
//!
//! The panel shows a short label for the failure kind next to the raw message,
//! so operators can tell a quota problem from a bad API key at a glance.
use serde::Serialize;

/// Known failure kinds, serialized in snake_case for the panel frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimit,
    Server,
    Network,
    Auth,
    Validation,
    Unknown,
}

impl FailureKind {
    /// Short user-facing label.
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::RateLimit => "The model API is rate limiting requests",
            FailureKind::Server => "The model API reported a server error",
            FailureKind::Network => "Could not reach the model API",
            FailureKind::Auth => "The model API rejected the API key",
            FailureKind::Validation => "The model API rejected the request",
            FailureKind::Unknown => "Analysis failed",
        }
    }
}

/// Classify an error message into a known failure kind.
pub fn classify_error(message: &str) -> FailureKind {
    // Bare status codes need word boundaries so "5000ms" or "15001" don't match
    lazy_static::lazy_static! {
        static ref HTTP_429: regex::Regex =
            regex::Regex::new(r"\b429\b").expect("static 429 pattern");
        static ref HTTP_5XX: regex::Regex =
            regex::Regex::new(r"\b50[0234]\b").expect("static 5xx pattern");
        static ref HTTP_AUTH: regex::Regex =
            regex::Regex::new(r"\b40[13]\b").expect("static 401/403 pattern");
        static ref HTTP_400: regex::Regex =
            regex::Regex::new(r"\b400\b").expect("static 400 pattern");
    }

    let lower = message.to_lowercase();

    // Rate limit patterns
    if lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("quota exceeded")
        || lower.contains("resource_exhausted")
        || HTTP_429.is_match(&lower)
    {
        return FailureKind::RateLimit;
    }

    if lower.contains("internal server error")
        || lower.contains("service unavailable")
        || lower.contains("overloaded")
    {
        return FailureKind::Server;
    }
    if HTTP_5XX.is_match(&lower) {
        return FailureKind::Server;
    }

    if lower.contains("network error")
        || lower.contains("connection refused")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("dns error")
    {
        return FailureKind::Network;
    }

    if lower.contains("unauthorized")
        || lower.contains("permission_denied")
        || lower.contains("invalid api key")
        || lower.contains("api key not valid")
        || HTTP_AUTH.is_match(&lower)
    {
        return FailureKind::Auth;
    }

    if lower.contains("invalid request")
        || lower.contains("invalid_argument")
        || lower.contains("validation error")
        || HTTP_400.is_match(&lower)
    {
        return FailureKind::Validation;
    }

    FailureKind::Unknown
}
