//! Rate-limit classification.

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "resource exhausted",
];

/// True when the message looks like provider throttling.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Classify an error by its rendered form.
pub fn is_rate_limited<E: std::fmt::Display + ?Sized>(err: &E) -> bool {
    is_rate_limit_message(&err.to_string())
}
