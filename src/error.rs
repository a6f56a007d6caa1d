// src/error.rs

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Retry przyjmowany, gdy platforma zgłosiła limit, ale nie podała liczby sekund.
pub const DEFAULT_FLOOD_WAIT: Duration = Duration::from_secs(30);
/// Górna granica retry z komunikatu platformy (doba).
pub const MAX_FLOOD_WAIT: Duration = Duration::from_secs(86_400);

static RE_FLOOD_WAIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)flood[_ ]?wait[_ ]?(?:of\s+)?(\d+)").unwrap());
static RE_RETRY_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)retry[_ -]?after["':=\s]*(\d+(?:\.\d+)?)"#).unwrap());
static RE_RATE_LIMITED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\b429\b|too many requests|rate[ -]?limited|being rate limited)").unwrap()
});

/// Błędy wywołań do platformy komunikacyjnej.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("flood wait: retry after {}s", retry_after.as_secs())]
    FloodWait { retry_after: Duration },
    #[error("platform call timed out after {0:?}")]
    Timeout(Duration),
    #[error("platform api error: {0}")]
    Api(String),
}

impl PlatformError {
    /// Rozpoznaje odpowiedź "rate limit" po treści błędu; resztę zostawia jako `Api`.
    pub fn classify(message: &str) -> Self {
        match flood_wait_from_message(message) {
            Some(retry_after) => PlatformError::FloodWait { retry_after },
            None => PlatformError::Api(message.to_string()),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::FloodWait { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_flood_wait(&self) -> bool {
        matches!(self, PlatformError::FloodWait { .. })
    }
}

pub fn flood_wait_from_message(message: &str) -> Option<Duration> {
    if let Some(c) = RE_FLOOD_WAIT.captures(message) {
        // same cyfry: parse zawodzi tylko przy przepełnieniu
        let secs = c[1].parse::<u64>().unwrap_or(u64::MAX);
        return Some(Duration::from_secs(secs.min(MAX_FLOOD_WAIT.as_secs())));
    }
    if let Some(c) = RE_RETRY_AFTER.captures(message) {
        if let Ok(secs) = c[1].parse::<f64>() {
            let secs = secs.max(0.0).ceil().min(MAX_FLOOD_WAIT.as_secs_f64());
            return Some(Duration::from_secs_f64(secs));
        }
    }
    if RE_RATE_LIMITED.is_match(message) {
        return Some(DEFAULT_FLOOD_WAIT);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_flood_wait_variants() {
        assert_eq!(
            flood_wait_from_message("FLOOD_WAIT_42"),
            Some(Duration::from_secs(42))
        );
        assert_eq!(
            flood_wait_from_message("Too Many Requests: retry after 17"),
            Some(Duration::from_secs(17))
        );
        assert_eq!(
            flood_wait_from_message(r#"{"message":"You are being rate limited.","retry_after":1.2}"#),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            flood_wait_from_message("HTTP 429"),
            Some(DEFAULT_FLOOD_WAIT)
        );
    }

    #[test]
    fn oversized_retry_values_are_capped_at_a_day() {
        assert_eq!(
            flood_wait_from_message("FLOOD_WAIT_18446744073709551615"),
            Some(MAX_FLOOD_WAIT)
        );
        assert_eq!(
            flood_wait_from_message("FLOOD_WAIT_99999999999999999999999999"),
            Some(MAX_FLOOD_WAIT)
        );
        let huge = format!(r#"{{"retry_after":{}.5}}"#, "9".repeat(400));
        assert_eq!(flood_wait_from_message(&huge), Some(MAX_FLOOD_WAIT));
    }

    #[test]
    fn other_errors_stay_api_errors() {
        let e = PlatformError::classify("Unknown Member");
        assert_eq!(e, PlatformError::Api("Unknown Member".into()));
        assert!(e.retry_after().is_none());
        assert!(PlatformError::classify("FLOOD_WAIT_3").is_flood_wait());
    }
}
