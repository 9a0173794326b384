use thiserror::Error;

/// Application-wide error types for Marquee.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// The caller sent something we cannot act on (empty query, bad page).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// HTTP request failed with no more specific classification.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// An external metadata provider answered with an error status.
    #[error("Provider '{provider}' error (HTTP {status_code}): {message}")]
    ProviderError {
        provider: String,
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Explicitly marked as transient by the caller, regardless of message text.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Rejected by the retry queue because the underlying error is permanent.
    #[error("Not retryable: {0}")]
    NonRetryable(String),

    /// A circuit breaker refused the call without contacting the service.
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::SerializationError(e.to_string())
    }
}

/// Coarse failure taxonomy used by the orchestrator, retry queue and health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, timeout or rate-limit trouble; worth retrying later.
    Transient,
    /// Malformed input or missing entity; retrying cannot help.
    Permanent,
    /// A breaker fast-failed the call.
    CircuitOpenSkip,
    /// A deferred task ran out of attempts.
    RetryExhausted,
}

/// Fragments that identify a transient failure in free-form error text.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline exceeded",
    "rate limit",
    "too many requests",
    "429",
    "500",
    "502",
    "503",
    "504",
    "connection refused",
    "connection reset",
    "connection closed",
    "connection failed",
    "broken pipe",
    "temporarily unavailable",
    "service unavailable",
    "bad gateway",
];

/// Returns true if `message` looks like a transient failure.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::Transient(_) => true,
            AppError::ProviderError {
                retryable,
                status_code,
                ..
            } => *retryable || *status_code == 429 || *status_code >= 500,
            AppError::HttpError(msg) | AppError::Generic(msg) | AppError::DatabaseError(msg) => {
                is_transient_message(msg)
            }
            _ => false,
        }
    }

    /// Returns true if this error should count against a circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::CircuitOpen(_) | AppError::Cancelled => false,
            _ => self.is_retryable(),
        }
    }

    /// Returns true if this failure is a rate-limit signal.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded
                | AppError::ProviderError {
                    status_code: 429,
                    ..
                }
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::CircuitOpen(_) => ErrorClass::CircuitOpenSkip,
            e if e.is_retryable() => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(AppError::Transient("anything at all".into()).is_retryable());
        assert!(
            AppError::ProviderError {
                provider: "tmdb".into(),
                message: "server error".into(),
                status_code: 503,
                retryable: false,
            }
            .is_retryable()
        );
        assert!(!AppError::InvalidRequest("empty query".into()).is_retryable());
        assert!(!AppError::NotFound("movie 42".into()).is_retryable());
    }

    #[test]
    fn test_transient_text_matching() {
        assert!(AppError::HttpError("HTTP 502 Bad Gateway".into()).is_retryable());
        assert!(AppError::Generic("upstream timed out".into()).is_retryable());
        assert!(AppError::Generic("Connection refused (os error 111)".into()).is_retryable());
        assert!(!AppError::HttpError("HTTP 404 for /search".into()).is_retryable());
        assert!(!AppError::Generic("malformed payload".into()).is_retryable());
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::RateLimitExceeded.should_trip_circuit());
        assert!(AppError::Timeout(30).should_trip_circuit());
        assert!(!AppError::NotFound("x".into()).should_trip_circuit());
        assert!(!AppError::CircuitOpen("tmdb".into()).should_trip_circuit());
        assert!(!AppError::Cancelled.should_trip_circuit());
    }

    #[test]
    fn test_error_class() {
        assert_eq!(AppError::Timeout(5).class(), ErrorClass::Transient);
        assert_eq!(
            AppError::InvalidRequest("bad".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            AppError::CircuitOpen("douban".into()).class(),
            ErrorClass::CircuitOpenSkip
        );
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(AppError::RateLimitExceeded.is_rate_limit());
        assert!(
            AppError::ProviderError {
                provider: "tmdb".into(),
                message: "slow down".into(),
                status_code: 429,
                retryable: true,
            }
            .is_rate_limit()
        );
        assert!(!AppError::Timeout(1).is_rate_limit());
    }
}
