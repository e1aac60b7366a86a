use thiserror::Error;

/// Application-wide error types for Harrow.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// Non-2xx response or an unusable HTTP exchange. Not retried.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Connection refused/reset or another transport failure.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The proxy itself refused or botched the tunnel/handshake.
    #[error("Proxy error: {0}")]
    ProxyError(String),

    /// A 200 response that turned out to be an anti-bot interstitial.
    #[error("Challenge page served for {url}")]
    ChallengeDetected { url: String },

    /// Direct (proxy-less) attempts are suspended by the circuit breaker.
    #[error("Direct connection suspended, retry after {retry_after_secs} seconds")]
    DirectLaneOpen { retry_after_secs: u64 },

    /// No proxy is currently eligible for selection.
    #[error("No eligible proxy available")]
    NoProxyAvailable,

    /// Probe through a proxy failed on transport or content check.
    #[error("Proxy verification failed: {0}")]
    ProxyVerificationFailed(String),

    /// The document did not have the expected shape.
    #[error("Extraction failed: {0}")]
    FatalExtraction(String),

    /// Transient failures kept happening until the retry policy gave up.
    #[error("Retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },

    /// The task queue was shut down while waiting for space.
    #[error("Task queue closed")]
    QueueClosed,

    /// Shutdown was requested while the operation was waiting.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::SerializationError(e.to_string())
    }
}

impl AppError {
    /// Returns true if the same URL is worth retrying through another route.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::ProxyError(_)
                | AppError::ChallengeDetected { .. }
                | AppError::DirectLaneOpen { .. }
        )
    }

    /// Returns true if the failure should be blamed on the proxy that carried
    /// the request, i.e. the proxy must be frozen before retrying.
    pub fn should_freeze_proxy(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::ProxyError(_)
                | AppError::ChallengeDetected { .. }
        )
    }

    /// Returns true if this error should trip the direct-lane circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        self.should_freeze_proxy()
    }

    /// Returns true if the failure is specific to one document and the
    /// surrounding work should simply move on.
    pub fn is_skippable(&self) -> bool {
        matches!(self, AppError::HttpError(_) | AppError::FatalExtraction(_))
    }

    /// Challenges lengthen the direct-lane recovery window.
    pub fn is_challenge(&self) -> bool {
        matches!(self, AppError::ChallengeDetected { .. })
    }
}
