use std::time::Duration;

use quota_queue::HeaderError;

/// Errors delivered to callers of the admission stack.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    /// The request was refused without being served.
    ///
    /// Raised when the endpoint's queue is full, or when the controller drains its queues.
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests` with a
    /// `Retry-After` header whenever a hint is available.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// How long the caller should wait before retrying, if known.
        retry_after: Option<Duration>,
    },

    /// No credential became available before the request deadline.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out waiting for quota")]
    Timeout,

    /// The admission controller is shutting down or has stopped.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Admission controller is not running")]
    Closed,

    /// The upstream call failed after a credential was granted.
    ///
    /// The string contains the `Display` representation of the upstream error.
    /// When the `axum` feature is enabled, this converts to `502 Bad Gateway`.
    #[error("Upstream request failed: {0}")]
    Upstream(String),
}

/// A configuration value outside of its allowed range. Raised only at startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("At least one credential is required")]
    NoCredentials,

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("Priority fraction must be within 0..=1, got {0}")]
    PriorityFraction(f64),
}

/// Why an inbound request could not be mapped onto a known endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Invalid path syntax {0}")]
    Syntax(String),

    #[error("Unknown platform '{0}'")]
    UnknownPlatform(String),

    #[error("No endpoint of '{platform}' matches '{method}'")]
    NoMatch { platform: String, method: String },

    #[error("Unable to parse endpoint catalog")]
    Catalog(#[from] serde_json::Error),
}

/// An upstream response whose quota headers could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("Unable to parse Retry-After value '{0}'")]
    RetryAfter(String),

    #[error("Header value contains invalid chars")]
    HeaderValue,
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AdmitError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, header) = match &self {
            Self::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                retry_after.map(|after| {
                    (
                        axum::http::header::RETRY_AFTER,
                        axum::http::HeaderValue::from(after.as_secs().max(1)),
                    )
                }),
            ),
            Self::Timeout => (StatusCode::REQUEST_TIMEOUT, None),
            Self::Closed => (StatusCode::SERVICE_UNAVAILABLE, None),
            Self::Upstream(_) => (StatusCode::BAD_GATEWAY, None),
        };

        let mut response = (status, self.to_string()).into_response();
        if let Some((name, value)) = header {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
