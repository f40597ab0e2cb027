use shed_limit::Rejected;

/// Errors produced by the Tower Shed middleware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShedError {
    /// The adaptive limiter shed the request before it reached the inner service.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error("limit exceeded; request shed")]
    LimitExceeded,

    /// The circuit breaker dropped the call to protect a failing dependency.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("circuit breaker not allowed")]
    NotAllowed,

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("internal service error: {0}")]
    Inner(String),
}

impl From<Rejected> for ShedError {
    fn from(rejected: Rejected) -> Self {
        match rejected {
            Rejected::LimitExceeded => Self::LimitExceeded,
            Rejected::NotAllowed => Self::NotAllowed,
        }
    }
}

impl ShedError {
    /// Label used for the `reason` attribute on rejection metrics.
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            Self::LimitExceeded => "limit_exceeded",
            Self::NotAllowed => "not_allowed",
            Self::Inner(_) => "inner",
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ShedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::NotAllowed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
