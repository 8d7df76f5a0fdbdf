use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// Gateway-wide error type.
///
/// As long as the struct member is private, we force people to use the `new`
/// method, which logs the error as a side effect. Errors whose diagnostic
/// detail was already logged at the call site (e.g. raw upstream bodies,
/// which must never reach the client) use `new_without_logging`.
#[derive(Debug, PartialEq)]
pub struct Error(Box<ErrorDetails>);

impl Error {
    #[must_use]
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    #[must_use]
    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    #[must_use]
    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    ApiKeyMissing,
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    EmptyCompletion,
    InvalidRequest {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    Observability {
        message: String,
    },
    QuotaExceeded {
        message: String,
        retry_after: Option<u64>,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    UpstreamClient {
        message: String,
    },
    UpstreamServer {
        status_code: StatusCode,
    },
    UpstreamThrottled {
        retry_after: u64,
    },
    UpstreamTimeout {
        timeout: Duration,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::ApiKeyMissing => tracing::Level::ERROR,
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::EmptyCompletion => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::QuotaExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::UpstreamClient { .. } => tracing::Level::ERROR,
            ErrorDetails::UpstreamServer { .. } => tracing::Level::ERROR,
            ErrorDetails::UpstreamThrottled { .. } => tracing::Level::WARN,
            ErrorDetails::UpstreamTimeout { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::ApiKeyMissing => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::EmptyCompletion => StatusCode::BAD_GATEWAY,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::UpstreamClient { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UpstreamServer { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::UpstreamThrottled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Client-facing retry hint, included in the response body when present.
    fn retry_after(&self) -> Option<Option<u64>> {
        match self {
            ErrorDetails::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            ErrorDetails::UpstreamThrottled { retry_after } => Some(Some(*retry_after)),
            _ => None,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::ApiKeyMissing => {
                write!(f, "Upstream API key is not configured")
            }
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing application state: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::EmptyCompletion => {
                write!(
                    f,
                    "The model returned an empty response. Try rephrasing your message."
                )
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::JsonRequest { message } => write!(f, "{message}"),
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::QuotaExceeded { message, .. } => write!(f, "{message}"),
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::UpstreamClient { message } => {
                write!(f, "Error sending request to upstream: {message}")
            }
            ErrorDetails::UpstreamServer { .. } => {
                write!(
                    f,
                    "The AI provider returned an unexpected response. Please try again later."
                )
            }
            ErrorDetails::UpstreamThrottled { .. } => {
                write!(
                    f,
                    "The service is temporarily overloaded. Please try again in a couple of minutes."
                )
            }
            ErrorDetails::UpstreamTimeout { .. } => {
                write!(f, "Timed out waiting for the model to respond. Please try again.")
            }
        }
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response.
    ///
    /// The body carries human text only; raw upstream payloads are logged at
    /// the gateway boundary and never serialized here.
    fn into_response(self) -> Response {
        let mut body = json!({"error": true, "message": self.to_string()});
        if let Some(retry_after) = self.0.retry_after() {
            body["retryAfter"] = json!(retry_after);
        }
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn response_json(error: Error) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 4096).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_quota_exceeded_response() {
        let (status, body) = response_json(Error::new_without_logging(
            ErrorDetails::QuotaExceeded {
                message: "Wait 8s between messages".to_string(),
                retry_after: Some(8),
            },
        ))
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], Value::Bool(true));
        assert_eq!(body["message"], "Wait 8s between messages");
        assert_eq!(body["retryAfter"], 8);
    }

    #[tokio::test]
    async fn test_blocked_denial_has_null_retry_hint() {
        let (status, body) = response_json(Error::new_without_logging(
            ErrorDetails::QuotaExceeded {
                message: "Account is temporarily blocked".to_string(),
                retry_after: None,
            },
        ))
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["retryAfter"], Value::Null);
    }

    #[tokio::test]
    async fn test_upstream_throttled_response() {
        let (status, body) = response_json(Error::new_without_logging(
            ErrorDetails::UpstreamThrottled { retry_after: 120 },
        ))
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retryAfter"], 120);
    }

    #[tokio::test]
    async fn test_upstream_server_body_is_generic() {
        let (status, body) = response_json(Error::new_without_logging(
            ErrorDetails::UpstreamServer {
                status_code: StatusCode::INTERNAL_SERVER_ERROR,
            },
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let message = body["message"].as_str().unwrap();
        assert!(!message.contains("500"));
        assert!(body.get("retryAfter").is_none());
    }

    #[tokio::test]
    async fn test_status_codes() {
        let cases = [
            (ErrorDetails::ApiKeyMissing, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorDetails::EmptyCompletion, StatusCode::BAD_GATEWAY),
            (
                ErrorDetails::InvalidRequest {
                    message: "bad".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ErrorDetails::UpstreamTimeout {
                    timeout: Duration::from_secs(30),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ErrorDetails::RouteNotFound {
                    path: "/nope".to_string(),
                    method: "GET".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
        ];
        for (details, expected) in cases {
            assert_eq!(Error::new_without_logging(details).status_code(), expected);
        }
    }
}
