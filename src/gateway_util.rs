use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Json, Request};
use axum::routing::{get, post};
use axum::Router;
use reqwest::Client;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use crate::config_parser::Config;
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::QuotaStore;

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: Client,
    pub quota_store: Arc<QuotaStore>,
    pub api_key: Option<SecretString>,
    pub start_time: Instant,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub fn new(config: Arc<Config>, api_key: Option<SecretString>) -> Self {
        if api_key.is_none() {
            tracing::warn!(
                "Upstream API key is not set; chat requests will fail with a configuration error"
            );
        }
        let quota_store = Arc::new(QuotaStore::new(config.limits.clone()));
        Self {
            config,
            http_client: Client::new(),
            quota_store,
            api_key,
            start_time: Instant::now(),
        }
    }
}

/// Build the API router over the given state
pub fn build_router(app_state: AppStateData) -> Router {
    Router::new()
        .route("/", get(endpoints::status::status_handler))
        .route("/api/limits", get(endpoints::limits::limits_handler))
        .route("/api/chat", post(endpoints::chat::chat_handler))
        .fallback(endpoints::fallback::handle_404)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        // Failed requests are logged at DEBUG, since the error type has its
        // own logging
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state)
}

/// Custom Axum extractor that validates the JSON body and deserializes it
/// into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type`
/// header is `application/json`, and instead simply assume that the request
/// body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // Retrieve the request body as Bytes before deserializing it
        let bytes = bytes::Bytes::from_request(req, state)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?;

        // Convert the entire body into `serde_json::Value`
        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        // Now use `serde_path_to_error::deserialize` to attempt
        // deserialization into `T`, so error messages name the offending
        // field
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
