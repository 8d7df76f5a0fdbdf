use axum::debug_handler;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::identity::resolve_user_key;
use crate::providers::openrouter;
use crate::rate_limiting::{now_ms, LimitDecision, Remaining};

/// The expected payload is a JSON object with the following fields:
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    // the conversation history, oldest first; the last entry is the message
    // being sent
    pub messages: Vec<ChatMessage>,
    // overrides the configured default system prompt
    #[serde(rename = "systemPrompt")]
    pub system_prompt: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub content: String,
    /// Refreshed remaining-quota snapshot, or null if the user is inside a
    /// denial window after this request was charged
    pub limits: Option<Remaining>,
}

/// A handler for the chat endpoint.
///
/// Order matters: validation runs before admission (malformed requests are
/// 400 regardless of quota state), and usage is charged before the upstream
/// call begins (failed upstream calls still consume quota).
#[debug_handler(state = AppStateData)]
pub async fn chat_handler(
    State(AppStateData {
        config,
        http_client,
        quota_store,
        api_key,
        ..
    }): AppState,
    headers: HeaderMap,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Json<ChatResponse>, Error> {
    let user_key = resolve_user_key(&headers);

    validate(&params, config.limits.max_message_length)?;
    quota_store.try_admit(&user_key, now_ms())?;

    let api_key = api_key.as_ref().ok_or_else(|| {
        Error::new(ErrorDetails::ApiKeyMissing)
    })?;

    let system_prompt = params
        .system_prompt
        .as_deref()
        .unwrap_or(&config.upstream.default_system_prompt);
    let content = openrouter::infer(
        system_prompt,
        &params.messages,
        &config,
        api_key,
        &http_client,
    )
    .await?;

    let limits = match quota_store.check(&user_key, now_ms()) {
        LimitDecision::Allowed { remaining } => Some(remaining),
        LimitDecision::Denied { .. } => None,
    };
    tracing::info!(
        user = %user_key.preview(),
        remaining_day = limits.map(|l| l.day),
        "Completed chat request"
    );

    Ok(Json(ChatResponse { content, limits }))
}

fn validate(params: &Params, max_message_length: usize) -> Result<(), Error> {
    let Some(last) = params.messages.last() else {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "Send at least one message".to_string(),
        }));
    };
    if last.content.chars().count() > max_message_length {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: format!(
                "Message is too long. At most {max_message_length} characters"
            ),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use axum::http::StatusCode;

    use crate::config_parser::Config;
    use crate::rate_limiting::now_ms;

    fn app_state() -> AppStateData {
        AppStateData::new(Arc::new(Config::default()), None)
    }

    fn params(messages: Vec<ChatMessage>) -> StructuredJson<Params> {
        StructuredJson(Params {
            messages,
            system_prompt: None,
        })
    }

    fn user_message(content: &str) -> ChatMessage {
        ChatMessage {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_messages_is_400_even_when_quota_denied() {
        let state = app_state();
        let headers = HeaderMap::new();
        let user_key = resolve_user_key(&headers);
        // Exhaust the cooldown so admission would deny
        state.quota_store.try_admit(&user_key, now_ms()).unwrap();

        let error = chat_handler(State(state), headers, params(vec![]))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_last_message_is_400() {
        let state = app_state();
        let long = "x".repeat(4001);
        let error = chat_handler(
            State(state),
            HeaderMap::new(),
            params(vec![user_message(&long)]),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quota_denial_is_429() {
        let state = app_state();
        let headers = HeaderMap::new();
        let user_key = resolve_user_key(&headers);
        state.quota_store.try_admit(&user_key, now_ms()).unwrap();

        let error = chat_handler(State(state), headers, params(vec![user_message("hi")]))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);
        // The cooldown denial reaches the handler with its retry hint intact
        match error.get_details() {
            ErrorDetails::QuotaExceeded { retry_after, .. } => {
                assert_eq!(*retry_after, Some(10));
            }
            other => panic!("unexpected error details: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_api_key_is_500_and_still_charges_quota() {
        let state = app_state();
        let headers = HeaderMap::new();
        let user_key = resolve_user_key(&headers);

        let error = chat_handler(
            State(state.clone()),
            headers,
            params(vec![user_message("hi")]),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        // The attempt was charged before the configuration check
        match state.quota_store.check(&user_key, now_ms() + 11_000) {
            LimitDecision::Allowed { remaining } => assert_eq!(remaining.day, 49),
            LimitDecision::Denied { reason, .. } => panic!("unexpected denial: {reason}"),
        }
    }
}
