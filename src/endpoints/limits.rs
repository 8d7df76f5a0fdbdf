use axum::debug_handler;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use crate::gateway_util::{AppState, AppStateData};
use crate::identity::resolve_user_key;
use crate::rate_limiting::{now_ms, LimitDecision, Remaining};

/// A handler for the read-only quota preview. Runs the admission check
/// without recording anything, so calling it never changes a subsequent
/// admission outcome.
#[debug_handler(state = AppStateData)]
pub async fn limits_handler(
    State(AppStateData {
        config, quota_store, ..
    }): AppState,
    headers: HeaderMap,
) -> Json<LimitsResponse> {
    let user_key = resolve_user_key(&headers);
    let (allowed, remaining, message) = match quota_store.check(&user_key, now_ms()) {
        LimitDecision::Allowed { remaining } => (true, Some(remaining), None),
        LimitDecision::Denied { reason, .. } => (false, None, Some(reason)),
    };
    Json(LimitsResponse {
        user_id: user_key.preview(),
        allowed,
        remaining,
        message,
        config: LimitsEcho {
            per_day: config.limits.max_per_day,
            per_hour: config.limits.max_per_hour,
            per_minute: config.limits.max_per_minute,
            cooldown: config.limits.cooldown_secs,
        },
    })
}

#[derive(Debug, Serialize)]
pub struct LimitsResponse {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub allowed: bool,
    pub remaining: Option<Remaining>,
    pub message: Option<String>,
    pub config: LimitsEcho,
}

#[derive(Debug, Serialize)]
pub struct LimitsEcho {
    #[serde(rename = "perDay")]
    pub per_day: u32,
    #[serde(rename = "perHour")]
    pub per_hour: u32,
    #[serde(rename = "perMinute")]
    pub per_minute: u32,
    pub cooldown: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config_parser::Config;

    fn test_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_limits_handler_is_read_only() {
        let app_state = AppStateData::new(Arc::new(Config::default()), None);
        let headers = test_headers();
        for _ in 0..5 {
            let response =
                limits_handler(State(app_state.clone()), headers.clone()).await;
            assert!(response.allowed);
            let remaining = response.remaining.unwrap();
            // Full quota every time: nothing was recorded
            assert_eq!(remaining.minute, 3);
            assert_eq!(remaining.day, 50);
        }
    }

    #[tokio::test]
    async fn test_limits_handler_reports_denial() {
        let app_state = AppStateData::new(Arc::new(Config::default()), None);
        let headers = test_headers();
        let user_key = resolve_user_key(&headers);
        app_state.quota_store.try_admit(&user_key, now_ms()).unwrap();

        // Within the cooldown the check reports a denial with a reason
        let response = limits_handler(State(app_state), headers).await;
        assert!(!response.allowed);
        assert!(response.remaining.is_none());
        assert!(response.message.as_deref().unwrap().contains("between messages"));
    }

    #[tokio::test]
    async fn test_limits_handler_echoes_config() {
        let app_state = AppStateData::new(Arc::new(Config::default()), None);
        let response = limits_handler(State(app_state), HeaderMap::new()).await;
        assert_eq!(response.config.per_day, 50);
        assert_eq!(response.config.per_hour, 15);
        assert_eq!(response.config.per_minute, 3);
        assert_eq!(response.config.cooldown, 10);
        assert!(response.user_id.ends_with("..."));
    }
}
