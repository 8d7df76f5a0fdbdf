//! Upstream gateway for an OpenAI-compatible chat-completions API
//! (OpenRouter wire format). A single call under a hard deadline; the
//! outcome is classified into the gateway error taxonomy and raw upstream
//! bodies stay in the logs.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config_parser::Config;
use crate::endpoints::chat::ChatMessage;
use crate::error::{Error, ErrorDetails};

/// Fixed backoff hint surfaced to clients when the upstream itself throttles
/// us (distinct from the caller's own quota denial)
const THROTTLED_RETRY_AFTER_SECS: u64 = 120;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub(super) enum OpenRouterRequestMessage<'a> {
    System { content: &'a str },
    User { content: &'a str },
    Assistant { content: &'a str },
}

#[derive(Debug, Serialize)]
struct OpenRouterRequest<'a> {
    model: &'a str,
    messages: Vec<OpenRouterRequestMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponseChoice {
    message: OpenRouterResponseMessage,
}

// Only `choices[0].message.content` is consumed; everything else the
// upstream sends is ignored.
#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterResponseChoice>,
}

/// Issue one chat-completion call for an already-admitted request.
///
/// The history is truncated to the configured last-N messages and each
/// content is hard-capped in length before transmission. The entire call,
/// including reading the response body, runs under the configured deadline.
pub async fn infer(
    system_prompt: &str,
    messages: &[ChatMessage],
    config: &Config,
    api_key: &SecretString,
    http_client: &reqwest::Client,
) -> Result<String, Error> {
    let request_body = OpenRouterRequest {
        model: &config.upstream.model,
        messages: prepare_messages(system_prompt, messages, config),
    };
    let request_url = get_chat_url(&config.upstream.api_base)?;
    let timeout = Duration::from_secs(config.upstream.timeout_secs);

    let mut request = http_client
        .post(request_url)
        .header("Content-Type", "application/json")
        .bearer_auth(api_key.expose_secret())
        .json(&request_body);
    if let Some(referer) = &config.upstream.referer {
        request = request.header("HTTP-Referer", referer);
    }
    if let Some(title) = &config.upstream.title {
        request = request.header("X-Title", title);
    }

    let call = async {
        let res = request.send().await.map_err(|e| {
            Error::new(ErrorDetails::UpstreamClient {
                message: format!("Error sending request to OpenRouter: {e}"),
            })
        })?;
        let status = res.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!("OpenRouter rate limited the gateway");
            return Err(Error::new_without_logging(ErrorDetails::UpstreamThrottled {
                retry_after: THROTTLED_RETRY_AFTER_SECS,
            }));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::error!("OpenRouter error: status={status}, body={body}");
            return Err(Error::new_without_logging(ErrorDetails::UpstreamServer {
                status_code: status,
            }));
        }
        let response_body = res.json::<OpenRouterResponse>().await.map_err(|e| {
            tracing::error!("Error parsing OpenRouter response: {e}");
            Error::new_without_logging(ErrorDetails::UpstreamServer {
                status_code: status,
            })
        })?;
        response_body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| Error::new(ErrorDetails::EmptyCompletion))
    };

    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(Error::new(ErrorDetails::UpstreamTimeout { timeout })))
}

pub(super) fn get_chat_url(base_url: &str) -> Result<Url, Error> {
    let base_url = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    Url::parse(&base_url)
        .and_then(|url| url.join("chat/completions"))
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid upstream base URL `{base_url}`: {e}"),
            })
        })
}

/// System prompt first, then the last `max_history_messages` inbound
/// messages with their contents hard-truncated. Inbound roles other than
/// `"user"` forward as `"assistant"`.
fn prepare_messages<'a>(
    system_prompt: &'a str,
    messages: &'a [ChatMessage],
    config: &Config,
) -> Vec<OpenRouterRequestMessage<'a>> {
    let skip = messages
        .len()
        .saturating_sub(config.limits.max_history_messages);
    let mut prepared = Vec::with_capacity(messages.len() - skip + 1);
    prepared.push(OpenRouterRequestMessage::System {
        content: system_prompt,
    });
    for message in &messages[skip..] {
        let content = truncate_chars(&message.content, config.limits.max_message_length);
        prepared.push(if message.role == "user" {
            OpenRouterRequestMessage::User { content }
        } else {
            OpenRouterRequestMessage::Assistant { content }
        });
    }
    prepared
}

/// Truncate to at most `max_chars` characters without splitting a char
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
