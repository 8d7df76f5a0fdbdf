use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub upstream: UpstreamConfig,
    pub limits: LimitsConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    pub service_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            bind_address: None,
            service_name: "chat-relay".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct UpstreamConfig {
    /// Base URL of the OpenAI-compatible completion API
    pub api_base: String,
    pub model: String,
    /// Sent as the `HTTP-Referer` header when present
    pub referer: Option<String>,
    /// Sent as the `X-Title` header when present
    pub title: Option<String>,
    /// Hard deadline for a single upstream call
    pub timeout_secs: u64,
    pub default_system_prompt: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            api_base: "https://openrouter.ai/api/v1/".to_string(),
            model: "nousresearch/hermes-3-llama-3.1-405b:free".to_string(),
            referer: None,
            title: None,
            timeout_secs: 30,
            default_system_prompt: "You are a helpful assistant.".to_string(),
        }
    }
}

/// Per-user admission caps and bookkeeping windows.
///
/// The caps are sliding windows ending "now"; `retention_hours` bounds how
/// long admitted-request timestamps are kept, and must cover the largest
/// window (a day) with some slack.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LimitsConfig {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub max_per_day: u32,
    pub cooldown_secs: u64,
    pub max_message_length: usize,
    pub max_history_messages: usize,
    pub retention_hours: u64,
    pub idle_eviction_hours: u64,
    pub reaper_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_per_minute: 3,
            max_per_hour: 15,
            max_per_day: 50,
            cooldown_secs: 10,
            max_message_length: 4000,
            max_history_messages: 20,
            retention_hours: 25,
            idle_eviction_hours: 24,
            reaper_interval_secs: 3600,
        }
    }
}

impl Config {
    /// Load and validate a config file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file `{}`:\n{e}", path.display()),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.limits.retention_hours < 24 {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "Invalid Config: `limits.retention_hours` must be at least 24 to cover the daily window (got {})",
                    self.limits.retention_hours
                ),
            }));
        }
        if self.limits.max_history_messages == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "Invalid Config: `limits.max_history_messages` must not be zero"
                    .to_string(),
            }));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "Invalid Config: `upstream.timeout_secs` must not be zero".to_string(),
            }));
        }
        Ok(())
    }
}
