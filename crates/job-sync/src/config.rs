/// Client configuration: endpoints, credential and reconnect policy
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::{Credentials, Result, SyncError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Delay growth between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    Fixed,
    Exponential { max_delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect attempts before giving up; 0 disables reconnecting
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_ms;
        let millis = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential { max_delay_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                base.saturating_mul(1u64 << shift).min(max_delay_ms)
            }
        };
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket endpoint of the event stream
    pub ws_url: String,

    /// Base URL of the REST API used for retry/cancel
    pub api_base_url: String,

    /// Bearer token sent on the handshake and on every command
    pub token: String,

    pub reconnect: ReconnectPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8080/events".to_string(),
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            token: String::new(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Defaults overridden by `JOB_SYNC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("JOB_SYNC_WS_URL") {
            config.ws_url = url;
        }
        if let Some(url) = lookup("JOB_SYNC_API_URL") {
            config.api_base_url = url;
        }
        if let Some(token) = lookup("JOB_SYNC_TOKEN") {
            config.token = token;
        }
        if let Some(attempts) = parse_var(&lookup, "JOB_SYNC_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = attempts;
        }
        if let Some(delay) = parse_var(&lookup, "JOB_SYNC_RETRY_DELAY_MS")? {
            config.reconnect.delay_ms = delay;
        }
        if let Some(backoff) = lookup("JOB_SYNC_BACKOFF") {
            config.reconnect.backoff = match backoff.to_ascii_lowercase().as_str() {
                "fixed" => Backoff::Fixed,
                "exponential" => Backoff::Exponential {
                    max_delay_ms: config.reconnect.delay_ms.saturating_mul(16),
                },
                other => {
                    return Err(SyncError::Config(format!(
                        "JOB_SYNC_BACKOFF must be fixed or exponential, got {other}"
                    )))
                }
            };
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ws_url.trim().is_empty() {
            return Err(SyncError::Config("ws_url is empty".to_string()));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(SyncError::Config("api_base_url is empty".to_string()));
        }
        if let Backoff::Exponential { max_delay_ms } = self.reconnect.backoff {
            if self.reconnect.delay_ms == 0 || max_delay_ms == 0 {
                return Err(SyncError::Config(
                    "exponential backoff needs a non-zero delay".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::bearer(self.token.clone())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SyncError::Config(format!("{name}: {e}"))),
        None => Ok(None),
    }
}
