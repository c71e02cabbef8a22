//! Bridge configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Overrides [`BridgeConfig::action_timeout_ms`]. `0` or `off` disables it.
pub const ACTION_TIMEOUT_ENV: &str = "FERRY_ACTION_TIMEOUT_MS";

/// Overrides [`BridgeConfig::spawn_timeout_ms`].
pub const SPAWN_TIMEOUT_ENV: &str = "FERRY_SPAWN_TIMEOUT_MS";

/// Configuration for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Deadline for a single action. `None` lets actions run indefinitely.
    pub action_timeout_ms: Option<u64>,

    /// How long a new context may take to report ready.
    pub spawn_timeout_ms: u64,

    /// Context threads are named `<prefix>-<context id>`.
    pub thread_name_prefix: String,

    /// Arguments handed to the main context.
    pub main_argv: Vec<String>,

    /// Initial payload handed to the main context.
    pub main_payload: Value,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: None,
            spawn_timeout_ms: 10_000,
            thread_name_prefix: "ferry".to_string(),
            main_argv: Vec::new(),
            main_payload: Value::Null,
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Apply `FERRY_*` environment variables on top of this configuration.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ACTION_TIMEOUT_ENV) {
            self.action_timeout_ms = match raw.trim() {
                "" | "0" | "off" => None,
                value => Some(parse_millis(ACTION_TIMEOUT_ENV, value)?),
            };
        }
        if let Some(raw) = lookup(SPAWN_TIMEOUT_ENV) {
            self.spawn_timeout_ms = parse_millis(SPAWN_TIMEOUT_ENV, raw.trim())?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.spawn_timeout_ms == 0 {
            return Err(Error::Config("spawn_timeout_ms must be positive".to_string()));
        }
        if self.action_timeout_ms == Some(0) {
            return Err(Error::Config(
                "action_timeout_ms must be positive; omit it to disable".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(Error::Config("thread_name_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_ms.map(Duration::from_millis)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        Error::Config(format!(
            "{} must be a number of milliseconds, got '{}'",
            key, value
        ))
    })
}
