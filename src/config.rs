use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::is_local_endpoint_url;

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
    pub anthropic_version: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Zero disables heartbeats.
    pub heartbeat_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.to_string(),
            max_tokens: 2048,
            temperature: 0.2,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            heartbeat_secs: 15,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let api_url = std::env::var("ANTHROPIC_API_URL").unwrap_or(defaults.api_url);
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok().and_then(|v| {
            if v.trim().is_empty() {
                None
            } else {
                Some(v)
            }
        });
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or(defaults.model);
        let anthropic_version =
            std::env::var("ANTHROPIC_VERSION").unwrap_or(defaults.anthropic_version);

        Ok(Self {
            api_key,
            model,
            api_url,
            anthropic_version,
            max_tokens: env_number("ASKSTREAM_MAX_TOKENS", defaults.max_tokens)?,
            temperature: env_number("ASKSTREAM_TEMPERATURE", defaults.temperature)?,
            connect_timeout_secs: env_number(
                "ASKSTREAM_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            )?,
            read_timeout_secs: env_number(
                "ASKSTREAM_READ_TIMEOUT_SECS",
                defaults.read_timeout_secs,
            )?,
            heartbeat_secs: env_number("ASKSTREAM_HEARTBEAT_SECS", defaults.heartbeat_secs)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!(
                "Invalid ANTHROPIC_API_URL '{}': expected http:// or https:// URL",
                self.api_url
            );
        }

        if !self.is_local_endpoint() && self.api_key.is_none() {
            bail!(
                "ANTHROPIC_API_KEY must be set for non-local endpoints (url: '{}')",
                self.api_url
            );
        }

        if self.model.trim().is_empty() {
            bail!("ANTHROPIC_MODEL must not be empty");
        }

        if !(1..=32_000).contains(&self.max_tokens) {
            bail!(
                "ASKSTREAM_MAX_TOKENS must be between 1 and 32000 (got {})",
                self.max_tokens
            );
        }

        if !(0.0..=1.0).contains(&self.temperature) {
            bail!(
                "ASKSTREAM_TEMPERATURE must be between 0.0 and 1.0 (got {})",
                self.temperature
            );
        }

        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            bail!("upstream timeouts must be greater than zero");
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }
}

fn env_number<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        _ => Ok(default),
    }
}
