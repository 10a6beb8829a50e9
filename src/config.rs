//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `RUNPILOT_BASE_URL`, `RUNPILOT_API_KEY`,
//!    `RUNPILOT_MODEL`
//! 2. **Config file**: path via `--config <path>`, or `runpilot.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [server]
//! base_url = "http://127.0.0.1:8000"
//! api_key = ""
//!
//! [transport]
//! connect_timeout_ms = 2000           # channel-vs-polling decision window
//! poll_interval_ms = 2000
//! channel_retry_interval_secs = 30    # silent channel upgrade while polling
//! heartbeat_interval_secs = 30
//! reconnect_initial_delay_ms = 1000
//! reconnect_max_delay_ms = 30000
//! reconnect_max_attempts = 5
//!
//! [timeouts]
//! request_timeout_secs = 30
//! replay_timeout_secs = 600           # undo/replay only
//!
//! [session]
//! headless = true
//! model = "default"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the session server lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP base URL; the channel URL is derived from it (`http` → `ws`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Optional bearer token. Sent as `?token=` on the channel upgrade.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Dual-mode transport timings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_channel_retry_interval_secs")]
    pub channel_retry_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Unexpected closes tolerated before settling into polling.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

/// REST timeouts. Replay is kept separate from ordinary requests.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_replay_timeout_secs")]
    pub replay_timeout_secs: u64,
}

/// Defaults applied to newly created sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDefaults {
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_model")]
    pub model: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_channel_retry_interval_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_reconnect_initial_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_reconnect_max_attempts() -> u32 {
    5
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_replay_timeout_secs() -> u64 {
    600
}
fn default_headless() -> bool {
    true
}
fn default_model() -> Option<String> {
    Some("default".to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            channel_retry_interval_secs: default_channel_retry_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            replay_timeout_secs: default_replay_timeout_secs(),
        }
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            model: default_model(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn channel_retry_interval(&self) -> Duration {
        Duration::from_secs(self.channel_retry_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Backoff before reconnect attempt `attempt` (1-based): the initial
    /// delay doubled per attempt, capped at the max delay.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .reconnect_initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl TimeoutConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_secs(self.replay_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `runpilot.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new("runpilot.toml").exists() {
            Self::from_file("runpilot.toml")?
        } else {
            Config::default()
        };

        if let Ok(url) = std::env::var("RUNPILOT_BASE_URL") {
            config.server.base_url = url;
        }
        if let Ok(key) = std::env::var("RUNPILOT_API_KEY") {
            config.server.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("RUNPILOT_MODEL") {
            config.session.model = Some(model);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.server.base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "server.base_url must be http(s), got '{url}'"
            )));
        }
        let t = &self.transport;
        if t.reconnect_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "transport.reconnect_max_attempts must be at least 1".into(),
            ));
        }
        if t.connect_timeout_ms == 0
            || t.poll_interval_ms == 0
            || t.channel_retry_interval_secs == 0
            || t.heartbeat_interval_secs == 0
            || t.reconnect_initial_delay_ms == 0
        {
            return Err(ConfigError::Invalid(
                "transport intervals must be non-zero".into(),
            ));
        }
        if self.timeouts.request_timeout_secs == 0 || self.timeouts.replay_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
