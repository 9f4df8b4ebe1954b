use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CouncilError, Result};

/// Top-level Council client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub timer: TimerConfig,
}

/// Where the orchestration server lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint for the event stream.
    pub ws_url: String,
    /// Base URL for control/review/CRUD request-response calls.
    pub api_base: String,
}

/// Reconnection policy for the streaming connection.
///
/// The delay before attempt N is `base_delay_ms × N`, and after
/// `max_attempts` consecutive failures the connection gives up with a
/// terminal `failed` status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
        }
    }
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_delay() -> u64 { 1000 }

/// Keep-alive ping cadence while connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

fn default_heartbeat_interval() -> u64 { 30 }

/// Elapsed-time ticker cadence for the run graph projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
        }
    }
}

fn default_tick_interval() -> u64 { 100 }

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CouncilError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CouncilError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let config: AppConfig = toml::from_str(
            r#"
[server]
ws_url = "ws://localhost:8080/ws"
api_base = "http://localhost:8080"
"#,
        )
        .unwrap();

        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.timer.tick_interval_ms, 100);
    }

    #[test]
    fn test_missing_file_is_config_not_found() {
        let err = AppConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, CouncilError::ConfigNotFound(_)));
    }
}
