// Server configuration.
//
// `ServerConfig` collects the endpoints handed to `register_proxy`, the
// limits advertised to clients in `RegisterClientResponse`, socket tuning,
// and the host frame rate used by the headless runner. It loads from JSON
// (every field optional, missing ones take the defaults below) and the
// binary applies command-line overrides on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the simulation-side endpoint.
    pub sim_host: String,
    pub sim_port: u16,
    /// Address clients connect to.
    pub client_host: String,
    pub client_port: u16,
    /// Host frame cadence for the headless runner, in frames per second.
    pub frame_rate_hz: u32,
    /// Maximum time a single response write may block before the connection
    /// is considered dead.
    pub write_timeout_ms: u64,
    /// Advertised in `RegisterClientResponse`.
    pub max_supported_cameras: u32,
    /// Advertised in `RegisterClientResponse`.
    pub max_capture_resolution: u32,
    /// Advertised in `RegisterClientResponse`; 0 means no inactivity timeout.
    pub inactivity_timeout_ms: u32,
    /// When false (the default, for compatibility with existing clients),
    /// `ReleaseAgentControl` answers success even to non-master clients.
    pub strict_release_control: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sim_host: "127.0.0.1".into(),
            sim_port: 9009,
            client_host: "127.0.0.1".into(),
            client_port: 9876,
            frame_rate_hz: 60,
            write_timeout_ms: 5000,
            max_supported_cameras: 8,
            max_capture_resolution: 2048,
            inactivity_timeout_ms: 0,
            strict_release_control: false,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    /// Duration of one host frame. A zero frame rate is treated as 1 Hz.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate_hz.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = ServerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn partial_json_overrides_fields() {
        let config =
            ServerConfig::from_json_str(r#"{"client_port": 7000, "strict_release_control": true}"#)
                .unwrap();
        assert_eq!(config.client_port, 7000);
        assert!(config.strict_release_control);
        assert_eq!(config.sim_port, 9009);
    }

    #[test]
    fn bad_json_is_an_error() {
        let err = ServerConfig::from_json_str(r#"{"client_port": "nope"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn frame_duration_handles_zero_rate() {
        let config = ServerConfig {
            frame_rate_hz: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.frame_duration(), Duration::from_secs(1));

        let config = ServerConfig {
            frame_rate_hz: 50,
            ..ServerConfig::default()
        };
        assert_eq!(config.frame_duration(), Duration::from_millis(20));
    }

    #[test]
    fn zero_write_timeout_disables_it() {
        let config = ServerConfig {
            write_timeout_ms: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.write_timeout(), None);
    }
}
