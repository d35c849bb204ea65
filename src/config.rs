use std::error::Error;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_RELAY_PORT: u16 = 4000;
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Relay tunables. Every field has a default, so a config file only needs
/// the keys it wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// TCP port for the relay listener.
    pub port: u16,
    /// HTTP liveness port, `0` turns the listener off.
    pub health_port: u16,
    pub ip_limit: usize,
    pub code_limit: usize,
    pub rate_window_secs: u64,
    pub failure_window_secs: u64,
    pub failure_threshold: usize,
    pub block_secs: u64,
    /// Half-open rooms older than this are evicted, and an unpaired
    /// connection waits at most this long for its peer.
    pub abandon_secs: u64,
    pub reconnect_window_secs: u64,
    pub sweep_interval_secs: u64,
    pub peek_timeout_ms: u64,
    pub peek_bytes: usize,
    /// `0` waits forever for the control line.
    pub handshake_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            port: DEFAULT_RELAY_PORT,
            health_port: DEFAULT_HEALTH_PORT,
            ip_limit: 5,
            code_limit: 5,
            rate_window_secs: 60,
            failure_window_secs: 5 * 60,
            failure_threshold: 3,
            block_secs: 10 * 60,
            abandon_secs: 10 * 60,
            reconnect_window_secs: 2 * 60,
            sweep_interval_secs: 60,
            peek_timeout_ms: 2000,
            peek_bytes: 128,
            handshake_timeout_secs: 30,
        }
    }
}

impl RelayConfig {
    pub fn from_toml(raw: &str) -> Result<Self, Box<dyn Error>> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from `path` when given; a missing file falls back to defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        let Some(path) = path else {
            return Ok(RelayConfig::default());
        };
        if !path.exists() {
            log::info!("Config file {} not found, using defaults", path.display());
            return Ok(RelayConfig::default());
        }
        if !path.is_file() {
            return Err(format!("config path {} is not a file", path.display()).into());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&raw).map_err(|e| format!("invalid config {}: {}", path.display(), e).into())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    pub fn abandon_after(&self) -> Duration {
        Duration::from_secs(self.abandon_secs)
    }

    pub fn reconnect_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.handshake_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 4000);
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.rate_window(), Duration::from_secs(60));
        assert_eq!(config.failure_window(), Duration::from_secs(300));
        assert_eq!(config.block_duration(), Duration::from_secs(600));
        assert_eq!(config.abandon_after(), Duration::from_secs(600));
        assert_eq!(config.reconnect_window(), Duration::from_secs(120));
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml("port = 5000\nhandshake_timeout_secs = 0\n").unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.handshake_timeout(), None);
        assert_eq!(config.ip_limit, 5);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(RelayConfig::from_toml("prot = 5000\n").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("rift_relay_config_{}.toml", std::process::id()));
        std::fs::write(&path, "code_limit = 9\n").unwrap();

        let config = RelayConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.code_limit, 9);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("rift_relay_config_does_not_exist.toml");
        let config = RelayConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[tokio::test]
    async fn test_directory_is_rejected() {
        let dir = std::env::temp_dir();
        assert!(RelayConfig::load(Some(&dir)).await.is_err());
    }
}
