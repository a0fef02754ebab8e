//! Configuration: the typed struct the rest of the system depends on, plus
//! the YAML loading/validation the CLI's `--config` flag requires.
//!
//! Hot-reload is out of scope; this is a one-shot load-then-validate at
//! startup, matching the supervisor's fixed startup sequence.

use crate::error::ConfigError;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub uuid: String,
    pub shared_secret: String,
    pub keepalive_interval: u64,
    pub session_heartbeat_frequency: f64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 5770,
            uuid: String::new(),
            shared_secret: String::new(),
            keepalive_interval: 30,
            session_heartbeat_frequency: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub local_listen_port: u16,
    /// -1 disabled, 0 random, >0 bind to that port.
    pub broadcast_port: i32,
    pub target_host: String,
    pub target_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_listen_port: 14550,
            broadcast_port: -1,
            target_host: "127.0.0.1".into(),
            target_port: 14551,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EthernetConfig {
    pub interface: String,
    pub local_ip: String,
    pub broadcast_ip: String,
    pub pixhawk_ip: String,
    pub auto_setup: bool,
    pub subnet: String,
    pub allow_missing_pixhawk: bool,
    pub pixhawk_connection_timeout: u64,
}

impl Default for EthernetConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            local_ip: String::new(),
            broadcast_ip: String::new(),
            pixhawk_ip: String::new(),
            auto_setup: false,
            subnet: String::new(),
            allow_missing_pixhawk: false,
            pixhawk_connection_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub verbose: bool,
    pub timestamp_format: String,
    pub stats_interval: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            verbose: false,
            timestamp_format: "%Y-%m-%dT%H:%M:%S%.3f".into(),
            stats_interval: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub network: NetworkConfig,
    pub ethernet: EthernetConfig,
    pub log: LogConfig,
}

fn uuid_regex() -> Regex {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid regex is valid")
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }

    /// §7: UUID regex, numeric ranges for ports/intervals. Run once, before
    /// the supervisor proceeds past step 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.enabled && !uuid_regex().is_match(&self.auth.uuid) {
            return Err(ConfigError::InvalidUuid(self.auth.uuid.clone()));
        }
        if self.network.broadcast_port < -1 {
            return Err(ConfigError::OutOfRange {
                field: "network.broadcast_port",
                value: self.network.broadcast_port as i64,
                expected: ">= -1",
            });
        }
        if self.auth.session_heartbeat_frequency <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "auth.session_heartbeat_frequency",
                value: self.auth.session_heartbeat_frequency as i64,
                expected: "> 0",
            });
        }
        if self.ethernet.pixhawk_connection_timeout == 0 {
            return Err(ConfigError::OutOfRange {
                field: "ethernet.pixhawk_connection_timeout",
                value: 0,
                expected: "> 0",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_auth_disabled_validates() {
        let mut config = Config::default();
        config.auth.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_auth_requires_valid_uuid() {
        let mut config = Config::default();
        config.auth.enabled = true;
        config.auth.uuid = "not-a-uuid".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUuid(_))));

        config.auth.uuid = "00000001-0000-0000-0000-000000000001".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn broadcast_port_rejects_below_disabled_sentinel() {
        let mut config = Config::default();
        config.auth.enabled = false;
        config.network.broadcast_port = -2;
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { field: "network.broadcast_port", .. })));
    }

    #[test]
    fn load_parses_yaml_into_config() {
        let dir = std::env::temp_dir().join(format!("agent-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(
            &path,
            "auth:\n  uuid: \"00000001-0000-0000-0000-000000000001\"\n  shared_secret: SHARED-XYZ\nnetwork:\n  local_listen_port: 14550\n",
        )
        .unwrap();

        let config = Config::load(&path).expect("load should succeed");
        assert_eq!(config.auth.uuid, "00000001-0000-0000-0000-000000000001");
        assert_eq!(config.network.local_listen_port, 14550);
        assert_eq!(config.network.target_port, 14551); // default preserved

        std::fs::remove_dir_all(&dir).ok();
    }
}
