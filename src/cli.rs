//! CLI (§4.9 step 2 / §6): flags the supervisor applies as overrides on top
//! of the loaded YAML config.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "drone-edge-agent", about = "MAVLink-to-router bridge agent")]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Log level override (trace/debug/info/warn/error).
    #[arg(long)]
    pub log: Option<String>,

    /// Run `register()` before `authenticate()` on startup.
    #[arg(long)]
    pub register: bool,

    /// Override `network.local_listen_port`.
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Port for the web bridge (collaborator-owned; accepted but unused by
    /// the core since the web bridge is a consumed-only interface).
    #[arg(long)]
    pub web_port: Option<u16>,

    /// Override `auth.uuid`.
    #[arg(long)]
    pub uuid: Option<String>,

    /// Override `auth.host`.
    #[arg(long)]
    pub server: Option<String>,

    /// Override `auth.port`.
    #[arg(long)]
    pub server_port: Option<u16>,

    /// Override `network.broadcast_port` (-1 disabled / 0 random / >0 bind).
    #[arg(long)]
    pub broadcast_port: Option<i32>,

    /// Point the Secret Store at an isolated, per-UUID file.
    #[arg(long)]
    pub test_mode: bool,
}

impl Cli {
    /// Applies CLI overrides onto a loaded config, per §4.9 step 2.
    pub fn apply_overrides(&self, config: &mut crate::config::Config) {
        if let Some(level) = &self.log {
            config.log.level = level.clone();
        }
        if let Some(port) = self.listen_port {
            config.network.local_listen_port = port;
        }
        if let Some(uuid) = &self.uuid {
            config.auth.uuid = uuid.clone();
        }
        if let Some(server) = &self.server {
            config.auth.host = server.clone();
        }
        if let Some(port) = self.server_port {
            config.auth.port = port;
        }
        if let Some(port) = self.broadcast_port {
            config.network.broadcast_port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn broadcast_port_override_preserves_tristate() {
        let cli = Cli {
            config: "config.yaml".into(),
            log: None,
            register: false,
            listen_port: None,
            web_port: None,
            uuid: None,
            server: None,
            server_port: None,
            broadcast_port: Some(-1),
            test_mode: false,
        };
        let mut config = Config::default();
        config.network.broadcast_port = 0;
        cli.apply_overrides(&mut config);
        assert_eq!(config.network.broadcast_port, -1);
    }

    #[test]
    fn unset_flags_leave_config_untouched() {
        let cli = Cli {
            config: "config.yaml".into(),
            log: None,
            register: false,
            listen_port: None,
            web_port: None,
            uuid: None,
            server: None,
            server_port: None,
            broadcast_port: None,
            test_mode: false,
        };
        let mut config = Config::default();
        let before = config.auth.host.clone();
        cli.apply_overrides(&mut config);
        assert_eq!(config.auth.host, before);
    }
}
