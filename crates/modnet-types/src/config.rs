//! Configuration types, deserialized from `~/.modnet/config.toml`.
//!
//! Every section carries `#[serde(default)]` so a partial file only overrides
//! the keys it names.

use crate::error::{ModnetError, ModnetResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root of the modnet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModnetConfig {
    /// Name this process announces during the module-name exchange.
    pub module_name: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Connection manager settings.
    pub wire: WireConfig,
    /// Orchestrator settings.
    pub fleet: FleetConfig,
}

impl Default for ModnetConfig {
    fn default() -> Self {
        Self {
            module_name: "modnet".to_string(),
            log_level: "info".to_string(),
            wire: WireConfig::default(),
            fleet: FleetConfig::default(),
        }
    }
}

impl ModnetConfig {
    /// Reject values that would make the event loop or the bounded waits
    /// meaningless.
    pub fn validate(&self) -> ModnetResult<()> {
        if self.module_name.trim().is_empty() {
            return Err(ModnetError::Config("module_name must not be empty".into()));
        }
        if self.fleet.poll_interval_ms == 0 {
            return Err(ModnetError::Config(
                "fleet.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.wire.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ModnetError::Config(format!(
                "wire.listen_addr is not a socket address: {}",
                self.wire.listen_addr
            )));
        }
        Ok(())
    }
}

/// How two endpoints decide they share a host, which allows an encrypting
/// converter to be dropped after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SameHostPolicy {
    /// Both addresses are loopback, or the peer address equals the local one.
    #[default]
    LoopbackOrMatch,
    /// Only loopback connections count as same-host.
    Loopback,
    /// Never drop encryption on account of locality.
    Never,
}

/// Connection manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Address the manager listens on when a module serves protocols.
    pub listen_addr: String,
    /// Authorization file; defaults to `~/.modnet/authorization`.
    pub auth_file: Option<PathBuf>,
    /// Locality rule for dropping converters.
    pub same_host: SameHostPolicy,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            auth_file: None,
            same_host: SameHostPolicy::default(),
        }
    }
}

impl WireConfig {
    /// Resolved path of the authorization file.
    pub fn auth_file_path(&self) -> PathBuf {
        self.auth_file
            .clone()
            .unwrap_or_else(|| modnet_home().join("authorization"))
    }
}

/// Orchestrator settings. Every wait is `attempts * poll_interval_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Granularity of every bounded wait.
    pub poll_interval_ms: u64,
    /// Attempts while waiting for a slave daemon to register.
    pub host_wait_attempts: u32,
    /// Attempts while waiting for a module's control and stdio links.
    pub module_wait_attempts: u32,
    /// Attempts while waiting for a server module to publish its port.
    pub port_wait_attempts: u32,
    /// Attempts while waiting for a requested connection to establish.
    pub connection_wait_attempts: u32,
    /// Attempts while waiting for children to exit during teardown.
    pub teardown_wait_attempts: u32,
    /// Delay after each COMMANDS line unless the script overrides it.
    pub command_delay_ms: u64,
    /// Remote bootstrap template. `{host}`, `{address}`, `{port}`,
    /// `{alias}` and `{display}` are substituted.
    pub bootstrap_command: String,
    /// Display handed to remote hosts.
    pub display: Option<String>,
    /// Address other hosts use to reach this orchestrator.
    pub advertise_host: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            host_wait_attempts: 200,
            module_wait_attempts: 200,
            port_wait_attempts: 100,
            connection_wait_attempts: 100,
            teardown_wait_attempts: 100,
            command_delay_ms: 1000,
            bootstrap_command:
                "ssh -n {host} modnet slave --orchestrator {address}:{port} --alias {alias} --display {display}"
                    .to_string(),
            display: None,
            advertise_host: None,
        }
    }
}

impl FleetConfig {
    /// Poll granularity as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// `~/.modnet`, or `./.modnet` when no home directory is known.
pub fn modnet_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".modnet"))
        .unwrap_or_else(|| PathBuf::from(".modnet"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ModnetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fleet.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.fleet.host_wait_attempts, 200);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ModnetConfig = toml::from_str(
            r#"
            module_name = "viewer"
            [fleet]
            poll_interval_ms = 50
            [wire]
            same_host = "never"
            "#,
        )
        .unwrap();
        assert_eq!(config.module_name, "viewer");
        assert_eq!(config.fleet.poll_interval_ms, 50);
        assert_eq!(config.fleet.command_delay_ms, 1000);
        assert_eq!(config.wire.same_host, SameHostPolicy::Never);
        assert_eq!(config.wire.listen_addr, "0.0.0.0:0");
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = ModnetConfig::default();
        config.fleet.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_listen_addr() {
        let mut config = ModnetConfig::default();
        config.wire.listen_addr = "not-an-address".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listen_addr"));
    }
}
