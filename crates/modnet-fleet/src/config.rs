//! Configuration loading from `~/.modnet/config.toml` with defaults.

use modnet_types::config::modnet_home;
use modnet_types::ModnetConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load configuration from a TOML file, falling back to defaults.
///
/// A missing file is not an error. An unreadable, unparsable or invalid one
/// is logged and replaced by defaults.
pub fn load_config(path: Option<&Path>) -> ModnetConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return ModnetConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return ModnetConfig::default();
        }
    };

    let config = match toml::from_str::<ModnetConfig>(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            return ModnetConfig::default();
        }
    };

    if let Err(e) = config.validate() {
        warn!(
            error = %e,
            path = %config_path.display(),
            "Invalid config, using defaults"
        );
        return ModnetConfig::default();
    }

    info!(path = %config_path.display(), "Loaded configuration");
    config
}

/// `~/.modnet/config.toml`.
pub fn default_config_path() -> PathBuf {
    modnet_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config.module_name, "modnet");
    }

    #[test]
    fn test_loads_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "module_name = \"orchestrator\"\n[fleet]\nhost_wait_attempts = 5\nadvertise_host = \"10.0.0.2\""
        )
        .unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.module_name, "orchestrator");
        assert_eq!(config.fleet.host_wait_attempts, 5);
        assert_eq!(config.fleet.advertise_host.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_broken_file_gives_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "module_name = [unterminated").unwrap();
        assert_eq!(load_config(Some(file.path())).module_name, "modnet");
    }

    #[test]
    fn test_invalid_values_give_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[fleet]\npoll_interval_ms = 0").unwrap();
        assert_eq!(load_config(Some(file.path())).fleet.poll_interval_ms, 100);
    }
}
