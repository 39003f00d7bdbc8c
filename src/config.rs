//! Daemon configuration, loaded once at startup from a JSON file.

use std::fs::File;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

static CONFIG: OnceCell<Config> = OnceCell::new();

pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub container: ContainerConfig,
    pub network: NetworkConfig,
    pub log: LogConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Prefix under which auto-created working directories live. Only paths
    /// under this prefix are removed during start failure cleanup.
    pub tmp_dir: PathBuf,
    /// Upper bound for stdout/stderr log files before rotation trims them.
    pub max_log_size: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            tmp_dir: PathBuf::from("/var/lib/warden/tmp"),
            max_log_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub debug: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            enabled: true,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Directory with one JSON state file per container, reloaded on
    /// daemon restart.
    pub state_dir: PathBuf,
    /// Memory cgroup that short-lived helper commands are confined to.
    pub helpers_cgroup: String,
    /// Seconds between stdio log rotation sweeps.
    pub rotate_interval: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            socket_path: PathBuf::from("/run/warden.sock"),
            state_dir: PathBuf::from("/var/lib/warden/containers"),
            helpers_cgroup: String::from("warden-helpers"),
            rotate_interval: 60,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let file = File::open(path).map_err(|e| {
            Error::from(e).wrap(format!("open config {}", path.display()))
        })?;
        serde_json::from_reader(file)
            .map_err(|e| Error::new(ErrorKind::InvalidValue, format!("parse config: {}", e)))
    }
}

/// Install the configuration for the lifetime of the process. Later calls
/// are ignored, matching the initialize-once contract.
pub fn init(config: Config) {
    let _ = CONFIG.set(config);
}

pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.container.max_log_size, 10 * 1024 * 1024);
        assert!(config.network.enabled);
        assert!(!config.log.verbose);
        assert_eq!(config.daemon.socket_path, PathBuf::from("/run/warden.sock"));
        assert_eq!(
            config.daemon.state_dir,
            PathBuf::from("/var/lib/warden/containers")
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"network": {{"enabled": false}}}}"#).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!(!config.network.enabled);
        assert_eq!(config.container.max_log_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_malformed_file_is_invalid_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }
}
