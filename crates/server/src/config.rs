use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

/// The add, retrieve and stream listeners are bound at fixed offsets
/// from the control port so clients only need to know one number.
pub const ADD_PORT_OFFSET: u16 = 1;
pub const RETRIEVE_PORT_OFFSET: u16 = 2;
pub const STREAM_PORT_OFFSET: u16 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    /// Path the external drive is expected to be mounted at. The server
    /// refuses to start when this path does not exist.
    pub mount_path: String,
    /// Folder under the mount that holds the staging and database trees.
    pub server_folder: String,
    pub control_port: u16,
    /// Listen backlog requested from the OS.
    pub backlog: u32,
    /// Upper bound on a single framed file transfer, in bytes. Declared
    /// lengths above this are refused before any payload is read.
    pub max_transfer_bytes: u64,
    /// How long a command handler waits for the matching auxiliary
    /// channel to attach before giving up.
    pub aux_attach_timeout_secs: u64,
    /// Read timeout applied to accepted sockets. Zero disables it.
    pub read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            mount_path: "/mnt/ext500GB".to_string(),
            server_folder: "server".to_string(),
            control_port: 6501,
            backlog: 50,
            max_transfer_bytes: 512 * 1024 * 1024,
            aux_attach_timeout_secs: 30,
            read_timeout_secs: 0,
        }
    }
}

impl ServerConfig {
    pub fn add_port(&self) -> u16 {
        self.control_port.saturating_add(ADD_PORT_OFFSET)
    }

    pub fn retrieve_port(&self) -> u16 {
        self.control_port.saturating_add(RETRIEVE_PORT_OFFSET)
    }

    pub fn stream_port(&self) -> u16 {
        self.control_port.saturating_add(STREAM_PORT_OFFSET)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("LYREBIRD_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

/// Loads the config at `path`, creating it with defaults when absent.
/// The boolean is true when a fresh file was written.
pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.server_folder.trim().is_empty() {
            config.server_folder = "server".to_string();
        }
        if config.control_port == 0 {
            config.control_port = 6501;
        }
        if config.max_transfer_bytes == 0 {
            config.max_transfer_bytes = 512 * 1024 * 1024;
        }
        if config.aux_attach_timeout_secs == 0 {
            config.aux_attach_timeout_secs = 30;
        }
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aux_ports_follow_control_port() {
        let mut config = ServerConfig::default();
        config.control_port = 7000;
        assert_eq!(config.add_port(), 7001);
        assert_eq!(config.retrieve_port(), 7002);
        assert_eq!(config.stream_port(), 7003);
    }

    #[test]
    fn load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert_eq!(config.control_port, 6501);

        let (again, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(again.control_port, config.control_port);
    }

    #[test]
    fn load_repairs_zeroed_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "version: 1\ncontrol_port: 0\nserver_folder: \"\"\n").unwrap();
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.control_port, 6501);
        assert_eq!(config.server_folder, "server");
    }
}
