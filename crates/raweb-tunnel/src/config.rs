//! TOML configuration. Every field has a default, so an empty file (or no
//! file at all) is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub daemon: DaemonConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Path of the WebSocket endpoint.
    pub ws_path: String,
    /// Header carrying the principal authenticated by the fronting proxy.
    pub principal_header: String,
    /// Directory holding `.rdp` descriptors.
    pub resource_root: PathBuf,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8089)),
            ws_path: "/guacd-tunnel".into(),
            principal_header: "x-raweb-user".into(),
            resource_root: PathBuf::from("resources"),
            max_connections: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMethod {
    /// guacd runs in a runtime this process installs and supervises.
    Managed,
    /// guacd is already running elsewhere.
    External,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub method: DaemonMethod,
    /// `host:port` of an external guacd. Required for `external`.
    pub external_addr: Option<String>,
    /// `host:port` the managed guacd listens on.
    pub managed_addr: String,
    pub runtime_bin: String,
    pub instance_prefix: String,
    pub image_path: PathBuf,
    pub install_dir: PathBuf,
    pub command: Vec<String>,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub ready_timeout_secs: u64,
    pub idle_stop_secs: u64,
    pub idle_uninstall_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let wsl = raweb_guacd::WslConfig::default();
        Self {
            method: DaemonMethod::Managed,
            external_addr: None,
            managed_addr: "127.0.0.1:4822".into(),
            runtime_bin: wsl.wsl_bin,
            instance_prefix: wsl.instance_prefix,
            image_path: wsl.image_path,
            install_dir: wsl.install_root,
            command: wsl.daemon_command,
            probe_interval_ms: 500,
            probe_timeout_ms: 500,
            ready_timeout_secs: 30,
            idle_stop_secs: 5 * 60,
            idle_uninstall_secs: 60 * 60,
        }
    }
}

impl DaemonConfig {
    pub fn wsl_config(&self) -> raweb_guacd::WslConfig {
        raweb_guacd::WslConfig {
            wsl_bin: self.runtime_bin.clone(),
            image_path: self.image_path.clone(),
            install_root: self.install_dir.clone(),
            instance_prefix: self.instance_prefix.clone(),
            daemon_command: self.command.clone(),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn idle_stop(&self) -> Duration {
        Duration::from_secs(self.idle_stop_secs)
    }

    pub fn idle_uninstall(&self) -> Duration {
        Duration::from_secs(self.idle_uninstall_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub tls_probe_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub daemon_connect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tls_probe_timeout_ms: 5_000,
            keepalive_interval_ms: 5_000,
            daemon_connect_timeout_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn tls_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_probe_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn daemon_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.daemon_connect_timeout_ms)
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            None => Self::default(),
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.ws_path must start with '/': {:?}",
                self.server.ws_path
            )));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be > 0".into()));
        }
        if http::HeaderName::from_bytes(self.server.principal_header.as_bytes()).is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.principal_header is not a valid header name: {:?}",
                self.server.principal_header
            )));
        }
        match self.daemon.method {
            DaemonMethod::External if self.daemon.external_addr.is_none() => Err(
                ConfigError::Invalid("daemon.external_addr is required for method = \"external\"".into()),
            ),
            DaemonMethod::Managed if self.daemon.command.is_empty() => {
                Err(ConfigError::Invalid("daemon.command must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}
