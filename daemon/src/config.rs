use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DaemonError, Result};

const DEFAULT_CONFIG_ENV: &str = "MERIDIAN_DAEMON_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the metastore and shard files.
    pub data_dir: PathBuf,
    /// Address the HTTP listener binds to.
    pub bind_addr: String,
    /// URL advertised to the rest of the cluster.
    pub url: String,
    /// URL of an existing cluster member to join, empty for the first
    /// node.
    pub join: String,
    pub authentication_enabled: bool,
    pub log_level: Option<String>,
    /// Seconds between retention enforcement sweeps; 0 disables.
    pub retention_check_interval_secs: u64,
    /// Seconds between continuous-query scheduler ticks; 0 disables.
    pub continuous_query_interval_secs: u64,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub body_limit: Option<usize>,
    pub concurrency_limit: Option<usize>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("meridian-data"),
            bind_addr: String::from("127.0.0.1:8086"),
            url: String::from("http://127.0.0.1:8086"),
            join: String::new(),
            authentication_enabled: false,
            log_level: Some(String::from("info")),
            retention_check_interval_secs: 600,
            continuous_query_interval_secs: 1,
            server: ServerSettings::default(),
        }
    }
}

impl DaemonConfig {
    /// Resolves configuration from the CLI path, the environment, or
    /// built-in defaults, in that order.
    pub fn from_sources(cli_path: Option<&str>) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let env_path = std::env::var(DEFAULT_CONFIG_ENV).ok();

        if let Some(path) = cli_path {
            if path.is_empty() {
                return Err(DaemonError::Config(
                    "configuration path must not be empty".into(),
                ));
            }
        }

        let config = if let Some(path) = cli_path {
            Self::load_from_path(path)?
        } else if let Some(path) = env_path.as_deref().filter(|p| !p.is_empty()) {
            Self::load_from_path(path)?
        } else {
            let mut cfg = Self::default();
            cfg.normalize_paths(&cwd);
            cfg
        };

        if config.data_dir.as_os_str().is_empty() {
            return Err(DaemonError::Config("data_dir must not be empty".into()));
        }
        if config.url.is_empty() {
            return Err(DaemonError::Config("url must not be empty".into()));
        }

        Ok(config)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        let raw = fs::read_to_string(&absolute_path)?;
        let mut config: DaemonConfig = toml::from_str(&raw)?;
        let base = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.normalize_paths(&base);
        Ok(config)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .map_err(|err| DaemonError::Config(format!("invalid bind_addr: {err}")))
    }

    fn normalize_paths(&mut self, base: &Path) {
        if self.data_dir.is_relative() {
            self.data_dir = base.join(&self.data_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert!(!config.authentication_enabled);
        assert!(config.join.is_empty());
        assert!(config.socket_addr().is_ok());
    }

    #[test]
    fn parses_toml_with_partial_keys() {
        let config: DaemonConfig = toml::from_str(
            r#"
            data_dir = "/var/lib/meridian"
            bind_addr = "0.0.0.0:8086"
            authentication_enabled = true

            [server]
            concurrency_limit = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/meridian"));
        assert!(config.authentication_enabled);
        assert_eq!(config.server.concurrency_limit, Some(64));
        // Unset keys keep their defaults.
        assert_eq!(config.retention_check_interval_secs, 600);
    }
}
