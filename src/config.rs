//! Session and server configuration
//!
//! Loaded from a JSON file, then overridden from the environment:
//! `DOCSYNC_BIND_ADDR`, `DOCSYNC_HANDSHAKE_TIMEOUT_MS` and `DOCSYNC_SESSION`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_BIND_ADDR: &str = "DOCSYNC_BIND_ADDR";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "DOCSYNC_HANDSHAKE_TIMEOUT_MS";
pub const ENV_SESSION: &str = "DOCSYNC_SESSION";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Client session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long `pull_session` waits for the pull reply.
    pub handshake_timeout_ms: u64,
    /// Per-request timeout; `None` waits until the reply or session close.
    pub request_timeout_ms: Option<u64>,
    /// Forward inbound events back to their origin as well.
    pub echo_inbound: bool,
    /// Send numeric buffers as base64; plain JSON lists otherwise.
    pub binary_arrays: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5000,
            request_timeout_ms: None,
            echo_inbound: false,
            binary_arrays: true,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Session server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Document served to pulls that name no session.
    pub default_session: String,
    pub binary_arrays: bool,
    /// Snapshot loaded into the default session at startup.
    pub snapshot: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5006".to_string(),
            default_session: "default".to_string(),
            binary_arrays: true,
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load from a JSON file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loading config from {:?}", path);
        let mut config = Self::from_json_str(&json)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.server.bind_addr = addr;
        }
        if let Some(value) = lookup(ENV_HANDSHAKE_TIMEOUT_MS) {
            self.session.handshake_timeout_ms =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_HANDSHAKE_TIMEOUT_MS,
                    value: value.clone(),
                })?;
        }
        if let Some(session) = lookup(ENV_SESSION) {
            self.server.default_session = session;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_json_str(r#"{"session": {"echo_inbound": true}}"#).unwrap();
        assert!(config.session.echo_inbound);
        assert_eq!(config.session.handshake_timeout(), Duration::from_millis(5000));
        assert_eq!(config.session.request_timeout(), None);
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_BIND_ADDR, "0.0.0.0:9000"),
            (ENV_HANDSHAKE_TIMEOUT_MS, "250"),
            (ENV_SESSION, "sales"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.session.handshake_timeout_ms, 250);
        assert_eq!(config.server.default_session, "sales");

        let result = config.apply_overrides(|name| {
            (name == ENV_HANDSHAKE_TIMEOUT_MS).then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{"server": {"bind_addr": "127.0.0.1:7000", "snapshot": "doc.json"}}"#,
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.snapshot, Some(PathBuf::from("doc.json")));
        assert!(matches!(
            Config::load("/nonexistent/docsync.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
