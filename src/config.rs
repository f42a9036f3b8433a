//! Configuration file and defaults.
//!
//! Precedence: defaults < config file < CLI flags

use crate::item::ItemRegistry;
use crate::protocol::{CHUNK_SIZE, HEADER_LEN, MAX_FRAME_SIZE};
use crate::server::DEFAULT_PORT;
use crate::transfer::{EventSender, SessionConfig, SessionContext};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default location: `<config dir>/lanbeam/config.toml`
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("lanbeam").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("lanbeam.toml"))
}

fn default_device_name() -> String {
    whoami::devicename()
}

fn default_destination() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_chunk_size() -> usize {
    CHUNK_SIZE
}

fn default_max_frame_size() -> u32 {
    MAX_FRAME_SIZE
}

fn default_idle_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name announced to receivers
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Port the receiver listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory received items are written under
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Content bytes per Binary packet
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Largest frame accepted from a peer
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    /// Seconds without progress before a transfer fails (0 disables)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            port: default_port(),
            destination: default_destination(),
            chunk_size: default_chunk_size(),
            max_frame_size: default_max_frame_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Config {
    /// Load `path`, or the default location when `path` is None.
    ///
    /// A missing file at the default location yields the defaults; an
    /// explicitly requested file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_path(), false),
        };

        if !path.exists() {
            ensure!(!required, "Config file not found: {}", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.device_name.trim().is_empty(), "device_name must not be empty");
        ensure!(self.port != 0, "port must be non-zero");
        ensure!(self.chunk_size > 0, "chunk_size must be positive");
        ensure!(
            (self.max_frame_size as usize) > HEADER_LEN,
            "max_frame_size must exceed the {} byte frame header",
            HEADER_LEN
        );
        ensure!(
            self.chunk_size < self.max_frame_size as usize,
            "chunk_size ({}) must be smaller than max_frame_size ({})",
            self.chunk_size,
            self.max_frame_size
        );
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunk_size: self.chunk_size,
            max_frame_size: self.max_frame_size,
            idle_timeout: match self.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// Session context using the default item registry.
    pub fn session_context(&self, events: EventSender) -> SessionContext {
        SessionContext {
            device_name: self.device_name.clone(),
            destination: self.destination.clone(),
            registry: Arc::new(ItemRegistry::default()),
            config: self.session_config(),
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = Config::from_toml("device_name = \"desk\"\nport = 5000\n").unwrap();
        assert_eq!(config.device_name, "desk");
        assert_eq!(config.port, 5000);
        assert_eq!(config.chunk_size, CHUNK_SIZE);
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(config.idle_timeout_secs, 30);
    }

    #[test]
    fn test_validation() {
        assert!(Config::from_toml("port = 0").is_err());
        assert!(Config::from_toml("chunk_size = 0").is_err());
        assert!(Config::from_toml("chunk_size = 2048\nmax_frame_size = 1024").is_err());
        assert!(Config::from_toml("unknown_key = 1").is_err());
    }

    #[test]
    fn test_session_config_mapping() {
        let mut config = Config::default();
        config.idle_timeout_secs = 0;
        assert_eq!(config.session_config().idle_timeout, None);

        config.idle_timeout_secs = 5;
        config.chunk_size = 1024;
        let session = config.session_config();
        assert_eq!(session.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(session.chunk_size, 1024);
    }

    #[test]
    fn test_load_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "destination = \"/srv/inbox\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.destination, PathBuf::from("/srv/inbox"));

        assert!(Config::load(Some(&tmp.path().join("missing.toml"))).is_err());
    }
}
