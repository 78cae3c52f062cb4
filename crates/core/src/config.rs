//! Server configuration
//!
//! Loaded from TOML. Every field has a default, so a missing file or a
//! partial file is fine. The file location comes from `AGORA_CONFIG` or,
//! failing that, the platform config directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{RoomSettings, DEFAULT_PAGE_SIZE};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "AGORA_CONFIG";

/// Default listen port
pub const DEFAULT_PORT: u16 = 7342;

const CONFIG_FILE: &str = "agora.toml";
const ARCHIVE_FILE: &str = "agora.db";

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the discussion server listens on
    pub bind: SocketAddr,
    /// Connections accepted per room
    pub max_peers_per_room: usize,
    /// Newest messages sent on join; older ones are fetched in pages.
    /// Unset sends the full log, which can outgrow a single frame.
    pub history_limit: Option<usize>,
    /// Typing debounce window
    pub typing_window_ms: u64,
    /// A connection silent for this long is closed
    pub idle_timeout_secs: u64,
    /// Outbound frames buffered per connection; a connection that falls
    /// this far behind is dropped
    pub peer_queue: usize,
    /// Defaults applied to newly created rooms
    pub room: RoomSettings,
    pub archive: ArchiveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_peers_per_room: 64,
            history_limit: Some(DEFAULT_PAGE_SIZE),
            typing_window_ms: 2000,
            idle_timeout_secs: 90,
            peer_queue: 256,
            room: RoomSettings::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

/// SQLite archive settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    /// Database file; defaults to the platform data directory
    pub path: Option<PathBuf>,
}

impl ArchiveConfig {
    /// Resolve the database path, falling back to the data directory
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join(ARCHIVE_FILE)),
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load from `AGORA_CONFIG`, else the platform config directory
    pub fn load_default() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => project_dirs()?.config_dir().join(CONFIG_FILE),
        };
        Self::load(&path)
    }

    pub fn typing_window(&self) -> Duration {
        Duration::from_millis(self.typing_window_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_peers_per_room == 0 {
            return Err(Error::Config("max_peers_per_room must be at least 1".into()));
        }
        if self.typing_window_ms == 0 {
            return Err(Error::Config("typing_window_ms must be positive".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(Error::Config("idle_timeout_secs must be positive".into()));
        }
        if self.peer_queue == 0 {
            return Err(Error::Config("peer_queue must be at least 1".into()));
        }
        Ok(())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "agora", "agora")
        .ok_or_else(|| Error::Config("Could not determine home directory".into()))
}
