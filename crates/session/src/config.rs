//! Session configuration.
//!
//! Stored as pretty JSON at `~/.config/peerline/config.json` (or the
//! platform equivalent). A missing file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use peerline_protocol::constants::DEFAULT_CANCEL_GRACE;
use peerline_transfer::RegistryConfig;

use crate::error::SessionError;

const APP_DIR: &str = "peerline";
const CONFIG_FILE: &str = "config.json";
const DOWNLOADS_DIR: &str = "downloads";

fn default_cancel_grace_ms() -> u64 {
    DEFAULT_CANCEL_GRACE.as_millis() as u64
}

fn default_event_buffer() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Keep all data next to the executable's working directory.
    #[serde(default)]
    pub portable: bool,

    /// Overrides the data directory (ignored in portable mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Where accepted files land when no explicit path is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,

    /// Grace period for a cancelled send worker, in milliseconds.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Capacity of the transfer and avatar event channels.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            portable: false,
            data_dir: None,
            download_dir: None,
            cancel_grace_ms: default_cancel_grace_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SessionConfig {
    /// Loads the config from the default location.
    pub fn load() -> Result<Self, SessionError> {
        let base = config_dir().ok_or(SessionError::NoConfigDir)?;
        Self::load_from(&config_path_in(&base))
    }

    /// Loads the config from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, SessionError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Persists the config to the default location.
    pub fn save(&self) -> Result<(), SessionError> {
        let base = config_dir().ok_or(SessionError::NoConfigDir)?;
        self.save_to(&config_path_in(&base))
    }

    /// Writes pretty JSON to `path` via a temp file and rename.
    pub fn save_to(&self, path: &Path) -> Result<(), SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        if let Err(e) = std::fs::rename(&tmp_path, path) {
            warn!(path = %path.display(), error = %e, "failed to replace config file");
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Directory holding avatars and (by default) downloads.
    pub fn resolve_data_dir(&self) -> Result<PathBuf, SessionError> {
        if self.portable {
            return Ok(std::env::current_dir()?);
        }
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let base = config_dir().ok_or(SessionError::NoConfigDir)?;
        Ok(base.join(APP_DIR))
    }

    pub fn resolve_download_dir(&self, data_dir: &Path) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| data_dir.join(DOWNLOADS_DIR))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            cancel_grace: self.cancel_grace(),
            event_buffer: self.event_buffer,
        }
    }
}

fn config_path_in(base: &Path) -> PathBuf {
    base.join(APP_DIR).join(CONFIG_FILE)
}

/// Platform config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
