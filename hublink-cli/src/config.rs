//! Configuration file support for hublink.
//!
//! Configuration is loaded from multiple sources with the following priority
//! (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (HUBLINK_*)
//! 3. Local config file (./hublink.toml)
//! 4. Global config file (~/.config/hublink/config.toml)

use directories::ProjectDirs;
use hublink::{ProtocolRevision, UploadConfig};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Remembered hub identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubSection {
    /// Preferred hub name.
    pub name: Option<String>,
    /// Preferred hub address.
    pub address: Option<String>,
}

/// Transfer tuning.
///
/// The delays are protocol settling times; the defaults are minimums
/// validated against real hubs. Raise them for flaky links before lowering
/// anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSection {
    /// Protocol revision name ("v1" or "v2").
    pub revision: Option<String>,
    /// Pause after the stop command, in milliseconds.
    pub stop_settle_ms: Option<u64>,
    /// Pause after the size announcement, in milliseconds.
    pub meta_settle_ms: Option<u64>,
    /// Pause between chunk writes, in milliseconds.
    pub chunk_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remembered hub.
    #[serde(default)]
    pub hub: HubSection,
    /// Transfer tuning.
    #[serde(default)]
    pub upload: UploadSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("hublink.toml")) {
            debug!("Loaded local config from hublink.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Invalid config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Merge another configuration into this one; `other` wins where set.
    fn merge(&mut self, other: Self) {
        if other.hub.name.is_some() {
            self.hub.name = other.hub.name;
        }
        if other.hub.address.is_some() {
            self.hub.address = other.hub.address;
        }
        if other.upload.revision.is_some() {
            self.upload.revision = other.upload.revision;
        }
        if other.upload.stop_settle_ms.is_some() {
            self.upload.stop_settle_ms = other.upload.stop_settle_ms;
        }
        if other.upload.meta_settle_ms.is_some() {
            self.upload.meta_settle_ms = other.upload.meta_settle_ms;
        }
        if other.upload.chunk_delay_ms.is_some() {
            self.upload.chunk_delay_ms = other.upload.chunk_delay_ms;
        }
    }

    /// Path of the global config file, if a home directory exists.
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "hublink").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Persist this configuration to the global config file.
    pub fn save_global(&self) -> anyhow::Result<()> {
        let path = Self::global_config_path()
            .ok_or_else(|| anyhow::anyhow!("no config directory available"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Protocol revision from the config file, if valid.
    pub fn revision(&self) -> Option<ProtocolRevision> {
        let name = self.upload.revision.as_deref()?;
        let revision = ProtocolRevision::from_name(name);
        if revision.is_none() {
            warn!("Unknown protocol revision '{name}' in config, ignoring");
        }
        revision
    }

    /// Upload timing with config-file overrides applied.
    pub fn upload_config(&self) -> UploadConfig {
        let mut upload = UploadConfig::default();
        if let Some(ms) = self.upload.stop_settle_ms {
            upload.stop_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = self.upload.meta_settle_ms {
            upload.meta_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = self.upload.chunk_delay_ms {
            upload.chunk_delay = Duration::from_millis(ms);
        }
        upload
    }
}
