//! User preferences persisted between runs: last output, volume and mute.
//!
//! Read once at startup and rewritten whenever the engine reports a change.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::events::EngineUpdate;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub output_uid: Option<String>,
    pub volume: f32,
    pub muted: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            output_uid: None,
            volume: 1.0,
            muted: false,
        }
    }
}

impl Preferences {
    /// Fold an engine update into the preferences. Returns true if anything changed.
    pub fn apply(&mut self, update: &EngineUpdate) -> bool {
        match update {
            EngineUpdate::Gain(snapshot) => {
                let changed = self.volume != snapshot.volume || self.muted != snapshot.muted;
                self.volume = snapshot.volume;
                self.muted = snapshot.muted;
                changed
            }
            EngineUpdate::OutputSelected(uid) => {
                let changed = self.output_uid.as_deref() != Some(uid.as_str());
                self.output_uid = Some(uid.clone());
                changed
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreferenceStore {
    path: PathBuf,
}

impl PreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("volume-relay").join("preferences.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable preferences fall back to defaults
    pub fn load(&self) -> Preferences {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not read preferences {:?}: {}", self.path, e);
                }
                return Preferences::default();
            }
        };

        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("Ignoring invalid preferences {:?}: {}", self.path, e);
            Preferences::default()
        })
    }

    pub fn save(&self, preferences: &Preferences) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(preferences).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json).map_err(io_error)?;

        debug!("Saved preferences to {:?}", self.path);
        Ok(())
    }
}
