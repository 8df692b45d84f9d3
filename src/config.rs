//! Engine configuration.
//!
//! Loaded once at startup from `<config_dir>/volume-relay/config.json`. A
//! missing file means defaults; a present but invalid file is an error so a
//! typo never silently routes audio to the wrong device.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

pub const DEFAULT_CAPTURE_DEVICE_NAME: &str = "BlackHole 16ch";
pub const DEFAULT_COMPOSITE_UID: &str = "com.volumerelay.aggregate";
pub const DEFAULT_COMPOSITE_NAME: &str = "Volume Relay Aggregate";
pub const BREADCRUMB_FILE_NAME: &str = "volume-relay.breadcrumb";

const CAPTURE_DEVICE_ENV: &str = "VOLUME_RELAY_CAPTURE_DEVICE";
const BREADCRUMB_ENV: &str = "VOLUME_RELAY_BREADCRUMB";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name substring of the virtual capture device system audio is redirected to
    pub capture_device_name: String,

    /// Reserved UID of the composite device; also used to reclaim leftovers
    pub composite_uid: String,
    pub composite_name: String,

    pub breadcrumb_path: PathBuf,

    /// Delay before touching the audio subsystem after wake
    #[serde(with = "millis")]
    pub wake_settle_delay: Duration,

    /// Upper bound on waiting for an output device to adopt a new sample rate
    #[serde(with = "millis")]
    pub rate_settle_timeout: Duration,
    #[serde(with = "millis")]
    pub rate_poll_interval: Duration,

    /// Volume change per step command
    pub volume_step: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_device_name: DEFAULT_CAPTURE_DEVICE_NAME.to_string(),
            composite_uid: DEFAULT_COMPOSITE_UID.to_string(),
            composite_name: DEFAULT_COMPOSITE_NAME.to_string(),
            breadcrumb_path: std::env::temp_dir().join(BREADCRUMB_FILE_NAME),
            wake_settle_delay: Duration::from_secs(2),
            rate_settle_timeout: Duration::from_secs(1),
            rate_poll_interval: Duration::from_millis(20),
            volume_step: 1.0 / 16.0,
        }
    }
}

impl EngineConfig {
    /// Default location of the config file, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("volume-relay").join("config.json"))
    }

    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config file at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var(CAPTURE_DEVICE_ENV) {
            if !name.is_empty() {
                self.capture_device_name = name;
            }
        }
        if let Ok(path) = std::env::var(BREADCRUMB_ENV) {
            if !path.is_empty() {
                self.breadcrumb_path = PathBuf::from(path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_device_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "capture_device_name must not be empty".to_string(),
            ));
        }
        if self.composite_uid.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "composite_uid must not be empty".to_string(),
            ));
        }
        if !(self.volume_step > 0.0 && self.volume_step <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "volume_step must be in (0, 1], got {}",
                self.volume_step
            )));
        }
        if self.rate_poll_interval.is_zero() && !self.rate_settle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "rate_poll_interval must be non-zero when rate_settle_timeout is set".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
