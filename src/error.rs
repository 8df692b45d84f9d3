//! Error taxonomy for the routing engine.
//!
//! Startup failures are fatal to the run. The same variants raised by
//! device-change or wake-triggered restarts are logged and swallowed by the
//! engine, because those conditions are transient.

use std::path::PathBuf;

use crate::audio::hardware::HardwareError;

/// Errors surfaced by the routing engine and its components.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A required device is absent.
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    /// The OS rejected the composite device topology.
    #[error("failed to create composite device: {0}")]
    CreateFailed(#[source] HardwareError),

    /// One of the hardware unit configuration steps failed.
    #[error("hardware unit configuration failed at '{step}': {source}")]
    UnitConfigFailed {
        step: &'static str,
        #[source]
        source: HardwareError,
    },

    /// Restoring the original default output failed during shutdown.
    #[error("failed to restore default output device {0}")]
    RestoreFailed(u32),

    /// Redirecting the OS default output to the capture device failed.
    #[error("failed to redirect default output to '{0}'")]
    RedirectFailed(String),

    /// The crash-recovery breadcrumb could not be written or removed.
    #[error("breadcrumb file {path:?}: {source}")]
    Breadcrumb {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Any other hardware query failure.
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl EngineError {
    /// Wraps a hardware failure that happened while configuring the unit.
    pub fn unit(step: &'static str) -> impl FnOnce(HardwareError) -> EngineError {
        move |source| EngineError::UnitConfigFailed { step, source }
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
