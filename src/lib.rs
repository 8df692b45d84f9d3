pub mod audio;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod log;
pub mod platform;
pub mod preferences;

// Re-export the engine surface for the binary and integration tests
pub use audio::devices::{CompositeDeviceManager, DeviceCatalog, SimulatedDevice, SimulatedHardware};
pub use audio::render::{GainSnapshot, GainState, RenderSession};
pub use audio::{AudioDevice, AudioHardware, DefaultRole, DeviceId, HardwareError, OutputChoice};
pub use config::EngineConfig;
pub use engine::{
    EngineCommand, EngineEvent, EngineHandle, EngineUpdate, RoutingEngine, RoutingState,
};
pub use error::{ConfigError, EngineError};
pub use preferences::{PreferenceStore, Preferences};

#[cfg(target_os = "macos")]
pub use audio::devices::CoreAudioHardware;
