// Audio devices module - Device discovery and composite device lifecycle
//
// - catalog: output device enumeration and default-device routing
// - aggregate_device: composite device creation, destruction and reclaim
// - notifications: coalescing device-set change signal (+ CoreAudio listener)
// - coreaudio_integration: CoreAudio implementation of the hardware boundary (macOS only)
// - coreaudio_stream: HAL output unit and render callback (macOS only)
// - simulated: in-memory hardware for tests and dry runs

pub mod aggregate_device;
pub mod catalog;
pub mod notifications;
pub mod simulated;

#[cfg(target_os = "macos")]
pub mod coreaudio_integration;
#[cfg(target_os = "macos")]
pub mod coreaudio_stream;

pub use aggregate_device::{CompositeDevice, CompositeDeviceManager, CompositeDeviceSpec};
pub use catalog::DeviceCatalog;
pub use notifications::DeviceChangeSignal;
pub use simulated::{SimulatedDevice, SimulatedHardware};

#[cfg(target_os = "macos")]
pub use coreaudio_integration::CoreAudioHardware;
