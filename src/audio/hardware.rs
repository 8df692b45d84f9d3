//! Capability boundary to the OS audio subsystem.
//!
//! Everything the engine needs from the platform goes through [`AudioHardware`]
//! and [`IoUnit`]. The CoreAudio implementation lives in
//! `devices::coreaudio_integration` / `devices::coreaudio_stream` (macOS only);
//! `devices::simulated` provides an in-memory implementation.

use std::sync::Arc;

use super::devices::aggregate_device::CompositeDeviceSpec;
use super::devices::notifications::DeviceChangeSignal;
use super::render::channel_map::ChannelMap;
use super::render::gain::GainState;
use super::types::{DefaultRole, DeviceId, Scope, StreamFormat, StreamSide};

/// OS-level failure, carrying the raw status code where one exists
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HardwareError {
    #[error("{operation} failed: OSStatus {status}")]
    Status { operation: &'static str, status: i32 },

    #[error("audio device {0} is not present")]
    NoSuchDevice(DeviceId),

    #[error("audio subsystem unavailable: {0}")]
    Unavailable(String),
}

impl HardwareError {
    /// Map a raw OS status to `Ok` or a `Status` error
    pub fn check(status: i32, operation: &'static str) -> Result<(), HardwareError> {
        if status == 0 {
            Ok(())
        } else {
            Err(HardwareError::Status { operation, status })
        }
    }
}

pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

/// Device, default-routing and aggregate operations of the OS audio subsystem.
///
/// Calls may block briefly on OS property access; they are only made from the
/// control context, never from the real-time thread.
pub trait AudioHardware: Send + Sync {
    /// Every device object the OS currently exposes
    fn device_ids(&self) -> HardwareResult<Vec<DeviceId>>;

    fn device_uid(&self, id: DeviceId) -> HardwareResult<String>;
    fn device_name(&self, id: DeviceId) -> HardwareResult<String>;

    /// Total channels across all streams in the given scope
    fn channel_count(&self, id: DeviceId, scope: Scope) -> HardwareResult<u32>;

    /// True when the device exposes at least one output stream
    fn has_output_streams(&self, id: DeviceId) -> bool;

    /// True when a volume scalar exists on the given output element
    fn has_volume_property(&self, id: DeviceId, element: u32) -> bool;

    fn nominal_sample_rate(&self, id: DeviceId) -> HardwareResult<f64>;

    /// Request a rate change. The change may take effect asynchronously.
    fn set_nominal_sample_rate(&self, id: DeviceId, rate: f64) -> HardwareResult<()>;

    fn default_device(&self, role: DefaultRole) -> HardwareResult<DeviceId>;
    fn set_default_device(&self, role: DefaultRole, id: DeviceId) -> HardwareResult<()>;

    /// Resolve a stable UID to the current handle
    fn translate_uid(&self, uid: &str) -> Option<DeviceId>;

    fn create_aggregate(&self, spec: &CompositeDeviceSpec) -> HardwareResult<DeviceId>;
    fn destroy_aggregate(&self, id: DeviceId) -> HardwareResult<()>;

    /// Register the single device-list listener. Replaces any previous one.
    fn watch_device_list(&self, signal: DeviceChangeSignal) -> HardwareResult<()>;
    fn unwatch_device_list(&self);

    /// Instantiate an unconfigured hardware output unit
    fn new_io_unit(&self) -> HardwareResult<Box<dyn IoUnit>>;
}

/// A hardware I/O unit. Disposed when dropped.
pub trait IoUnit: Send {
    /// Bind the unit to a device as its sole device
    fn set_current_device(&mut self, device: DeviceId) -> HardwareResult<()>;

    /// Enable the input bus (bus 1) for capture
    fn enable_input(&mut self) -> HardwareResult<()>;

    /// Install a channel map; `Scope::Output` is the render map, `Scope::Input` the capture map
    fn set_channel_map(&mut self, scope: Scope, map: &ChannelMap) -> HardwareResult<()>;

    fn set_stream_format(&mut self, side: StreamSide, format: &StreamFormat) -> HardwareResult<()>;

    /// Install the real-time callback that pulls capture audio and applies gain
    fn install_render_callback(&mut self, gain: Arc<GainState>) -> HardwareResult<()>;

    fn start(&mut self) -> HardwareResult<()>;
    fn stop(&mut self) -> HardwareResult<()>;

    /// The unit's running flag as reported by the OS
    fn is_running(&self) -> bool;
}
