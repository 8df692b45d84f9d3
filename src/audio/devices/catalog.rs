// Device discovery and classification
//
// Every query goes to the OS; nothing is cached, because handles are
// invalidated by hot-plug. An unavailable audio subsystem yields an empty
// list rather than an error.

use std::sync::Arc;

use colored::Colorize;
use tracing::{info, warn};

use super::notifications::DeviceChangeSignal;
use crate::audio::hardware::{AudioHardware, HardwareResult};
use crate::audio::types::{AudioDevice, DefaultRole, DeviceId, Scope};

/// Output volume elements probed for a hardware volume scalar: master, then first channel
const VOLUME_ELEMENTS: [u32; 2] = [0, 1];

pub struct DeviceCatalog {
    hardware: Arc<dyn AudioHardware>,
    capture_device_name: String,
    composite_uid: String,
}

impl std::fmt::Debug for DeviceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCatalog")
            .field("capture_device_name", &self.capture_device_name)
            .field("composite_uid", &self.composite_uid)
            .finish()
    }
}

impl DeviceCatalog {
    pub fn new(
        hardware: Arc<dyn AudioHardware>,
        capture_device_name: &str,
        composite_uid: &str,
    ) -> Self {
        Self {
            hardware,
            capture_device_name: capture_device_name.to_string(),
            composite_uid: composite_uid.to_string(),
        }
    }

    pub fn capture_device_name(&self) -> &str {
        &self.capture_device_name
    }

    /// All devices exposing at least one output stream
    pub fn list_output_devices(&self) -> Vec<AudioDevice> {
        let ids = match self.hardware.device_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    "{} Device enumeration unavailable: {}",
                    "CATALOG_WARN".bright_yellow(),
                    e
                );
                return Vec::new();
            }
        };

        crate::device_debug!("OS reports {} audio devices", ids.len());

        ids.into_iter()
            .filter(|id| self.hardware.has_output_streams(*id))
            .filter_map(|id| match self.describe(id) {
                Ok(device) => {
                    crate::device_debug!(
                        "  {} '{}' uid={} in={} out={} hw_volume={}",
                        device.id,
                        device.name,
                        device.uid,
                        device.input_channels,
                        device.output_channels,
                        device.has_volume_control
                    );
                    Some(device)
                }
                Err(e) => {
                    crate::device_debug!("Skipping device {}: {}", id, e);
                    None
                }
            })
            .collect()
    }

    /// First output device whose name contains `substring`
    pub fn find_by_name(&self, substring: &str) -> Option<AudioDevice> {
        self.list_output_devices()
            .into_iter()
            .find(|device| device.name.contains(substring))
    }

    /// Re-resolve an output device by its stable identifier
    pub fn find_by_uid(&self, uid: &str) -> Option<AudioDevice> {
        let id = self.hardware.translate_uid(uid)?;
        if !self.hardware.has_output_streams(id) {
            return None;
        }
        self.describe(id).ok()
    }

    /// The virtual capture device system audio is redirected into
    pub fn capture_device(&self) -> Option<AudioDevice> {
        self.find_by_name(&self.capture_device_name)
    }

    /// Devices that are valid routing targets: not the capture device, not our
    /// composite, and without native hardware volume.
    pub fn fixed_volume_outputs(&self) -> Vec<AudioDevice> {
        self.list_output_devices()
            .into_iter()
            .filter(|device| self.is_routing_target(device))
            .collect()
    }

    pub fn is_routing_target(&self, device: &AudioDevice) -> bool {
        !device.name.contains(&self.capture_device_name)
            && device.uid != self.composite_uid
            && !device.has_volume_control
    }

    /// Whether the OS reports a volume scalar on the master or first channel element
    pub fn has_volume_control(&self, id: DeviceId) -> bool {
        VOLUME_ELEMENTS
            .iter()
            .any(|element| self.hardware.has_volume_property(id, *element))
    }

    /// Stable identifier of a device handle, if the device still exists
    pub fn device_uid(&self, id: DeviceId) -> Option<String> {
        self.hardware.device_uid(id).ok()
    }

    /// Current handle for a stable identifier. Handles can change across sleep.
    pub fn resolve_uid(&self, uid: &str) -> Option<DeviceId> {
        self.hardware.translate_uid(uid)
    }

    pub fn default_output(&self) -> Option<DeviceId> {
        self.default_device(DefaultRole::Output)
    }

    pub fn set_default_output(&self, id: DeviceId) -> bool {
        self.set_default_device(DefaultRole::Output, id)
    }

    pub fn default_system_output(&self) -> Option<DeviceId> {
        self.default_device(DefaultRole::SystemOutput)
    }

    pub fn set_default_system_output(&self, id: DeviceId) -> bool {
        self.set_default_device(DefaultRole::SystemOutput, id)
    }

    pub fn default_device(&self, role: DefaultRole) -> Option<DeviceId> {
        match self.hardware.default_device(role) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    "{} Failed to get {} output device: {}",
                    "SYS_AUDIO_WARN".bright_yellow(),
                    role.label(),
                    e
                );
                None
            }
        }
    }

    pub fn set_default_device(&self, role: DefaultRole, id: DeviceId) -> bool {
        match self.hardware.set_default_device(role, id) {
            Ok(()) => {
                info!(
                    "{} Set {} output device to ID {}",
                    "SYS_AUDIO_SET".bright_green(),
                    role.label(),
                    id
                );
                true
            }
            Err(e) => {
                warn!(
                    "{} Failed to set {} output device to ID {}: {}",
                    "SYS_AUDIO_WARN".bright_yellow(),
                    role.label(),
                    id,
                    e
                );
                false
            }
        }
    }

    /// Register the OS device-list listener, forwarding through `signal`
    pub fn watch(&self, signal: DeviceChangeSignal) -> HardwareResult<()> {
        self.hardware.watch_device_list(signal)?;
        info!("{} Watching device list", "CATALOG_WATCH".bright_blue());
        Ok(())
    }

    pub fn unwatch(&self) {
        self.hardware.unwatch_device_list();
    }

    fn describe(&self, id: DeviceId) -> HardwareResult<AudioDevice> {
        let uid = self.hardware.device_uid(id)?;
        let name = self.hardware.device_name(id)?;
        let input_channels = self.hardware.channel_count(id, Scope::Input).unwrap_or(0);
        let output_channels = self.hardware.channel_count(id, Scope::Output).unwrap_or(0);

        Ok(AudioDevice {
            id,
            uid,
            name,
            input_channels,
            output_channels,
            has_volume_control: self.has_volume_control(id),
        })
    }
}
