// Composite (aggregate) device lifecycle
//
// The engine owns at most one private composite at a time, identified by a
// reserved UID that stays fixed across runs. Leftovers from a killed process
// carry the same UID and are reclaimed at startup.

use std::sync::Arc;

use colored::Colorize;
use tracing::{error, info, warn};

use crate::audio::hardware::{AudioHardware, HardwareError, HardwareResult};
use crate::audio::types::DeviceId;
use crate::error::EngineError;

/// Description of the composite device joining the virtual capture device and
/// the physical output device.
///
/// The physical output is both clock source and master so timing follows real
/// hardware; the capture member is drift-compensated against it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeDeviceSpec {
    /// Reserved UID, fixed across runs so leftovers can be found
    pub uid: String,
    pub name: String,
    pub capture_uid: String,
    pub output_uid: String,
    pub master_uid: String,
    pub clock_uid: String,
    pub drift_compensate_capture: bool,
    /// Hidden from the OS output-device list
    pub private: bool,
}

impl CompositeDeviceSpec {
    pub fn new(uid: &str, name: &str, capture_uid: &str, output_uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            capture_uid: capture_uid.to_string(),
            output_uid: output_uid.to_string(),
            master_uid: output_uid.to_string(),
            clock_uid: output_uid.to_string(),
            drift_compensate_capture: true,
            private: true,
        }
    }
}

/// A live composite device
#[derive(Debug)]
pub struct CompositeDevice {
    pub id: DeviceId,
    pub spec: CompositeDeviceSpec,
    destroyed: bool,
}

impl CompositeDevice {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

/// Manager for creating, destroying and reclaiming the engine's composite device
pub struct CompositeDeviceManager {
    hardware: Arc<dyn AudioHardware>,
    uid: String,
    name: String,
}

impl CompositeDeviceManager {
    pub fn new(hardware: Arc<dyn AudioHardware>, uid: &str, name: &str) -> Self {
        Self {
            hardware,
            uid: uid.to_string(),
            name: name.to_string(),
        }
    }

    /// The reserved UID every composite created by this manager carries
    pub fn reserved_uid(&self) -> &str {
        &self.uid
    }

    /// Create a private composite over (capture, output).
    ///
    /// Any composite already holding the reserved UID is destroyed first so at
    /// most one exists at a time.
    pub fn create(&self, capture_uid: &str, output_uid: &str) -> Result<CompositeDevice, EngineError> {
        let spec = CompositeDeviceSpec::new(&self.uid, &self.name, capture_uid, output_uid);

        info!(
            "{} Creating composite device: uid='{}', capture='{}', output='{}'",
            "AGGREGATE_CREATE".bright_cyan(),
            spec.uid,
            capture_uid,
            output_uid
        );

        if let Some(existing) = self.hardware.translate_uid(&self.uid) {
            warn!(
                "{} Composite '{}' already exists (ID {}), destroying before re-creating",
                "AGGREGATE_WARN".bright_yellow(),
                self.uid,
                existing
            );
            if let Err(e) = self.hardware.destroy_aggregate(existing) {
                warn!(
                    "{} Failed to destroy existing composite {}: {}",
                    "AGGREGATE_WARN".bright_yellow(),
                    existing,
                    e
                );
            }
        }

        let id = self.hardware.create_aggregate(&spec).map_err(|e| {
            error!(
                "{} Failed to create composite device: {}",
                "AGGREGATE_ERROR".bright_red(),
                e
            );
            EngineError::CreateFailed(e)
        })?;

        info!(
            "{} Created composite device with ID: {}",
            "AGGREGATE_CREATED".bright_green(),
            id
        );

        Ok(CompositeDevice {
            id,
            spec,
            destroyed: false,
        })
    }

    /// Destroy a composite. Safe to call on an already torn-down handle.
    pub fn destroy(&self, device: &mut CompositeDevice) -> HardwareResult<()> {
        if device.destroyed {
            return Ok(());
        }

        info!(
            "{} Destroying composite device with ID: {}",
            "AGGREGATE_DESTROY".bright_yellow(),
            device.id
        );

        match self.hardware.destroy_aggregate(device.id) {
            Ok(()) | Err(HardwareError::NoSuchDevice(_)) => {
                device.destroyed = true;
                Ok(())
            }
            Err(e) => {
                error!(
                    "{} Failed to destroy composite device {}: {}",
                    "AGGREGATE_ERROR".bright_red(),
                    device.id,
                    e
                );
                Err(e)
            }
        }
    }

    /// Destroy every device carrying the reserved UID, returning how many were removed.
    ///
    /// Scans all device objects rather than only outputs, since a leftover may
    /// have been created privately by a killed process.
    pub fn reclaim_stale(&self) -> usize {
        let ids = match self.hardware.device_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    "{} Could not enumerate devices to reclaim stale composites: {}",
                    "AGGREGATE_WARN".bright_yellow(),
                    e
                );
                return 0;
            }
        };

        let mut reclaimed = 0;
        for id in ids {
            let Ok(uid) = self.hardware.device_uid(id) else {
                continue;
            };
            if uid != self.uid {
                continue;
            }

            info!(
                "{} Reclaiming stale composite '{}' (ID {})",
                "AGGREGATE_RECLAIM".bright_magenta(),
                uid,
                id
            );
            match self.hardware.destroy_aggregate(id) {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(
                    "{} Failed to reclaim stale composite {}: {}",
                    "AGGREGATE_WARN".bright_yellow(),
                    id,
                    e
                ),
            }
        }

        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::simulated::{SimulatedDevice, SimulatedHardware};

    const RESERVED: &str = "com.volumerelay.aggregate";

    fn hardware() -> Arc<SimulatedHardware> {
        let hw = SimulatedHardware::new();
        hw.plug(SimulatedDevice::virtual_capture("VCap", "vcap-uid", 16));
        hw.plug(SimulatedDevice::output("Mon", "mon-uid", 2));
        Arc::new(hw)
    }

    #[test]
    fn test_spec_ties_clock_and_master_to_output() {
        let spec = CompositeDeviceSpec::new(RESERVED, "Relay", "vcap-uid", "mon-uid");
        assert_eq!(spec.master_uid, "mon-uid");
        assert_eq!(spec.clock_uid, "mon-uid");
        assert!(spec.drift_compensate_capture);
        assert!(spec.private);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let hw = hardware();
        let manager = CompositeDeviceManager::new(hw.clone(), RESERVED, "Relay");

        let mut composite = manager.create("vcap-uid", "mon-uid").unwrap();
        assert_eq!(hw.aggregate_count(RESERVED), 1);

        manager.destroy(&mut composite).unwrap();
        manager.destroy(&mut composite).unwrap();
        assert!(composite.is_destroyed());
        assert_eq!(hw.aggregate_count(RESERVED), 0);
    }

    #[test]
    fn test_create_replaces_existing_reserved_composite() {
        let hw = hardware();
        let manager = CompositeDeviceManager::new(hw.clone(), RESERVED, "Relay");

        let _first = manager.create("vcap-uid", "mon-uid").unwrap();
        let _second = manager.create("vcap-uid", "mon-uid").unwrap();
        assert_eq!(hw.aggregate_count(RESERVED), 1);
    }

    #[test]
    fn test_create_fails_for_missing_member() {
        let hw = hardware();
        let manager = CompositeDeviceManager::new(hw.clone(), RESERVED, "Relay");

        let result = manager.create("vcap-uid", "gone-uid");
        assert!(matches!(result, Err(EngineError::CreateFailed(_))));
        assert_eq!(hw.aggregate_count(RESERVED), 0);
    }

    #[test]
    fn test_reclaim_removes_only_reserved_composite() {
        let hw = hardware();
        hw.plug_stale_aggregate(RESERVED, "vcap-uid", "mon-uid");
        hw.plug_stale_aggregate("com.other.aggregate", "vcap-uid", "mon-uid");
        let before = hw.device_ids().unwrap().len();

        let manager = CompositeDeviceManager::new(hw.clone(), RESERVED, "Relay");
        assert_eq!(manager.reclaim_stale(), 1);

        assert_eq!(hw.aggregate_count(RESERVED), 0);
        assert_eq!(hw.aggregate_count("com.other.aggregate"), 1);
        assert_eq!(hw.device_ids().unwrap().len(), before - 1);
    }
}
