// Device-set change notifications
//
// The OS delivers a burst of property notifications for every plug/unplug.
// They are folded into a level-triggered hint: at most one `DevicesChanged`
// event sits in the engine queue at a time, and the engine acknowledges the
// signal before it re-queries the device list. Consumers must treat the event
// as "something changed, re-query", never as an edit log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::engine::events::EngineEvent;

/// Coalescing bridge from OS notification threads into the engine queue
#[derive(Debug, Clone)]
pub struct DeviceChangeSignal {
    pending: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl DeviceChangeSignal {
    pub fn new(sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            pending: Arc::new(AtomicBool::new(false)),
            sender,
        }
    }

    /// Record that the device set changed. Callable from any thread, never blocks.
    /// Returns true if this call enqueued a new event.
    pub fn raise(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.sender.send(EngineEvent::DevicesChanged).is_err() {
            // Engine is gone; leave pending set so nothing else is queued
            return false;
        }
        true
    }

    /// Called by the engine right before it re-evaluates the device set, so a
    /// change that lands during re-evaluation queues a fresh event.
    pub fn acknowledge(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(target_os = "macos")]
pub(crate) mod coreaudio {
    //! CoreAudio listener registration for `kAudioHardwarePropertyDevices`

    use std::ffi::c_void;

    use coreaudio_sys::{
        kAudioHardwarePropertyDevices, kAudioObjectPropertyElementMaster,
        kAudioObjectPropertyScopeGlobal, kAudioObjectSystemObject, AudioObjectAddPropertyListener,
        AudioObjectID, AudioObjectPropertyAddress, AudioObjectRemovePropertyListener, OSStatus,
    };
    use tracing::{debug, warn};

    use super::DeviceChangeSignal;
    use crate::audio::hardware::{HardwareError, HardwareResult};

    /// Owns the listener context handed to CoreAudio. Dropping it unregisters.
    pub struct DeviceListListener {
        context: *mut DeviceChangeSignal,
    }

    // The context is only touched by CoreAudio's notification thread and by Drop
    unsafe impl Send for DeviceListListener {}
    unsafe impl Sync for DeviceListListener {}

    fn devices_address() -> AudioObjectPropertyAddress {
        AudioObjectPropertyAddress {
            mSelector: kAudioHardwarePropertyDevices,
            mScope: kAudioObjectPropertyScopeGlobal,
            mElement: kAudioObjectPropertyElementMaster,
        }
    }

    impl DeviceListListener {
        pub fn register(signal: DeviceChangeSignal) -> HardwareResult<Self> {
            let context = Box::into_raw(Box::new(signal));
            let address = devices_address();

            let status = unsafe {
                AudioObjectAddPropertyListener(
                    kAudioObjectSystemObject,
                    &address,
                    Some(device_list_change_listener),
                    context as *mut c_void,
                )
            };

            if let Err(e) = HardwareError::check(status, "AudioObjectAddPropertyListener") {
                unsafe {
                    drop(Box::from_raw(context));
                }
                return Err(e);
            }

            debug!("Registered device list listener");
            Ok(Self { context })
        }
    }

    impl Drop for DeviceListListener {
        fn drop(&mut self) {
            let address = devices_address();
            let status = unsafe {
                AudioObjectRemovePropertyListener(
                    kAudioObjectSystemObject,
                    &address,
                    Some(device_list_change_listener),
                    self.context as *mut c_void,
                )
            };
            if status != 0 {
                // Leak the context rather than free memory CoreAudio may still call into
                warn!("Failed to remove device list listener: OSStatus {}", status);
                return;
            }
            unsafe {
                drop(Box::from_raw(self.context));
            }
            debug!("Unregistered device list listener");
        }
    }

    /// Callback for device list changes
    extern "C" fn device_list_change_listener(
        _in_object_id: AudioObjectID,
        _in_number_addresses: u32,
        _in_addresses: *const AudioObjectPropertyAddress,
        in_client_data: *mut c_void,
    ) -> OSStatus {
        if !in_client_data.is_null() {
            let signal = unsafe { &*(in_client_data as *const DeviceChangeSignal) };
            signal.raise();
        }
        0
    }
}
