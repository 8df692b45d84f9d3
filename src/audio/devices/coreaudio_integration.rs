// Platform-specific CoreAudio integration for macOS
//
// Direct CoreAudio property access for device discovery, default-device
// routing, sample-rate control and aggregate device lifecycle. Implements the
// `AudioHardware` capability trait; the render path lives in
// `coreaudio_stream`.

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::Mutex;

use core_foundation::array::CFArray;
use core_foundation::base::{CFType, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::{CFString, CFStringRef};
use coreaudio_sys::{
    kAudioDevicePropertyDeviceNameCFString, kAudioDevicePropertyDeviceUID,
    kAudioDevicePropertyNominalSampleRate, kAudioDevicePropertyStreamConfiguration,
    kAudioDevicePropertyStreams, kAudioDevicePropertyVolumeScalar,
    kAudioHardwarePropertyDefaultOutputDevice, kAudioHardwarePropertyDefaultSystemOutputDevice,
    kAudioHardwarePropertyDevices, kAudioHardwarePropertyTranslateUIDToDevice,
    kAudioObjectPropertyElementMaster, kAudioObjectPropertyScopeGlobal,
    kAudioObjectPropertyScopeInput, kAudioObjectPropertyScopeOutput, kAudioObjectSystemObject,
    kAudioObjectUnknown, AudioBufferList, AudioDeviceID, AudioHardwareCreateAggregateDevice,
    AudioHardwareDestroyAggregateDevice, AudioObjectGetPropertyData,
    AudioObjectGetPropertyDataSize, AudioObjectHasProperty, AudioObjectPropertyAddress,
    AudioObjectPropertyScope, AudioObjectPropertySelector, AudioObjectSetPropertyData,
};
use tracing::{debug, info};

use super::aggregate_device::CompositeDeviceSpec;
use super::coreaudio_stream::CoreAudioIoUnit;
use super::notifications::coreaudio::DeviceListListener;
use super::notifications::DeviceChangeSignal;
use crate::audio::hardware::{AudioHardware, HardwareError, HardwareResult, IoUnit};
use crate::audio::types::{DefaultRole, DeviceId, Scope};

// Aggregate description keys (AudioHardware.h)
const AGGREGATE_UID_KEY: &str = "uid";
const AGGREGATE_NAME_KEY: &str = "name";
const AGGREGATE_PRIVATE_KEY: &str = "private";
const AGGREGATE_SUB_DEVICES_KEY: &str = "subdevices";
const AGGREGATE_MASTER_KEY: &str = "master";
const AGGREGATE_CLOCK_KEY: &str = "clock";
const SUB_DEVICE_UID_KEY: &str = "uid";
const SUB_DEVICE_DRIFT_KEY: &str = "drift";

fn address(
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
    element: u32,
) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: scope,
        mElement: element,
    }
}

fn global(selector: AudioObjectPropertySelector) -> AudioObjectPropertyAddress {
    address(
        selector,
        kAudioObjectPropertyScopeGlobal,
        kAudioObjectPropertyElementMaster,
    )
}

fn scope_selector(scope: Scope) -> AudioObjectPropertyScope {
    match scope {
        Scope::Input => kAudioObjectPropertyScopeInput,
        Scope::Output => kAudioObjectPropertyScopeOutput,
    }
}

fn role_selector(role: DefaultRole) -> AudioObjectPropertySelector {
    match role {
        DefaultRole::Output => kAudioHardwarePropertyDefaultOutputDevice,
        DefaultRole::SystemOutput => kAudioHardwarePropertyDefaultSystemOutputDevice,
    }
}

/// Read a fixed-size property value
fn get_property<T: Copy>(
    object: u32,
    address: &AudioObjectPropertyAddress,
    initial: T,
    operation: &'static str,
) -> HardwareResult<T> {
    let mut value = initial;
    let mut size = mem::size_of::<T>() as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            object,
            address,
            0,
            ptr::null(),
            &mut size,
            &mut value as *mut T as *mut c_void,
        )
    };
    HardwareError::check(status, operation)?;
    Ok(value)
}

fn set_property<T>(
    object: u32,
    address: &AudioObjectPropertyAddress,
    value: &T,
    operation: &'static str,
) -> HardwareResult<()> {
    let status = unsafe {
        AudioObjectSetPropertyData(
            object,
            address,
            0,
            ptr::null(),
            mem::size_of::<T>() as u32,
            value as *const T as *const c_void,
        )
    };
    HardwareError::check(status, operation)
}

fn property_size(object: u32, address: &AudioObjectPropertyAddress) -> Option<u32> {
    let mut size: u32 = 0;
    let status = unsafe { AudioObjectGetPropertyDataSize(object, address, 0, ptr::null(), &mut size) };
    (status == 0).then_some(size)
}

/// Read a CFString property, taking ownership of the returned reference
fn get_string(
    object: u32,
    selector: AudioObjectPropertySelector,
    operation: &'static str,
) -> HardwareResult<String> {
    let cf_string_ref: CFStringRef = get_property(object, &global(selector), ptr::null(), operation)?;
    if cf_string_ref.is_null() {
        return Err(HardwareError::Status {
            operation,
            status: -1,
        });
    }
    let cf_string = unsafe { CFString::wrap_under_create_rule(cf_string_ref) };
    Ok(cf_string.to_string())
}

/// CoreAudio-backed implementation of the OS audio boundary
pub struct CoreAudioHardware {
    listener: Mutex<Option<DeviceListListener>>,
}

impl Default for CoreAudioHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreAudioHardware {
    pub fn new() -> Self {
        Self {
            listener: Mutex::new(None),
        }
    }

    fn aggregate_description(spec: &CompositeDeviceSpec) -> CFDictionary<CFString, CFType> {
        let sub_device = |uid: &str, drift: bool| {
            CFDictionary::from_CFType_pairs(&[
                (
                    CFString::new(SUB_DEVICE_UID_KEY),
                    CFString::new(uid).as_CFType(),
                ),
                (
                    CFString::new(SUB_DEVICE_DRIFT_KEY),
                    CFNumber::from(drift as i32).as_CFType(),
                ),
            ])
        };

        // Capture first: its channels occupy the low composite indices
        let members = CFArray::from_CFTypes(&[
            sub_device(&spec.capture_uid, spec.drift_compensate_capture),
            sub_device(&spec.output_uid, false),
        ]);

        let private = if spec.private {
            CFBoolean::true_value()
        } else {
            CFBoolean::false_value()
        };

        CFDictionary::from_CFType_pairs(&[
            (CFString::new(AGGREGATE_UID_KEY), CFString::new(&spec.uid).as_CFType()),
            (CFString::new(AGGREGATE_NAME_KEY), CFString::new(&spec.name).as_CFType()),
            (CFString::new(AGGREGATE_PRIVATE_KEY), private.as_CFType()),
            (CFString::new(AGGREGATE_SUB_DEVICES_KEY), members.as_CFType()),
            (
                CFString::new(AGGREGATE_MASTER_KEY),
                CFString::new(&spec.master_uid).as_CFType(),
            ),
            (
                CFString::new(AGGREGATE_CLOCK_KEY),
                CFString::new(&spec.clock_uid).as_CFType(),
            ),
        ])
    }
}

impl AudioHardware for CoreAudioHardware {
    fn device_ids(&self) -> HardwareResult<Vec<DeviceId>> {
        let devices_address = global(kAudioHardwarePropertyDevices);
        let size = property_size(kAudioObjectSystemObject, &devices_address).ok_or_else(|| {
            HardwareError::Unavailable("cannot read device list size".to_string())
        })?;

        let count = size as usize / mem::size_of::<AudioDeviceID>();
        let mut ids: Vec<AudioDeviceID> = vec![0; count];
        let mut size = (count * mem::size_of::<AudioDeviceID>()) as u32;

        let status = unsafe {
            AudioObjectGetPropertyData(
                kAudioObjectSystemObject,
                &devices_address,
                0,
                ptr::null(),
                &mut size,
                ids.as_mut_ptr() as *mut c_void,
            )
        };
        HardwareError::check(status, "get device list")?;

        // The list can shrink between the size query and the read
        ids.truncate(size as usize / mem::size_of::<AudioDeviceID>());
        Ok(ids)
    }

    fn device_uid(&self, id: DeviceId) -> HardwareResult<String> {
        get_string(id, kAudioDevicePropertyDeviceUID, "get device UID")
    }

    fn device_name(&self, id: DeviceId) -> HardwareResult<String> {
        get_string(id, kAudioDevicePropertyDeviceNameCFString, "get device name")
    }

    fn channel_count(&self, id: DeviceId, scope: Scope) -> HardwareResult<u32> {
        let config_address = address(
            kAudioDevicePropertyStreamConfiguration,
            scope_selector(scope),
            kAudioObjectPropertyElementMaster,
        );
        let Some(size) = property_size(id, &config_address) else {
            return Err(HardwareError::NoSuchDevice(id));
        };
        if size == 0 {
            return Ok(0);
        }

        // u64 backing keeps the AudioBufferList suitably aligned
        let words = (size as usize).div_ceil(mem::size_of::<u64>());
        let mut storage: Vec<u64> = vec![0; words];
        let mut size = size;
        let status = unsafe {
            AudioObjectGetPropertyData(
                id,
                &config_address,
                0,
                ptr::null(),
                &mut size,
                storage.as_mut_ptr() as *mut c_void,
            )
        };
        HardwareError::check(status, "get stream configuration")?;

        let list = unsafe { &*(storage.as_ptr() as *const AudioBufferList) };
        let buffers =
            unsafe { std::slice::from_raw_parts(list.mBuffers.as_ptr(), list.mNumberBuffers as usize) };
        Ok(buffers.iter().map(|buffer| buffer.mNumberChannels).sum())
    }

    fn has_output_streams(&self, id: DeviceId) -> bool {
        let streams_address = address(
            kAudioDevicePropertyStreams,
            kAudioObjectPropertyScopeOutput,
            kAudioObjectPropertyElementMaster,
        );
        property_size(id, &streams_address).is_some_and(|size| size > 0)
    }

    fn has_volume_property(&self, id: DeviceId, element: u32) -> bool {
        let volume_address = address(
            kAudioDevicePropertyVolumeScalar,
            kAudioObjectPropertyScopeOutput,
            element,
        );
        unsafe { AudioObjectHasProperty(id, &volume_address) != 0 }
    }

    fn nominal_sample_rate(&self, id: DeviceId) -> HardwareResult<f64> {
        get_property(
            id,
            &global(kAudioDevicePropertyNominalSampleRate),
            0.0f64,
            "get nominal sample rate",
        )
    }

    fn set_nominal_sample_rate(&self, id: DeviceId, rate: f64) -> HardwareResult<()> {
        debug!("Requesting nominal sample rate {} Hz on device {}", rate, id);
        set_property(
            id,
            &global(kAudioDevicePropertyNominalSampleRate),
            &rate,
            "set nominal sample rate",
        )
    }

    fn default_device(&self, role: DefaultRole) -> HardwareResult<DeviceId> {
        let id: AudioDeviceID = get_property(
            kAudioObjectSystemObject,
            &global(role_selector(role)),
            kAudioObjectUnknown,
            "get default device",
        )?;
        if id == kAudioObjectUnknown {
            return Err(HardwareError::Unavailable(format!(
                "no {} output device",
                role.label()
            )));
        }
        Ok(id)
    }

    fn set_default_device(&self, role: DefaultRole, id: DeviceId) -> HardwareResult<()> {
        set_property(
            kAudioObjectSystemObject,
            &global(role_selector(role)),
            &id,
            "set default device",
        )
    }

    fn translate_uid(&self, uid: &str) -> Option<DeviceId> {
        let cf_uid = CFString::new(uid);
        let uid_ref: CFStringRef = cf_uid.as_concrete_TypeRef();
        let translate_address = global(kAudioHardwarePropertyTranslateUIDToDevice);

        let mut id: AudioDeviceID = kAudioObjectUnknown;
        let mut size = mem::size_of::<AudioDeviceID>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                kAudioObjectSystemObject,
                &translate_address,
                mem::size_of::<CFStringRef>() as u32,
                &uid_ref as *const CFStringRef as *const c_void,
                &mut size,
                &mut id as *mut AudioDeviceID as *mut c_void,
            )
        };

        (status == 0 && id != kAudioObjectUnknown).then_some(id)
    }

    fn create_aggregate(&self, spec: &CompositeDeviceSpec) -> HardwareResult<DeviceId> {
        let description = Self::aggregate_description(spec);
        let mut id: DeviceId = kAudioObjectUnknown;
        let status = unsafe {
            AudioHardwareCreateAggregateDevice(description.as_concrete_TypeRef() as *const _, &mut id)
        };
        HardwareError::check(status, "AudioHardwareCreateAggregateDevice")?;
        Ok(id)
    }

    fn destroy_aggregate(&self, id: DeviceId) -> HardwareResult<()> {
        let status = unsafe { AudioHardwareDestroyAggregateDevice(id) };
        HardwareError::check(status, "AudioHardwareDestroyAggregateDevice")
    }

    fn watch_device_list(&self, signal: DeviceChangeSignal) -> HardwareResult<()> {
        let listener = DeviceListListener::register(signal)?;
        let mut slot = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Dropping the previous listener unregisters it
        *slot = Some(listener);
        info!("Registered CoreAudio device list listener");
        Ok(())
    }

    fn unwatch_device_list(&self) {
        let mut slot = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.take();
    }

    fn new_io_unit(&self) -> HardwareResult<Box<dyn IoUnit>> {
        Ok(Box::new(CoreAudioIoUnit::new()?))
    }
}
