// CoreAudio HAL output unit and its real-time render callback
//
// The render callback runs on CoreAudio's I/O thread. It touches only the
// boxed RenderContext: the unit handle (for pulling bus 1) and the shared
// GainState. It never allocates, locks or logs, and a panic inside it is
// caught and reported as an error status.
//
// The context pointer is published through an AtomicPtr and reclaimed only
// after the unit has been stopped and disposed.

use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use coreaudio_sys::{
    kAudioFormatFlagIsFloat, kAudioFormatFlagIsNonInterleaved, kAudioFormatFlagIsPacked,
    kAudioFormatLinearPCM, kAudioOutputUnitProperty_ChannelMap,
    kAudioOutputUnitProperty_CurrentDevice, kAudioOutputUnitProperty_EnableIO,
    kAudioOutputUnitProperty_IsRunning, kAudioUnitManufacturer_Apple,
    kAudioUnitProperty_SetRenderCallback, kAudioUnitProperty_StreamFormat, kAudioUnitScope_Global,
    kAudioUnitScope_Input, kAudioUnitScope_Output, kAudioUnitSubType_HALOutput,
    kAudioUnitType_Output, AURenderCallbackStruct, AudioBufferList, AudioComponentDescription,
    AudioComponentFindNext, AudioComponentInstanceDispose, AudioComponentInstanceNew,
    AudioDeviceID, AudioOutputUnitStart, AudioOutputUnitStop, AudioStreamBasicDescription,
    AudioTimeStamp, AudioUnit, AudioUnitGetProperty, AudioUnitInitialize,
    AudioUnitPropertyID, AudioUnitRender, AudioUnitRenderActionFlags, AudioUnitScope,
    AudioUnitSetProperty, AudioUnitUninitialize, OSStatus,
};
use tracing::{debug, warn};

use crate::audio::hardware::{HardwareError, HardwareResult, IoUnit};
use crate::audio::render::callback::process_period;
use crate::audio::render::channel_map::ChannelMap;
use crate::audio::render::gain::GainState;
use crate::audio::types::{DeviceId, Scope, StreamFormat, StreamSide};

const INPUT_BUS: u32 = 1;
const OUTPUT_BUS: u32 = 0;

struct RenderContext {
    audio_unit: AudioUnit,
    gain: Arc<GainState>,
}

/// HAL output unit bound to a single (composite) device, capturing on bus 1
/// and rendering on bus 0.
pub struct CoreAudioIoUnit {
    audio_unit: AudioUnit,
    initialized: bool,
    callback_context: AtomicPtr<RenderContext>,
}

// Manual Debug implementation to handle the AudioUnit pointer
impl std::fmt::Debug for CoreAudioIoUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreAudioIoUnit")
            .field("initialized", &self.initialized)
            .field(
                "callback_context",
                &(!self.callback_context.load(Ordering::Acquire).is_null()),
            )
            .finish()
    }
}

// Unit configuration happens on the control context only
unsafe impl Send for CoreAudioIoUnit {}

impl CoreAudioIoUnit {
    pub fn new() -> HardwareResult<Self> {
        let component_desc = AudioComponentDescription {
            componentType: kAudioUnitType_Output,
            componentSubType: kAudioUnitSubType_HALOutput,
            componentManufacturer: kAudioUnitManufacturer_Apple,
            componentFlags: 0,
            componentFlagsMask: 0,
        };

        let component = unsafe { AudioComponentFindNext(ptr::null_mut(), &component_desc) };
        if component.is_null() {
            return Err(HardwareError::Unavailable(
                "HAL output component not found".to_string(),
            ));
        }

        let mut audio_unit: AudioUnit = ptr::null_mut();
        let status = unsafe { AudioComponentInstanceNew(component, &mut audio_unit) };
        HardwareError::check(status, "AudioComponentInstanceNew")?;

        Ok(Self {
            audio_unit,
            initialized: false,
            callback_context: AtomicPtr::new(ptr::null_mut()),
        })
    }

    fn set_property<T>(
        &self,
        property: AudioUnitPropertyID,
        scope: AudioUnitScope,
        element: u32,
        data: *const T,
        size: usize,
        operation: &'static str,
    ) -> HardwareResult<()> {
        let status = unsafe {
            AudioUnitSetProperty(
                self.audio_unit,
                property,
                scope,
                element,
                data as *const c_void,
                size as u32,
            )
        };
        HardwareError::check(status, operation)
    }
}

fn stream_description(format: &StreamFormat) -> AudioStreamBasicDescription {
    let mut flags = kAudioFormatFlagIsPacked;
    if format.is_float {
        flags |= kAudioFormatFlagIsFloat;
    }
    if format.non_interleaved {
        flags |= kAudioFormatFlagIsNonInterleaved;
    }

    AudioStreamBasicDescription {
        mSampleRate: format.sample_rate,
        mFormatID: kAudioFormatLinearPCM,
        mFormatFlags: flags,
        mBytesPerPacket: format.bytes_per_frame(),
        mFramesPerPacket: 1,
        mBytesPerFrame: format.bytes_per_frame(),
        mChannelsPerFrame: format.channels,
        mBitsPerChannel: format.bits_per_channel,
        mReserved: 0,
    }
}

impl IoUnit for CoreAudioIoUnit {
    fn set_current_device(&mut self, device: DeviceId) -> HardwareResult<()> {
        let device_id: AudioDeviceID = device;
        self.set_property(
            kAudioOutputUnitProperty_CurrentDevice,
            kAudioUnitScope_Global,
            0,
            &device_id,
            std::mem::size_of::<AudioDeviceID>(),
            "set current device",
        )
    }

    fn enable_input(&mut self) -> HardwareResult<()> {
        let enable: u32 = 1;
        self.set_property(
            kAudioOutputUnitProperty_EnableIO,
            kAudioUnitScope_Input,
            INPUT_BUS,
            &enable,
            std::mem::size_of::<u32>(),
            "enable input",
        )?;
        self.set_property(
            kAudioOutputUnitProperty_EnableIO,
            kAudioUnitScope_Output,
            OUTPUT_BUS,
            &enable,
            std::mem::size_of::<u32>(),
            "enable output",
        )
    }

    fn set_channel_map(&mut self, scope: Scope, map: &ChannelMap) -> HardwareResult<()> {
        // Output map: one entry per device channel naming the unit channel feeding it.
        // Input map: one entry per unit channel naming the device channel it reads.
        let (raw, unit_scope, element, operation) = match scope {
            Scope::Output => (
                map.to_raw(),
                kAudioUnitScope_Input,
                OUTPUT_BUS,
                "set output channel map",
            ),
            Scope::Input => (
                map.to_raw_sources(),
                kAudioUnitScope_Output,
                INPUT_BUS,
                "set input channel map",
            ),
        };
        debug!("{}: {:?}", operation, raw);
        self.set_property(
            kAudioOutputUnitProperty_ChannelMap,
            unit_scope,
            element,
            raw.as_ptr(),
            raw.len() * std::mem::size_of::<i32>(),
            operation,
        )
    }

    fn set_stream_format(&mut self, side: StreamSide, format: &StreamFormat) -> HardwareResult<()> {
        let description = stream_description(format);
        let (scope, element, operation) = match side {
            StreamSide::Capture => (kAudioUnitScope_Output, INPUT_BUS, "set capture stream format"),
            StreamSide::Render => (kAudioUnitScope_Input, OUTPUT_BUS, "set render stream format"),
        };
        self.set_property(
            kAudioUnitProperty_StreamFormat,
            scope,
            element,
            &description,
            std::mem::size_of::<AudioStreamBasicDescription>(),
            operation,
        )
    }

    fn install_render_callback(&mut self, gain: Arc<GainState>) -> HardwareResult<()> {
        let context = Box::into_raw(Box::new(RenderContext {
            audio_unit: self.audio_unit,
            gain,
        }));

        let callback = AURenderCallbackStruct {
            inputProc: Some(render_callback),
            inputProcRefCon: context as *mut c_void,
        };

        if let Err(e) = self.set_property(
            kAudioUnitProperty_SetRenderCallback,
            kAudioUnitScope_Input,
            OUTPUT_BUS,
            &callback,
            std::mem::size_of::<AURenderCallbackStruct>(),
            "set render callback",
        ) {
            unsafe { drop(Box::from_raw(context)) };
            return Err(e);
        }

        // A previous context can only be replaced while the unit is not running
        let old = self.callback_context.swap(context, Ordering::AcqRel);
        if !old.is_null() {
            unsafe { drop(Box::from_raw(old)) };
        }
        Ok(())
    }

    fn start(&mut self) -> HardwareResult<()> {
        if !self.initialized {
            let status = unsafe { AudioUnitInitialize(self.audio_unit) };
            HardwareError::check(status, "AudioUnitInitialize")?;
            self.initialized = true;
        }
        let status = unsafe { AudioOutputUnitStart(self.audio_unit) };
        HardwareError::check(status, "AudioOutputUnitStart")
    }

    fn stop(&mut self) -> HardwareResult<()> {
        let status = unsafe { AudioOutputUnitStop(self.audio_unit) };
        HardwareError::check(status, "AudioOutputUnitStop")
    }

    fn is_running(&self) -> bool {
        let mut running: u32 = 0;
        let mut size = std::mem::size_of::<u32>() as u32;
        let status = unsafe {
            AudioUnitGetProperty(
                self.audio_unit,
                kAudioOutputUnitProperty_IsRunning,
                kAudioUnitScope_Global,
                0,
                &mut running as *mut u32 as *mut c_void,
                &mut size,
            )
        };
        status == 0 && running != 0
    }
}

impl Drop for CoreAudioIoUnit {
    fn drop(&mut self) {
        unsafe {
            let status = AudioOutputUnitStop(self.audio_unit);
            if status != 0 {
                warn!("AudioOutputUnitStop during dispose returned {}", status);
            }
            if self.initialized {
                AudioUnitUninitialize(self.audio_unit);
            }
            AudioComponentInstanceDispose(self.audio_unit);
        }

        // The unit is gone, so the callback can no longer run
        let context = self.callback_context.swap(ptr::null_mut(), Ordering::AcqRel);
        if !context.is_null() {
            unsafe { drop(Box::from_raw(context)) };
        }
    }
}

/// Render callback: pull bus-1 capture audio straight into the output buffers,
/// then apply the current gain in place.
extern "C" fn render_callback(
    in_ref_con: *mut c_void,
    io_action_flags: *mut AudioUnitRenderActionFlags,
    in_time_stamp: *const AudioTimeStamp,
    _in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus {
    if in_ref_con.is_null() || io_data.is_null() {
        return -1;
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let context = unsafe { &*(in_ref_con as *const RenderContext) };

        let status = unsafe {
            AudioUnitRender(
                context.audio_unit,
                io_action_flags,
                in_time_stamp,
                INPUT_BUS,
                in_number_frames,
                io_data,
            )
        };

        let list = unsafe { &mut *io_data };
        let buffers = unsafe {
            std::slice::from_raw_parts_mut(list.mBuffers.as_mut_ptr(), list.mNumberBuffers as usize)
        };

        let samples = buffers.iter_mut().filter(|b| !b.mData.is_null()).map(|b| unsafe {
            std::slice::from_raw_parts_mut(
                b.mData as *mut f32,
                b.mDataByteSize as usize / std::mem::size_of::<f32>(),
            )
        });

        if status != 0 {
            for buffer in samples {
                buffer.fill(0.0);
            }
            return status;
        }

        process_period(samples, &context.gain);
        0
    }));

    result.unwrap_or(-1)
}
