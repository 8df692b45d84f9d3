//! In-memory audio subsystem.
//!
//! Backs the test-suite and the `--simulate` dry-run mode. Devices can be
//! plugged and unplugged, handles renumbered (as after sleep), sample-rate
//! changes delayed, and individual hardware-unit steps made to fail.
//! Aggregate creation and destruction do not fire the device-list listener.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::aggregate_device::CompositeDeviceSpec;
use super::notifications::DeviceChangeSignal;
use crate::audio::hardware::{AudioHardware, HardwareError, HardwareResult, IoUnit};
use crate::audio::render::callback::process_period;
use crate::audio::render::channel_map::ChannelMap;
use crate::audio::render::gain::GainState;
use crate::audio::types::{DefaultRole, DeviceId, Scope, StreamFormat, StreamSide};

/// OSStatus returned for rejected operations ('nope')
pub const STATUS_REJECTED: i32 = 0x6E6F_7065;
/// OSStatus returned when a device handle is unknown ('!dev')
pub const STATUS_BAD_DEVICE: i32 = 0x2164_6576;

const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;
const FIRST_DEVICE_ID: DeviceId = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDevice {
    pub name: String,
    pub uid: String,
    pub input_channels: u32,
    pub output_channels: u32,
    /// Output elements carrying a volume scalar
    pub volume_elements: Vec<u32>,
    pub sample_rate: f64,
    pub aggregate: Option<CompositeDeviceSpec>,
}

impl SimulatedDevice {
    pub fn output(name: &str, uid: &str, channels: u32) -> Self {
        Self {
            name: name.to_string(),
            uid: uid.to_string(),
            input_channels: 0,
            output_channels: channels,
            volume_elements: Vec::new(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            aggregate: None,
        }
    }

    /// Loopback-style device exposing the same channel count in both directions
    pub fn virtual_capture(name: &str, uid: &str, channels: u32) -> Self {
        Self {
            input_channels: channels,
            ..Self::output(name, uid, channels)
        }
    }

    pub fn input_only(name: &str, uid: &str, channels: u32) -> Self {
        Self {
            input_channels: channels,
            output_channels: 0,
            ..Self::output(name, uid, 0)
        }
    }

    pub fn with_volume_control(mut self, element: u32) -> Self {
        self.volume_elements.push(element);
        self
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn with_input_channels(mut self, channels: u32) -> Self {
        self.input_channels = channels;
        self
    }
}

/// Hardware-unit configuration steps that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitStep {
    Create,
    SetDevice,
    EnableInput,
    OutputMap,
    InputMap,
    CaptureFormat,
    RenderFormat,
    Callback,
    Start,
}

/// What a hardware unit was configured with
#[derive(Debug, Clone, Default)]
pub struct UnitRecord {
    pub device: Option<DeviceId>,
    pub input_enabled: bool,
    pub output_map: Option<ChannelMap>,
    pub input_map: Option<ChannelMap>,
    pub formats: HashMap<StreamSide, StreamFormat>,
    pub gain: Option<Arc<GainState>>,
    pub started: bool,
    pub disposed: bool,
}

#[derive(Debug)]
struct PendingRate {
    rate: f64,
    polls_left: u32,
}

#[derive(Debug)]
struct State {
    available: bool,
    next_id: DeviceId,
    devices: BTreeMap<DeviceId, SimulatedDevice>,
    defaults: HashMap<DefaultRole, DeviceId>,
    pending_rates: HashMap<DeviceId, PendingRate>,
    rate_lag_polls: u32,
    reject_rate_changes: bool,
    fail_aggregate_creation: bool,
    fail_aggregate_member: Option<String>,
    fail_set_default: bool,
    fail_unit_step: Option<UnitStep>,
    listener: Option<DeviceChangeSignal>,
    units: Vec<Arc<Mutex<UnitRecord>>>,
    rate_changes: Vec<(DeviceId, f64)>,
}

impl State {
    fn id_for_uid(&self, uid: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|(_, device)| device.uid == uid)
            .map(|(id, _)| *id)
    }

    fn device(&self, id: DeviceId) -> HardwareResult<&SimulatedDevice> {
        self.devices.get(&id).ok_or(HardwareError::NoSuchDevice(id))
    }

    fn ensure_available(&self) -> HardwareResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(HardwareError::Unavailable("simulated subsystem offline".to_string()))
        }
    }

    fn first_output(&self) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|(_, d)| d.output_channels > 0 && d.aggregate.is_none())
            .map(|(id, _)| *id)
    }

    fn notify(&self) {
        if let Some(listener) = &self.listener {
            listener.raise();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated OS audio subsystem
#[derive(Debug, Clone)]
pub struct SimulatedHardware {
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                available: true,
                next_id: FIRST_DEVICE_ID,
                devices: BTreeMap::new(),
                defaults: HashMap::new(),
                pending_rates: HashMap::new(),
                rate_lag_polls: 0,
                reject_rate_changes: false,
                fail_aggregate_creation: false,
                fail_aggregate_member: None,
                fail_set_default: false,
                fail_unit_step: None,
                listener: None,
                units: Vec::new(),
                rate_changes: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Connect a device. The first output device becomes both defaults.
    pub fn plug(&self, device: SimulatedDevice) -> DeviceId {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        debug!("simulated plug: {} '{}' ({})", id, device.name, device.uid);
        let is_output = device.output_channels > 0;
        state.devices.insert(id, device);
        if is_output {
            for role in DefaultRole::ALL {
                state.defaults.entry(role).or_insert(id);
            }
        }
        state.notify();
        id
    }

    /// Disconnect a device by UID. Defaults that pointed at it fall back to the
    /// first remaining output, as the OS does.
    pub fn unplug(&self, uid: &str) -> bool {
        let mut state = self.state();
        let Some(id) = state.id_for_uid(uid) else {
            return false;
        };
        debug!("simulated unplug: {} ({})", id, uid);
        state.devices.remove(&id);
        state.pending_rates.remove(&id);
        let fallback = state.first_output();
        for role in DefaultRole::ALL {
            if state.defaults.get(&role) == Some(&id) {
                match fallback {
                    Some(f) => {
                        state.defaults.insert(role, f);
                    }
                    None => {
                        state.defaults.remove(&role);
                    }
                }
            }
        }
        state.notify();
        true
    }

    /// Insert a composite as if left behind by a previous process
    pub fn plug_stale_aggregate(&self, uid: &str, capture_uid: &str, output_uid: &str) -> DeviceId {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        let spec = CompositeDeviceSpec::new(uid, "Stale Aggregate", capture_uid, output_uid);
        state.devices.insert(
            id,
            SimulatedDevice {
                name: spec.name.clone(),
                uid: uid.to_string(),
                input_channels: 2,
                output_channels: 2,
                volume_elements: Vec::new(),
                sample_rate: DEFAULT_SAMPLE_RATE,
                aggregate: Some(spec),
            },
        );
        id
    }

    /// Assign fresh handles to every device, as can happen across sleep
    pub fn renumber(&self) {
        let mut state = self.state();
        let old = std::mem::take(&mut state.devices);
        let mut remap = HashMap::new();
        for (old_id, device) in old {
            let new_id = state.next_id;
            state.next_id += 1;
            remap.insert(old_id, new_id);
            state.devices.insert(new_id, device);
        }
        for id in state.defaults.values_mut() {
            if let Some(new_id) = remap.get(id) {
                *id = *new_id;
            }
        }
        state.pending_rates = std::mem::take(&mut state.pending_rates)
            .into_iter()
            .filter_map(|(id, pending)| remap.get(&id).map(|new_id| (*new_id, pending)))
            .collect();
    }

    /// Fire the device-list listener `count` times, as the OS does per plug event
    pub fn raise_device_change(&self, count: usize) {
        let state = self.state();
        for _ in 0..count {
            state.notify();
        }
    }

    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Rate changes take effect after this many reads of the rate property
    pub fn set_rate_lag(&self, polls: u32) {
        self.state().rate_lag_polls = polls;
    }

    pub fn set_reject_rate_changes(&self, reject: bool) {
        self.state().reject_rate_changes = reject;
    }

    pub fn set_fail_aggregate_creation(&self, fail: bool) {
        self.state().fail_aggregate_creation = fail;
    }

    /// Reject composites that include the device with this UID
    pub fn set_fail_aggregate_with(&self, member_uid: Option<&str>) {
        self.state().fail_aggregate_member = member_uid.map(str::to_string);
    }

    pub fn set_fail_set_default(&self, fail: bool) {
        self.state().fail_set_default = fail;
    }

    pub fn fail_unit_step(&self, step: Option<UnitStep>) {
        self.state().fail_unit_step = step;
    }

    pub fn device_id(&self, uid: &str) -> Option<DeviceId> {
        self.state().id_for_uid(uid)
    }

    pub fn device(&self, uid: &str) -> Option<SimulatedDevice> {
        let state = self.state();
        state.id_for_uid(uid).and_then(|id| state.devices.get(&id).cloned())
    }

    pub fn current_default(&self, role: DefaultRole) -> Option<DeviceId> {
        self.state().defaults.get(&role).copied()
    }

    /// Force a default without going through the trait (setup for crash scenarios)
    pub fn force_default(&self, role: DefaultRole, id: DeviceId) {
        self.state().defaults.insert(role, id);
    }

    pub fn aggregate_count(&self, uid: &str) -> usize {
        self.state()
            .devices
            .values()
            .filter(|d| d.aggregate.is_some() && d.uid == uid)
            .count()
    }

    pub fn aggregate_spec(&self, uid: &str) -> Option<CompositeDeviceSpec> {
        self.state()
            .devices
            .values()
            .find(|d| d.uid == uid)
            .and_then(|d| d.aggregate.clone())
    }

    /// Rate change requests made through the trait, in order
    pub fn rate_changes(&self) -> Vec<(DeviceId, f64)> {
        self.state().rate_changes.clone()
    }

    pub fn units_created(&self) -> usize {
        self.state().units.len()
    }

    /// Configuration of the most recently created hardware unit
    pub fn last_unit(&self) -> Option<UnitRecord> {
        let state = self.state();
        state.units.last().map(|record| lock(record).clone())
    }

    /// Units that were started and are not yet disposed
    pub fn live_unit_count(&self) -> usize {
        let state = self.state();
        state
            .units
            .iter()
            .filter(|record| {
                let record = lock(record);
                record.started && !record.disposed
            })
            .count()
    }

    /// Run one hardware period through the running unit's callback.
    /// Returns false when no unit is running.
    pub fn render_period(&self, left: &mut [f32], right: &mut [f32]) -> bool {
        let gain = {
            let state = self.state();
            let running = state.units.iter().rev().find_map(|record| {
                let record = lock(record);
                let present = record
                    .device
                    .map(|id| state.devices.contains_key(&id))
                    .unwrap_or(false);
                if record.started && !record.disposed && present {
                    record.gain.clone()
                } else {
                    None
                }
            });
            match running {
                Some(gain) => gain,
                None => return false,
            }
        };
        process_period([left, right], &gain);
        true
    }
}

impl AudioHardware for SimulatedHardware {
    fn device_ids(&self) -> HardwareResult<Vec<DeviceId>> {
        let state = self.state();
        state.ensure_available()?;
        Ok(state.devices.keys().copied().collect())
    }

    fn device_uid(&self, id: DeviceId) -> HardwareResult<String> {
        Ok(self.state().device(id)?.uid.clone())
    }

    fn device_name(&self, id: DeviceId) -> HardwareResult<String> {
        Ok(self.state().device(id)?.name.clone())
    }

    fn channel_count(&self, id: DeviceId, scope: Scope) -> HardwareResult<u32> {
        let state = self.state();
        let device = state.device(id)?;
        Ok(match scope {
            Scope::Input => device.input_channels,
            Scope::Output => device.output_channels,
        })
    }

    fn has_output_streams(&self, id: DeviceId) -> bool {
        self.state()
            .devices
            .get(&id)
            .map(|d| d.output_channels > 0)
            .unwrap_or(false)
    }

    fn has_volume_property(&self, id: DeviceId, element: u32) -> bool {
        self.state()
            .devices
            .get(&id)
            .map(|d| d.volume_elements.contains(&element))
            .unwrap_or(false)
    }

    fn nominal_sample_rate(&self, id: DeviceId) -> HardwareResult<f64> {
        let mut state = self.state();
        state.device(id)?;
        let mut applied = None;
        if let Some(pending) = state.pending_rates.get_mut(&id) {
            if pending.polls_left == 0 {
                applied = Some(pending.rate);
            } else {
                pending.polls_left -= 1;
            }
        }
        if let Some(rate) = applied {
            state.pending_rates.remove(&id);
            if let Some(device) = state.devices.get_mut(&id) {
                device.sample_rate = rate;
            }
        }
        Ok(state.device(id)?.sample_rate)
    }

    fn set_nominal_sample_rate(&self, id: DeviceId, rate: f64) -> HardwareResult<()> {
        let mut state = self.state();
        state.device(id)?;
        state.rate_changes.push((id, rate));
        if state.reject_rate_changes {
            return Err(HardwareError::Status {
                operation: "set nominal sample rate",
                status: STATUS_REJECTED,
            });
        }
        let lag = state.rate_lag_polls;
        if lag == 0 {
            if let Some(device) = state.devices.get_mut(&id) {
                device.sample_rate = rate;
            }
        } else {
            state.pending_rates.insert(
                id,
                PendingRate {
                    rate,
                    polls_left: lag,
                },
            );
        }
        Ok(())
    }

    fn default_device(&self, role: DefaultRole) -> HardwareResult<DeviceId> {
        let state = self.state();
        state.ensure_available()?;
        state.defaults.get(&role).copied().ok_or(HardwareError::Status {
            operation: "get default device",
            status: STATUS_BAD_DEVICE,
        })
    }

    fn set_default_device(&self, role: DefaultRole, id: DeviceId) -> HardwareResult<()> {
        let mut state = self.state();
        if state.fail_set_default {
            return Err(HardwareError::Status {
                operation: "set default device",
                status: STATUS_REJECTED,
            });
        }
        let device = state.device(id)?;
        if device.output_channels == 0 {
            return Err(HardwareError::Status {
                operation: "set default device",
                status: STATUS_BAD_DEVICE,
            });
        }
        state.defaults.insert(role, id);
        Ok(())
    }

    fn translate_uid(&self, uid: &str) -> Option<DeviceId> {
        self.state().id_for_uid(uid)
    }

    fn create_aggregate(&self, spec: &CompositeDeviceSpec) -> HardwareResult<DeviceId> {
        let mut state = self.state();
        let rejected = HardwareError::Status {
            operation: "AudioHardwareCreateAggregateDevice",
            status: STATUS_REJECTED,
        };
        let member_rejected = state
            .fail_aggregate_member
            .as_deref()
            .is_some_and(|uid| uid == spec.capture_uid || uid == spec.output_uid);
        if state.fail_aggregate_creation || member_rejected {
            return Err(rejected);
        }
        let (Some(capture_id), Some(output_id)) = (
            state.id_for_uid(&spec.capture_uid),
            state.id_for_uid(&spec.output_uid),
        ) else {
            return Err(rejected);
        };
        let capture = state.device(capture_id)?.clone();
        let output = state.device(output_id)?.clone();

        let id = state.next_id;
        state.next_id += 1;
        state.devices.insert(
            id,
            SimulatedDevice {
                name: spec.name.clone(),
                uid: spec.uid.clone(),
                input_channels: capture.input_channels + output.input_channels,
                output_channels: capture.output_channels + output.output_channels,
                volume_elements: Vec::new(),
                sample_rate: output.sample_rate,
                aggregate: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    fn destroy_aggregate(&self, id: DeviceId) -> HardwareResult<()> {
        let mut state = self.state();
        match state.devices.get(&id) {
            Some(device) if device.aggregate.is_some() => {
                state.devices.remove(&id);
                Ok(())
            }
            Some(_) => Err(HardwareError::Status {
                operation: "AudioHardwareDestroyAggregateDevice",
                status: STATUS_REJECTED,
            }),
            None => Err(HardwareError::NoSuchDevice(id)),
        }
    }

    fn watch_device_list(&self, signal: DeviceChangeSignal) -> HardwareResult<()> {
        let mut state = self.state();
        state.ensure_available()?;
        state.listener = Some(signal);
        Ok(())
    }

    fn unwatch_device_list(&self) {
        self.state().listener = None;
    }

    fn new_io_unit(&self) -> HardwareResult<Box<dyn IoUnit>> {
        let mut state = self.state();
        state.ensure_available()?;
        if state.fail_unit_step == Some(UnitStep::Create) {
            return Err(step_failure(UnitStep::Create));
        }
        let record = Arc::new(Mutex::new(UnitRecord::default()));
        state.units.push(record.clone());
        Ok(Box::new(SimulatedUnit {
            state: self.state.clone(),
            record,
        }))
    }
}

fn step_failure(step: UnitStep) -> HardwareError {
    HardwareError::Status {
        operation: match step {
            UnitStep::Create => "AudioComponentInstanceNew",
            UnitStep::SetDevice => "set current device",
            UnitStep::EnableInput => "enable input",
            UnitStep::OutputMap => "set output channel map",
            UnitStep::InputMap => "set input channel map",
            UnitStep::CaptureFormat => "set capture stream format",
            UnitStep::RenderFormat => "set render stream format",
            UnitStep::Callback => "set render callback",
            UnitStep::Start => "AudioOutputUnitStart",
        },
        status: STATUS_REJECTED,
    }
}

struct SimulatedUnit {
    state: Arc<Mutex<State>>,
    record: Arc<Mutex<UnitRecord>>,
}

impl SimulatedUnit {
    fn check(&self, step: UnitStep) -> HardwareResult<()> {
        if lock(&self.state).fail_unit_step == Some(step) {
            Err(step_failure(step))
        } else {
            Ok(())
        }
    }
}

impl IoUnit for SimulatedUnit {
    fn set_current_device(&mut self, device: DeviceId) -> HardwareResult<()> {
        self.check(UnitStep::SetDevice)?;
        lock(&self.state).device(device)?;
        lock(&self.record).device = Some(device);
        Ok(())
    }

    fn enable_input(&mut self) -> HardwareResult<()> {
        self.check(UnitStep::EnableInput)?;
        lock(&self.record).input_enabled = true;
        Ok(())
    }

    fn set_channel_map(&mut self, scope: Scope, map: &ChannelMap) -> HardwareResult<()> {
        match scope {
            Scope::Output => {
                self.check(UnitStep::OutputMap)?;
                lock(&self.record).output_map = Some(map.clone());
            }
            Scope::Input => {
                self.check(UnitStep::InputMap)?;
                lock(&self.record).input_map = Some(map.clone());
            }
        }
        Ok(())
    }

    fn set_stream_format(&mut self, side: StreamSide, format: &StreamFormat) -> HardwareResult<()> {
        self.check(match side {
            StreamSide::Capture => UnitStep::CaptureFormat,
            StreamSide::Render => UnitStep::RenderFormat,
        })?;
        lock(&self.record).formats.insert(side, *format);
        Ok(())
    }

    fn install_render_callback(&mut self, gain: Arc<GainState>) -> HardwareResult<()> {
        self.check(UnitStep::Callback)?;
        lock(&self.record).gain = Some(gain);
        Ok(())
    }

    fn start(&mut self) -> HardwareResult<()> {
        self.check(UnitStep::Start)?;
        let device = lock(&self.record).device;
        match device {
            Some(id) => {
                lock(&self.state).device(id)?;
            }
            None => {
                return Err(HardwareError::Status {
                    operation: "AudioOutputUnitStart",
                    status: STATUS_BAD_DEVICE,
                })
            }
        }
        lock(&self.record).started = true;
        Ok(())
    }

    fn stop(&mut self) -> HardwareResult<()> {
        lock(&self.record).started = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        let record = lock(&self.record);
        let present = record
            .device
            .map(|id| lock(&self.state).devices.contains_key(&id))
            .unwrap_or(false);
        record.started && !record.disposed && present
    }
}

impl Drop for SimulatedUnit {
    fn drop(&mut self) {
        let mut record = lock(&self.record);
        record.started = false;
        record.disposed = true;
    }
}
