//! Live render session: one hardware I/O unit bound to one composite device.
//!
//! Start order is rate negotiation, composite creation, then unit
//! configuration. A failure at any step tears down whatever was already
//! built, so a failed start never leaves a composite or a unit behind.

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channel_map::ChannelMap;
use super::gain::GainState;
use crate::audio::devices::aggregate_device::{CompositeDevice, CompositeDeviceManager};
use crate::audio::hardware::{AudioHardware, IoUnit};
use crate::audio::types::{AudioDevice, Scope, StreamFormat, StreamSide};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Rates closer than this are treated as equal
const RATE_TOLERANCE_HZ: f64 = 0.5;

struct ActiveSession {
    unit: Box<dyn IoUnit>,
    composite: CompositeDevice,
    sample_rate: f64,
    output_map: ChannelMap,
}

pub struct RenderSession {
    hardware: Arc<dyn AudioHardware>,
    composites: CompositeDeviceManager,
    gain: Arc<GainState>,
    rate_settle_timeout: Duration,
    rate_poll_interval: Duration,
    active: Option<ActiveSession>,
}

impl RenderSession {
    pub fn new(hardware: Arc<dyn AudioHardware>, gain: Arc<GainState>, config: &EngineConfig) -> Self {
        let composites =
            CompositeDeviceManager::new(hardware.clone(), &config.composite_uid, &config.composite_name);
        Self {
            hardware,
            composites,
            gain,
            rate_settle_timeout: config.rate_settle_timeout,
            rate_poll_interval: config.rate_poll_interval,
            active: None,
        }
    }

    pub fn gain(&self) -> &Arc<GainState> {
        &self.gain
    }

    pub fn composites(&self) -> &CompositeDeviceManager {
        &self.composites
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Sample rate both composite members were negotiated to
    pub fn sample_rate(&self) -> Option<f64> {
        self.active.as_ref().map(|a| a.sample_rate)
    }

    pub fn output_map(&self) -> Option<&ChannelMap> {
        self.active.as_ref().map(|a| &a.output_map)
    }

    /// The unit's running flag as reported by the OS. False when no session is active.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.unit.is_running())
            .unwrap_or(false)
    }

    /// Build and start the session. An already active session is stopped first.
    pub async fn start(&mut self, capture: &AudioDevice, output: &AudioDevice) -> Result<()> {
        if self.active.is_some() {
            self.stop();
        }

        info!(
            "{} Starting render session: '{}' -> '{}'",
            "RENDER_START".bright_cyan(),
            capture.name,
            output.name
        );

        let sample_rate = self.negotiate_sample_rate(capture, output).await?;
        let mut composite = self.composites.create(&capture.uid, &output.uid)?;

        match self.configure_unit(&composite, capture, output, sample_rate) {
            Ok((unit, output_map)) => {
                info!(
                    "{} Render session running at {} Hz on composite {} (output map {})",
                    "RENDER_RUNNING".bright_green(),
                    sample_rate,
                    composite.id,
                    output_map
                );
                self.active = Some(ActiveSession {
                    unit,
                    composite,
                    sample_rate,
                    output_map,
                });
                Ok(())
            }
            Err(e) => {
                warn!(
                    "{} Render session failed, tearing down composite: {}",
                    "RENDER_ERROR".bright_red(),
                    e
                );
                if let Err(destroy_err) = self.composites.destroy(&mut composite) {
                    warn!("Composite cleanup after failed start: {}", destroy_err);
                }
                Err(e)
            }
        }
    }

    /// Stop and dispose the unit, then destroy the composite. Idempotent.
    pub fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        info!(
            "{} Stopping render session on composite {}",
            "RENDER_STOP".bright_yellow(),
            active.composite.id
        );

        if let Err(e) = active.unit.stop() {
            warn!("Hardware unit stop failed: {}", e);
        }
        // Disposes the unit before its device goes away
        drop(active.unit);

        if let Err(e) = self.composites.destroy(&mut active.composite) {
            warn!(
                "{} Composite {} could not be destroyed: {}",
                "RENDER_WARN".bright_yellow(),
                active.composite.id,
                e
            );
        }
    }

    pub async fn restart(&mut self, capture: &AudioDevice, output: &AudioDevice) -> Result<()> {
        self.stop();
        self.start(capture, output).await
    }

    /// Align the output device's nominal rate with the capture device's.
    ///
    /// Returns the output's rate after the attempt. A rejected or slow change is
    /// not fatal: drift compensation on the capture member covers the gap.
    async fn negotiate_sample_rate(&self, capture: &AudioDevice, output: &AudioDevice) -> Result<f64> {
        let capture_rate = self.hardware.nominal_sample_rate(capture.id)?;
        let output_rate = self.hardware.nominal_sample_rate(output.id)?;

        if (capture_rate - output_rate).abs() < RATE_TOLERANCE_HZ {
            return Ok(output_rate);
        }

        info!(
            "{} Aligning '{}' from {} Hz to {} Hz",
            "RENDER_RATE".bright_blue(),
            output.name,
            output_rate,
            capture_rate
        );

        if let Err(e) = self.hardware.set_nominal_sample_rate(output.id, capture_rate) {
            warn!(
                "{} '{}' rejected {} Hz, continuing at {} Hz: {}",
                "RENDER_WARN".bright_yellow(),
                output.name,
                capture_rate,
                output_rate,
                e
            );
            return Ok(output_rate);
        }

        let deadline = Instant::now() + self.rate_settle_timeout;
        loop {
            let current = self.hardware.nominal_sample_rate(output.id)?;
            if (current - capture_rate).abs() < RATE_TOLERANCE_HZ {
                debug!("'{}' settled at {} Hz", output.name, current);
                return Ok(current);
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} '{}' did not reach {} Hz within {:?}, continuing at {} Hz",
                    "RENDER_WARN".bright_yellow(),
                    output.name,
                    capture_rate,
                    self.rate_settle_timeout,
                    current
                );
                return Ok(current);
            }
            tokio::time::sleep(self.rate_poll_interval).await;
        }
    }

    /// Configure and start a fresh unit on the composite. On error the
    /// partially configured unit is dropped, which disposes it.
    fn configure_unit(
        &self,
        composite: &CompositeDevice,
        capture: &AudioDevice,
        output: &AudioDevice,
        sample_rate: f64,
    ) -> Result<(Box<dyn IoUnit>, ChannelMap)> {
        let mut unit = self
            .hardware
            .new_io_unit()
            .map_err(EngineError::unit("create unit"))?;

        unit.set_current_device(composite.id)
            .map_err(EngineError::unit("bind composite"))?;
        unit.enable_input().map_err(EngineError::unit("enable input"))?;

        let output_map = ChannelMap::for_output(capture.output_channels, output.output_channels);
        unit.set_channel_map(Scope::Output, &output_map)
            .map_err(EngineError::unit("output channel map"))?;

        let composite_inputs = self
            .hardware
            .channel_count(composite.id, Scope::Input)
            .unwrap_or(capture.input_channels + output.input_channels);
        let input_map = ChannelMap::for_input(composite_inputs);
        unit.set_channel_map(Scope::Input, &input_map)
            .map_err(EngineError::unit("input channel map"))?;

        let format = StreamFormat::float_stereo(sample_rate);
        unit.set_stream_format(StreamSide::Capture, &format)
            .map_err(EngineError::unit("capture format"))?;
        unit.set_stream_format(StreamSide::Render, &format)
            .map_err(EngineError::unit("render format"))?;

        unit.install_render_callback(self.gain.clone())
            .map_err(EngineError::unit("render callback"))?;
        unit.start().map_err(EngineError::unit("start"))?;

        Ok((unit, output_map))
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::catalog::DeviceCatalog;
    use crate::audio::devices::simulated::{SimulatedDevice, SimulatedHardware, UnitStep};
    use crate::audio::render::channel_map::ChannelSlot;

    fn config() -> EngineConfig {
        EngineConfig {
            rate_settle_timeout: Duration::from_millis(200),
            rate_poll_interval: Duration::ZERO,
            ..EngineConfig::default()
        }
    }

    struct Rig {
        hw: Arc<SimulatedHardware>,
        capture: AudioDevice,
        output: AudioDevice,
        session: RenderSession,
    }

    fn rig_with(output: SimulatedDevice, config: EngineConfig) -> Rig {
        let hw = Arc::new(SimulatedHardware::new());
        hw.plug(SimulatedDevice::virtual_capture("VCap", "vcap", 16));
        hw.plug(output.clone());
        let catalog = DeviceCatalog::new(hw.clone(), "VCap", &config.composite_uid);
        let capture = catalog.capture_device().unwrap();
        let output = catalog.find_by_uid(&output.uid).unwrap();
        let session = RenderSession::new(hw.clone(), Arc::new(GainState::default()), &config);
        Rig {
            hw,
            capture,
            output,
            session,
        }
    }

    fn rig() -> Rig {
        rig_with(SimulatedDevice::output("Mon", "mon", 2), config())
    }

    #[tokio::test]
    async fn test_start_configures_unit_and_stop_cleans_up() {
        let mut rig = rig();
        rig.session.start(&rig.capture, &rig.output).await.unwrap();

        assert!(rig.session.is_running());
        assert_eq!(rig.hw.aggregate_count(&config().composite_uid), 1);

        let unit = rig.hw.last_unit().unwrap();
        assert!(unit.input_enabled);
        let output_map = unit.output_map.unwrap();
        assert_eq!(output_map.len(), 18);
        assert_eq!(output_map.slots()[16], ChannelSlot::Logical(0));
        assert_eq!(output_map.slots()[17], ChannelSlot::Logical(1));
        assert_eq!(
            unit.formats.get(&StreamSide::Capture),
            Some(&StreamFormat::float_stereo(48_000.0))
        );
        assert_eq!(
            unit.formats.get(&StreamSide::Render),
            Some(&StreamFormat::float_stereo(48_000.0))
        );

        rig.session.stop();
        rig.session.stop();
        assert!(!rig.session.is_running());
        assert_eq!(rig.hw.aggregate_count(&config().composite_uid), 0);
        assert_eq!(rig.hw.live_unit_count(), 0);
    }

    #[tokio::test]
    async fn test_every_unit_step_failure_unwinds() {
        let steps = [
            UnitStep::Create,
            UnitStep::SetDevice,
            UnitStep::EnableInput,
            UnitStep::OutputMap,
            UnitStep::InputMap,
            UnitStep::CaptureFormat,
            UnitStep::RenderFormat,
            UnitStep::Callback,
            UnitStep::Start,
        ];

        for step in steps {
            let mut rig = rig();
            rig.hw.fail_unit_step(Some(step));

            let result = rig.session.start(&rig.capture, &rig.output).await;
            assert!(
                matches!(result, Err(EngineError::UnitConfigFailed { .. })),
                "{:?} should fail the start",
                step
            );
            assert!(!rig.session.is_active());
            assert_eq!(rig.hw.aggregate_count(&config().composite_uid), 0, "{:?}", step);
            assert_eq!(rig.hw.live_unit_count(), 0, "{:?}", step);
        }
    }

    #[tokio::test]
    async fn test_composite_rejection_is_create_failed() {
        let mut rig = rig();
        rig.hw.set_fail_aggregate_creation(true);

        let result = rig.session.start(&rig.capture, &rig.output).await;
        assert!(matches!(result, Err(EngineError::CreateFailed(_))));
        assert_eq!(rig.hw.units_created(), 0);
    }

    #[tokio::test]
    async fn test_output_rate_follows_capture() {
        let mut rig = rig_with(
            SimulatedDevice::output("Mon", "mon", 2).with_sample_rate(44_100.0),
            config(),
        );
        rig.hw.set_rate_lag(3);

        rig.session.start(&rig.capture, &rig.output).await.unwrap();
        assert_eq!(rig.session.sample_rate(), Some(48_000.0));
        assert_eq!(rig.hw.rate_changes(), vec![(rig.output.id, 48_000.0)]);
    }

    #[tokio::test]
    async fn test_rejected_rate_change_proceeds_at_output_rate() {
        let mut rig = rig_with(
            SimulatedDevice::output("Mon", "mon", 2).with_sample_rate(44_100.0),
            config(),
        );
        rig.hw.set_reject_rate_changes(true);

        rig.session.start(&rig.capture, &rig.output).await.unwrap();
        assert_eq!(rig.session.sample_rate(), Some(44_100.0));
        assert!(rig.session.is_running());
    }

    #[tokio::test]
    async fn test_rate_settle_timeout_proceeds_at_actual_rate() {
        let mut rig = rig_with(
            SimulatedDevice::output("Mon", "mon", 2).with_sample_rate(44_100.0),
            EngineConfig {
                rate_settle_timeout: Duration::ZERO,
                ..config()
            },
        );
        rig.hw.set_rate_lag(u32::MAX);

        rig.session.start(&rig.capture, &rig.output).await.unwrap();
        assert_eq!(rig.session.sample_rate(), Some(44_100.0));
    }

    #[tokio::test]
    async fn test_mono_output_maps_only_left() {
        let mut rig = rig_with(SimulatedDevice::output("Mono", "mono", 1), config());
        rig.session.start(&rig.capture, &rig.output).await.unwrap();

        let map = rig.session.output_map().unwrap();
        assert_eq!(map.len(), 17);
        assert_eq!(map.slots()[16], ChannelSlot::Logical(0));
    }

    #[tokio::test]
    async fn test_gain_reaches_render_path() {
        let mut rig = rig();
        rig.session.start(&rig.capture, &rig.output).await.unwrap();
        rig.session.gain().set_volume(0.5);

        let mut left = vec![1.0f32; 32];
        let mut right = vec![1.0f32; 32];
        assert!(rig.hw.render_period(&mut left, &mut right));
        assert!(left.iter().chain(right.iter()).all(|s| *s == 0.5));
    }
}
