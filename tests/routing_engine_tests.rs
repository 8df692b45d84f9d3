use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use volume_relay_lib::*;

const RESERVED: &str = "com.volumerelay.aggregate";

struct Harness {
    hw: Arc<SimulatedHardware>,
    engine: RoutingEngine,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    config: EngineConfig,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let hw = Arc::new(SimulatedHardware::new());
        hw.plug(SimulatedDevice::output("Speakers", "spk", 2).with_volume_control(0));
        hw.plug(SimulatedDevice::output("DELL Monitor", "mon", 2));
        hw.plug(SimulatedDevice::virtual_capture("VCap 16ch", "vcap", 16));
        Self::with_hardware(hw)
    }

    fn with_hardware(hw: Arc<SimulatedHardware>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            capture_device_name: "VCap".to_string(),
            composite_uid: RESERVED.to_string(),
            breadcrumb_path: dir.path().join("relay.breadcrumb"),
            wake_settle_delay: Duration::ZERO,
            rate_settle_timeout: Duration::from_millis(100),
            rate_poll_interval: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let (engine, events) =
            RoutingEngine::new(hw.clone(), config.clone(), Arc::new(GainState::default()));
        Self {
            hw,
            engine,
            events,
            config,
            _dir: dir,
        }
    }

    fn id(&self, uid: &str) -> DeviceId {
        self.hw.device_id(uid).unwrap()
    }

    fn defaults(&self) -> (Option<DeviceId>, Option<DeviceId>) {
        (
            self.hw.current_default(DefaultRole::Output),
            self.hw.current_default(DefaultRole::SystemOutput),
        )
    }
}

fn drain_updates(rx: &mut broadcast::Receiver<EngineUpdate>) -> Vec<EngineUpdate> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[cfg(test)]
mod startup_tests {
    use super::*;

    #[tokio::test]
    #[serial]
    async fn test_startup_redirects_defaults_and_routes() {
        let mut h = Harness::new();
        let speakers = h.id("spk");
        let vcap = h.id("vcap");

        h.engine.startup(None).await.unwrap();

        assert_eq!(h.engine.state(), RoutingState::Routing);
        assert_eq!(h.engine.output_uid(), Some("mon"));
        assert!(h.engine.is_running());
        assert_eq!(h.defaults(), (Some(vcap), Some(vcap)));
        assert_eq!(h.hw.aggregate_count(RESERVED), 1);

        let crumb = std::fs::read_to_string(&h.config.breadcrumb_path).unwrap();
        assert_eq!(crumb, format!("{},{}", speakers, speakers));
    }

    #[tokio::test]
    #[serial]
    async fn test_shutdown_restores_defaults_and_cleans_up() {
        let mut h = Harness::new();
        let speakers = h.id("spk");
        h.engine.startup(None).await.unwrap();

        h.engine.shutdown();

        assert_eq!(h.engine.state(), RoutingState::Idle);
        assert_eq!(h.defaults(), (Some(speakers), Some(speakers)));
        assert!(!h.config.breadcrumb_path.exists());
        assert_eq!(h.hw.aggregate_count(RESERVED), 0);
        assert_eq!(h.hw.live_unit_count(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_preferred_output_used_when_eligible() {
        let hw = Arc::new(SimulatedHardware::new());
        hw.plug(SimulatedDevice::output("DELL Monitor", "mon", 2));
        hw.plug(SimulatedDevice::output("LG Monitor", "lg", 2));
        hw.plug(SimulatedDevice::virtual_capture("VCap 16ch", "vcap", 16));
        let mut h = Harness::with_hardware(hw);

        h.engine.startup(Some("lg")).await.unwrap();
        assert_eq!(h.engine.output_uid(), Some("lg"));
    }

    #[tokio::test]
    #[serial]
    async fn test_ineligible_preference_falls_back_to_first_eligible() {
        let mut h = Harness::new();

        // Speakers have hardware volume and are never a routing target
        h.engine.startup(Some("spk")).await.unwrap();
        assert_eq!(h.engine.output_uid(), Some("mon"));
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_capture_device_is_fatal() {
        let hw = Arc::new(SimulatedHardware::new());
        let speakers = hw.plug(SimulatedDevice::output("Speakers", "spk", 2).with_volume_control(0));
        hw.plug(SimulatedDevice::output("DELL Monitor", "mon", 2));
        let mut h = Harness::with_hardware(hw);
        let mut updates = h.engine.subscribe();

        let result = h.engine.startup(None).await;

        assert!(matches!(result, Err(EngineError::DeviceNotFound(_))));
        assert_eq!(h.engine.state(), RoutingState::Idle);
        assert_eq!(h.defaults(), (Some(speakers), Some(speakers)));
        assert!(!h.config.breadcrumb_path.exists());
        assert!(drain_updates(&mut updates)
            .iter()
            .any(|u| matches!(u, EngineUpdate::Fatal(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_unit_failure_at_startup_restores_everything() {
        let mut h = Harness::new();
        let speakers = h.id("spk");
        h.hw.fail_unit_step(Some(volume_relay_lib::audio::devices::simulated::UnitStep::Start));

        let result = h.engine.startup(None).await;

        assert!(matches!(result, Err(EngineError::UnitConfigFailed { .. })));
        assert_eq!(h.defaults(), (Some(speakers), Some(speakers)));
        assert!(!h.config.breadcrumb_path.exists());
        assert_eq!(h.hw.aggregate_count(RESERVED), 0);
        assert_eq!(h.hw.live_unit_count(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_redirect_failure_is_fatal() {
        let mut h = Harness::new();
        h.hw.set_fail_set_default(true);

        let result = h.engine.startup(None).await;
        assert!(matches!(result, Err(EngineError::RedirectFailed(_))));
        assert!(!h.config.breadcrumb_path.exists());
        assert_eq!(h.hw.aggregate_count(RESERVED), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_default_already_on_capture_restores_to_output() {
        let mut h = Harness::new();
        let vcap = h.id("vcap");
        let mon = h.id("mon");
        h.hw.force_default(DefaultRole::Output, vcap);
        h.hw.force_default(DefaultRole::SystemOutput, vcap);

        h.engine.startup(None).await.unwrap();
        h.engine.shutdown();

        assert_eq!(h.defaults(), (Some(mon), Some(mon)));
    }

    #[tokio::test]
    #[serial]
    async fn test_quit_through_event_loop_shuts_down() {
        let mut h = Harness::new();
        let speakers = h.id("spk");
        h.engine.startup(None).await.unwrap();

        let handle = h.engine.handle();
        handle.command(EngineCommand::SetVolume(0.5));
        handle.command(EngineCommand::Quit);
        let gain = h.engine.gain().clone();
        h.engine.run(h.events).await;

        assert_eq!(gain.volume(), 0.5);
        assert_eq!(
            h.hw.current_default(DefaultRole::Output),
            Some(speakers)
        );
        assert_eq!(h.hw.aggregate_count(RESERVED), 0);
    }
}

#[cfg(test)]
mod gain_command_tests {
    use super::*;

    async fn routed() -> Harness {
        let mut h = Harness::new();
        h.engine.startup(None).await.unwrap();
        h
    }

    #[tokio::test]
    async fn test_set_volume_clamps_and_unmutes() {
        let mut h = routed().await;
        h.engine.handle_command(&EngineCommand::SetMuted(true));

        h.engine.handle_command(&EngineCommand::SetVolume(1.7));

        let snapshot = h.engine.gain().snapshot();
        assert_eq!(snapshot.volume, 1.0);
        assert!(!snapshot.muted);
    }

    #[tokio::test]
    async fn test_step_up_while_muted_only_unmutes() {
        let mut h = routed().await;
        h.engine.handle_command(&EngineCommand::SetVolume(0.5));
        h.engine.handle_command(&EngineCommand::SetMuted(true));

        h.engine.handle_command(&EngineCommand::StepVolume { up: true });

        let snapshot = h.engine.gain().snapshot();
        assert!(!snapshot.muted);
        assert_eq!(snapshot.volume, 0.5);
    }

    #[tokio::test]
    async fn test_step_moves_by_configured_step() {
        let mut h = routed().await;
        h.engine.handle_command(&EngineCommand::SetVolume(0.5));

        h.engine.handle_command(&EngineCommand::StepVolume { up: false });
        assert_eq!(h.engine.gain().volume(), 0.5 - h.config.volume_step);

        h.engine.handle_command(&EngineCommand::StepVolume { up: true });
        h.engine.handle_command(&EngineCommand::StepVolume { up: true });
        assert_eq!(h.engine.gain().volume(), 0.5 + h.config.volume_step);
    }

    #[tokio::test]
    async fn test_gain_updates_are_broadcast_and_applied_live() {
        let mut h = routed().await;
        let mut updates = h.engine.subscribe();

        h.engine.handle_command(&EngineCommand::SetVolume(0.25));
        h.engine.handle_command(&EngineCommand::ToggleMute);

        let gains: Vec<_> = drain_updates(&mut updates)
            .into_iter()
            .filter_map(|u| match u {
                EngineUpdate::Gain(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect();
        assert_eq!(
            gains,
            vec![
                GainSnapshot {
                    volume: 0.25,
                    muted: false
                },
                GainSnapshot {
                    volume: 0.25,
                    muted: true
                },
            ]
        );

        let mut left = vec![0.8f32; 16];
        let mut right = vec![0.8f32; 16];
        assert!(h.hw.render_period(&mut left, &mut right));
        assert!(left.iter().chain(right.iter()).all(|s| *s == 0.0));
    }
}

#[cfg(test)]
mod output_selection_tests {
    use super::*;

    async fn routed_with_two_monitors() -> Harness {
        let mut h = Harness::new();
        h.hw.plug(SimulatedDevice::output("LG Monitor", "lg", 2));
        h.engine.startup(Some("mon")).await.unwrap();
        h
    }

    #[tokio::test]
    async fn test_select_output_restarts_on_new_device() {
        let mut h = routed_with_two_monitors().await;
        let mut updates = h.engine.subscribe();

        h.engine.select_output("lg").await;

        assert_eq!(h.engine.output_uid(), Some("lg"));
        assert_eq!(h.engine.state(), RoutingState::Routing);
        assert!(h.engine.is_running());
        assert_eq!(h.hw.aggregate_count(RESERVED), 1);
        assert_eq!(h.hw.aggregate_spec(RESERVED).unwrap().output_uid, "lg");
        assert!(drain_updates(&mut updates)
            .contains(&EngineUpdate::OutputSelected("lg".to_string())));
    }

    #[tokio::test]
    async fn test_select_same_or_ineligible_output_is_ignored() {
        let mut h = routed_with_two_monitors().await;
        let units = h.hw.units_created();

        h.engine.select_output("mon").await;
        h.engine.select_output("spk").await;
        h.engine.select_output("vcap").await;
        h.engine.select_output("missing").await;

        assert_eq!(h.engine.output_uid(), Some("mon"));
        assert_eq!(h.hw.units_created(), units);
    }

    #[tokio::test]
    async fn test_failed_switch_falls_back_to_previous_output() {
        let mut h = routed_with_two_monitors().await;
        h.hw.set_fail_aggregate_with(Some("lg"));

        h.engine.select_output("lg").await;

        assert_eq!(h.engine.state(), RoutingState::Routing);
        assert_eq!(h.engine.output_uid(), Some("mon"));
        assert!(h.engine.is_running());
        assert_eq!(h.hw.aggregate_spec(RESERVED).unwrap().output_uid, "mon");
    }

    #[tokio::test]
    async fn test_switch_and_fallback_both_failing_degrades() {
        let mut h = routed_with_two_monitors().await;
        h.hw.set_fail_aggregate_creation(true);

        h.engine.select_output("lg").await;

        assert_eq!(h.engine.state(), RoutingState::Degraded);
        assert!(!h.engine.is_running());
        assert_eq!(h.hw.aggregate_count(RESERVED), 0);
    }
}
