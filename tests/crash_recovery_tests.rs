use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use volume_relay_lib::*;

const RESERVED: &str = "com.volumerelay.aggregate";

fn system() -> Arc<SimulatedHardware> {
    let hw = Arc::new(SimulatedHardware::new());
    hw.plug(SimulatedDevice::output("Speakers", "spk", 2).with_volume_control(0));
    hw.plug(SimulatedDevice::output("DELL Monitor", "mon", 2));
    hw.plug(SimulatedDevice::virtual_capture("VCap 16ch", "vcap", 16));
    hw
}

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        capture_device_name: "VCap".to_string(),
        breadcrumb_path: dir.path().join("state").join("relay.breadcrumb"),
        wake_settle_delay: Duration::ZERO,
        rate_settle_timeout: Duration::from_millis(100),
        rate_poll_interval: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

fn engine(hw: &Arc<SimulatedHardware>, config: &EngineConfig) -> RoutingEngine {
    let (engine, _events) =
        RoutingEngine::new(hw.clone(), config.clone(), Arc::new(GainState::default()));
    engine
}

fn both_defaults(hw: &SimulatedHardware) -> (Option<DeviceId>, Option<DeviceId>) {
    (
        hw.current_default(DefaultRole::Output),
        hw.current_default(DefaultRole::SystemOutput),
    )
}

fn write_breadcrumb(path: &PathBuf, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[cfg(test)]
mod crash_tests {
    use super::*;

    #[tokio::test]
    async fn test_next_run_restores_defaults_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let hw = system();
        let speakers = hw.device_id("spk").unwrap();
        let vcap = hw.device_id("vcap").unwrap();

        let mut crashed = engine(&hw, &config);
        crashed.startup(None).await.unwrap();
        // No destructors run on a crash: composite and redirect stay behind
        std::mem::forget(crashed);
        assert_eq!(both_defaults(&hw), (Some(vcap), Some(vcap)));
        assert!(config.breadcrumb_path.exists());
        assert_eq!(hw.aggregate_count(RESERVED), 1);

        let mut next = engine(&hw, &config);
        next.startup(None).await.unwrap();

        // Stale composite reclaimed, exactly one live composite
        assert_eq!(hw.aggregate_count(RESERVED), 1);
        // Breadcrumb rewritten with the real originals, not the capture device
        let crumb = std::fs::read_to_string(&config.breadcrumb_path).unwrap();
        assert_eq!(crumb, format!("{},{}", speakers, speakers));

        next.shutdown();
        assert_eq!(both_defaults(&hw), (Some(speakers), Some(speakers)));
        assert!(!config.breadcrumb_path.exists());
        assert_eq!(hw.aggregate_count(RESERVED), 0);
    }

    #[tokio::test]
    async fn test_crash_after_wake_restores_renumbered_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let hw = system();

        let mut crashed = engine(&hw, &config);
        crashed.startup(None).await.unwrap();
        hw.renumber();
        crashed.handle_event(EngineEvent::Wake).await;
        std::mem::forget(crashed);

        let speakers = hw.device_id("spk").unwrap();
        let mut next = engine(&hw, &config);
        next.startup(None).await.unwrap();
        next.shutdown();

        assert_eq!(both_defaults(&hw), (Some(speakers), Some(speakers)));
    }

    #[tokio::test]
    async fn test_stale_composite_is_reclaimed_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let hw = system();
        hw.plug_stale_aggregate(RESERVED, "vcap", "mon");
        hw.plug_stale_aggregate(RESERVED, "vcap", "spk");
        assert_eq!(hw.aggregate_count(RESERVED), 2);

        let mut engine = engine(&hw, &config);
        engine.startup(None).await.unwrap();

        assert_eq!(hw.aggregate_count(RESERVED), 1);
        assert_eq!(hw.aggregate_spec(RESERVED).unwrap().output_uid, "mon");
    }

    #[tokio::test]
    async fn test_foreign_aggregate_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let hw = system();
        hw.plug_stale_aggregate("com.someone.else", "vcap", "mon");

        let mut engine = engine(&hw, &config);
        engine.startup(None).await.unwrap();
        engine.shutdown();

        assert_eq!(hw.aggregate_count("com.someone.else"), 1);
    }
}

#[cfg(test)]
mod breadcrumb_file_tests {
    use super::*;

    #[tokio::test]
    async fn test_corrupt_breadcrumb_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let hw = system();
        let speakers = hw.device_id("spk").unwrap();
        write_breadcrumb(&config.breadcrumb_path, "not,a,breadcrumb");

        let mut engine = engine(&hw, &config);
        engine.startup(None).await.unwrap();

        let crumb = std::fs::read_to_string(&config.breadcrumb_path).unwrap();
        assert_eq!(crumb, format!("{},{}", speakers, speakers));

        engine.shutdown();
        assert_eq!(both_defaults(&hw), (Some(speakers), Some(speakers)));
    }

    #[tokio::test]
    async fn test_single_value_breadcrumb_restores_both_roles() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let hw = system();
        let monitor = hw.device_id("mon").unwrap();
        write_breadcrumb(&config.breadcrumb_path, &monitor.to_string());

        let mut engine = engine(&hw, &config);
        engine.startup(None).await.unwrap();
        engine.shutdown();

        assert_eq!(both_defaults(&hw), (Some(monitor), Some(monitor)));
    }

    #[tokio::test]
    async fn test_breadcrumb_naming_vanished_devices_does_not_block_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let hw = system();
        let speakers = hw.device_id("spk").unwrap();
        write_breadcrumb(&config.breadcrumb_path, "9001,9002");

        let mut engine = engine(&hw, &config);
        engine.startup(None).await.unwrap();
        assert_eq!(engine.state(), RoutingState::Routing);

        engine.shutdown();
        assert_eq!(both_defaults(&hw), (Some(speakers), Some(speakers)));
    }

    #[tokio::test]
    async fn test_failed_startup_leaves_no_breadcrumb_behind() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let hw = system();
        let speakers = hw.device_id("spk").unwrap();
        hw.set_fail_aggregate_creation(true);

        let mut engine = engine(&hw, &config);
        assert!(matches!(
            engine.startup(None).await,
            Err(EngineError::CreateFailed(_))
        ));

        assert!(!config.breadcrumb_path.exists());
        assert_eq!(both_defaults(&hw), (Some(speakers), Some(speakers)));
    }
}
