use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Global flag to control verbose device enumeration logging
pub static DEVICE_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

const DEFAULT_FILTER: &str = "volume_relay=info,volume_relay_lib=info";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // A subscriber may already be installed when embedded or under test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Set device debug logging on/off
pub fn set_device_debug(enabled: bool) {
    DEVICE_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    tracing::info!(
        "Device debug logging {}",
        if enabled { "ENABLED" } else { "DISABLED" }
    );
}

/// Device debug macro - only emits if device debug is enabled
#[macro_export]
macro_rules! device_debug {
    ($($arg:tt)*) => {
        if $crate::log::DEVICE_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!($($arg)*);
        }
    };
}
