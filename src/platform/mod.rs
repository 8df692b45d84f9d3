// Platform integration outside the audio subsystem

#[cfg(target_os = "macos")]
pub mod macos;

use tokio::sync::mpsc;
use tracing::info;

use crate::engine::events::EngineEvent;

/// Keeps the OS wake notification source alive
pub struct WakeWatcher {
    #[cfg(target_os = "macos")]
    _inner: macos::wake::SystemPowerWatcher,
}

/// Forward system wake notifications into the engine queue as `EngineEvent::Wake`.
///
/// Returns `None` where the platform has no wake source or registration failed.
#[cfg(target_os = "macos")]
pub fn watch_wake(sender: mpsc::UnboundedSender<EngineEvent>) -> Option<WakeWatcher> {
    match macos::wake::SystemPowerWatcher::spawn(sender) {
        Ok(inner) => {
            info!("Watching for system wake");
            Some(WakeWatcher { _inner: inner })
        }
        Err(e) => {
            tracing::warn!("Wake notifications unavailable: {}", e);
            None
        }
    }
}

#[cfg(not(target_os = "macos"))]
pub fn watch_wake(_sender: mpsc::UnboundedSender<EngineEvent>) -> Option<WakeWatcher> {
    info!("No system wake source on this platform");
    None
}
