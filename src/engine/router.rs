//! Routing engine: the single owner of routing state.
//!
//! Drives `Idle → Routing → Degraded → Routing → Idle`. All transitions run on
//! the task draining the engine queue, one event at a time. Only startup
//! failures are fatal; failures triggered by device changes, output switches
//! or wake are logged and the engine keeps waiting for the next event.

use std::sync::Arc;

use colored::Colorize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::breadcrumb::{Breadcrumb, BreadcrumbState, BreadcrumbStore};
use super::events::{EngineCommand, EngineEvent, EngineHandle, EngineUpdate};
use super::state::RoutingState;
use crate::audio::devices::catalog::DeviceCatalog;
use crate::audio::devices::notifications::DeviceChangeSignal;
use crate::audio::hardware::AudioHardware;
use crate::audio::render::gain::GainState;
use crate::audio::render::session::RenderSession;
use crate::audio::types::{AudioDevice, DefaultRole, DeviceId, OutputChoice};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Defaults to put back at shutdown. Handles can be renumbered across sleep,
/// so the UIDs are kept alongside and win whenever they still resolve.
#[derive(Debug)]
struct SavedDefaults {
    handles: Breadcrumb,
    output_uid: Option<String>,
    system_output_uid: Option<String>,
}

impl SavedDefaults {
    fn capture(catalog: &DeviceCatalog, handles: Breadcrumb) -> Self {
        Self {
            output_uid: catalog.device_uid(handles.output),
            system_output_uid: catalog.device_uid(handles.system_output),
            handles,
        }
    }

    /// Current handles, falling back to the recorded ones
    fn resolve(&self, catalog: &DeviceCatalog) -> Breadcrumb {
        let current = |uid: &Option<String>, recorded: DeviceId| {
            uid.as_deref()
                .and_then(|uid| catalog.resolve_uid(uid))
                .unwrap_or(recorded)
        };
        Breadcrumb {
            output: current(&self.output_uid, self.handles.output),
            system_output: current(&self.system_output_uid, self.handles.system_output),
        }
    }
}

pub struct RoutingEngine {
    config: EngineConfig,
    catalog: DeviceCatalog,
    session: RenderSession,
    breadcrumbs: BreadcrumbStore,
    signal: DeviceChangeSignal,
    events: mpsc::UnboundedSender<EngineEvent>,
    updates: broadcast::Sender<EngineUpdate>,
    state: RoutingState,
    capture_uid: Option<String>,
    /// Current target output; in Degraded, the output to recover onto
    output_uid: Option<String>,
    saved_defaults: Option<SavedDefaults>,
}

impl RoutingEngine {
    /// Build an engine and the receiving end of its event queue
    pub fn new(
        hardware: Arc<dyn AudioHardware>,
        config: EngineConfig,
        gain: Arc<GainState>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let catalog = DeviceCatalog::new(
            hardware.clone(),
            &config.capture_device_name,
            &config.composite_uid,
        );
        let session = RenderSession::new(hardware, gain, &config);
        let breadcrumbs = BreadcrumbStore::new(config.breadcrumb_path.clone());
        let signal = DeviceChangeSignal::new(events.clone());

        let engine = Self {
            config,
            catalog,
            session,
            breadcrumbs,
            signal,
            events,
            updates,
            state: RoutingState::Idle,
            capture_uid: None,
            output_uid: None,
            saved_defaults: None,
        };
        (engine, receiver)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(self.events.clone(), self.updates.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    pub fn state(&self) -> RoutingState {
        self.state
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn gain(&self) -> &Arc<GainState> {
        self.session.gain()
    }

    pub fn output_uid(&self) -> Option<&str> {
        self.output_uid.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn sample_rate(&self) -> Option<f64> {
        self.session.sample_rate()
    }

    /// Eligible outputs as shown to the user
    pub fn outputs(&self) -> Vec<OutputChoice> {
        self.catalog
            .fixed_volume_outputs()
            .iter()
            .map(OutputChoice::from)
            .collect()
    }

    /// Idle → Routing. `preferred_output` is the persisted output UID, if any.
    ///
    /// On failure the defaults are restored, the breadcrumb removed, a `Fatal`
    /// update broadcast and the error returned; the engine stays Idle.
    pub async fn startup(&mut self, preferred_output: Option<&str>) -> Result<()> {
        if self.state != RoutingState::Idle {
            warn!("Startup requested while {}, ignoring", self.state);
            return Ok(());
        }

        match self.try_startup(preferred_output).await {
            Ok(()) => {
                self.set_state(RoutingState::Routing);
                self.emit_outputs();
                self.emit_gain();
                Ok(())
            }
            Err(e) => {
                error!("{} Startup failed: {}", "ENGINE_FATAL".bright_red(), e);
                self.session.stop();
                self.catalog.unwatch();
                self.restore_defaults();
                if let Err(remove_err) = self.breadcrumbs.remove() {
                    warn!("{}", remove_err);
                }
                self.capture_uid = None;
                self.output_uid = None;
                self.emit(EngineUpdate::Fatal(e.to_string()));
                Err(e)
            }
        }
    }

    async fn try_startup(&mut self, preferred_output: Option<&str>) -> Result<()> {
        info!("{} Starting routing engine", "ENGINE_START".bright_cyan());

        self.recover_breadcrumb()?;

        let reclaimed = self.session.composites().reclaim_stale();
        if reclaimed > 0 {
            info!("Reclaimed {} stale composite device(s)", reclaimed);
        }

        let capture = self
            .catalog
            .capture_device()
            .ok_or_else(|| EngineError::DeviceNotFound(self.config.capture_device_name.clone()))?;
        let output = self.choose_output(preferred_output)?;

        info!(
            "{} Capture '{}' ({} ch), output '{}' ({} ch)",
            "ENGINE_DEVICES".bright_blue(),
            capture.name,
            capture.output_channels,
            output.name,
            output.output_channels
        );

        let breadcrumb = self.capture_defaults(&capture, &output);
        self.breadcrumbs.write(&breadcrumb)?;
        self.saved_defaults = Some(SavedDefaults::capture(&self.catalog, breadcrumb));

        if !self.redirect_defaults(&capture) {
            return Err(EngineError::RedirectFailed(capture.name.clone()));
        }

        if let Err(e) = self.catalog.watch(self.signal.clone()) {
            warn!("Device change notifications unavailable: {}", e);
        }

        self.capture_uid = Some(capture.uid.clone());
        self.output_uid = Some(output.uid.clone());
        self.session.start(&capture, &output).await
    }

    /// Apply and delete a breadcrumb left by a run that did not shut down cleanly
    fn recover_breadcrumb(&mut self) -> Result<()> {
        match self.breadcrumbs.load()? {
            BreadcrumbState::Absent => return Ok(()),
            BreadcrumbState::Found(breadcrumb) => {
                warn!(
                    "{} Previous run did not shut down cleanly, restoring defaults {}",
                    "ENGINE_RECOVER".bright_magenta(),
                    breadcrumb
                );
                self.catalog.set_default_output(breadcrumb.output);
                self.catalog.set_default_system_output(breadcrumb.system_output);
            }
            BreadcrumbState::Corrupt(reason) => {
                warn!(
                    "{} Discarding unreadable breadcrumb {:?}: {}",
                    "ENGINE_RECOVER".bright_magenta(),
                    self.breadcrumbs.path(),
                    reason
                );
            }
        }
        self.breadcrumbs.remove()
    }

    fn choose_output(&self, preferred: Option<&str>) -> Result<AudioDevice> {
        let eligible = self.catalog.fixed_volume_outputs();

        if let Some(uid) = preferred {
            if let Some(device) = eligible.iter().find(|d| d.uid == uid) {
                return Ok(device.clone());
            }
            info!("Preferred output '{}' not available, using first eligible", uid);
        }

        eligible
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::DeviceNotFound("fixed-volume output device".to_string()))
    }

    /// Current defaults, to be restored at shutdown. A default that already
    /// points at the capture device (crash without breadcrumb) is replaced by
    /// the target output so the user is never left on a silent device.
    fn capture_defaults(&self, capture: &AudioDevice, output: &AudioDevice) -> Breadcrumb {
        let original = |role: DefaultRole| -> DeviceId {
            match self.catalog.default_device(role) {
                Some(id) if id != capture.id => id,
                Some(_) => {
                    warn!(
                        "{} default already routed to '{}', will restore to '{}'",
                        role.label(),
                        capture.name,
                        output.name
                    );
                    output.id
                }
                None => output.id,
            }
        };

        Breadcrumb {
            output: original(DefaultRole::Output),
            system_output: original(DefaultRole::SystemOutput),
        }
    }

    fn redirect_defaults(&self, capture: &AudioDevice) -> bool {
        let output = self.catalog.set_default_output(capture.id);
        let system = self.catalog.set_default_system_output(capture.id);
        output && system
    }

    /// Redirect again after recovery or wake; a failure is not fatal there
    fn reapply_redirect(&self, capture: &AudioDevice) {
        if !self.redirect_defaults(capture) {
            warn!(
                "{} {}",
                "ENGINE_WARN".bright_yellow(),
                EngineError::RedirectFailed(capture.name.clone())
            );
        }
    }

    /// Follow the saved defaults to their current handles and keep the
    /// breadcrumb in step, so a crash after sleep still restores them.
    fn refresh_saved_defaults(&mut self) {
        let Some(saved) = self.saved_defaults.as_mut() else {
            return;
        };
        let current = saved.resolve(&self.catalog);
        if current == saved.handles {
            return;
        }

        info!(
            "{} Saved default outputs moved {} -> {}",
            "ENGINE_RECOVER".bright_magenta(),
            saved.handles,
            current
        );
        saved.handles = current;
        if let Err(e) = self.breadcrumbs.write(&current) {
            warn!("{}", e);
        }
    }

    /// Put the saved defaults back. Failures are logged, not retried.
    fn restore_defaults(&mut self) {
        let Some(saved) = self.saved_defaults.take() else {
            return;
        };
        let saved = saved.resolve(&self.catalog);

        info!(
            "{} Restoring default outputs {}",
            "ENGINE_RESTORE".bright_green(),
            saved
        );
        if !self.catalog.set_default_output(saved.output) {
            warn!("{}", EngineError::RestoreFailed(saved.output));
        }
        if !self.catalog.set_default_system_output(saved.system_output) {
            warn!("{}", EngineError::RestoreFailed(saved.system_output));
        }
    }

    fn resolve(&self, uid: Option<&str>) -> Option<AudioDevice> {
        uid.and_then(|uid| self.catalog.find_by_uid(uid))
    }

    /// Re-evaluate after a device-set change
    pub async fn handle_devices_changed(&mut self) {
        // Acknowledge first so changes during re-evaluation queue a new event
        self.signal.acknowledge();
        self.refresh_saved_defaults();
        self.emit_outputs();
        self.reevaluate().await;
    }

    /// Reconcile routing with the devices currently present
    async fn reevaluate(&mut self) {
        if self.state == RoutingState::Idle {
            return;
        }

        let capture = self.resolve(self.capture_uid.as_deref());
        let output = self.resolve(self.output_uid.as_deref());

        match (capture, output) {
            (Some(capture), Some(output)) => {
                if self.state == RoutingState::Routing {
                    if self.session.is_running() {
                        debug!("Device set changed, routing unaffected");
                        return;
                    }
                    warn!(
                        "{} Hardware unit stopped by the OS, restarting",
                        "ENGINE_WARN".bright_yellow()
                    );
                } else {
                    info!(
                        "{} Devices are back, resuming routing",
                        "ENGINE_RECOVER".bright_magenta()
                    );
                    self.reapply_redirect(&capture);
                }
                self.restart_or_degrade(&capture, &output).await;
            }
            (capture, output) => {
                if self.state == RoutingState::Routing {
                    warn!(
                        "{} Lost {}{}, pausing routing",
                        "ENGINE_WARN".bright_yellow(),
                        if capture.is_none() { "capture device " } else { "" },
                        if output.is_none() { "output device" } else { "" }
                    );
                    self.session.stop();
                    self.set_state(RoutingState::Degraded);
                }
            }
        }
    }

    async fn restart_or_degrade(&mut self, capture: &AudioDevice, output: &AudioDevice) {
        match self.session.restart(capture, output).await {
            Ok(()) => self.set_state(RoutingState::Routing),
            Err(e) => {
                warn!("{} Restart failed: {}", "ENGINE_WARN".bright_yellow(), e);
                self.session.stop();
                self.set_state(RoutingState::Degraded);
            }
        }
    }

    /// Switch the routing target to the output with `uid`
    pub async fn select_output(&mut self, uid: &str) {
        if self.output_uid.as_deref() == Some(uid) {
            debug!("Output '{}' already selected", uid);
            return;
        }

        let Some(output) = self
            .catalog
            .find_by_uid(uid)
            .filter(|device| self.catalog.is_routing_target(device))
        else {
            warn!("Output '{}' is not an eligible routing target", uid);
            return;
        };

        info!(
            "{} Selecting output '{}'",
            "ENGINE_OUTPUT".bright_cyan(),
            output.name
        );
        let previous = self.output_uid.replace(uid.to_string());
        self.emit(EngineUpdate::OutputSelected(uid.to_string()));

        match self.state {
            RoutingState::Idle => {}
            RoutingState::Degraded => {
                // Recorded; recover right away if the capture device is present
                self.reevaluate().await;
            }
            RoutingState::Routing => {
                let Some(capture) = self.resolve(self.capture_uid.as_deref()) else {
                    self.session.stop();
                    self.set_state(RoutingState::Degraded);
                    return;
                };

                match self.session.restart(&capture, &output).await {
                    Ok(()) => self.emit_outputs(),
                    Err(e) => {
                        warn!(
                            "{} Could not route to '{}': {}",
                            "ENGINE_WARN".bright_yellow(),
                            output.name,
                            e
                        );
                        self.fall_back_to(previous, &capture).await;
                    }
                }
            }
        }
    }

    async fn fall_back_to(&mut self, previous: Option<String>, capture: &AudioDevice) {
        let Some(previous) = self.resolve(previous.as_deref()) else {
            self.session.stop();
            self.set_state(RoutingState::Degraded);
            return;
        };

        match self.session.restart(capture, &previous).await {
            Ok(()) => {
                info!("Reverted to previous output '{}'", previous.name);
                self.output_uid = Some(previous.uid.clone());
                self.emit(EngineUpdate::OutputSelected(previous.uid));
                self.emit_outputs();
            }
            Err(e) => {
                warn!(
                    "{} Previous output failed too: {}",
                    "ENGINE_WARN".bright_yellow(),
                    e
                );
                self.session.stop();
                self.set_state(RoutingState::Degraded);
            }
        }
    }

    /// Rebuild routing after sleep, once the audio subsystem has settled
    pub async fn handle_wake(&mut self) {
        if self.state == RoutingState::Idle {
            return;
        }

        info!(
            "{} System woke, waiting {:?} before re-routing",
            "ENGINE_WAKE".bright_blue(),
            self.config.wake_settle_delay
        );
        tokio::time::sleep(self.config.wake_settle_delay).await;
        self.refresh_saved_defaults();

        let (Some(capture), Some(output)) = (
            self.resolve(self.capture_uid.as_deref()),
            self.resolve(self.output_uid.as_deref()),
        ) else {
            warn!(
                "{} Devices not found after wake",
                "ENGINE_WARN".bright_yellow()
            );
            return;
        };

        self.reapply_redirect(&capture);
        match self.session.restart(&capture, &output).await {
            Ok(()) => {
                info!("Routing restarted after wake");
                self.set_state(RoutingState::Routing);
            }
            Err(e) => warn!(
                "{} Failed to restart after wake: {}",
                "ENGINE_WARN".bright_yellow(),
                e
            ),
        }
    }

    pub fn handle_command(&mut self, command: &EngineCommand) {
        let gain = self.session.gain().clone();
        match command {
            EngineCommand::SetVolume(volume) => {
                gain.set_volume(*volume);
                gain.set_muted(false);
            }
            EngineCommand::SetMuted(muted) => gain.set_muted(*muted),
            EngineCommand::ToggleMute => {
                gain.toggle_muted();
            }
            EngineCommand::StepVolume { up } => {
                if *up && gain.is_muted() {
                    gain.set_muted(false);
                } else {
                    let step = if *up {
                        self.config.volume_step
                    } else {
                        -self.config.volume_step
                    };
                    gain.step_volume(step);
                }
            }
            EngineCommand::SelectOutput(_) | EngineCommand::Quit => return,
        }
        self.emit_gain();
    }

    /// Process one queued event. Returns false when the engine should stop.
    pub async fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::DevicesChanged => self.handle_devices_changed().await,
            EngineEvent::Wake => self.handle_wake().await,
            EngineEvent::Command(EngineCommand::Quit) => return false,
            EngineEvent::Command(EngineCommand::SelectOutput(uid)) => self.select_output(&uid).await,
            EngineEvent::Command(command) => self.handle_command(&command),
        }
        true
    }

    /// Drain the queue until `Quit`, then shut down
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        self.shutdown();
    }

    /// → Idle from any state: stop routing, restore defaults, drop the breadcrumb
    pub fn shutdown(&mut self) {
        info!("{} Shutting down routing engine", "ENGINE_STOP".bright_yellow());

        self.session.stop();
        self.catalog.unwatch();
        self.restore_defaults();
        if let Err(e) = self.breadcrumbs.remove() {
            warn!("{}", e);
        }
        self.set_state(RoutingState::Idle);
    }

    fn set_state(&mut self, state: RoutingState) {
        if self.state != state {
            info!("Routing state: {} -> {}", self.state, state);
            self.state = state;
            self.emit(EngineUpdate::State(state));
        }
    }

    fn emit_gain(&self) {
        self.emit(EngineUpdate::Gain(self.session.gain().snapshot()));
    }

    fn emit_outputs(&self) {
        self.emit(EngineUpdate::Outputs {
            devices: self.outputs(),
            active: self.output_uid.clone(),
        });
    }

    fn emit(&self, update: EngineUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}
