//! Messages into and out of the routing engine.
//!
//! Everything that can change engine state arrives as an [`EngineEvent`] on
//! one unbounded queue, so transitions are serialized. Collaborators (front
//! end, OSD, preference store) observe the engine through [`EngineUpdate`]s
//! on a broadcast channel.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use super::state::RoutingState;
use crate::audio::render::gain::GainSnapshot;
use crate::audio::types::OutputChoice;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The OS device set changed; re-query, never diff
    DevicesChanged,
    /// The system woke from sleep
    Wake,
    Command(EngineCommand),
}

/// Requests from the UI or media keys
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Set volume (clamped) and unmute
    SetVolume(f32),
    SetMuted(bool),
    ToggleMute,
    StepVolume { up: bool },
    /// Route to the output device with this UID
    SelectOutput(String),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineUpdate {
    Gain(GainSnapshot),
    Outputs {
        devices: Vec<OutputChoice>,
        active: Option<String>,
    },
    /// The user's output choice changed; persist it
    OutputSelected(String),
    State(RoutingState),
    Fatal(String),
}

/// Cloneable handle for feeding the engine and observing it
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: mpsc::UnboundedSender<EngineEvent>,
    updates: broadcast::Sender<EngineUpdate>,
}

impl EngineHandle {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<EngineEvent>,
        updates: broadcast::Sender<EngineUpdate>,
    ) -> Self {
        Self { events, updates }
    }

    /// Enqueue an event. Returns false once the engine has shut down.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn command(&self, command: EngineCommand) -> bool {
        self.send(EngineEvent::Command(command))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    /// Raw sender for OS notification bridges
    pub fn sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.events.clone()
    }
}
