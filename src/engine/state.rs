use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of the routing engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingState {
    /// Not routing; OS defaults are untouched
    Idle,
    /// Render session running between capture and output device
    Routing,
    /// A required device is missing; waiting for it to come back
    Degraded,
}

impl fmt::Display for RoutingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoutingState::Idle => "idle",
            RoutingState::Routing => "routing",
            RoutingState::Degraded => "degraded",
        };
        f.write_str(label)
    }
}
