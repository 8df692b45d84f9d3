// Routing engine - orchestration of catalog, composite device and render session
//
// - router: the state machine and its event loop
// - events: inbound events/commands and outbound updates
// - state: routing lifecycle states
// - breadcrumb: crash-recovery record of the original OS defaults

pub mod breadcrumb;
pub mod events;
pub mod router;
pub mod state;

pub use breadcrumb::{Breadcrumb, BreadcrumbState, BreadcrumbStore};
pub use events::{EngineCommand, EngineEvent, EngineHandle, EngineUpdate};
pub use router::RoutingEngine;
pub use state::RoutingState;
