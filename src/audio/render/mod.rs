// Render path: channel maps, shared gain state, the real-time callback body
// and the session that owns the live hardware unit.

pub mod callback;
pub mod channel_map;
pub mod gain;
pub mod session;

pub use channel_map::{ChannelMap, ChannelSlot};
pub use gain::{GainSnapshot, GainState};
pub use session::RenderSession;
