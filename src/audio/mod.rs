// Audio module - device layer and render path of the routing engine
//
// - types: device snapshots, roles and stream formats
// - hardware: capability traits over the OS audio subsystem
// - devices: catalog, composite devices, notifications and backends
// - render: gain state, channel maps and the render session

pub mod devices;
pub mod hardware;
pub mod render;
pub mod types;

pub use hardware::{AudioHardware, HardwareError, HardwareResult, IoUnit};
pub use types::{AudioDevice, DefaultRole, DeviceId, OutputChoice, Scope, StreamFormat, StreamSide};
