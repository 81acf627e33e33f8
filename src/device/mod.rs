//! Device connectivity
//!
//! WebSocket endpoint for ESP metering devices: connection registry, wire
//! frames, and the per-connection ingestion loop.

pub mod frames;
pub mod handler;
pub mod registry;

pub use frames::{CommandKind, DeviceCommand, DeviceFrame, OutboundFrame, RegisterAck};
pub use handler::device_ws_handler;
pub use registry::{DeviceRegistry, DeviceSender, RegisterError};
