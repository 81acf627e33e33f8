//! WattSwap - Peer-to-Peer Energy Trading Backend
//!
//! Coordinates physical energy transfers between sellers and buyers. ESP
//! metering devices stream telemetry over WebSockets; trades settled on the
//! blockchain ledger are delivered as metered energy and recorded durably.
//!
//! # Modules
//!
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing setup (rolling file + stdout)
//! - [`device`] - device registry, wire frames, WebSocket ingestion loop
//! - [`transfer`] - transfer coordinator, durable ledger store, recovery
//! - [`gateway`] - shared state for the axum gateway

pub mod config;
pub mod device;
pub mod gateway;
pub mod logging;
pub mod transfer;

// Convenient re-exports at crate root
pub use device::{DeviceCommand, DeviceFrame, DeviceRegistry};
pub use gateway::AppState;
pub use transfer::{
    TransferCoordinator, TransferError, TransferRecord, TransferStatus, TransferStore,
    recover_in_flight,
};
