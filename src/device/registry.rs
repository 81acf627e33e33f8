//! Device connection registry
//!
//! Maps registered device IDs to their live WebSocket senders using DashMap
//! for concurrent access. Unlike user-facing push channels, a metering device
//! gets exactly one connection: a second REGISTER for the same ID is rejected
//! and the original connection stays authoritative.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::frames::{DeviceCommand, OutboundFrame};

/// Device sender channel type
pub type DeviceSender = mpsc::UnboundedSender<OutboundFrame>;

/// Unique connection identifier
pub type ConnectionId = u64;

/// Registration outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    AlreadyRegistered,
}

/// Device connection registry
pub struct DeviceRegistry {
    /// device_id -> (connection_id, sender)
    devices: DashMap<String, (ConnectionId, DeviceSender)>,
    /// Next connection ID
    next_conn_id: AtomicU64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a device connection
    ///
    /// Returns the unique connection ID on success. Fails if the device ID is
    /// already mapped to a live connection; the existing mapping is untouched.
    pub fn register(
        &self,
        device_id: &str,
        tx: DeviceSender,
    ) -> Result<ConnectionId, RegisterError> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        // Entry API keeps check-and-insert atomic across connections
        match self.devices.entry(device_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::warn!(device_id, "Duplicate registration rejected");
                Err(RegisterError::AlreadyRegistered)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((conn_id, tx));
                tracing::info!(device_id, conn_id, "Device registered");
                Ok(conn_id)
            }
        }
    }

    /// Look up the live sender for a device, if connected
    pub fn lookup(&self, device_id: &str) -> Option<DeviceSender> {
        self.devices.get(device_id).map(|entry| entry.1.clone())
    }

    /// Remove a device mapping on connection close or error
    ///
    /// Idempotent. The connection ID must match the registered one so that a
    /// rejected duplicate closing cannot evict the original connection.
    pub fn unregister(&self, device_id: &str, conn_id: ConnectionId) {
        let removed = self
            .devices
            .remove_if(device_id, |_, (registered_id, _)| *registered_id == conn_id);

        if removed.is_some() {
            tracing::info!(device_id, conn_id, "Device unregistered");
        }
    }

    /// Send a command to a device, best-effort
    ///
    /// Returns false if the device is not connected or the channel is closed.
    /// Commands are not queued for offline devices.
    pub fn send(&self, device_id: &str, command: DeviceCommand) -> bool {
        match self.devices.get(device_id) {
            Some(entry) => {
                if entry.1.send(OutboundFrame::Command(command)).is_err() {
                    tracing::warn!(device_id, "Failed to send - device disconnected");
                    false
                } else {
                    true
                }
            }
            None => {
                tracing::debug!(device_id, "Command dropped - device not connected");
                false
            }
        }
    }

    /// IDs of all currently connected devices
    pub fn active_devices(&self) -> Vec<String> {
        self.devices.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of connected devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
