use std::sync::Arc;

use crate::device::registry::DeviceRegistry;
use crate::transfer::coordinator::TransferCoordinator;
use crate::transfer::store::TransferStore;

/// Shared application state for gateway handlers
#[derive(Clone)]
pub struct AppState {
    /// Live device connections
    pub registry: Arc<DeviceRegistry>,
    /// Active transfer table and finalization
    pub coordinator: Arc<TransferCoordinator>,
    /// Durable transfer ledger
    pub store: Arc<dyn TransferStore>,
}

impl AppState {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        coordinator: Arc<TransferCoordinator>,
        store: Arc<dyn TransferStore>,
    ) -> Self {
        Self {
            registry,
            coordinator,
            store,
        }
    }
}
