//! Startup recovery
//!
//! Reloads transfer records left IN_PROGRESS by a prior run and re-arms them
//! in the coordinator before the server accepts new connections. Devices are
//! not contacted; this only restores bookkeeping so that resumed telemetry or
//! the fresh timeout can finalize each transfer correctly.

use std::sync::Arc;
use tracing::{info, warn};

use super::coordinator::TransferCoordinator;
use super::error::TransferError;
use super::store::TransferStore;

/// Restore all IN_PROGRESS transfers into the coordinator
///
/// Each restored transfer gets a full-duration timeout; the restart resets
/// the clock. Returns the number of transfers restored.
pub async fn recover_in_flight(
    coordinator: &Arc<TransferCoordinator>,
    store: &Arc<dyn TransferStore>,
) -> Result<usize, TransferError> {
    let in_progress = store.find_all_in_progress().await?;

    if in_progress.is_empty() {
        info!("No in-flight transfers to recover");
        return Ok(0);
    }

    info!(count = in_progress.len(), "Recovering in-flight transfers");

    let mut restored = 0;
    for record in &in_progress {
        match coordinator.restore_transfer(record) {
            Ok(info) => {
                info!(
                    device_id = %record.device_id,
                    record_id = record.id,
                    accumulated = info.accumulated_amount,
                    target = info.target_amount,
                    "Transfer restored"
                );
                restored += 1;
            }
            Err(e) => {
                // Two IN_PROGRESS rows for one device can only come from a
                // finalize whose durable write was lost; keep the first
                warn!(
                    device_id = %record.device_id,
                    record_id = record.id,
                    error = %e,
                    "Skipping unrecoverable record"
                );
            }
        }
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registry::DeviceRegistry;
    use crate::transfer::status::TransferStatus;
    use crate::transfer::store::MemoryTransferStore;
    use std::time::Duration;

    fn harness() -> (
        Arc<TransferCoordinator>,
        Arc<MemoryTransferStore>,
        Arc<dyn TransferStore>,
    ) {
        let store = Arc::new(MemoryTransferStore::new());
        let store_dyn: Arc<dyn TransferStore> = store.clone();
        let registry = Arc::new(DeviceRegistry::new());
        let coordinator = TransferCoordinator::new(
            store_dyn.clone(),
            registry,
            Duration::from_secs(60),
        );
        (coordinator, store, store_dyn)
    }

    #[tokio::test]
    async fn test_recovery_restores_and_telemetry_completes() {
        let (coordinator, store, store_dyn) = harness();
        store.set_quota("esp-01", 200.0);

        // A prior run left this record IN_PROGRESS at 30 of 100 kWh
        let id = store
            .create_in_progress("esp-01", "0xabc", 100.0)
            .await
            .unwrap();
        let mut record = store.record(id).unwrap();
        record.amount = 30.0;

        let restored = coordinator.restore_transfer(&record).unwrap();
        assert_eq!(restored.accumulated_amount, 30.0);

        // Resumed telemetry finalizes against the restored entry
        coordinator.report_telemetry("esp-01", 100.0).await;

        let record = store.record(id).unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.amount, 100.0);
        drop(store_dyn);
    }

    #[tokio::test]
    async fn test_recover_in_flight_counts_and_skips_duplicates() {
        let (coordinator, store, store_dyn) = harness();

        store
            .create_in_progress("esp-01", "0xaaa", 100.0)
            .await
            .unwrap();
        store
            .create_in_progress("esp-02", "0xbbb", 50.0)
            .await
            .unwrap();
        // Duplicate device: only the first row is restored
        store
            .create_in_progress("esp-01", "0xccc", 70.0)
            .await
            .unwrap();

        let restored = recover_in_flight(&coordinator, &store_dyn).await.unwrap();
        assert_eq!(restored, 2);
        assert!(coordinator.is_active("esp-01"));
        assert!(coordinator.is_active("esp-02"));
    }

    #[tokio::test]
    async fn test_recover_with_empty_store() {
        let (coordinator, _store, store_dyn) = harness();
        let restored = recover_in_flight(&coordinator, &store_dyn).await.unwrap();
        assert_eq!(restored, 0);
        assert!(coordinator.active_snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_transfer_times_out_with_fresh_clock() {
        let (coordinator, store, store_dyn) = harness();

        let id = store
            .create_in_progress("esp-01", "0xaaa", 100.0)
            .await
            .unwrap();
        let restored = recover_in_flight(&coordinator, &store_dyn).await.unwrap();
        assert_eq!(restored, 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(store.record(id).unwrap().status, TransferStatus::Failed);
        assert!(!coordinator.is_active("esp-01"));
    }
}
