//! Transfer Coordinator
//!
//! Owns the in-memory table of active energy transfers, keyed by device ID.
//! Telemetry updates the matching entry; crossing the target or hitting the
//! timeout finalizes the transfer against the durable ledger and commands the
//! device to stop.
//!
//! # At-most-once finalize
//!
//! Both the telemetry path and the timeout path funnel into `finalize`. The
//! first caller to flip the entry from ACTIVE to FINALIZING under the table
//! mutex wins; the loser sees FINALIZING (or no entry at all) and returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::device::frames::DeviceCommand;
use crate::device::registry::DeviceRegistry;

use super::error::TransferError;
use super::store::{TransferRecord, TransferStore};

/// Per-device finalization phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Finalizing,
}

/// Finalization outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

/// One in-flight energy transfer
struct ActiveTransfer {
    record_id: i64,
    target_amount: f64,
    /// Latest cumulative reading from the device. The reported value is
    /// authoritative, not a delta; decreases are accepted as-is.
    accumulated_amount: f64,
    ledger_reference: String,
    started_at: chrono::DateTime<chrono::Utc>,
    phase: Phase,
    /// Exactly one live timeout per active transfer
    expiry_handle: Option<tokio::task::JoinHandle<()>>,
}

/// Snapshot of an active transfer for monitoring queries
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveTransferInfo {
    pub device_id: String,
    pub target_amount: f64,
    pub accumulated_amount: f64,
    /// Milliseconds since epoch
    pub started_at: i64,
}

/// Transfer Coordinator - tracks and finalizes in-flight transfers
pub struct TransferCoordinator {
    store: Arc<dyn TransferStore>,
    registry: Arc<DeviceRegistry>,
    timeout: Duration,
    active: Mutex<HashMap<String, ActiveTransfer>>,
    /// Self-reference handed to timeout tasks; weak so a dropped
    /// coordinator takes its timers down with it
    this: Weak<TransferCoordinator>,
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<dyn TransferStore>,
        registry: Arc<DeviceRegistry>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            registry,
            timeout,
            active: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Open a new active transfer for a device
    ///
    /// Fails with `AlreadyActive` if the device already has one; the existing
    /// transfer is untouched. The caller has already written the IN_PROGRESS
    /// record and is responsible for commanding the device to start.
    pub fn begin_transfer(
        &self,
        device_id: &str,
        target_amount: f64,
        record_id: i64,
        ledger_reference: &str,
    ) -> Result<ActiveTransferInfo, TransferError> {
        self.insert_transfer(device_id, target_amount, 0.0, record_id, ledger_reference)
    }

    /// Re-create an active transfer from a durable record left IN_PROGRESS
    ///
    /// Used by startup recovery. Seeds the accumulated amount from the record
    /// and arms a fresh full-duration timeout; the restart resets the clock.
    pub fn restore_transfer(
        &self,
        record: &TransferRecord,
    ) -> Result<ActiveTransferInfo, TransferError> {
        self.insert_transfer(
            &record.device_id,
            record.target_amount,
            record.amount,
            record.id,
            &record.ledger_reference,
        )
    }

    fn insert_transfer(
        &self,
        device_id: &str,
        target_amount: f64,
        accumulated_amount: f64,
        record_id: i64,
        ledger_reference: &str,
    ) -> Result<ActiveTransferInfo, TransferError> {
        let mut table = self.active.lock().unwrap();

        if table.contains_key(device_id) {
            return Err(TransferError::AlreadyActive(device_id.to_string()));
        }

        let this = self.this.clone();
        let device = device_id.to_string();
        let timeout = self.timeout;
        let expiry_handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(coordinator) = this.upgrade() else {
                return;
            };
            warn!(device_id = %device, "Transfer timeout elapsed");
            // cancel_timer=false: aborting our own task here would cancel
            // the durable write at its first await
            coordinator.finalize(&device, Outcome::Failed, false).await;
        });

        let started_at = chrono::Utc::now();
        table.insert(
            device_id.to_string(),
            ActiveTransfer {
                record_id,
                target_amount,
                accumulated_amount,
                ledger_reference: ledger_reference.to_string(),
                started_at,
                phase: Phase::Active,
                expiry_handle: Some(expiry_handle),
            },
        );

        info!(
            device_id,
            record_id, target_amount, accumulated_amount, "Transfer opened"
        );

        Ok(ActiveTransferInfo {
            device_id: device_id.to_string(),
            target_amount,
            accumulated_amount,
            started_at: started_at.timestamp_millis(),
        })
    }

    /// Apply one telemetry reading
    ///
    /// A reading for a device with no active transfer is a benign race (late
    /// frame, or a device with no initiated trade) and is dropped after
    /// logging. Crossing the target finalizes the transfer as COMPLETED.
    pub async fn report_telemetry(&self, device_id: &str, reported_amount: f64) {
        let target_reached = {
            let mut table = self.active.lock().unwrap();
            match table.get_mut(device_id) {
                None => {
                    debug!(device_id, reported_amount, "Orphan telemetry dropped");
                    return;
                }
                Some(entry) if entry.phase == Phase::Finalizing => {
                    debug!(device_id, reported_amount, "Telemetry during finalize ignored");
                    return;
                }
                Some(entry) => {
                    entry.accumulated_amount = reported_amount;
                    entry.accumulated_amount >= entry.target_amount
                }
            }
        };

        if target_reached {
            self.finalize(device_id, Outcome::Completed, true).await;
        }
    }

    /// Finalize a transfer: stop the device, write the outcome, drop the entry
    ///
    /// No-op if the transfer is already finalizing or gone. The in-memory
    /// entry is removed even when the durable update fails; the stuck
    /// IN_PROGRESS record is reconciled by recovery at next startup.
    async fn finalize(&self, device_id: &str, outcome: Outcome, cancel_timer: bool) {
        let (record_id, accumulated, ledger_reference, duration_ms) = {
            let mut table = self.active.lock().unwrap();
            let entry = match table.get_mut(device_id) {
                None => return,
                Some(entry) if entry.phase == Phase::Finalizing => return,
                Some(entry) => entry,
            };

            entry.phase = Phase::Finalizing;
            if cancel_timer {
                if let Some(handle) = entry.expiry_handle.take() {
                    handle.abort();
                }
            }

            let duration_ms = (chrono::Utc::now() - entry.started_at)
                .num_milliseconds()
                .max(0);
            (
                entry.record_id,
                entry.accumulated_amount,
                entry.ledger_reference.clone(),
                duration_ms,
            )
        };

        // Best-effort: completion is driven by telemetry and the timeout,
        // never by acknowledgment of this command
        let reason = match outcome {
            Outcome::Completed => "target reached",
            Outcome::Failed => "transfer timed out",
        };
        self.registry
            .send(device_id, DeviceCommand::stop(device_id, reason));

        let result = match outcome {
            Outcome::Completed => {
                self.store
                    .mark_completed(record_id, device_id, accumulated, duration_ms)
                    .await
            }
            Outcome::Failed => self.store.mark_failed(record_id, accumulated).await,
        };

        match &result {
            Ok(()) => info!(
                device_id,
                record_id,
                outcome = ?outcome,
                amount = accumulated,
                duration_ms,
                ledger_ref = %ledger_reference,
                "Transfer finalized"
            ),
            Err(e) => error!(
                device_id,
                record_id,
                outcome = ?outcome,
                error = %e,
                "Durable update failed during finalize; dropping in-memory entry"
            ),
        }

        // Guaranteed cleanup so the slot never stays stuck for this device
        self.active.lock().unwrap().remove(device_id);
    }

    /// Snapshot of all active transfers for monitoring tooling
    pub fn active_snapshot(&self) -> Vec<ActiveTransferInfo> {
        let table = self.active.lock().unwrap();
        table
            .iter()
            .map(|(device_id, entry)| ActiveTransferInfo {
                device_id: device_id.clone(),
                target_amount: entry.target_amount,
                accumulated_amount: entry.accumulated_amount,
                started_at: entry.started_at.timestamp_millis(),
            })
            .collect()
    }

    /// Whether a device currently has an active transfer
    pub fn is_active(&self, device_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(device_id)
    }
}
