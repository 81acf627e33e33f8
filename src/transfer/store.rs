//! Transfer ledger persistence
//!
//! PostgreSQL-backed store for durable transfer records. The in-memory
//! active-transfer table is a working set only; these records are the source
//! of truth across restarts.
//!
//! All status updates are guarded with `WHERE status = IN_PROGRESS` so a
//! record can reach a terminal status at most once. COMPLETED and the seller
//! quota decrement are applied in a single transaction.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::error::TransferError;
use super::status::TransferStatus;

/// One durable transfer record
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: i64,
    pub device_id: String,
    /// Latest accumulated energy (kWh); final amount once terminal
    pub amount: f64,
    /// Energy the transfer must deliver before completion (kWh)
    pub target_amount: f64,
    /// Blockchain settlement transaction hash
    pub ledger_reference: String,
    pub status: TransferStatus,
    /// Wall-clock duration, present on COMPLETED
    pub duration_ms: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Durable store consumed by the coordinator and recovery routine
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Create a new IN_PROGRESS record, returning its ID
    async fn create_in_progress(
        &self,
        device_id: &str,
        ledger_reference: &str,
        target_amount: f64,
    ) -> Result<i64, TransferError>;

    /// Mark a record COMPLETED and decrement the seller's available quota
    ///
    /// Both effects are applied together or neither.
    async fn mark_completed(
        &self,
        record_id: i64,
        device_id: &str,
        final_amount: f64,
        duration_ms: i64,
    ) -> Result<(), TransferError>;

    /// Mark a record FAILED (quota untouched)
    async fn mark_failed(&self, record_id: i64, final_amount: f64) -> Result<(), TransferError>;

    /// All records still IN_PROGRESS, for startup recovery
    async fn find_all_in_progress(&self) -> Result<Vec<TransferRecord>, TransferError>;
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

pub struct PgTransferStore {
    pool: PgPool,
}

impl PgTransferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables if they do not exist
    pub async fn ensure_schema(&self) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers_tb (
                id              BIGSERIAL PRIMARY KEY,
                device_id       TEXT NOT NULL,
                amount          DOUBLE PRECISION NOT NULL DEFAULT 0,
                target_amount   DOUBLE PRECISION NOT NULL,
                ledger_ref      TEXT NOT NULL,
                status          SMALLINT NOT NULL DEFAULT 0,
                duration_ms     BIGINT,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sellers_tb (
                device_id       TEXT PRIMARY KEY,
                available_quota DOUBLE PRECISION NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(&self, row: &sqlx::postgres::PgRow) -> Result<TransferRecord, TransferError> {
        let status_id: i16 = row.get("status");
        let status = TransferStatus::from_id(status_id).ok_or_else(|| {
            TransferError::SystemError(format!("Invalid status ID: {}", status_id))
        })?;

        let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
        let updated_at: chrono::DateTime<chrono::Utc> = row.get("updated_at");

        Ok(TransferRecord {
            id: row.get("id"),
            device_id: row.get("device_id"),
            amount: row.get("amount"),
            target_amount: row.get("target_amount"),
            ledger_reference: row.get("ledger_ref"),
            status,
            duration_ms: row.get("duration_ms"),
            created_at: created_at.timestamp_millis(),
            updated_at: updated_at.timestamp_millis(),
        })
    }
}

#[async_trait]
impl TransferStore for PgTransferStore {
    async fn create_in_progress(
        &self,
        device_id: &str,
        ledger_reference: &str,
        target_amount: f64,
    ) -> Result<i64, TransferError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO transfers_tb
                (device_id, target_amount, ledger_ref, status, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(device_id)
        .bind(target_amount)
        .bind(ledger_reference)
        .bind(TransferStatus::InProgress.id())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn mark_completed(
        &self,
        record_id: i64,
        device_id: &str,
        final_amount: f64,
        duration_ms: i64,
    ) -> Result<(), TransferError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE transfers_tb
            SET status = $1, amount = $2, duration_ms = $3, updated_at = NOW()
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(TransferStatus::Completed.id())
        .bind(final_amount)
        .bind(duration_ms)
        .bind(record_id)
        .bind(TransferStatus::InProgress.id())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Already terminal - roll back rather than double-decrement quota
            tx.rollback().await?;
            return Err(TransferError::TransferNotFound(record_id.to_string()));
        }

        let decremented = sqlx::query(
            r#"
            UPDATE sellers_tb
            SET available_quota = available_quota - $1
            WHERE device_id = $2
            "#,
        )
        .bind(final_amount)
        .bind(device_id)
        .execute(&mut *tx)
        .await?;

        if decremented.rows_affected() == 0 {
            // No seller row means the quota decrement would be lost; the
            // record must not commit as COMPLETED without it
            tx.rollback().await?;
            return Err(TransferError::DatabaseError(format!(
                "no seller row for device {}",
                device_id
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, record_id: i64, final_amount: f64) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            UPDATE transfers_tb
            SET status = $1, amount = $2, updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(TransferStatus::Failed.id())
        .bind(final_amount)
        .bind(record_id)
        .bind(TransferStatus::InProgress.id())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_all_in_progress(&self) -> Result<Vec<TransferRecord>, TransferError> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, amount, target_amount, ledger_ref, status,
                   duration_ms, created_at, updated_at
            FROM transfers_tb
            WHERE status = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(TransferStatus::InProgress.id())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.row_to_record(&row)?);
        }

        Ok(records)
    }
}

// ============================================================================
// In-memory implementation (tests)
// ============================================================================

/// In-memory store used by unit and integration tests
///
/// Mirrors the all-or-nothing semantics of the Postgres implementation and
/// supports fault injection: when `fail_next_write` is set, the next terminal
/// update errors without applying any effect.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryTransferStore {
    inner: std::sync::Mutex<MemoryState>,
}

#[cfg(test)]
#[derive(Default)]
struct MemoryState {
    next_id: i64,
    records: Vec<TransferRecord>,
    quotas: std::collections::HashMap<String, f64>,
    fail_next_write: bool,
    completed_calls: usize,
    failed_calls: usize,
}

#[cfg(test)]
impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next mark_completed / mark_failed call error
    pub fn fail_next_write(&self) {
        self.inner.lock().unwrap().fail_next_write = true;
    }

    pub fn set_quota(&self, device_id: &str, quota: f64) {
        self.inner
            .lock()
            .unwrap()
            .quotas
            .insert(device_id.to_string(), quota);
    }

    pub fn quota(&self, device_id: &str) -> Option<f64> {
        self.inner.lock().unwrap().quotas.get(device_id).copied()
    }

    pub fn record(&self, record_id: i64) -> Option<TransferRecord> {
        self.inner
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|r| r.id == record_id)
            .cloned()
    }

    pub fn completed_calls(&self) -> usize {
        self.inner.lock().unwrap().completed_calls
    }

    pub fn failed_calls(&self) -> usize {
        self.inner.lock().unwrap().failed_calls
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn create_in_progress(
        &self,
        device_id: &str,
        ledger_reference: &str,
        target_amount: f64,
    ) -> Result<i64, TransferError> {
        let mut state = self.inner.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        let now = Self::now_ms();
        state.records.push(TransferRecord {
            id,
            device_id: device_id.to_string(),
            amount: 0.0,
            target_amount,
            ledger_reference: ledger_reference.to_string(),
            status: TransferStatus::InProgress,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn mark_completed(
        &self,
        record_id: i64,
        device_id: &str,
        final_amount: f64,
        duration_ms: i64,
    ) -> Result<(), TransferError> {
        let mut state = self.inner.lock().unwrap();
        state.completed_calls += 1;

        if state.fail_next_write {
            state.fail_next_write = false;
            // Neither the record nor the quota is touched
            return Err(TransferError::DatabaseError("injected failure".into()));
        }

        // Checked before the record is touched; a COMPLETED record must
        // never land without its quota decrement
        if !state.quotas.contains_key(device_id) {
            return Err(TransferError::DatabaseError(format!(
                "no seller row for device {}",
                device_id
            )));
        }

        let now = Self::now_ms();
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == record_id && r.status == TransferStatus::InProgress)
            .ok_or_else(|| TransferError::TransferNotFound(record_id.to_string()))?;

        record.status = TransferStatus::Completed;
        record.amount = final_amount;
        record.duration_ms = Some(duration_ms);
        record.updated_at = now;

        if let Some(quota) = state.quotas.get_mut(device_id) {
            *quota -= final_amount;
        }

        Ok(())
    }

    async fn mark_failed(&self, record_id: i64, final_amount: f64) -> Result<(), TransferError> {
        let mut state = self.inner.lock().unwrap();
        state.failed_calls += 1;

        if state.fail_next_write {
            state.fail_next_write = false;
            return Err(TransferError::DatabaseError("injected failure".into()));
        }

        let now = Self::now_ms();
        if let Some(record) = state
            .records
            .iter_mut()
            .find(|r| r.id == record_id && r.status == TransferStatus::InProgress)
        {
            record.status = TransferStatus::Failed;
            record.amount = final_amount;
            record.updated_at = now;
        }

        Ok(())
    }

    async fn find_all_in_progress(&self) -> Result<Vec<TransferRecord>, TransferError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|r| r.status == TransferStatus::InProgress)
            .cloned()
            .collect())
    }
}
