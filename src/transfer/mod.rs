//! Energy transfer coordination
//!
//! Tracks in-flight physical energy transfers keyed by device identity.
//!
//! # Lifecycle
//!
//! ```text
//! trade initiation ──▶ ACTIVE ──telemetry >= target──▶ FINALIZING ──▶ COMPLETED
//!                        │
//!                        └───────timeout──────────────▶ FINALIZING ──▶ FAILED
//! ```
//!
//! # Safety Invariants
//!
//! 1. At most one active transfer per device; duplicates are rejected.
//! 2. Finalize runs at most once per transfer; telemetry and timeout race
//!    for a single FINALIZING flip under the table mutex.
//! 3. COMPLETED and the seller quota decrement land in one transaction.
//! 4. The durable record is the source of truth; in-memory state is rebuilt
//!    from IN_PROGRESS records at startup.

pub mod api;
pub mod coordinator;
pub mod error;
pub mod recovery;
pub mod status;
pub mod store;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use api::{ApiResponse, TradeRequest, TradeResponse, health_check, initiate_trade,
    list_active_transfers};
pub use coordinator::{ActiveTransferInfo, TransferCoordinator};
pub use error::TransferError;
pub use recovery::recover_in_flight;
pub use status::TransferStatus;
pub use store::{PgTransferStore, TransferRecord, TransferStore};
