//! Transfer API layer
//!
//! Control-plane HTTP handlers: trade initiation, active-transfer queries,
//! and health. The caller is the trade-settlement flow, which has already
//! submitted the ledger transaction and passes its hash along.

use axum::http::StatusCode;
use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

use super::coordinator::ActiveTransferInfo;
use super::error::TransferError;
use crate::device::frames::DeviceCommand;
use crate::gateway::state::AppState;

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Request to initiate a physical energy transfer
#[derive(Debug, Deserialize)]
pub struct TradeRequest {
    /// Seller's metering device
    pub device_id: String,
    /// Energy to deliver (kWh)
    pub amount: f64,
    /// Settlement transaction hash from the ledger
    pub ledger_reference: String,
}

/// Response for a successfully opened transfer
#[derive(Debug, Serialize)]
pub struct TradeResponse {
    pub record_id: i64,
    pub device_id: String,
    pub target_amount: f64,
    pub ledger_reference: String,
    /// Whether the START_TRANSFER command reached the device
    pub device_notified: bool,
}

/// API wrapper for standard response format
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            data: Some(data),
            msg: None,
        }
    }

    pub fn error(code: i32, msg: impl ToString) -> Self {
        Self {
            code,
            data: None,
            msg: Some(msg.to_string()),
        }
    }
}

pub mod error_codes {
    pub const INVALID_PARAMETER: i32 = -1001;
    pub const INVALID_AMOUNT: i32 = -1002;
    pub const ALREADY_ACTIVE: i32 = -2001;
    pub const STORAGE_ERROR: i32 = -5001;
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/trade
///
/// Writes the IN_PROGRESS record, opens the active transfer, and commands
/// the device to start. Command delivery is best-effort: an offline device
/// simply never pushes telemetry and the transfer fails on timeout.
pub async fn initiate_trade(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradeRequest>,
) -> (StatusCode, Json<ApiResponse<TradeResponse>>) {
    if let Err(e) = validate_trade(&req) {
        let code = match e {
            TransferError::InvalidAmount => error_codes::INVALID_AMOUNT,
            _ => error_codes::INVALID_PARAMETER,
        };
        return (
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_REQUEST),
            Json(ApiResponse::error(code, e)),
        );
    }

    // Durable record first: a crash after this point is picked up by recovery
    let record_id = match state
        .store
        .create_in_progress(&req.device_id, &req.ledger_reference, req.amount)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            error!(device_id = %req.device_id, error = %e, "Failed to create transfer record");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(error_codes::STORAGE_ERROR, e)),
            );
        }
    };

    if let Err(e) =
        state
            .coordinator
            .begin_transfer(&req.device_id, req.amount, record_id, &req.ledger_reference)
    {
        // The record was already written; fail it so it cannot be recovered
        // into a duplicate active transfer at next boot
        if let Err(mark_err) = state.store.mark_failed(record_id, 0.0).await {
            error!(record_id, error = %mark_err, "Failed to mark rejected transfer");
        }
        return (
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::CONFLICT),
            Json(ApiResponse::error(error_codes::ALREADY_ACTIVE, e)),
        );
    }

    let device_notified = state
        .registry
        .send(&req.device_id, DeviceCommand::start(&req.device_id));
    if !device_notified {
        warn!(device_id = %req.device_id, "Device offline at trade initiation");
    }

    info!(
        device_id = %req.device_id,
        record_id,
        amount = req.amount,
        ledger_ref = %req.ledger_reference,
        "Trade initiated"
    );

    (
        StatusCode::OK,
        Json(ApiResponse::success(TradeResponse {
            record_id,
            device_id: req.device_id,
            target_amount: req.amount,
            ledger_reference: req.ledger_reference,
            device_notified,
        })),
    )
}

/// GET /api/v1/transfers/active
///
/// Snapshot of in-flight transfers for monitoring and admin tooling.
pub async fn list_active_transfers(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<ActiveTransferInfo>>> {
    Json(ApiResponse::success(state.coordinator.active_snapshot()))
}

/// Health check response data
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Server timestamp in milliseconds
    pub timestamp_ms: u64,
    pub connected_devices: usize,
    pub active_transfers: usize,
}

/// GET /api/v1/health
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<HealthResponse>> {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    Json(ApiResponse::success(HealthResponse {
        timestamp_ms,
        connected_devices: state.registry.len(),
        active_transfers: state.coordinator.active_snapshot().len(),
    }))
}

fn validate_trade(req: &TradeRequest) -> Result<(), TransferError> {
    if req.device_id.trim().is_empty() {
        return Err(TransferError::InvalidDeviceId);
    }
    if !req.amount.is_finite() || req.amount <= 0.0 {
        return Err(TransferError::InvalidAmount);
    }
    if req.ledger_reference.trim().is_empty() {
        return Err(TransferError::MissingLedgerReference);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> TradeRequest {
        TradeRequest {
            device_id: "esp-01".into(),
            amount: 50.0,
            ledger_reference: "0xabc".into(),
        }
    }

    #[test]
    fn test_validate_trade_accepts_valid_request() {
        assert!(validate_trade(&valid_request()).is_ok());
    }

    #[test]
    fn test_validate_trade_rejects_bad_fields() {
        let mut req = valid_request();
        req.device_id = "  ".into();
        assert!(matches!(
            validate_trade(&req),
            Err(TransferError::InvalidDeviceId)
        ));

        let mut req = valid_request();
        req.amount = 0.0;
        assert!(matches!(
            validate_trade(&req),
            Err(TransferError::InvalidAmount)
        ));

        let mut req = valid_request();
        req.amount = f64::NAN;
        assert!(matches!(
            validate_trade(&req),
            Err(TransferError::InvalidAmount)
        ));

        let mut req = valid_request();
        req.ledger_reference = "".into();
        assert!(matches!(
            validate_trade(&req),
            Err(TransferError::MissingLedgerReference)
        ));
    }

    #[test]
    fn test_api_response_shapes() {
        let ok: ApiResponse<u32> = ApiResponse::success(7);
        assert_eq!(ok.code, 0);
        assert_eq!(ok.data, Some(7));

        let err: ApiResponse<u32> = ApiResponse::error(error_codes::INVALID_AMOUNT, "bad");
        assert_eq!(err.code, error_codes::INVALID_AMOUNT);
        assert!(err.data.is_none());
        assert_eq!(err.msg.as_deref(), Some("bad"));
    }
}
