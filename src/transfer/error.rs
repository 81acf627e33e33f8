//! Transfer error types

use thiserror::Error;

/// Transfer subsystem errors
///
/// Error codes are stable strings for API responses.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Device ID must not be empty")]
    InvalidDeviceId,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Ledger reference is required")]
    MissingLedgerReference,

    // === Coordination Errors ===
    #[error("Device already has an active transfer: {0}")]
    AlreadyActive(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // === System Errors ===
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal system error: {0}")]
    SystemError(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidDeviceId => "INVALID_DEVICE_ID",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::MissingLedgerReference => "MISSING_LEDGER_REFERENCE",
            TransferError::AlreadyActive(_) => "ALREADY_ACTIVE",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::DatabaseError(_) => "DATABASE_ERROR",
            TransferError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::InvalidDeviceId
            | TransferError::InvalidAmount
            | TransferError::MissingLedgerReference => 400,
            TransferError::AlreadyActive(_) => 409,
            TransferError::TransferNotFound(_) => 404,
            TransferError::DatabaseError(_) | TransferError::SystemError(_) => 500,
        }
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::DatabaseError(e.to_string())
    }
}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> Self {
        TransferError::SystemError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TransferError::AlreadyActive("esp-01".into()).code(),
            "ALREADY_ACTIVE"
        );
        assert_eq!(TransferError::InvalidAmount.code(), "INVALID_AMOUNT");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(TransferError::InvalidAmount.http_status(), 400);
        assert_eq!(TransferError::AlreadyActive("x".into()).http_status(), 409);
        assert_eq!(TransferError::TransferNotFound("x".into()).http_status(), 404);
        assert_eq!(TransferError::DatabaseError("x".into()).http_status(), 500);
    }

    #[test]
    fn test_display() {
        let err = TransferError::AlreadyActive("esp-01".into());
        assert_eq!(
            err.to_string(),
            "Device already has an active transfer: esp-01"
        );
    }
}
