//! Error taxonomy for the EcoVault core.
//!
//! Validation errors reject bad input before any state is created, conflict
//! errors reject without mutating and are safe to retry after a refetch,
//! resource errors preserve the ledger invariants, and infrastructure errors
//! carry their source for the operator log.

use axum::http::StatusCode;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // Validation
    #[error("capture location is not within any active collection point")]
    LocationOutOfRange,
    #[error("recorded_at must fall within the last 24 hours")]
    StaleOrFutureCapture,
    #[error("daily submission limit of {0} reached")]
    RateLimitExceeded(i64),
    #[error("a rejection reason is required")]
    MissingReason,
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("cashout amount {0} is below the configured minimum")]
    BelowMinimum(Decimal),
    #[error("cashout amount {0} is above the configured maximum")]
    AboveMaximum(Decimal),

    // Conflict
    #[error("illegal {entity} transition from {from} to {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("user already has a cashout request in progress")]
    DuplicatePendingRequest,

    // Resource
    #[error("insufficient points balance")]
    InsufficientPoints,
    #[error("insufficient available cash")]
    InsufficientAvailableCash,
    #[error("unlock amount exceeds locked funds")]
    OverUnlock,

    // Access
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("operation not permitted for this user")]
    Forbidden,

    // Infrastructure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::LocationOutOfRange
            | CoreError::StaleOrFutureCapture
            | CoreError::MissingReason
            | CoreError::NonPositiveAmount
            | CoreError::BelowMinimum(_)
            | CoreError::AboveMaximum(_) => StatusCode::BAD_REQUEST,
            CoreError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::InvalidStateTransition { .. } | CoreError::DuplicatePendingRequest => {
                StatusCode::CONFLICT
            }
            CoreError::InsufficientPoints
            | CoreError::InsufficientAvailableCash
            | CoreError::OverUnlock => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Forbidden => StatusCode::FORBIDDEN,
            CoreError::Database(_) | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_bad_request() {
        assert_eq!(
            CoreError::StaleOrFutureCapture.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CoreError::LocationOutOfRange.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn conflict_errors_map_to_conflict() {
        let err = CoreError::InvalidStateTransition {
            entity: "submission",
            from: "approved".into(),
            to: "rejected".into(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            CoreError::DuplicatePendingRequest.status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn resource_errors_map_to_unprocessable() {
        assert_eq!(
            CoreError::InsufficientPoints.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            CoreError::OverUnlock.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
