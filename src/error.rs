// Compliance error taxonomy
//
// Domain errors are recoverable at the request boundary: the caller corrects the
// input or retries. `Internal` is reserved for broken engine invariants.

use rusqlite::ErrorCode;
use thiserror::Error;

pub type ComplianceResult<T> = Result<T, ComplianceError>;

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("ship '{0}' appears more than once in the pool")]
    DuplicateMember(String),

    #[error("pool member '{ship_id}' has no route data for {year}")]
    MemberNotFound { ship_id: String, year: i32 },

    #[error("insufficient surplus: requested {requested:.2}, available {available:.2}")]
    InsufficientSurplus { requested: f64, available: f64 },

    #[error("insufficient banked balance: requested {requested:.2}, available {available:.2}")]
    InsufficientBankedBalance { requested: f64, available: f64 },

    #[error("invalid pool: total compliance balance {total_cb:.2} is negative")]
    InvalidPool { total_cb: f64 },

    #[error("conflicting concurrent update, retry: {0}")]
    Conflict(String),

    #[error("no baseline route is set")]
    NoBaselineSet,

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(rusqlite::Error),
}

impl ComplianceError {
    pub fn route_not_found(ship_id: &str, year: i32) -> Self {
        Self::NotFound(format!("no route data for ship '{}' in {}", ship_id, year))
    }

    /// Stable machine-readable code for API payloads
    pub fn code(&self) -> &'static str {
        match self {
            ComplianceError::NotFound(_) => "not_found",
            ComplianceError::Validation(_) => "validation_error",
            ComplianceError::DuplicateMember(_) => "duplicate_member",
            ComplianceError::MemberNotFound { .. } => "member_not_found",
            ComplianceError::InsufficientSurplus { .. } => "insufficient_surplus",
            ComplianceError::InsufficientBankedBalance { .. } => "insufficient_banked_balance",
            ComplianceError::InvalidPool { .. } => "invalid_pool",
            ComplianceError::Conflict(_) => "conflict",
            ComplianceError::NoBaselineSet => "no_baseline_set",
            ComplianceError::Internal(_) => "internal_error",
            ComplianceError::Storage(_) => "storage_error",
        }
    }

    /// True for errors caused by the request rather than the engine
    pub fn is_domain(&self) -> bool {
        !matches!(self, ComplianceError::Internal(_) | ComplianceError::Storage(_))
    }
}

impl From<rusqlite::Error> for ComplianceError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                ComplianceError::Conflict(err.to_string())
            }
            _ => ComplianceError::Storage(err),
        }
    }
}

impl From<serde_json::Error> for ComplianceError {
    fn from(err: serde_json::Error) -> Self {
        ComplianceError::Internal(format!("serialization failed: {}", err))
    }
}
