use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::position::{PositionStatus, Transition};

/// Bad input shape or value, raised before any mutation happens.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid share count: {0}")]
    InvalidShares(String),

    #[error("Invalid ticker: {0}")]
    InvalidTicker(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Sender and recipient must differ ({0})")]
    SelfAddressed(String),

    #[error("Value must be non-negative")]
    MustBeNonNegative,

    #[error("Value must be finite")]
    MustBeFinite,
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}

/// Failures of the durable store backing the bus and the ledger.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient failures are retried with backoff before the operation is
    /// considered failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::Database(db) if db.message().contains("database is locked") => {
                StoreError::Unavailable(e.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(e.to_string())
            }
            _ => StoreError::Query(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors returned by Position Ledger operations.
///
/// `Validation`, `StateConflict` and `NotFound` are expected business
/// conditions: the caller records them as anomalies. Only `Store` reflects an
/// infrastructure failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("State conflict on {position_id}: cannot {attempted} a position that is {current}")]
    StateConflict {
        position_id: String,
        current: PositionStatus,
        attempted: Transition,
    },

    #[error("Position not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn is_business(&self) -> bool {
        !matches!(self, LedgerError::Store(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Store(e) if e.is_transient())
    }

    /// Short code used in anomaly reports and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "ERR_VALIDATION",
            LedgerError::StateConflict { .. } => "ERR_STATE_CONFLICT",
            LedgerError::NotFound(_) => "ERR_NOT_FOUND",
            LedgerError::Store(_) => "ERR_STORE",
        }
    }
}

/// Errors returned by the message bus.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Store(e) if e.is_transient())
    }
}

/// Failures of calls to external collaborators (valuation, broker view).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("{collaborator} timed out after {after_ms}ms")]
    Timeout { collaborator: String, after_ms: u64 },

    #[error("{0} unavailable")]
    Unavailable(String),

    #[error("Collaborator call failed: {0}")]
    Failed(String),

    #[error("Collaborator pool is closed")]
    PoolClosed,
}

impl CollaboratorError {
    /// A timeout never implies a state change, so the call can be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Timeout { .. } | CollaboratorError::Unavailable(_)
        )
    }
}
