//! Position Store Trait
//!
//! Persistence seam for the Position Ledger. Rows are never overwritten
//! outside a status transition, and every transition appends an event.

use crate::domain::entities::position::{Position, PositionEvent, PositionStatus};
use crate::domain::errors::StoreError;
use async_trait::async_trait;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Inserts a new position together with its creation event.
    async fn insert(&self, position: &Position, event: &PositionEvent) -> StoreResult<()>;

    async fn get(&self, position_id: &str) -> StoreResult<Option<Position>>;

    async fn find_by_order_msg(&self, order_msg_id: &str) -> StoreResult<Option<Position>>;

    /// Replaces the row only if its status is still `expected`, appending
    /// `event` in the same unit of work. Returns false when the status
    /// moved underneath the caller.
    async fn transition(
        &self,
        position: &Position,
        expected: PositionStatus,
        event: &PositionEvent,
    ) -> StoreResult<bool>;

    /// All positions, optionally filtered by status, oldest first.
    async fn list(&self, status: Option<PositionStatus>) -> StoreResult<Vec<Position>>;

    async fn events(&self, position_id: &str) -> StoreResult<Vec<PositionEvent>>;
}
