//! In-memory PositionStore for tests and dry runs.

use crate::domain::entities::position::{Position, PositionEvent, PositionStatus};
use crate::domain::errors::StoreError;
use crate::domain::repositories::position_store::{PositionStore, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct StoreState {
    positions: HashMap<String, Position>,
    /// Insertion order of position ids
    order: Vec<String>,
    events: Vec<PositionEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPositionStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn insert(&self, position: &Position, event: &PositionEvent) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.positions.contains_key(&position.position_id) {
            return Err(StoreError::Query(format!(
                "position {} already exists",
                position.position_id
            )));
        }
        state.order.push(position.position_id.clone());
        state
            .positions
            .insert(position.position_id.clone(), position.clone());
        state.events.push(event.clone());
        Ok(())
    }

    async fn get(&self, position_id: &str) -> StoreResult<Option<Position>> {
        Ok(self.state.read().await.positions.get(position_id).cloned())
    }

    async fn find_by_order_msg(&self, order_msg_id: &str) -> StoreResult<Option<Position>> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .values()
            .find(|p| p.order_msg_id == order_msg_id)
            .cloned())
    }

    async fn transition(
        &self,
        position: &Position,
        expected: PositionStatus,
        event: &PositionEvent,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.positions.get_mut(&position.position_id) {
            Some(current) if current.status == expected => {
                *current = position.clone();
            }
            _ => return Ok(false),
        }
        state.events.push(event.clone());
        Ok(true)
    }

    async fn list(&self, status: Option<PositionStatus>) -> StoreResult<Vec<Position>> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.positions.get(id))
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect())
    }

    async fn events(&self, position_id: &str) -> StoreResult<Vec<PositionEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.position_id == position_id)
            .cloned()
            .collect())
    }
}
