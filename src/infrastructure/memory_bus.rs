//! In-memory MessageBus for tests and dry runs.
//!
//! Same contract as the SQLite bus, minus durability across restarts.

use crate::domain::entities::message::{
    Department, Inbound, MessageDocument, MessageIdGenerator, StoredMessage,
};
use crate::domain::repositories::message_bus::{BusResult, MessageBus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct BusState {
    messages: Vec<StoredMessage>,
    by_idempotency_key: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<RwLock<BusState>>,
    ids: Arc<MessageIdGenerator>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn deliver_document(&self, mut document: MessageDocument) -> BusResult<String> {
        let recipient = document.validate_header()?;
        document.recipient = recipient.as_str().to_string();

        let mut state = self.state.write().await;
        if let Some(key) = &document.idempotency_key {
            if let Some(existing) = state.by_idempotency_key.get(key) {
                debug!("Idempotency key {} already sent as {}", key, existing);
                return Ok(existing.clone());
            }
        }

        let now = Utc::now();
        let id = self.ids.next_id(now);
        if let Some(key) = &document.idempotency_key {
            state.by_idempotency_key.insert(key.clone(), id.clone());
        }
        debug!(
            "Enqueued {} {} -> {} as {}",
            document.message_type, document.sender, document.recipient, id
        );
        state.messages.push(StoredMessage {
            id: id.clone(),
            created_at: now,
            processed_at: None,
            document,
        });
        Ok(id)
    }

    async fn receive(&self, recipient: Department) -> BusResult<Vec<Inbound>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.processed_at.is_none() && m.document.recipient == recipient.as_str())
            .map(StoredMessage::decode)
            .collect())
    }

    async fn ack(&self, message_id: &str) -> BusResult<bool> {
        let mut state = self.state.write().await;
        match state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.processed_at.is_none())
        {
            Some(message) => {
                message.processed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_count(&self, recipient: Department) -> BusResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.processed_at.is_none() && m.document.recipient == recipient.as_str())
            .count())
    }

    async fn history(&self, recipient: Department) -> BusResult<Vec<StoredMessage>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.document.recipient == recipient.as_str())
            .cloned()
            .collect())
    }
}
