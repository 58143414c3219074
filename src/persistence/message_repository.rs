//! SQLite Message Bus
//!
//! Durable per-recipient queues on a single append-only `messages` table.
//! Insertion order comes from the autoincrement `seq` column, so per-sender
//! order holds regardless of clock behavior.

use super::models::MessageRecord;
use super::DbPool;
use crate::domain::entities::message::{
    Department, Inbound, MessageDocument, MessageIdGenerator, StoredMessage,
};
use crate::domain::errors::StoreError;
use crate::domain::repositories::message_bus::{BusResult, MessageBus};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};

/// Message bus backed by SQLite
pub struct SqliteMessageBus {
    pool: DbPool,
    ids: MessageIdGenerator,
}

impl SqliteMessageBus {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            ids: MessageIdGenerator::new(),
        }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM messages WHERE idempotency_key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to look up idempotency key {}: {}", key, e);
                    StoreError::from(e)
                })?;
        Ok(row.map(|(id,)| id))
    }

    async fn fetch(&self, recipient: Department, pending_only: bool) -> Result<Vec<MessageRecord>, StoreError> {
        let sql = if pending_only {
            "SELECT * FROM messages WHERE recipient = ?1 AND processed_at IS NULL ORDER BY seq"
        } else {
            "SELECT * FROM messages WHERE recipient = ?1 ORDER BY seq"
        };
        sqlx::query_as::<_, MessageRecord>(sql)
            .bind(recipient.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to read inbox for {}: {}", recipient, e);
                StoreError::from(e)
            })
    }
}

#[async_trait]
impl MessageBus for SqliteMessageBus {
    async fn deliver_document(&self, mut document: MessageDocument) -> BusResult<String> {
        let recipient = document.validate_header()?;
        document.recipient = recipient.as_str().to_string();
        document.sender = document.sender.to_ascii_lowercase();
        document.priority = document.priority.to_ascii_lowercase();

        if let Some(key) = &document.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                debug!("Idempotency key {} already sent as {}", key, existing);
                return Ok(existing);
            }
        }

        let now = Utc::now();
        let id = self.ids.next_id(now);
        let body = serde_json::to_string(&document.body).map_err(StoreError::from)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (
                id, message_type, sender, recipient, priority,
                causation_id, idempotency_key, body, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&document.message_type)
        .bind(&document.sender)
        .bind(&document.recipient)
        .bind(&document.priority)
        .bind(&document.causation_id)
        .bind(&document.idempotency_key)
        .bind(&body)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue {} for {}: {}", document.message_type, recipient, e);
            StoreError::from(e)
        })?
        .rows_affected();

        if inserted == 0 {
            // Lost a race with a concurrent producer using the same key
            if let Some(key) = &document.idempotency_key {
                if let Some(existing) = self.find_by_idempotency_key(key).await? {
                    return Ok(existing);
                }
            }
            return Err(StoreError::Query(format!("message {} was not stored", id)).into());
        }

        debug!(
            "Enqueued {} {} -> {} as {}",
            document.message_type, document.sender, document.recipient, id
        );
        Ok(id)
    }

    async fn receive(&self, recipient: Department) -> BusResult<Vec<Inbound>> {
        let records = self.fetch(recipient, true).await?;
        Ok(records
            .into_iter()
            .map(|r| r.into_stored().decode())
            .collect())
    }

    async fn ack(&self, message_id: &str) -> BusResult<bool> {
        let rows = sqlx::query(
            "UPDATE messages SET processed_at = ?1 WHERE id = ?2 AND processed_at IS NULL",
        )
        .bind(Utc::now())
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to ack message {}: {}", message_id, e);
            StoreError::from(e)
        })?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn pending_count(&self, recipient: Department) -> BusResult<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE recipient = ?1 AND processed_at IS NULL",
        )
        .bind(recipient.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(count.max(0) as usize)
    }

    async fn history(&self, recipient: Department) -> BusResult<Vec<StoredMessage>> {
        let records = self.fetch(recipient, false).await?;
        Ok(records.into_iter().map(MessageRecord::into_stored).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::message::{ExitSignal, OutboundMessage, Payload};
    use crate::domain::entities::position::ExitReason;
    use crate::persistence::init_database;

    fn exit_signal(ticker: &str) -> OutboundMessage {
        OutboundMessage::new(
            Department::Trading,
            Department::Portfolio,
            Payload::ExitSignal(ExitSignal {
                position_id: format!("pos_{}", ticker),
                ticker: ticker.to_string(),
                exit_price: 186.0,
                exit_date: Utc::now(),
                reason: ExitReason::Target,
            }),
        )
    }

    #[tokio::test]
    async fn test_send_receive_ack() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let bus = SqliteMessageBus::new(pool);

        let first = bus.send(&exit_signal("AAPL")).await.unwrap();
        let second = bus.send(&exit_signal("MSFT")).await.unwrap();

        let inbox = bus.receive(Department::Portfolio).await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].id(), first);
        match &inbox[1] {
            Inbound::Valid(message) => {
                assert_eq!(message.id, second);
                assert_eq!(message.sender, Department::Trading);
                assert!(matches!(&message.payload, Payload::ExitSignal(e) if e.ticker == "MSFT"));
            }
            other => panic!("expected a valid message, got {:?}", other),
        }

        assert!(bus.ack(&first).await.unwrap());
        assert!(!bus.ack(&first).await.unwrap());
        assert_eq!(bus.pending_count(Department::Portfolio).await.unwrap(), 1);

        let history = bus.history(Department::Portfolio).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn test_idempotency_key_is_unique() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let bus = SqliteMessageBus::new(pool);

        let message = exit_signal("AAPL").with_idempotency_key("exit:AAPL");
        let first = bus.send(&message).await.unwrap();
        let second = bus.send(&message).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(bus.pending_count(Department::Portfolio).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_is_stored_and_flagged() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let bus = SqliteMessageBus::new(pool);

        bus.deliver_document(MessageDocument {
            message_type: "MarginCall".to_string(),
            sender: "risk".to_string(),
            recipient: "portfolio".to_string(),
            priority: "HIGH".to_string(),
            causation_id: None,
            idempotency_key: None,
            body: serde_json::json!({}),
        })
        .await
        .unwrap();

        let inbox = bus.receive(Department::Portfolio).await.unwrap();
        assert!(matches!(&inbox[0], Inbound::Malformed { message_type, .. } if message_type == "MarginCall"));
    }
}
