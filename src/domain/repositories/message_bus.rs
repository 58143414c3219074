//! Message Bus Trait
//!
//! Durable, per-recipient queue abstraction. Every department talks to the
//! others exclusively through an implementation of this trait.
//!
//! ## Guarantees
//! - At-least-once delivery: `receive` returns every unacked message for the
//!   recipient until it is acked.
//! - Insertion order per recipient, which implies per-sender order.
//! - `send` and `ack` are append-only; a processed message is retained for
//!   audit and never mutated again.
//! - A send carrying an already-seen idempotency key is absorbed and returns
//!   the id of the original message.

use crate::domain::entities::message::{
    Department, Inbound, MessageDocument, OutboundMessage, StoredMessage,
};
use crate::domain::errors::BusError;
use async_trait::async_trait;

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Validates and durably enqueues a message. Returns its id.
    async fn send(&self, message: &OutboundMessage) -> BusResult<String> {
        let document = message.to_document()?;
        self.deliver_document(document).await
    }

    /// Enqueues a document produced by an external collaborator. Only the
    /// header is validated here; the body is decoded by the consumer.
    async fn deliver_document(&self, document: MessageDocument) -> BusResult<String>;

    /// All unacked messages for `recipient`, in insertion order.
    async fn receive(&self, recipient: Department) -> BusResult<Vec<Inbound>>;

    /// Marks a message processed. Returns false when the id is unknown or
    /// was already acked.
    async fn ack(&self, message_id: &str) -> BusResult<bool>;

    async fn pending_count(&self, recipient: Department) -> BusResult<usize>;

    /// Every message ever delivered to `recipient`, processed or not.
    async fn history(&self, recipient: Department) -> BusResult<Vec<StoredMessage>>;
}
