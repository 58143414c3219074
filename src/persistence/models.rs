//! Database Models
//!
//! Row shapes for messages, positions, position events and reconciliation
//! reports, with conversions to and from the domain types. Conversions out of
//! the database reject rows that violate domain invariants as corrupt.

use crate::domain::entities::message::{MessageDocument, StoredMessage};
use crate::domain::entities::position::{
    ExitReason, FillKind, Position, PositionEvent, PositionStatus,
};
use crate::domain::errors::{StoreError, ValidationError};
use crate::domain::value_objects::{pnl::PnL, price::Price, shares::Shares};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

/// Message record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MessageRecord {
    pub seq: i64,
    pub id: String,
    pub message_type: String,
    pub sender: String,
    pub recipient: String,
    pub priority: String,
    pub causation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub body: String, // JSON string
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// The body is kept as an undecoded JSON value; unparseable JSON is
    /// passed through as a string so the consumer reports it as malformed.
    pub fn into_stored(self) -> StoredMessage {
        let body = serde_json::from_str(&self.body).unwrap_or(serde_json::Value::String(self.body));
        StoredMessage {
            id: self.id,
            created_at: self.created_at,
            processed_at: self.processed_at,
            document: MessageDocument {
                message_type: self.message_type,
                sender: self.sender,
                recipient: self.recipient,
                priority: self.priority,
                causation_id: self.causation_id,
                idempotency_key: self.idempotency_key,
                body,
            },
        }
    }
}

/// Position record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub position_id: String,
    pub ticker: String,
    pub sector: Option<String>,
    pub status: String, // PENDING, OPEN, CLOSED, REJECTED
    pub intended_entry_price: f64,
    pub intended_shares: i64,
    pub intended_stop_loss: Option<f64>,
    pub intended_target: Option<f64>,
    pub actual_entry_price: Option<f64>,
    pub actual_shares: Option<i64>,
    pub actual_entry_date: Option<DateTime<Utc>>,
    pub fill_kind: Option<String>,
    pub exit_price: Option<f64>,
    pub exit_date: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    pub rejection_reason: Option<String>,
    pub risk_per_share: Option<f64>,
    pub total_risk: Option<f64>,
    pub order_msg_id: String,
    pub risk_msg_id: Option<String>,
    pub fill_msg_id: Option<String>,
    pub exit_msg_id: Option<String>,
    pub reject_msg_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Position> for PositionRecord {
    fn from(p: &Position) -> Self {
        Self {
            position_id: p.position_id.clone(),
            ticker: p.ticker.clone(),
            sector: p.sector.clone(),
            status: p.status.as_str().to_string(),
            intended_entry_price: p.intended_entry_price.value(),
            intended_shares: p.intended_shares.value(),
            intended_stop_loss: p.intended_stop_loss.map(|v| v.value()),
            intended_target: p.intended_target.map(|v| v.value()),
            actual_entry_price: p.actual_entry_price.map(|v| v.value()),
            actual_shares: p.actual_shares.map(|v| v.value()),
            actual_entry_date: p.actual_entry_date,
            fill_kind: p.fill_kind.map(|k| k.as_str().to_string()),
            exit_price: p.exit_price.map(|v| v.value()),
            exit_date: p.exit_date,
            exit_reason: p.exit_reason.map(|r| r.as_str().to_string()),
            realized_pnl: p.realized_pnl.map(|v| v.value()),
            rejection_reason: p.rejection_reason.clone(),
            risk_per_share: p.risk_per_share,
            total_risk: p.total_risk,
            order_msg_id: p.order_msg_id.clone(),
            risk_msg_id: p.risk_msg_id.clone(),
            fill_msg_id: p.fill_msg_id.clone(),
            exit_msg_id: p.exit_msg_id.clone(),
            reject_msg_id: p.reject_msg_id.clone(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

fn corrupt(position_id: &str, e: ValidationError) -> StoreError {
    StoreError::Corrupt(format!("position {}: {}", position_id, e))
}

impl TryFrom<PositionRecord> for Position {
    type Error = StoreError;

    fn try_from(r: PositionRecord) -> Result<Self, Self::Error> {
        let id = r.position_id.clone();
        let price = |v: f64| Price::new(v).map_err(|e| corrupt(&id, e));
        let opt_price = |v: Option<f64>| v.map(|v| Price::new(v).map_err(|e| corrupt(&id, e))).transpose();

        Ok(Position {
            status: PositionStatus::from_str(&r.status).map_err(|e| corrupt(&id, e))?,
            intended_entry_price: price(r.intended_entry_price)?,
            intended_shares: Shares::new(r.intended_shares).map_err(|e| corrupt(&id, e))?,
            intended_stop_loss: opt_price(r.intended_stop_loss)?,
            intended_target: opt_price(r.intended_target)?,
            actual_entry_price: opt_price(r.actual_entry_price)?,
            actual_shares: r
                .actual_shares
                .map(Shares::new)
                .transpose()
                .map_err(|e| corrupt(&id, e))?,
            actual_entry_date: r.actual_entry_date,
            fill_kind: r
                .fill_kind
                .as_deref()
                .map(FillKind::from_str)
                .transpose()
                .map_err(|e| corrupt(&id, e))?,
            exit_price: opt_price(r.exit_price)?,
            exit_date: r.exit_date,
            exit_reason: r
                .exit_reason
                .as_deref()
                .map(ExitReason::from_str)
                .transpose()
                .map_err(|e| corrupt(&id, e))?,
            realized_pnl: r
                .realized_pnl
                .map(PnL::new)
                .transpose()
                .map_err(|e| corrupt(&id, e))?,
            rejection_reason: r.rejection_reason,
            risk_per_share: r.risk_per_share,
            total_risk: r.total_risk,
            order_msg_id: r.order_msg_id,
            risk_msg_id: r.risk_msg_id,
            fill_msg_id: r.fill_msg_id,
            exit_msg_id: r.exit_msg_id,
            reject_msg_id: r.reject_msg_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
            position_id: r.position_id,
            ticker: r.ticker,
            sector: r.sector,
        })
    }
}

/// Position event record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionEventRecord {
    pub id: i64,
    pub position_id: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub message_id: Option<String>,
    pub detail: String, // JSON string
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<PositionEventRecord> for PositionEvent {
    type Error = StoreError;

    fn try_from(r: PositionEventRecord) -> Result<Self, Self::Error> {
        let id = r.position_id.clone();
        Ok(PositionEvent {
            from_status: r
                .from_status
                .as_deref()
                .map(PositionStatus::from_str)
                .transpose()
                .map_err(|e| corrupt(&id, e))?,
            to_status: PositionStatus::from_str(&r.to_status).map_err(|e| corrupt(&id, e))?,
            message_id: r.message_id,
            detail: serde_json::from_str(&r.detail)?,
            recorded_at: r.recorded_at,
            position_id: r.position_id,
        })
    }
}

/// Reconciliation audit record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationAuditRecord {
    pub id: i64,
    pub reconciliation_id: String,
    pub reconciliation_timestamp: DateTime<Utc>,
    pub status: String,
    pub positions_checked: i64,
    pub broker_checked: bool,
    pub anomaly_count: i64,
    pub report_json: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::OrderIntent;

    fn open_position() -> Position {
        let intent = OrderIntent::new("CVX", Some("Energy"), 40, 155.0, Some(148.0), Some(170.0)).unwrap();
        Position::pending("pos_CVX_1".to_string(), &intent, "order-1", Some("risk-1"), Utc::now())
            .fill(Shares::new(30).unwrap(), Price::new(154.5).unwrap(), Utc::now(), "fill-1", Utc::now())
            .unwrap()
    }

    #[test]
    fn test_position_record_conversion_preserves_fields() {
        let position = open_position();
        let record = PositionRecord::from(&position);
        assert_eq!(record.status, "OPEN");
        assert_eq!(record.fill_kind.as_deref(), Some("PARTIAL"));

        let back = Position::try_from(record).unwrap();
        assert_eq!(back, position);
    }

    #[test]
    fn test_corrupt_status_is_rejected() {
        let mut record = PositionRecord::from(&open_position());
        record.status = "HALF_OPEN".to_string();
        assert!(matches!(Position::try_from(record), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_unparseable_body_is_passed_through() {
        let record = MessageRecord {
            seq: 1,
            id: "m1".to_string(),
            message_type: "BuyOrder".to_string(),
            sender: "portfolio".to_string(),
            recipient: "trading".to_string(),
            priority: "normal".to_string(),
            causation_id: None,
            idempotency_key: None,
            body: "{not json".to_string(),
            created_at: Utc::now(),
            processed_at: None,
        };
        let stored = record.into_stored();
        assert_eq!(stored.document.body, serde_json::Value::String("{not json".to_string()));
    }
}
