//! SQLite Position Store
//!
//! One row per position. A transition rewrites the row only while its
//! status still matches the expected one, and appends the matching event in
//! the same transaction.

use super::models::{PositionEventRecord, PositionRecord};
use super::DbPool;
use crate::domain::entities::position::{Position, PositionEvent, PositionStatus};
use crate::domain::errors::StoreError;
use crate::domain::repositories::position_store::{PositionStore, StoreResult};
use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, error};

/// Position store backed by SQLite
pub struct SqlitePositionStore {
    pool: DbPool,
}

impl SqlitePositionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn append_event(
        tx: &mut Transaction<'_, Sqlite>,
        event: &PositionEvent,
    ) -> Result<(), StoreError> {
        let detail = serde_json::to_string(&event.detail)?;
        sqlx::query(
            r#"
            INSERT INTO position_events (
                position_id, from_status, to_status, message_id, detail, recorded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&event.position_id)
        .bind(event.from_status.map(|s| s.as_str()))
        .bind(event.to_status.as_str())
        .bind(&event.message_id)
        .bind(&detail)
        .bind(event.recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to append event for {}: {}", event.position_id, e);
            StoreError::from(e)
        })?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            StoreError::from(e)
        })
    }
}

fn into_positions(records: Vec<PositionRecord>) -> StoreResult<Vec<Position>> {
    records.into_iter().map(Position::try_from).collect()
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn insert(&self, position: &Position, event: &PositionEvent) -> StoreResult<()> {
        let r = PositionRecord::from(position);
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                position_id, ticker, sector, status,
                intended_entry_price, intended_shares, intended_stop_loss, intended_target,
                actual_entry_price, actual_shares, actual_entry_date, fill_kind,
                exit_price, exit_date, exit_reason, realized_pnl, rejection_reason,
                risk_per_share, total_risk,
                order_msg_id, risk_msg_id, fill_msg_id, exit_msg_id, reject_msg_id,
                created_at, updated_at
            )
            VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
            )
            "#,
        )
        .bind(&r.position_id)
        .bind(&r.ticker)
        .bind(&r.sector)
        .bind(&r.status)
        .bind(r.intended_entry_price)
        .bind(r.intended_shares)
        .bind(r.intended_stop_loss)
        .bind(r.intended_target)
        .bind(r.actual_entry_price)
        .bind(r.actual_shares)
        .bind(r.actual_entry_date)
        .bind(&r.fill_kind)
        .bind(r.exit_price)
        .bind(r.exit_date)
        .bind(&r.exit_reason)
        .bind(r.realized_pnl)
        .bind(&r.rejection_reason)
        .bind(r.risk_per_share)
        .bind(r.total_risk)
        .bind(&r.order_msg_id)
        .bind(&r.risk_msg_id)
        .bind(&r.fill_msg_id)
        .bind(&r.exit_msg_id)
        .bind(&r.reject_msg_id)
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to insert position {}: {}", r.position_id, e);
            StoreError::from(e)
        })?;

        Self::append_event(&mut tx, event).await?;
        tx.commit().await.map_err(StoreError::from)?;

        debug!("Inserted position {} ({})", r.position_id, r.status);
        Ok(())
    }

    async fn get(&self, position_id: &str) -> StoreResult<Option<Position>> {
        let record = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE position_id = ?1",
        )
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get position {}: {}", position_id, e);
            StoreError::from(e)
        })?;

        record.map(Position::try_from).transpose()
    }

    async fn find_by_order_msg(&self, order_msg_id: &str) -> StoreResult<Option<Position>> {
        let record = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE order_msg_id = ?1",
        )
        .bind(order_msg_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find position for order {}: {}", order_msg_id, e);
            StoreError::from(e)
        })?;

        record.map(Position::try_from).transpose()
    }

    async fn transition(
        &self,
        position: &Position,
        expected: PositionStatus,
        event: &PositionEvent,
    ) -> StoreResult<bool> {
        let r = PositionRecord::from(position);
        let mut tx = self.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE positions SET
                status = ?1,
                actual_entry_price = ?2, actual_shares = ?3, actual_entry_date = ?4,
                fill_kind = ?5, exit_price = ?6, exit_date = ?7, exit_reason = ?8,
                realized_pnl = ?9, rejection_reason = ?10, total_risk = ?11,
                fill_msg_id = ?12, exit_msg_id = ?13, reject_msg_id = ?14,
                updated_at = ?15
            WHERE position_id = ?16 AND status = ?17
            "#,
        )
        .bind(&r.status)
        .bind(r.actual_entry_price)
        .bind(r.actual_shares)
        .bind(r.actual_entry_date)
        .bind(&r.fill_kind)
        .bind(r.exit_price)
        .bind(r.exit_date)
        .bind(&r.exit_reason)
        .bind(r.realized_pnl)
        .bind(&r.rejection_reason)
        .bind(r.total_risk)
        .bind(&r.fill_msg_id)
        .bind(&r.exit_msg_id)
        .bind(&r.reject_msg_id)
        .bind(r.updated_at)
        .bind(&r.position_id)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to transition position {}: {}", r.position_id, e);
            StoreError::from(e)
        })?
        .rows_affected();

        if rows == 0 {
            tx.rollback().await.map_err(StoreError::from)?;
            return Ok(false);
        }

        Self::append_event(&mut tx, event).await?;
        tx.commit().await.map_err(StoreError::from)?;

        debug!("Position {} {} -> {}", r.position_id, expected, r.status);
        Ok(true)
    }

    async fn list(&self, status: Option<PositionStatus>) -> StoreResult<Vec<Position>> {
        let records = match status {
            Some(status) => {
                sqlx::query_as::<_, PositionRecord>(
                    "SELECT * FROM positions WHERE status = ?1 ORDER BY rowid",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, PositionRecord>("SELECT * FROM positions ORDER BY rowid")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| {
            error!("Failed to list positions: {}", e);
            StoreError::from(e)
        })?;

        into_positions(records)
    }

    async fn events(&self, position_id: &str) -> StoreResult<Vec<PositionEvent>> {
        let records = sqlx::query_as::<_, PositionEventRecord>(
            "SELECT * FROM position_events WHERE position_id = ?1 ORDER BY id",
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load events for {}: {}", position_id, e);
            StoreError::from(e)
        })?;

        records.into_iter().map(PositionEvent::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::{ExitReason, OrderIntent};
    use crate::domain::value_objects::{price::Price, shares::Shares};
    use crate::persistence::init_database;
    use chrono::Utc;

    fn pending(id: &str) -> Position {
        let intent = OrderIntent::new("AAPL", Some("Technology"), 56, 175.60, Some(168.0), Some(190.0)).unwrap();
        Position::pending(id.to_string(), &intent, &format!("order-{}", id), None, Utc::now())
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let store = SqlitePositionStore::new(pool);
        let position = pending("pos_1");
        store.insert(&position, &PositionEvent::created(&position)).await.unwrap();

        let loaded = store.get("pos_1").await.unwrap().unwrap();
        assert_eq!(loaded.ticker, "AAPL");
        assert_eq!(loaded.status, PositionStatus::Pending);
        assert_eq!(loaded.intended_shares.value(), 56);
        assert!(store.find_by_order_msg("order-pos_1").await.unwrap().is_some());
        assert!(store.get("pos_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_compare_and_set() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let store = SqlitePositionStore::new(pool);
        let position = pending("pos_1");
        store.insert(&position, &PositionEvent::created(&position)).await.unwrap();

        let now = Utc::now();
        let open = position
            .fill(Shares::new(56).unwrap(), Price::new(175.60).unwrap(), now, "fill-1", now)
            .unwrap();
        let event = PositionEvent::transitioned(&position, &open, "fill-1", serde_json::json!({}));
        assert!(store.transition(&open, PositionStatus::Pending, &event).await.unwrap());
        assert!(!store.transition(&open, PositionStatus::Pending, &event).await.unwrap());

        let closed = open
            .close(Price::new(186.0).unwrap(), now, ExitReason::Target, "exit-1", now)
            .unwrap();
        let event = PositionEvent::transitioned(&open, &closed, "exit-1", serde_json::json!({}));
        assert!(store.transition(&closed, PositionStatus::Open, &event).await.unwrap());

        let loaded = store.get("pos_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, PositionStatus::Closed);
        assert!((loaded.realized_pnl.unwrap().value() - 582.40).abs() < 1e-6);

        let events = store.events("pos_1").await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].from_status, Some(PositionStatus::Open));
        assert_eq!(events[2].message_id.as_deref(), Some("exit-1"));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let store = SqlitePositionStore::new(pool);
        for id in ["pos_b", "pos_a"] {
            let position = pending(id);
            store.insert(&position, &PositionEvent::created(&position)).await.unwrap();
        }

        let all: Vec<String> = store.list(None).await.unwrap().into_iter().map(|p| p.position_id).collect();
        assert_eq!(all, vec!["pos_b", "pos_a"]);
        assert_eq!(store.list(Some(PositionStatus::Pending)).await.unwrap().len(), 2);
        assert!(store.list(Some(PositionStatus::Open)).await.unwrap().is_empty());
    }
}
