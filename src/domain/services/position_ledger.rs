//! PositionLedger service - the authoritative record of committed capital
//!
//! The ledger is the only component allowed to mutate positions. Writes are
//! serialized through a single async mutex (one mutation in flight at a
//! time); reads go straight to the store and see the latest committed
//! state. Each operation is atomic and self-contained, so a cycle may be
//! aborted between any two ledger calls.

use crate::domain::entities::position::{
    ExitReason, FillKind, OrderIntent, Position, PositionEvent, PositionStatus, Transition,
};
use crate::domain::errors::{LedgerError, StoreError};
use crate::domain::repositories::position_store::PositionStore;
use crate::domain::services::position_reconciliation::{
    reconcile_positions, BrokerSnapshot, ReconciliationConfig, ReconciliationReport,
};
use crate::domain::value_objects::{
    pnl::PnL,
    price::{Price, PriceBook},
    shares::Shares,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of a successful (or idempotently repeated) transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionReceipt {
    pub position_id: String,
    pub status: PositionStatus,
    /// The message id had already been applied; nothing changed
    pub duplicate: bool,
    pub fill_kind: Option<FillKind>,
    pub unfilled_shares: i64,
    pub realized_pnl: Option<PnL>,
}

impl TransitionReceipt {
    fn from_position(position: &Position, duplicate: bool) -> Self {
        Self {
            position_id: position.position_id.clone(),
            status: position.status,
            duplicate,
            fill_kind: position.fill_kind,
            unfilled_shares: position.unfilled_shares(),
            realized_pnl: position.realized_pnl,
        }
    }
}

/// Aggregate view over every position in the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub pending: u32,
    pub open: u32,
    pub closed: u32,
    pub rejected: u32,
    /// Σ(actual_shares × actual_entry_price) over OPEN positions
    pub capital_deployed: f64,
    /// Σ(intended_shares × intended_entry_price) over PENDING positions
    pub capital_pending: f64,
    /// Only available when the caller supplies current prices
    pub unrealized_pnl: Option<f64>,
    pub realized_pnl: f64,
}

impl LedgerSummary {
    pub fn from_positions(positions: &[Position], prices: Option<&PriceBook>) -> Self {
        let mut summary = LedgerSummary::default();
        let mut unrealized = 0.0;

        for position in positions {
            match position.status {
                PositionStatus::Pending => {
                    summary.pending += 1;
                    summary.capital_pending += position.committed_capital();
                }
                PositionStatus::Open => {
                    summary.open += 1;
                    summary.capital_deployed += position.cost_basis();
                    if let Some(pnl) = prices
                        .and_then(|book| book.get(&position.ticker))
                        .and_then(|price| position.unrealized_pnl(*price))
                    {
                        unrealized += pnl.value();
                    }
                }
                PositionStatus::Closed => {
                    summary.closed += 1;
                    summary.realized_pnl += position.realized_pnl.map(|p| p.value()).unwrap_or(0.0);
                }
                PositionStatus::Rejected => summary.rejected += 1,
            }
        }

        summary.unrealized_pnl = prices.map(|_| unrealized);
        summary
    }

    /// OPEN + PENDING capital.
    pub fn capital_committed(&self) -> f64 {
        self.capital_deployed + self.capital_pending
    }
}

/// Manager for the position lifecycle with single-writer discipline
pub struct PositionLedger {
    store: Arc<dyn PositionStore>,
    writer: Mutex<()>,
    reconciliation: ReconciliationConfig,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn PositionStore>, reconciliation: ReconciliationConfig) -> Self {
        Self {
            store,
            writer: Mutex::new(()),
            reconciliation,
        }
    }

    /// Records an approved sizing decision as a PENDING position.
    ///
    /// Repeating the call with the same `order_msg_id` returns the id of the
    /// position created the first time.
    pub async fn create_pending(
        &self,
        intent: &OrderIntent,
        order_msg_id: &str,
        risk_msg_id: Option<&str>,
    ) -> Result<String, LedgerError> {
        let _guard = self.writer.lock().await;

        if let Some(existing) = self.store.find_by_order_msg(order_msg_id).await? {
            debug!(
                "Order message {} already recorded as {}",
                order_msg_id, existing.position_id
            );
            return Ok(existing.position_id);
        }

        let position_id = format!("pos_{}_{}", intent.ticker, order_msg_id);
        let position = Position::pending(position_id.clone(), intent, order_msg_id, risk_msg_id, Utc::now());
        self.store
            .insert(&position, &PositionEvent::created(&position))
            .await?;

        info!(
            "Position {} PENDING: {} x {} @ {}",
            position_id, intent.ticker, intent.shares, intent.entry_price
        );
        Ok(position_id)
    }

    /// PENDING → OPEN. Classifies the fill as FULL or PARTIAL.
    pub async fn apply_fill(
        &self,
        position_id: &str,
        filled_shares: i64,
        fill_price: f64,
        fill_date: DateTime<Utc>,
        fill_msg_id: &str,
    ) -> Result<TransitionReceipt, LedgerError> {
        let filled_shares = Shares::new(filled_shares)?;
        let fill_price = Price::new(fill_price)?;

        self.transition(position_id, fill_msg_id, Transition::Fill, |position, now| {
            let next = position.fill(filled_shares, fill_price, fill_date, fill_msg_id, now)?;
            let detail = serde_json::json!({
                "filled_shares": filled_shares.value(),
                "fill_price": fill_price.value(),
                "fill_kind": next.fill_kind.map(|k| k.as_str()),
                "unfilled_shares": next.unfilled_shares(),
            });
            Ok((next, detail))
        })
        .await
    }

    /// OPEN → CLOSED. Realized P&L is `(exit − actual_entry) × actual_shares`.
    pub async fn close(
        &self,
        position_id: &str,
        exit_price: f64,
        exit_date: DateTime<Utc>,
        exit_reason: ExitReason,
        exit_msg_id: &str,
    ) -> Result<TransitionReceipt, LedgerError> {
        let exit_price = Price::new(exit_price)?;

        self.transition(position_id, exit_msg_id, Transition::Close, |position, now| {
            let next = position.close(exit_price, exit_date, exit_reason, exit_msg_id, now)?;
            let detail = serde_json::json!({
                "exit_price": exit_price.value(),
                "exit_reason": exit_reason.as_str(),
                "realized_pnl": next.realized_pnl.map(|p| p.value()),
            });
            Ok((next, detail))
        })
        .await
    }

    /// PENDING → REJECTED, on cancellation or broker-side refusal.
    pub async fn reject(
        &self,
        position_id: &str,
        reason: &str,
        reject_msg_id: &str,
    ) -> Result<TransitionReceipt, LedgerError> {
        self.transition(position_id, reject_msg_id, Transition::Reject, |position, now| {
            let next = position.reject(reason, reject_msg_id, now)?;
            Ok((next, serde_json::json!({ "reason": reason })))
        })
        .await
    }

    async fn transition<F>(
        &self,
        position_id: &str,
        message_id: &str,
        transition: Transition,
        apply: F,
    ) -> Result<TransitionReceipt, LedgerError>
    where
        F: FnOnce(&Position, DateTime<Utc>) -> Result<(Position, serde_json::Value), LedgerError>
            + Send,
    {
        let _guard = self.writer.lock().await;

        let current = self
            .store
            .get(position_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(position_id.to_string()))?;

        if current.has_applied(message_id) {
            debug!(
                "Message {} already applied to {}, skipping",
                message_id, position_id
            );
            return Ok(TransitionReceipt::from_position(&current, true));
        }

        let (next, detail) = match apply(&current, Utc::now()) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "Anomaly: {} rejected for {} (message {}): {}",
                    transition, position_id, message_id, e
                );
                return Err(e);
            }
        };

        let event = PositionEvent::transitioned(&current, &next, message_id, detail);
        let committed = self.store.transition(&next, current.status, &event).await?;
        if !committed {
            // Only reachable if something outside this ledger wrote the row
            let status = self
                .store
                .get(position_id)
                .await?
                .map(|p| p.status)
                .unwrap_or(current.status);
            warn!(
                "Anomaly: {} of {} lost a status race (now {})",
                transition, position_id, status
            );
            return Err(LedgerError::StateConflict {
                position_id: position_id.to_string(),
                current: status,
                attempted: transition,
            });
        }

        info!(
            "Position {} {} -> {} (message {})",
            position_id, current.status, next.status, message_id
        );
        Ok(TransitionReceipt::from_position(&next, false))
    }

    /// Advisory report of stale PENDING positions and OPEN positions drifting
    /// from the broker. Never mutates state.
    pub async fn reconcile(
        &self,
        broker: Option<&BrokerSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationReport, LedgerError> {
        let mut positions = self.store.list(Some(PositionStatus::Pending)).await?;
        positions.extend(self.store.list(Some(PositionStatus::Open)).await?);

        let report = reconcile_positions(&positions, broker, &self.reconciliation, now);
        if report.anomaly_count() > 0 {
            warn!(
                "Reconciliation {} found {} anomalies (status {})",
                report.reconciliation_id,
                report.anomaly_count(),
                report.status
            );
        } else {
            debug!("Reconciliation {} clean", report.reconciliation_id);
        }
        Ok(report)
    }

    pub async fn summary(&self, prices: Option<&PriceBook>) -> Result<LedgerSummary, StoreError> {
        let positions = self.store.list(None).await?;
        Ok(LedgerSummary::from_positions(&positions, prices))
    }

    pub async fn get(&self, position_id: &str) -> Result<Option<Position>, StoreError> {
        self.store.get(position_id).await
    }

    pub async fn positions(&self, status: Option<PositionStatus>) -> Result<Vec<Position>, StoreError> {
        self.store.list(status).await
    }

    pub async fn events(&self, position_id: &str) -> Result<Vec<PositionEvent>, StoreError> {
        self.store.events(position_id).await
    }
}
