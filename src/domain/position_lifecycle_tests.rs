//! Position lifecycle properties exercised through the ledger
//!
//! Covers the state machine, fill classification, realized P&L and
//! message-id idempotence end to end against the in-memory store.

use crate::domain::entities::position::{ExitReason, FillKind, OrderIntent, PositionStatus};
use crate::domain::errors::LedgerError;
use crate::domain::services::position_ledger::PositionLedger;
use crate::domain::services::position_reconciliation::ReconciliationConfig;
use crate::infrastructure::memory_store::InMemoryPositionStore;
use chrono::{TimeZone, Utc};
use std::sync::Arc;

// ============================================================================
// FIXTURES
// ============================================================================

fn ledger() -> PositionLedger {
    PositionLedger::new(
        Arc::new(InMemoryPositionStore::new()),
        ReconciliationConfig::default(),
    )
}

async fn pending(ledger: &PositionLedger, ticker: &str, shares: i64, entry: f64) -> String {
    let intent = OrderIntent::new(ticker, Some("Technology"), shares, entry, Some(entry * 0.93), Some(entry * 1.12))
        .unwrap();
    let risk_msg_id = format!("risk-{}", ticker);
    ledger
        .create_pending(&intent, &format!("order-{}", ticker), Some(risk_msg_id.as_str()))
        .await
        .unwrap()
}

// ============================================================================
// FILL CLASSIFICATION
// ============================================================================

#[tokio::test]
async fn test_full_fill_opens_position() {
    let ledger = ledger();
    let id = pending(&ledger, "AAPL", 56, 175.60).await;

    let receipt = ledger.apply_fill(&id, 56, 175.60, Utc::now(), "fill-1").await.unwrap();
    assert_eq!(receipt.status, PositionStatus::Open);
    assert_eq!(receipt.fill_kind, Some(FillKind::Full));
    assert_eq!(receipt.unfilled_shares, 0);

    let position = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(position.actual_shares.unwrap().value(), 56);
}

#[tokio::test]
async fn test_partial_fill_opens_position_with_remainder_dropped() {
    let ledger = ledger();
    let id = pending(&ledger, "MSFT", 40, 410.0).await;

    let receipt = ledger.apply_fill(&id, 30, 409.0, Utc::now(), "fill-1").await.unwrap();
    assert_eq!(receipt.status, PositionStatus::Open);
    assert_eq!(receipt.fill_kind, Some(FillKind::Partial));
    assert_eq!(receipt.unfilled_shares, 10);

    let position = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(position.actual_shares.unwrap().value(), 30);
    assert_eq!(position.intended_shares.value(), 40);

    // The remainder never becomes a second PENDING position
    assert_eq!(ledger.positions(Some(PositionStatus::Pending)).await.unwrap().len(), 0);

    let report = ledger.reconcile(None, Utc::now()).await.unwrap();
    assert_eq!(report.partial_fills.len(), 1);
}

#[tokio::test]
async fn test_overfill_is_rejected_without_mutation() {
    let ledger = ledger();
    let id = pending(&ledger, "AMD", 10, 150.0).await;

    let err = ledger.apply_fill(&id, 11, 150.0, Utc::now(), "fill-1").await.unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    assert_eq!(ledger.get(&id).await.unwrap().unwrap().status, PositionStatus::Pending);
}

// ============================================================================
// EXIT AND REALIZED P&L
// ============================================================================

#[tokio::test]
async fn test_close_realizes_gain() {
    let ledger = ledger();
    let id = pending(&ledger, "AAPL", 56, 175.60).await;
    ledger.apply_fill(&id, 56, 175.60, Utc::now(), "fill-1").await.unwrap();

    let exit_date = Utc.with_ymd_and_hms(2024, 7, 1, 20, 0, 0).unwrap();
    let receipt = ledger
        .close(&id, 186.00, exit_date, ExitReason::Target, "exit-1")
        .await
        .unwrap();

    assert_eq!(receipt.status, PositionStatus::Closed);
    let pnl = receipt.realized_pnl.unwrap().value();
    assert!((pnl - (186.00 - 175.60) * 56.0).abs() < 1e-9);

    let position = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(position.exit_reason, Some(ExitReason::Target));
    assert_eq!(position.exit_date, Some(exit_date));
    assert!(position.actual_shares.unwrap() <= position.intended_shares);
}

#[tokio::test]
async fn test_close_after_partial_fill_uses_actual_shares() {
    let ledger = ledger();
    let id = pending(&ledger, "NVDA", 40, 100.0).await;
    ledger.apply_fill(&id, 30, 100.0, Utc::now(), "fill-1").await.unwrap();

    let receipt = ledger
        .close(&id, 90.0, Utc::now(), ExitReason::Stop, "exit-1")
        .await
        .unwrap();
    assert_eq!(receipt.realized_pnl.unwrap().value(), -300.0);
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[tokio::test]
async fn test_invalid_transitions_leave_state_unchanged() {
    let ledger = ledger();
    let id = pending(&ledger, "XOM", 20, 110.0).await;

    // PENDING cannot close
    let err = ledger.close(&id, 120.0, Utc::now(), ExitReason::Manual, "exit-early").await.unwrap_err();
    assert_eq!(err.error_code(), "ERR_STATE_CONFLICT");
    assert_eq!(ledger.get(&id).await.unwrap().unwrap().status, PositionStatus::Pending);

    ledger.apply_fill(&id, 20, 110.0, Utc::now(), "fill-1").await.unwrap();
    ledger.close(&id, 120.0, Utc::now(), ExitReason::Target, "exit-1").await.unwrap();
    let closed = ledger.get(&id).await.unwrap().unwrap();

    // Terminal: nothing applies any more
    assert!(ledger.apply_fill(&id, 20, 111.0, Utc::now(), "fill-2").await.is_err());
    assert!(ledger.reject(&id, "late cancel", "cancel-1").await.is_err());
    assert!(ledger.close(&id, 125.0, Utc::now(), ExitReason::Manual, "exit-2").await.is_err());
    assert_eq!(ledger.get(&id).await.unwrap().unwrap(), closed);

    let statuses: Vec<PositionStatus> = ledger
        .events(&id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.to_status)
        .collect();
    assert_eq!(
        statuses,
        vec![PositionStatus::Pending, PositionStatus::Open, PositionStatus::Closed]
    );
}

#[tokio::test]
async fn test_rejected_position_frees_capital() {
    let ledger = ledger();
    let id = pending(&ledger, "KO", 100, 60.0).await;
    assert_eq!(ledger.summary(None).await.unwrap().capital_committed(), 6000.0);

    ledger.reject(&id, "broker refused", "cancel-1").await.unwrap();
    let summary = ledger.summary(None).await.unwrap();
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.capital_committed(), 0.0);
}

// ============================================================================
// IDEMPOTENCE
// ============================================================================

#[tokio::test]
async fn test_redelivered_messages_match_single_delivery() {
    let once = ledger();
    let twice = ledger();

    for ledger in [&once, &twice] {
        let id = pending(ledger, "JPM", 25, 195.0).await;
        ledger.apply_fill(&id, 25, 194.5, Utc::now(), "fill-1").await.unwrap();
        ledger.close(&id, 200.0, Utc::now(), ExitReason::Target, "exit-1").await.unwrap();
    }

    let id = pending(&twice, "JPM", 25, 195.0).await;
    let fill = twice.apply_fill(&id, 25, 194.5, Utc::now(), "fill-1").await.unwrap();
    let exit = twice.close(&id, 200.0, Utc::now(), ExitReason::Target, "exit-1").await.unwrap();
    assert!(fill.duplicate);
    assert!(exit.duplicate);

    let a = once.summary(None).await.unwrap();
    let b = twice.summary(None).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(twice.positions(None).await.unwrap().len(), 1);
    assert_eq!(twice.events(&id).await.unwrap().len(), 3);
}
