//! SQLite Durability End-to-End Tests
//!
//! Runs the Portfolio department against an on-disk database, closes the
//! pool and reopens it, the way a process restart would.

use atrium::application::handlers::portfolio_handler::{PortfolioHandler, PortfolioHandlerConfig};
use atrium::application::services::collaborator_pool::{CollaboratorPool, CollaboratorPoolConfig};
use atrium::application::services::orchestrator::{CancelFlag, DepartmentOrchestrator};
use atrium::domain::entities::message::{
    Department, FillConfirmation, OutboundMessage, Payload, TradeApproval,
};
use atrium::domain::entities::position::{OrderIntent, PositionStatus};
use atrium::domain::repositories::message_bus::MessageBus;
use atrium::domain::services::position_ledger::PositionLedger;
use atrium::domain::services::position_reconciliation::ReconciliationConfig;
use atrium::infrastructure::valuation::StaticValuation;
use atrium::persistence::message_repository::SqliteMessageBus;
use atrium::persistence::position_repository::SqlitePositionStore;
use atrium::persistence::reconciliation_audit::{
    ReconciliationRepository, SqliteReconciliationRepository,
};
use atrium::persistence::{init_database, DbPool};
use atrium::task_runner::RetryPolicy;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Desk {
    pool: DbPool,
    bus: Arc<SqliteMessageBus>,
    ledger: Arc<PositionLedger>,
    audit: Arc<SqliteReconciliationRepository>,
    portfolio: DepartmentOrchestrator<PortfolioHandler>,
}

async fn open(dir: &Path) -> Desk {
    let url = format!("sqlite://{}", dir.join("desk.db").display());
    let pool = init_database(&url).await.unwrap();

    let bus = Arc::new(SqliteMessageBus::new(pool.clone()));
    let audit = Arc::new(SqliteReconciliationRepository::new(pool.clone()));
    let ledger = Arc::new(PositionLedger::new(
        Arc::new(SqlitePositionStore::new(pool.clone())),
        ReconciliationConfig::default(),
    ));
    let handler = PortfolioHandler::new(
        ledger.clone(),
        Arc::new(StaticValuation::new(100_000.0)),
        CollaboratorPool::new(CollaboratorPoolConfig::default()),
        PortfolioHandlerConfig::default(),
    )
    .with_audit(audit.clone());

    Desk {
        pool,
        bus: bus.clone(),
        ledger,
        audit,
        portfolio: DepartmentOrchestrator::new(Arc::new(handler), bus, RetryPolicy::default()),
    }
}

fn approval(ticker: &str) -> OutboundMessage {
    OutboundMessage::new(
        Department::Compliance,
        Department::Portfolio,
        Payload::TradeApproval(TradeApproval {
            proposal_id: format!("prop-{}", ticker),
            ticker: ticker.to_string(),
            sector: Some("Financials".to_string()),
            shares: 40,
            entry_price: 190.0,
            stop_loss: Some(180.0),
            target: Some(210.0),
            validation_status: "APPROVED".to_string(),
            risk_assessment_id: None,
        }),
    )
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    let position_id = {
        let mut desk = open(dir.path()).await;
        desk.bus.send(&approval("JPM")).await.unwrap();
        let report = desk.portfolio.run_cycle(&CancelFlag::new()).await.unwrap();
        assert_eq!(report.acked, 1);

        let positions = desk.ledger.positions(Some(PositionStatus::Pending)).await.unwrap();
        assert_eq!(positions.len(), 1);

        // delivered but not yet processed when the process stops
        desk.bus
            .send(&OutboundMessage::new(
                Department::Trading,
                Department::Portfolio,
                Payload::FillConfirmation(FillConfirmation {
                    position_id: positions[0].position_id.clone(),
                    ticker: "JPM".to_string(),
                    filled_shares: 40,
                    fill_price: 189.5,
                    fill_date: Utc::now(),
                }),
            ))
            .await
            .unwrap();

        desk.pool.close().await;
        positions[0].position_id.clone()
    };

    let mut desk = open(dir.path()).await;

    let position = desk.ledger.get(&position_id).await.unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Pending);
    assert_eq!(desk.bus.pending_count(Department::Portfolio).await.unwrap(), 1);
    assert_eq!(desk.bus.pending_count(Department::Trading).await.unwrap(), 1);
    assert!(desk.audit.get_last_reconciliation().await.unwrap().is_some());

    let report = desk.portfolio.run_cycle(&CancelFlag::new()).await.unwrap();
    assert_eq!(report.tally.fills, 1);

    let position = desk.ledger.get(&position_id).await.unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(desk.ledger.events(&position_id).await.unwrap().len(), 2);
    assert_eq!(desk.bus.pending_count(Department::Portfolio).await.unwrap(), 0);

    desk.pool.close().await;
}

#[tokio::test]
async fn test_idempotency_keys_survive_restart() {
    let dir = TempDir::new().unwrap();

    {
        let mut desk = open(dir.path()).await;
        desk.portfolio.run_cycle(&CancelFlag::new()).await.unwrap();
        assert_eq!(desk.bus.pending_count(Department::Research).await.unwrap(), 1);
        desk.pool.close().await;
    }

    // same trading day, fresh process: the CandidateRequest is not repeated
    let mut desk = open(dir.path()).await;
    desk.portfolio.run_cycle(&CancelFlag::new()).await.unwrap();
    assert_eq!(desk.bus.pending_count(Department::Research).await.unwrap(), 1);

    // one daily report per cycle, across both processes
    assert_eq!(desk.bus.history(Department::Executive).await.unwrap().len(), 2);

    desk.pool.close().await;
}

#[tokio::test]
async fn test_replayed_approval_after_restart_reuses_position() {
    let dir = TempDir::new().unwrap();

    let approval_id = {
        let mut desk = open(dir.path()).await;
        let id = desk.bus.send(&approval("BAC")).await.unwrap();
        desk.portfolio.run_cycle(&CancelFlag::new()).await.unwrap();
        desk.pool.close().await;
        id
    };

    let desk = open(dir.path()).await;
    let intent = OrderIntent::new("BAC", Some("Financials"), 40, 190.0, Some(180.0), Some(210.0)).unwrap();
    let position_id = desk.ledger.create_pending(&intent, &approval_id, None).await.unwrap();

    assert_eq!(position_id, format!("pos_BAC_{}", approval_id));
    let positions = desk.ledger.positions(None).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].order_msg_id, approval_id);
    desk.pool.close().await;
}
