//! Deployment Rebalancing End-to-End Tests
//!
//! Covers the loop between Portfolio and Research: an under-deployed
//! portfolio asks for candidates, and the candidate list it gets back is
//! sized into trade proposals for Compliance.

use atrium::application::handlers::portfolio_handler::{PortfolioHandler, PortfolioHandlerConfig};
use atrium::application::services::collaborator_pool::{CollaboratorPool, CollaboratorPoolConfig};
use atrium::application::services::orchestrator::{CancelFlag, DepartmentOrchestrator};
use atrium::domain::entities::candidate::Candidate;
use atrium::domain::entities::message::{
    CandidateList, Department, Inbound, Message, OutboundMessage, Payload, TradeApproval,
    TradeProposal,
};
use atrium::domain::entities::position::OrderIntent;
use atrium::domain::repositories::message_bus::MessageBus;
use atrium::domain::services::position_ledger::PositionLedger;
use atrium::domain::services::position_reconciliation::ReconciliationConfig;
use atrium::infrastructure::memory_bus::InMemoryMessageBus;
use atrium::infrastructure::memory_store::InMemoryPositionStore;
use atrium::infrastructure::valuation::StaticValuation;
use atrium::task_runner::RetryPolicy;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

struct Desk {
    bus: Arc<InMemoryMessageBus>,
    valuation: StaticValuation,
    ledger: Arc<PositionLedger>,
    portfolio: DepartmentOrchestrator<PortfolioHandler>,
}

fn desk(portfolio_value: f64) -> Desk {
    let retry = RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    let bus = Arc::new(InMemoryMessageBus::new());
    let valuation = StaticValuation::new(portfolio_value);
    let ledger = Arc::new(PositionLedger::new(
        Arc::new(InMemoryPositionStore::new()),
        ReconciliationConfig::default(),
    ));
    let handler = PortfolioHandler::new(
        ledger.clone(),
        Arc::new(valuation.clone()),
        CollaboratorPool::new(CollaboratorPoolConfig::default()),
        PortfolioHandlerConfig {
            retry: retry.clone(),
            ..PortfolioHandlerConfig::default()
        },
    );
    Desk {
        bus: bus.clone(),
        valuation,
        ledger,
        portfolio: DepartmentOrchestrator::new(Arc::new(handler), bus, retry),
    }
}

async fn inbox(bus: &InMemoryMessageBus, department: Department) -> Vec<Message> {
    bus.receive(department)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|inbound| match inbound {
            Inbound::Valid(message) => Some(message),
            Inbound::Malformed { .. } => None,
        })
        .collect()
}

async fn proposals(bus: &InMemoryMessageBus) -> Vec<TradeProposal> {
    inbox(bus, Department::Compliance)
        .await
        .into_iter()
        .filter_map(|m| match m.payload {
            Payload::TradeProposal(p) => Some(p),
            _ => None,
        })
        .collect()
}

async fn send_candidates(bus: &InMemoryMessageBus, request_id: Option<String>, candidates: Vec<Candidate>) -> String {
    bus.send(&OutboundMessage::new(
        Department::Research,
        Department::Portfolio,
        Payload::CandidateList(CandidateList {
            request_id,
            candidates,
        }),
    ))
    .await
    .unwrap()
}

#[tokio::test]
async fn test_request_list_proposal_round_trip() {
    let mut desk = desk(100_000.0);
    let cancel = CancelFlag::new();

    desk.portfolio.run_cycle(&cancel).await.unwrap();
    let requests = inbox(&desk.bus, Department::Research).await;
    assert_eq!(requests.len(), 1);
    let request_id = requests[0].id.clone();

    let list_id = send_candidates(
        &desk.bus,
        Some(request_id),
        vec![
            Candidate::new("AAPL", 85.0, "Technology", 180.0),
            Candidate::new("MSFT", 80.0, "Technology", 400.0),
            Candidate::new("XOM", 72.0, "Energy", 110.0),
            Candidate::new("WEAK", 40.0, "Utilities", 50.0),
        ],
    )
    .await;

    let report = desk.portfolio.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.tally.proposals, 3);

    let sent = inbox(&desk.bus, Department::Compliance).await;
    assert!(sent
        .iter()
        .all(|m| m.causation_id.as_deref() == Some(list_id.as_str())));

    let proposals = proposals(&desk.bus).await;
    let tickers: Vec<&str> = proposals.iter().map(|p| p.ticker.as_str()).collect();
    assert_eq!(tickers, vec!["AAPL", "MSFT", "XOM"]);

    for proposal in &proposals {
        // every weight exceeds the 10% single-position cap here
        assert!((proposal.target_value - 10_000.0).abs() < 1e-6);
        assert!(proposal.shares as f64 * proposal.entry_price <= proposal.target_value);
    }
    assert_eq!(proposals[0].shares, 55);
    assert_eq!(proposals[1].shares, 25);
    assert_eq!(proposals[2].shares, 90);
}

#[tokio::test]
async fn test_candidate_list_waits_for_valuation() {
    let mut desk = desk(100_000.0);
    let cancel = CancelFlag::new();
    desk.valuation.set_portfolio_value(0.0).await;

    send_candidates(
        &desk.bus,
        None,
        vec![Candidate::new("JPM", 75.0, "Financials", 190.0)],
    )
    .await;

    let report = desk.portfolio.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.tally.deferred, 1);
    assert_eq!(report.acked, 0);
    assert!(proposals(&desk.bus).await.is_empty());
    assert_eq!(desk.bus.pending_count(Department::Portfolio).await.unwrap(), 1);

    let reports = inbox(&desk.bus, Department::Executive).await;
    match &reports[0].payload {
        Payload::DailyReport(report) => assert_eq!(report.deployment_pct, None),
        other => panic!("expected DailyReport, got {:?}", other),
    }

    desk.valuation.set_portfolio_value(100_000.0).await;
    let report = desk.portfolio.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.tally.proposals, 1);
    assert_eq!(desk.bus.pending_count(Department::Portfolio).await.unwrap(), 0);
    assert_eq!(proposals(&desk.bus).await[0].ticker, "JPM");
}

#[tokio::test]
async fn test_deployed_portfolio_ignores_candidates() {
    let mut desk = desk(10_000.0);
    let cancel = CancelFlag::new();

    desk.bus
        .send(&OutboundMessage::new(
            Department::Compliance,
            Department::Portfolio,
            Payload::TradeApproval(TradeApproval {
                proposal_id: "prop-XOM".to_string(),
                ticker: "XOM".to_string(),
                sector: Some("Energy".to_string()),
                shares: 80,
                entry_price: 100.0,
                stop_loss: None,
                target: None,
                validation_status: "APPROVED".to_string(),
                risk_assessment_id: None,
            }),
        ))
        .await
        .unwrap();

    // 8,000 committed against a 9,000 target is above the 85% threshold
    desk.portfolio.run_cycle(&cancel).await.unwrap();
    assert!(inbox(&desk.bus, Department::Research).await.is_empty());

    send_candidates(
        &desk.bus,
        None,
        vec![Candidate::new("CVX", 90.0, "Energy", 150.0)],
    )
    .await;
    let report = desk.portfolio.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.tally.proposals, 0);
    assert_eq!(report.acked, 1);
    assert!(proposals(&desk.bus).await.is_empty());
}

#[tokio::test]
async fn test_concentrated_sector_is_excluded() {
    let mut desk = desk(100_000.0);
    let cancel = CancelFlag::new();

    let intent = OrderIntent::new("AAPL", Some("Technology"), 50, 180.0, None, None).unwrap();
    let position_id = desk.ledger.create_pending(&intent, "seed-order", None).await.unwrap();
    desk.ledger
        .apply_fill(&position_id, 50, 180.0, Utc::now(), "seed-fill")
        .await
        .unwrap();

    desk.portfolio.run_cycle(&cancel).await.unwrap();
    let requests = inbox(&desk.bus, Department::Research).await;
    match &requests[0].payload {
        Payload::CandidateRequest(request) => {
            assert_eq!(request.excluded_sectors, vec!["Technology".to_string()]);
            assert!(request.sector_diversification);
            assert_eq!(request.available_positions, 9);
            assert!((request.available_capital - 81_000.0).abs() < 1e-6);
        }
        other => panic!("expected CandidateRequest, got {:?}", other),
    }

    send_candidates(
        &desk.bus,
        Some(requests[0].id.clone()),
        vec![
            Candidate::new("AAPL", 95.0, "Technology", 180.0),
            Candidate::new("MSFT", 90.0, "Technology", 400.0),
            Candidate::new("XOM", 70.0, "Energy", 110.0),
        ],
    )
    .await;
    desk.portfolio.run_cycle(&cancel).await.unwrap();

    let proposals = proposals(&desk.bus).await;
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].ticker, "XOM");
    assert_eq!(proposals[0].shares, 90);
}

#[tokio::test]
async fn test_two_lists_in_one_cycle_stay_within_capital() {
    let mut desk = desk(10_000.0);
    let cancel = CancelFlag::new();

    for prefix in ["A", "B"] {
        let candidates = (0..10)
            .map(|i| Candidate::new(&format!("{}{}", prefix, i), 80.0, "Industrials", 50.0))
            .collect();
        send_candidates(&desk.bus, None, candidates).await;
    }

    let report = desk.portfolio.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.acked, 2);
    assert_eq!(report.tally.proposals, 10);

    let proposals = proposals(&desk.bus).await;
    let total: f64 = proposals.iter().map(|p| p.target_value).sum();
    assert!(total <= 9_000.0 + 1e-6, "proposed {} of 9000", total);
    assert!(proposals.iter().all(|p| p.ticker.starts_with('A')));

    // every slot is spoken for, so no new request goes to Research
    assert!(inbox(&desk.bus, Department::Research).await.is_empty());
}
