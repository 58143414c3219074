//! Portfolio department handler
//!
//! Routes Portfolio's inbound messages onto the position ledger and the
//! rebalancer, and closes each cycle with a deployment check, an optional
//! candidate request and a daily report to Executive.
//!
//! | Inbound             | Effect                                   | Outbound            |
//! |---------------------|------------------------------------------|---------------------|
//! | TradeApproval       | PENDING position, reservation released   | BuyOrder → Trading  |
//! | TradeRejection      | reservation released                     | -                   |
//! | FillConfirmation    | PENDING → OPEN                           | -                   |
//! | OrderCancellation   | PENDING → REJECTED                       | -                   |
//! | ExitSignal          | OPEN → CLOSED                            | -                   |
//! | CandidateList       | sizing, capital and slots reserved       | TradeProposal(s) → Compliance |
//!
//! Proposals hold their capital and position slot until Compliance answers
//! or the trading day ends, so later lists only size what is still free.

use crate::application::services::collaborator_pool::CollaboratorPool;
use crate::application::services::orchestrator::{
    CycleContext, HandlerError, HandlerOutcome, HandlerReport, MessageHandler, OutcomeKind,
};
use crate::domain::entities::candidate::Candidate;
use crate::domain::entities::message::{
    BuyOrder, CandidateList, DailyReport, Department, ExitSignal, FillConfirmation, Message,
    OrderCancellation, OutboundMessage, Payload, TradeApproval, TradeRejection,
};
use crate::domain::entities::position::{OrderIntent, PositionStatus};
use crate::domain::errors::{LedgerError, ValidationError};
use crate::domain::repositories::valuation_source::ValuationSource;
use crate::domain::services::deployment_monitor::{
    DeploymentConfig, DeploymentMonitor, DeploymentSnapshot,
};
use crate::domain::services::position_ledger::PositionLedger;
use crate::domain::services::position_reconciliation::ReconciliationReport;
use crate::domain::services::rebalancer::{ProposalReservations, Rebalancer, RebalancerConfig};
use crate::domain::value_objects::price::PriceBook;
use crate::persistence::reconciliation_audit::ReconciliationRepository;
use crate::task_runner::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Tickers per price request
const PRICE_BATCH_SIZE: usize = 50;

/// Portfolio value and prices fetched at the start of a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub portfolio_value: f64,
    /// None when the price source failed; positions are then valued at cost
    pub prices: Option<PriceBook>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PortfolioHandlerConfig {
    pub deployment: DeploymentConfig,
    pub rebalancer: RebalancerConfig,
    pub retry: RetryPolicy,
}

pub struct PortfolioHandler {
    ledger: Arc<PositionLedger>,
    monitor: DeploymentMonitor,
    rebalancer: Rebalancer,
    valuation: Arc<dyn ValuationSource>,
    pool: CollaboratorPool,
    retry: RetryPolicy,
    audit: Option<Arc<dyn ReconciliationRepository>>,
    cycle_valuation: RwLock<Option<Valuation>>,
    last_deployment: RwLock<Option<DeploymentSnapshot>>,
    reservations: Mutex<ProposalReservations>,
}

impl PortfolioHandler {
    pub fn new(
        ledger: Arc<PositionLedger>,
        valuation: Arc<dyn ValuationSource>,
        pool: CollaboratorPool,
        config: PortfolioHandlerConfig,
    ) -> Self {
        Self {
            monitor: DeploymentMonitor::new(ledger.clone(), config.deployment),
            rebalancer: Rebalancer::new(config.rebalancer),
            ledger,
            valuation,
            pool,
            retry: config.retry,
            audit: None,
            cycle_valuation: RwLock::new(None),
            last_deployment: RwLock::new(None),
            reservations: Mutex::new(ProposalReservations::new()),
        }
    }

    /// Persists every reconciliation report to the audit trail.
    pub fn with_audit(mut self, audit: Arc<dyn ReconciliationRepository>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub async fn current_valuation(&self) -> Option<Valuation> {
        self.cycle_valuation.read().await.clone()
    }

    async fn fetch_valuation(&self) -> Result<Valuation, HandlerError> {
        let source = &self.valuation;
        let pool = &self.pool;
        let portfolio_value = retry_with_backoff("portfolio value", &self.retry, || {
            pool.call("valuation.portfolio_value", source.portfolio_value())
        })
        .await?;

        let tickers: Vec<String> = self
            .ledger
            .positions(Some(PositionStatus::Open))
            .await?
            .into_iter()
            .map(|p| p.ticker)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let prices = match retry_with_backoff("prices", &self.retry, || self.fetch_prices(&tickers)).await {
            Ok(book) => Some(book),
            Err(e) => {
                warn!("Valuing open positions at cost: {}", e);
                None
            }
        };

        Ok(Valuation {
            portfolio_value,
            prices,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_prices(&self, tickers: &[String]) -> Result<PriceBook, HandlerError> {
        let calls: Vec<_> = tickers
            .chunks(PRICE_BATCH_SIZE)
            .map(|batch| self.valuation.prices(batch))
            .collect();

        let mut book = PriceBook::new();
        for result in self.pool.call_all("valuation.prices", calls).await {
            book.extend(result?);
        }
        Ok(book)
    }

    /// Rejects messages whose ticker disagrees with the position they name.
    async fn ensure_ticker(&self, position_id: &str, ticker: &str) -> Result<(), HandlerError> {
        if let Some(position) = self.ledger.get(position_id).await? {
            if position.ticker != ticker {
                return Err(LedgerError::Validation(ValidationError::InvalidTicker(format!(
                    "{} refers to {} but the message names {}",
                    position_id, position.ticker, ticker
                )))
                .into());
            }
        }
        Ok(())
    }

    async fn on_trade_approval(
        &self,
        message: &Message,
        approval: &TradeApproval,
    ) -> Result<HandlerOutcome, HandlerError> {
        let intent = OrderIntent::new(
            &approval.ticker,
            approval.sector.as_deref(),
            approval.shares,
            approval.entry_price,
            approval.stop_loss,
            approval.target,
        )
        .map_err(LedgerError::from)?;

        let position_id = self
            .ledger
            .create_pending(&intent, &message.id, approval.risk_assessment_id.as_deref())
            .await?;
        // the PENDING position now carries the committed capital
        self.reservations.lock().await.release(&approval.ticker);

        let order = BuyOrder {
            position_id: position_id.clone(),
            ticker: approval.ticker.clone(),
            shares: approval.shares,
            limit_price: approval.entry_price,
            stop_loss: approval.stop_loss,
            target: approval.target,
        };
        debug!(
            "Approval {} for proposal {} becomes order on {}",
            message.id, approval.proposal_id, position_id
        );

        Ok(HandlerOutcome::new(OutcomeKind::Approval).with_outbound(
            OutboundMessage::new(Department::Portfolio, Department::Trading, Payload::BuyOrder(order))
                .caused_by(&message.id)
                .with_idempotency_key(format!("buy-order:{}", position_id)),
        ))
    }

    async fn on_trade_rejection(&self, rejection: &TradeRejection) -> HandlerOutcome {
        self.reservations.lock().await.release(&rejection.ticker);
        info!(
            "Proposal {} for {} rejected ({}): {}",
            rejection.proposal_id,
            rejection.ticker,
            rejection.rejection_category,
            rejection.rejection_reason
        );
        HandlerOutcome::new(OutcomeKind::Rejection)
    }

    async fn on_fill(
        &self,
        message: &Message,
        fill: &FillConfirmation,
    ) -> Result<HandlerOutcome, HandlerError> {
        self.ensure_ticker(&fill.position_id, &fill.ticker).await?;
        let receipt = self
            .ledger
            .apply_fill(
                &fill.position_id,
                fill.filled_shares,
                fill.fill_price,
                fill.fill_date,
                &message.id,
            )
            .await?;

        if receipt.duplicate {
            return Ok(HandlerOutcome::new(OutcomeKind::Duplicate));
        }
        if receipt.unfilled_shares > 0 {
            info!(
                "Partial fill on {}: {} shares unfilled",
                receipt.position_id, receipt.unfilled_shares
            );
        }
        Ok(HandlerOutcome::new(OutcomeKind::Fill))
    }

    async fn on_cancellation(
        &self,
        message: &Message,
        cancellation: &OrderCancellation,
    ) -> Result<HandlerOutcome, HandlerError> {
        self.ensure_ticker(&cancellation.position_id, &cancellation.ticker).await?;
        let receipt = self
            .ledger
            .reject(&cancellation.position_id, &cancellation.reason, &message.id)
            .await?;

        Ok(HandlerOutcome::new(if receipt.duplicate {
            OutcomeKind::Duplicate
        } else {
            OutcomeKind::Cancellation
        }))
    }

    async fn on_exit(
        &self,
        message: &Message,
        exit: &ExitSignal,
    ) -> Result<HandlerOutcome, HandlerError> {
        self.ensure_ticker(&exit.position_id, &exit.ticker).await?;
        let receipt = self
            .ledger
            .close(
                &exit.position_id,
                exit.exit_price,
                exit.exit_date,
                exit.reason,
                &message.id,
            )
            .await?;

        if receipt.duplicate {
            return Ok(HandlerOutcome::new(OutcomeKind::Duplicate));
        }
        if let Some(pnl) = receipt.realized_pnl {
            info!(
                "Closed {} ({}): realized ${:.2}",
                receipt.position_id,
                exit.reason.as_str(),
                pnl.value()
            );
        }
        Ok(HandlerOutcome::new(OutcomeKind::Exit))
    }

    async fn on_candidate_list(
        &self,
        message: &Message,
        list: &CandidateList,
        ctx: &CycleContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Some(valuation) = self.current_valuation().await else {
            warn!(
                "Deferring candidate list {}: no portfolio valuation this cycle",
                message.id
            );
            return Ok(HandlerOutcome::deferred());
        };

        let snapshot = self
            .monitor
            .check_deployment_status(valuation.portfolio_value)
            .await?;
        if !snapshot.needs_rebalancing {
            info!(
                "Ignoring candidate list {}: deployment at {:.1}% of target",
                message.id,
                snapshot.deployment_pct * 100.0
            );
            return Ok(HandlerOutcome::new(OutcomeKind::Ignored));
        }

        let concentration = self
            .monitor
            .check_sector_concentration(valuation.prices.as_ref())
            .await?;
        let held: HashSet<String> = self
            .ledger
            .positions(None)
            .await?
            .into_iter()
            .filter(|p| matches!(p.status, PositionStatus::Pending | PositionStatus::Open))
            .map(|p| p.ticker)
            .collect();

        let mut reservations = self.reservations.lock().await;
        reservations.roll_to(ctx.trading_day);
        // a list handled again replaces what it reserved the first time
        reservations.release_source(&message.id);
        let free = reservations.apply_to(&snapshot);

        let eligible: Vec<Candidate> = list
            .candidates
            .iter()
            .filter(|c| {
                if held.contains(&c.ticker) || reservations.contains(&c.ticker) {
                    debug!("Skipping {}: already held, pending or proposed", c.ticker);
                    return false;
                }
                if concentration.is_over_concentrated(c.sector_or_unknown()) {
                    debug!("Skipping {}: sector {} over limit", c.ticker, c.sector_or_unknown());
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        let allocations = self.rebalancer.size_candidates(
            &eligible,
            free.available_capital,
            valuation.portfolio_value,
            free.available_positions as usize,
        );
        for allocation in &allocations {
            reservations.reserve(&allocation.ticker, &message.id, allocation.target_value);
        }
        info!(
            "Candidate list {}: {} of {} candidates sized against ${:.2} and {} free slots",
            message.id,
            allocations.len(),
            list.candidates.len(),
            free.available_capital,
            free.available_positions
        );

        let mut outcome = HandlerOutcome::new(OutcomeKind::Proposals(allocations.len()));
        for allocation in &allocations {
            outcome = outcome.with_outbound(
                OutboundMessage::new(
                    Department::Portfolio,
                    Department::Compliance,
                    Payload::TradeProposal(allocation.to_proposal()),
                )
                .caused_by(&message.id)
                .with_idempotency_key(format!("proposal:{}:{}", message.id, allocation.ticker)),
            );
        }
        Ok(outcome)
    }
}

#[async_trait]
impl MessageHandler for PortfolioHandler {
    fn department(&self) -> Department {
        Department::Portfolio
    }

    async fn begin_cycle(&self, ctx: &CycleContext) {
        let valuation = match self.fetch_valuation().await {
            Ok(valuation) => {
                debug!(
                    "Cycle {} valuation: portfolio ${:.2}",
                    ctx.cycle, valuation.portfolio_value
                );
                Some(valuation)
            }
            Err(e) => {
                warn!("Cycle {} has no portfolio valuation: {}", ctx.cycle, e);
                None
            }
        };
        *self.cycle_valuation.write().await = valuation;
        self.reservations.lock().await.roll_to(ctx.trading_day);
    }

    async fn handle(
        &self,
        message: &Message,
        ctx: &CycleContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        match &message.payload {
            Payload::TradeApproval(approval) => self.on_trade_approval(message, approval).await,
            Payload::TradeRejection(rejection) => Ok(self.on_trade_rejection(rejection).await),
            Payload::FillConfirmation(fill) => self.on_fill(message, fill).await,
            Payload::OrderCancellation(cancellation) => {
                self.on_cancellation(message, cancellation).await
            }
            Payload::ExitSignal(exit) => self.on_exit(message, exit).await,
            Payload::CandidateList(list) => self.on_candidate_list(message, list, ctx).await,
            _ => Err(HandlerError::Unroutable {
                department: Department::Portfolio,
                message_type: message.message_type(),
            }),
        }
    }

    async fn end_of_cycle(&self, ctx: &CycleContext) -> Result<Vec<OutboundMessage>, HandlerError> {
        let mut outbound = Vec::new();
        let valuation = self.current_valuation().await;
        let prices = valuation.as_ref().and_then(|v| v.prices.as_ref());

        let mut deployment_pct = None;
        match &valuation {
            Some(v) => {
                let snapshot = self.monitor.check_deployment_status(v.portfolio_value).await?;
                let concentration = self.monitor.check_sector_concentration(prices).await?;
                let free = self.reservations.lock().await.apply_to(&snapshot);
                if let Some(request) = self.rebalancer.generate_candidate_request(
                    &free,
                    &concentration.over_concentrated,
                    ctx.trading_day,
                ) {
                    outbound.push(request);
                }
                deployment_pct = Some(snapshot.deployment_pct);
                *self.last_deployment.write().await = Some(snapshot);
            }
            None => warn!("Skipping deployment check: no portfolio valuation this cycle"),
        }

        let reconciliation_anomalies = match self.reconcile().await {
            Ok(Some(report)) => report.anomaly_count() as u64,
            Ok(None) => 0,
            Err(e) => {
                warn!("Reconciliation skipped this cycle: {}", e);
                0
            }
        };

        let summary = self.ledger.summary(prices).await?;
        let report = DailyReport {
            pending: summary.pending,
            open: summary.open,
            closed: summary.closed,
            rejected: summary.rejected,
            capital_deployed: summary.capital_deployed,
            realized_pnl: summary.realized_pnl,
            deployment_pct,
            approvals: ctx.tally.approvals,
            rejections: ctx.tally.rejections,
            fills: ctx.tally.fills,
            exits: ctx.tally.exits,
            anomalies: ctx.tally.anomalies,
            reconciliation_anomalies,
        };
        outbound.push(
            OutboundMessage::new(
                Department::Portfolio,
                Department::Executive,
                Payload::DailyReport(report),
            )
            .with_idempotency_key(format!(
                "daily-report:{}:{}",
                ctx.started_at.timestamp_millis(),
                ctx.cycle
            )),
        );

        Ok(outbound)
    }

    async fn report(&self) -> Result<HandlerReport, HandlerError> {
        let valuation = self.current_valuation().await;
        let ledger = self
            .ledger
            .summary(valuation.as_ref().and_then(|v| v.prices.as_ref()))
            .await?;
        Ok(HandlerReport {
            ledger: Some(ledger),
            deployment: self.last_deployment.read().await.clone(),
        })
    }

    async fn reconcile(&self) -> Result<Option<ReconciliationReport>, HandlerError> {
        let source = &self.valuation;
        let pool = &self.pool;
        let broker = match retry_with_backoff("broker snapshot", &self.retry, || {
            pool.call("valuation.broker_snapshot", source.broker_snapshot())
        })
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Reconciling without a broker view: {}", e);
                None
            }
        };

        let report = self.ledger.reconcile(broker.as_ref(), Utc::now()).await?;
        if let Some(audit) = &self.audit {
            if !audit.save_reconciliation(&report).await? {
                warn!(
                    "Reconciliation {} was not added to the audit trail",
                    report.reconciliation_id
                );
            }
        }
        Ok(Some(report))
    }
}
