//! Department Orchestrator
//!
//! Runs one trading cycle for a department: drain the inbox, route each
//! message to the department's handler, then send every produced message and
//! ack the inbound ones that completed.
//!
//! Failure handling:
//! - malformed, unroutable and business-rejected messages are recorded as
//!   anomalies and left unacked for manual review
//! - transient infrastructure failures are retried with backoff; once
//!   retries are exhausted the cycle aborts and nothing is acked
//! - cancellation is checked between messages; completed messages are still
//!   flushed and acked, the rest stay pending for the next cycle
//!
//! Handlers are idempotent per inbound message id, so a message that is
//! handled again after an aborted cycle produces the same outbound messages
//! under the same idempotency keys and the bus absorbs the repeats.

use crate::domain::entities::message::{
    Department, Inbound, Message, MessageType, OutboundMessage,
};
use crate::domain::errors::{BusError, CollaboratorError, LedgerError, StoreError};
use crate::domain::repositories::message_bus::MessageBus;
use crate::domain::services::deployment_monitor::DeploymentSnapshot;
use crate::domain::services::position_ledger::LedgerSummary;
use crate::domain::services::position_reconciliation::ReconciliationReport;
use crate::task_runner::{retry_with_backoff, Retryable, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Anomalies kept in memory for the status view
const MAX_RECENT_ANOMALIES: usize = 50;

/// Cooperative stop signal, checked between messages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What handling a message amounted to, for the cycle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Approval,
    Rejection,
    Fill,
    Exit,
    Cancellation,
    Proposals(usize),
    /// Already applied by an earlier delivery
    Duplicate,
    Ignored,
    /// Cannot be handled this cycle; left pending without an anomaly
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub kind: OutcomeKind,
    pub outbound: Vec<OutboundMessage>,
}

impl HandlerOutcome {
    pub fn new(kind: OutcomeKind) -> Self {
        Self {
            kind,
            outbound: Vec::new(),
        }
    }

    pub fn deferred() -> Self {
        Self::new(OutcomeKind::Deferred)
    }

    pub fn with_outbound(mut self, message: OutboundMessage) -> Self {
        self.outbound.push(message);
        self
    }
}

/// Per-cycle counters. Also used as running totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleTally {
    pub processed: u64,
    pub approvals: u64,
    pub rejections: u64,
    pub fills: u64,
    pub exits: u64,
    pub cancellations: u64,
    pub proposals: u64,
    pub duplicates: u64,
    pub deferred: u64,
    pub anomalies: u64,
}

impl CycleTally {
    pub fn record(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Approval => self.approvals += 1,
            OutcomeKind::Rejection => self.rejections += 1,
            OutcomeKind::Fill => self.fills += 1,
            OutcomeKind::Exit => self.exits += 1,
            OutcomeKind::Cancellation => self.cancellations += 1,
            OutcomeKind::Proposals(n) => self.proposals += n as u64,
            OutcomeKind::Duplicate => self.duplicates += 1,
            OutcomeKind::Ignored => {}
            OutcomeKind::Deferred => {
                self.deferred += 1;
                return;
            }
        }
        self.processed += 1;
    }

    pub fn merge(&mut self, other: &CycleTally) {
        self.processed += other.processed;
        self.approvals += other.approvals;
        self.rejections += other.rejections;
        self.fills += other.fills;
        self.exits += other.exits;
        self.cancellations += other.cancellations;
        self.proposals += other.proposals;
        self.duplicates += other.duplicates;
        self.deferred += other.deferred;
        self.anomalies += other.anomalies;
    }
}

/// State shared with the handler for the duration of one cycle.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub trading_day: NaiveDate,
    pub tally: CycleTally,
}

impl CycleContext {
    pub fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            started_at,
            trading_day: started_at.date_naive(),
            tally: CycleTally::default(),
        }
    }
}

/// Errors a department handler can raise.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandlerError {
    #[error("{department} does not handle {message_type}")]
    Unroutable {
        department: Department,
        message_type: MessageType,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl HandlerError {
    /// Expected conditions that leave the message for manual review instead
    /// of aborting the cycle.
    pub fn is_anomaly(&self) -> bool {
        match self {
            HandlerError::Unroutable { .. } => true,
            HandlerError::Ledger(e) => e.is_business(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            HandlerError::Unroutable { .. } => "ERR_UNROUTABLE",
            HandlerError::Ledger(e) => e.error_code(),
            HandlerError::Store(_) => "ERR_STORE",
            HandlerError::Bus(_) => "ERR_BUS",
            HandlerError::Collaborator(_) => "ERR_COLLABORATOR",
        }
    }
}

impl Retryable for HandlerError {
    fn is_transient(&self) -> bool {
        match self {
            HandlerError::Unroutable { .. } => false,
            HandlerError::Ledger(e) => e.is_transient(),
            HandlerError::Store(e) => e.is_transient(),
            HandlerError::Bus(e) => e.is_transient(),
            HandlerError::Collaborator(e) => e.is_retryable(),
        }
    }
}

/// Infrastructure failures that abort a cycle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Could not read inbox: {0}")]
    Inbox(BusError),

    #[error("Handling message {message_id} failed: {source}")]
    Dispatch {
        message_id: String,
        source: HandlerError,
    },

    #[error("End of cycle failed: {0}")]
    EndOfCycle(HandlerError),

    #[error("Could not send {message_type}: {source}")]
    Send {
        message_type: MessageType,
        source: BusError,
    },

    #[error("Could not ack message {message_id}: {source}")]
    Ack { message_id: String, source: BusError },
}

/// A message left pending for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub message_id: Option<String>,
    pub message_type: String,
    pub sender: String,
    pub code: String,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl Anomaly {
    fn from_error(message: &Message, error: &HandlerError) -> Self {
        Self {
            message_id: Some(message.id.clone()),
            message_type: message.message_type().to_string(),
            sender: message.sender.to_string(),
            code: error.error_code().to_string(),
            detail: error.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Extra status a handler contributes beyond the cycle counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HandlerReport {
    pub ledger: Option<LedgerSummary>,
    pub deployment: Option<DeploymentSnapshot>,
}

/// The seam between the generic cycle and a department's business rules.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn department(&self) -> Department;

    /// Called once before the inbox is dispatched.
    async fn begin_cycle(&self, _ctx: &CycleContext) {}

    /// Applies one inbound message. Must be idempotent per message id.
    async fn handle(
        &self,
        message: &Message,
        ctx: &CycleContext,
    ) -> Result<HandlerOutcome, HandlerError>;

    /// Called once after the inbox, unless the cycle was cancelled.
    async fn end_of_cycle(&self, _ctx: &CycleContext) -> Result<Vec<OutboundMessage>, HandlerError> {
        Ok(Vec::new())
    }

    async fn report(&self) -> Result<HandlerReport, HandlerError> {
        Ok(HandlerReport::default())
    }

    /// Runs an advisory reconciliation, for handlers that own positions.
    async fn reconcile(&self) -> Result<Option<ReconciliationReport>, HandlerError> {
        Ok(None)
    }
}

/// Result of one completed cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub department: Department,
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tally: CycleTally,
    pub sent: usize,
    pub acked: usize,
    pub cancelled: bool,
    /// Messages not reached because of cancellation
    pub remaining: usize,
}

/// Aggregate counters across all cycles
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentStatus {
    pub department: Department,
    pub cycles_completed: u64,
    pub cycles_aborted: u64,
    pub cycles_cancelled: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub totals: CycleTally,
    pub pending_messages: Option<usize>,
    pub quarantined: usize,
    pub recent_anomalies: Vec<Anomaly>,
    pub ledger: Option<LedgerSummary>,
    pub deployment: Option<DeploymentSnapshot>,
}

pub struct DepartmentOrchestrator<H: MessageHandler> {
    handler: Arc<H>,
    bus: Arc<dyn MessageBus>,
    retry: RetryPolicy,
    cycle_seq: u64,
    cycles_completed: u64,
    cycles_aborted: u64,
    cycles_cancelled: u64,
    last_cycle_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    totals: CycleTally,
    /// Messages already reported as anomalies; skipped until restart
    quarantined: HashSet<String>,
    recent_anomalies: VecDeque<Anomaly>,
}

impl<H: MessageHandler> DepartmentOrchestrator<H> {
    pub fn new(handler: Arc<H>, bus: Arc<dyn MessageBus>, retry: RetryPolicy) -> Self {
        Self {
            handler,
            bus,
            retry,
            cycle_seq: 0,
            cycles_completed: 0,
            cycles_aborted: 0,
            cycles_cancelled: 0,
            last_cycle_at: None,
            last_error: None,
            totals: CycleTally::default(),
            quarantined: HashSet::new(),
            recent_anomalies: VecDeque::new(),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn department(&self) -> Department {
        self.handler.department()
    }

    /// Runs one cycle. On error nothing from this cycle was acked.
    pub async fn run_cycle(&mut self, cancel: &CancelFlag) -> Result<CycleReport, OrchestratorError> {
        self.cycle_seq += 1;
        let mut ctx = CycleContext::new(self.cycle_seq, Utc::now());
        info!("{} cycle {} started", self.department(), ctx.cycle);

        let result = self.execute_cycle(&mut ctx, cancel).await;

        self.totals.merge(&ctx.tally);
        self.last_cycle_at = Some(ctx.started_at);
        match &result {
            Ok(report) => {
                self.cycles_completed += 1;
                if report.cancelled {
                    self.cycles_cancelled += 1;
                }
                self.last_error = None;
                info!(
                    "{} cycle {} done: {} processed, {} sent, {} acked, {} anomalies",
                    report.department,
                    report.cycle,
                    report.tally.processed,
                    report.sent,
                    report.acked,
                    report.tally.anomalies
                );
            }
            Err(e) => {
                self.cycles_aborted += 1;
                self.last_error = Some(e.to_string());
                error!("{} cycle {} aborted: {}", self.department(), ctx.cycle, e);
            }
        }
        result
    }

    async fn execute_cycle(
        &mut self,
        ctx: &mut CycleContext,
        cancel: &CancelFlag,
    ) -> Result<CycleReport, OrchestratorError> {
        let department = self.department();
        let handler = self.handler.clone();
        let bus = self.bus.clone();
        let retry = self.retry.clone();

        let inbox = retry_with_backoff("receive inbox", &retry, || bus.receive(department))
            .await
            .map_err(OrchestratorError::Inbox)?;
        debug!("{} inbox holds {} messages", department, inbox.len());

        handler.begin_cycle(ctx).await;

        let mut completed: Vec<String> = Vec::new();
        let mut outbound: Vec<OutboundMessage> = Vec::new();
        let mut cancelled = false;
        let mut remaining = 0;

        for (index, inbound) in inbox.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                remaining = inbox.len() - index;
                info!(
                    "{} cycle {} cancelled with {} messages left",
                    department, ctx.cycle, remaining
                );
                break;
            }
            if self.quarantined.contains(inbound.id()) {
                continue;
            }

            let message = match inbound {
                Inbound::Valid(message) => message,
                Inbound::Malformed {
                    id,
                    sender,
                    message_type,
                    error,
                } => {
                    self.record_anomaly(
                        &mut ctx.tally,
                        Anomaly {
                            message_id: Some(id.clone()),
                            message_type: message_type.clone(),
                            sender: sender.clone(),
                            code: "ERR_MALFORMED".to_string(),
                            detail: error.to_string(),
                            recorded_at: Utc::now(),
                        },
                    );
                    continue;
                }
            };

            debug!(
                "Dispatching {} {} from {}",
                message.message_type(),
                message.id,
                message.sender
            );
            let result = {
                let handler = &handler;
                let ctx: &CycleContext = ctx;
                let name = format!("handle {} {}", message.message_type(), message.id);
                retry_with_backoff(&name, &retry, move || handler.handle(message, ctx)).await
            };

            match result {
                Ok(outcome) => {
                    ctx.tally.record(outcome.kind);
                    if outcome.kind == OutcomeKind::Deferred {
                        debug!("Message {} deferred to a later cycle", message.id);
                        continue;
                    }
                    outbound.extend(outcome.outbound);
                    completed.push(message.id.clone());
                }
                Err(e) if e.is_anomaly() => {
                    self.record_anomaly(&mut ctx.tally, Anomaly::from_error(message, &e));
                }
                Err(e) => {
                    return Err(OrchestratorError::Dispatch {
                        message_id: message.id.clone(),
                        source: e,
                    });
                }
            }
        }

        if !cancelled {
            let closing = {
                let handler = &handler;
                let ctx: &CycleContext = ctx;
                retry_with_backoff("end of cycle", &retry, move || handler.end_of_cycle(ctx)).await
            };
            match closing {
                Ok(messages) => outbound.extend(messages),
                Err(e) if e.is_anomaly() => {
                    self.record_anomaly(
                        &mut ctx.tally,
                        Anomaly {
                            message_id: None,
                            message_type: "EndOfCycle".to_string(),
                            sender: department.to_string(),
                            code: e.error_code().to_string(),
                            detail: e.to_string(),
                            recorded_at: Utc::now(),
                        },
                    );
                }
                Err(e) => return Err(OrchestratorError::EndOfCycle(e)),
            }
        }

        let sent = self.flush(&outbound).await?;
        let acked = self.ack_all(&completed).await?;

        Ok(CycleReport {
            department,
            cycle: ctx.cycle,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            tally: ctx.tally.clone(),
            sent,
            acked,
            cancelled,
            remaining,
        })
    }

    async fn flush(&self, outbound: &[OutboundMessage]) -> Result<usize, OrchestratorError> {
        for message in outbound {
            let bus = &self.bus;
            let id = retry_with_backoff("send", &self.retry, || bus.send(message))
                .await
                .map_err(|source| OrchestratorError::Send {
                    message_type: message.message_type(),
                    source,
                })?;
            debug!(
                "Sent {} to {} as {}",
                message.message_type(),
                message.recipient,
                id
            );
        }
        Ok(outbound.len())
    }

    async fn ack_all(&self, completed: &[String]) -> Result<usize, OrchestratorError> {
        let mut acked = 0;
        for message_id in completed {
            let bus = &self.bus;
            let fresh = retry_with_backoff("ack", &self.retry, || bus.ack(message_id))
                .await
                .map_err(|source| OrchestratorError::Ack {
                    message_id: message_id.clone(),
                    source,
                })?;
            if fresh {
                acked += 1;
            } else {
                debug!("Message {} was already acked", message_id);
            }
        }
        Ok(acked)
    }

    fn record_anomaly(&mut self, tally: &mut CycleTally, anomaly: Anomaly) {
        warn!(
            "Anomaly {} on {} {} from {}: {}",
            anomaly.code,
            anomaly.message_type,
            anomaly.message_id.as_deref().unwrap_or("-"),
            anomaly.sender,
            anomaly.detail
        );
        tally.anomalies += 1;
        if let Some(id) = &anomaly.message_id {
            self.quarantined.insert(id.clone());
        }
        if self.recent_anomalies.len() == MAX_RECENT_ANOMALIES {
            self.recent_anomalies.pop_front();
        }
        self.recent_anomalies.push_back(anomaly);
    }

    pub async fn status(&self) -> DepartmentStatus {
        let department = self.department();
        let pending_messages = match self.bus.pending_count(department).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Could not count pending messages for {}: {}", department, e);
                None
            }
        };
        let report = match self.handler.report().await {
            Ok(report) => report,
            Err(e) => {
                warn!("Could not build {} report: {}", department, e);
                HandlerReport::default()
            }
        };

        DepartmentStatus {
            department,
            cycles_completed: self.cycles_completed,
            cycles_aborted: self.cycles_aborted,
            cycles_cancelled: self.cycles_cancelled,
            last_cycle_at: self.last_cycle_at,
            last_error: self.last_error.clone(),
            totals: self.totals.clone(),
            pending_messages,
            quarantined: self.quarantined.len(),
            recent_anomalies: self.recent_anomalies.iter().cloned().collect(),
            ledger: report.ledger,
            deployment: report.deployment,
        }
    }

    pub async fn reconcile(&self) -> Result<Option<ReconciliationReport>, HandlerError> {
        self.handler.reconcile().await
    }
}
