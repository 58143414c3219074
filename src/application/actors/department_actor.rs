//! Department Actor
//!
//! Owns a department orchestrator and runs its cycles on a fixed interval.
//! Cycles can also be requested on demand. Commands are processed one at a
//! time, so two cycles of the same department never overlap.

use crate::application::services::orchestrator::{
    CancelFlag, CycleReport, DepartmentOrchestrator, DepartmentStatus, HandlerError,
    MessageHandler, OrchestratorError,
};
use crate::domain::services::position_reconciliation::ReconciliationReport;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Channel capacity for department actor messages
const DEPARTMENT_CHANNEL_CAPACITY: usize = 100;

/// Messages that can be sent to the department actor
#[derive(Debug)]
pub enum DepartmentMessage {
    /// Run one cycle now
    RunCycle {
        reply: mpsc::Sender<Result<CycleReport, OrchestratorError>>,
    },

    GetStatus {
        reply: mpsc::Sender<DepartmentStatus>,
    },

    /// Run an advisory reconciliation now
    Reconcile {
        reply: mpsc::Sender<Result<Option<ReconciliationReport>, HandlerError>>,
    },

    /// Shutdown the actor
    Shutdown,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DepartmentActorError {
    #[error("Department actor is not running")]
    Closed,

    #[error(transparent)]
    Cycle(#[from] OrchestratorError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Cloneable front end for a spawned department actor.
#[derive(Debug, Clone)]
pub struct DepartmentHandle {
    tx: mpsc::Sender<DepartmentMessage>,
    cancel: CancelFlag,
}

impl DepartmentHandle {
    pub async fn run_cycle(&self) -> Result<CycleReport, DepartmentActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.send(DepartmentMessage::RunCycle { reply }).await?;
        Ok(rx.recv().await.ok_or(DepartmentActorError::Closed)??)
    }

    pub async fn status(&self) -> Result<DepartmentStatus, DepartmentActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.send(DepartmentMessage::GetStatus { reply }).await?;
        rx.recv().await.ok_or(DepartmentActorError::Closed)
    }

    pub async fn reconcile(&self) -> Result<Option<ReconciliationReport>, DepartmentActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.send(DepartmentMessage::Reconcile { reply }).await?;
        Ok(rx.recv().await.ok_or(DepartmentActorError::Closed)??)
    }

    /// Cancels any in-flight cycle at the next message boundary, then stops
    /// the actor.
    /// Stops the actor at the next message boundary and waits until it has
    /// exited, so the cycle in flight has flushed and acked before this returns.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if self.tx.send(DepartmentMessage::Shutdown).await.is_err() {
            debug!("Department actor already stopped");
        }
        // the receiver is dropped when the actor loop returns
        self.tx.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, message: DepartmentMessage) -> Result<(), DepartmentActorError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| DepartmentActorError::Closed)
    }
}

pub struct DepartmentActor<H: MessageHandler + 'static> {
    orchestrator: DepartmentOrchestrator<H>,
    cycle_interval: Duration,
    cancel: CancelFlag,
}

impl<H: MessageHandler + 'static> DepartmentActor<H> {
    pub fn new(orchestrator: DepartmentOrchestrator<H>, cycle_interval: Duration) -> Self {
        Self {
            orchestrator,
            cycle_interval,
            cancel: CancelFlag::new(),
        }
    }

    /// Spawn the actor. The first scheduled cycle runs one interval after
    /// spawning.
    pub fn spawn(orchestrator: DepartmentOrchestrator<H>, cycle_interval: Duration) -> DepartmentHandle {
        let (tx, rx) = mpsc::channel(DEPARTMENT_CHANNEL_CAPACITY);

        let actor = Self::new(orchestrator, cycle_interval);
        let cancel = actor.cancel.clone();

        tokio::spawn(async move {
            actor.run(rx).await;
        });

        info!("DepartmentActor spawned");
        DepartmentHandle { tx, cancel }
    }

    /// Main actor loop
    async fn run(mut self, mut rx: mpsc::Receiver<DepartmentMessage>) {
        let department = self.orchestrator.department();
        info!(
            "DepartmentActor for {} started with interval {:?}",
            department, self.cycle_interval
        );

        let period = self.cycle_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Scheduled {} cycle", department);
                    // Failures are logged by the orchestrator and retried next tick
                    let _ = self.orchestrator.run_cycle(&self.cancel).await;
                }

                msg = rx.recv() => {
                    match msg {
                        Some(DepartmentMessage::RunCycle { reply }) => {
                            let result = self.orchestrator.run_cycle(&self.cancel).await;
                            if let Err(e) = reply.send(result).await {
                                error!("Failed to send RunCycle reply: {:?}", e);
                            }
                        }
                        Some(DepartmentMessage::GetStatus { reply }) => {
                            let status = self.orchestrator.status().await;
                            if let Err(e) = reply.send(status).await {
                                error!("Failed to send GetStatus reply: {:?}", e);
                            }
                        }
                        Some(DepartmentMessage::Reconcile { reply }) => {
                            let result = self.orchestrator.reconcile().await;
                            if let Err(e) = reply.send(result).await {
                                error!("Failed to send Reconcile reply: {:?}", e);
                            }
                        }
                        Some(DepartmentMessage::Shutdown) => {
                            info!("DepartmentActor received shutdown signal");
                            break;
                        }
                        None => {
                            error!("DepartmentActor message channel closed");
                            break;
                        }
                    }
                }
            }
        }

        info!("DepartmentActor for {} stopped", department);
    }
}
