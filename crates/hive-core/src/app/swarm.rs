//! Swarm - 組み立て済みのコンポーネント一式とバックグラウンドループ
//!
//! - `start()` で ReaperLoop / GcLoop / ReviewLoop / ElectionLoop を spawn
//! - `spawn_worker()` で WorkerLoop を追加
//! - `shutdown()` で watch channel に停止を通知し、全ループの終了を待つ

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::election_loop::ElectionLoop;
use super::gc_loop::GcLoop;
use super::reaper_loop::ReaperLoop;
use super::review_loop::ReviewLoop;
use super::status::SwarmStatus;
use super::worker_loop::{WorkerAgent, WorkerLoop};
use crate::board::CoordinationGateway;
use crate::bus::{BusError, MessageBus};
use crate::config::HiveConfig;
use crate::domain::{CoordinationError, DomainEvent, PresenceRecord, TaskId, WorkerId, WorkerStatus};
use crate::election::{ElectionCoordinator, ScoreLedger};
use crate::ports::Clock;
use crate::registry::{CapabilityRegistry, RegistryError};
use crate::review::{ReviewCoordinator, ReviewFlowError};

/// Failure of a swarm-level operation or loop step.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error(transparent)]
    Board(#[from] CoordinationError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Review(#[from] ReviewFlowError),

    #[error("swarm is shutting down")]
    ShuttingDown,
}

pub struct Swarm {
    pub(crate) config: HiveConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) gateway: Arc<CoordinationGateway>,
    pub(crate) bus: Arc<MessageBus>,
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) reviews: Arc<ReviewCoordinator>,
    pub(crate) election: Arc<ElectionCoordinator>,
    pub(crate) ledger: Arc<ScoreLedger>,
    /// Taken by `start` for the review loop.
    pub(crate) review_events: StdMutex<Option<mpsc::UnboundedReceiver<DomainEvent>>>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) joins: StdMutex<Vec<JoinHandle<()>>>,
}

impl Swarm {
    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn gateway(&self) -> &Arc<CoordinationGateway> {
        &self.gateway
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn reviews(&self) -> &Arc<ReviewCoordinator> {
        &self.reviews
    }

    pub fn election(&self) -> &Arc<ElectionCoordinator> {
        &self.election
    }

    pub fn ledger(&self) -> &Arc<ScoreLedger> {
        &self.ledger
    }

    /// Register a worker and open its mailbox.
    pub async fn join(
        &self,
        worker: &WorkerId,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), SwarmError> {
        self.registry.register(worker, tags)?;
        self.bus.open_mailbox(worker).await;
        Ok(())
    }

    /// Liveness signal. Naming a task the worker holds also refreshes its lease.
    pub async fn heartbeat(
        &self,
        worker: &WorkerId,
        status: WorkerStatus,
        task_id: Option<TaskId>,
        message: Option<String>,
    ) -> Result<PresenceRecord, SwarmError> {
        let presence = self.registry.heartbeat(worker, status, message)?;
        if let Some(task_id) = task_id {
            self.gateway.refresh_lease(task_id, worker).await?;
        }
        Ok(presence)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn track(&self, join: JoinHandle<()>) {
        self.joins
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(join);
    }

    /// Spawn the background loops. Calling it twice does not start a second
    /// review loop.
    pub fn start(self: &Arc<Self>) -> Result<(), SwarmError> {
        if self.is_shutting_down() {
            return Err(SwarmError::ShuttingDown);
        }
        let system = self.config.roles.system.clone();

        let reaper = ReaperLoop::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.bus),
            Arc::clone(&self.reviews),
            system.clone(),
            self.config.lease.sweep_interval(),
        );
        self.track(tokio::spawn(reaper.run(self.shutdown_tx.subscribe())));

        let gc = GcLoop::new(
            Arc::clone(&self.gateway),
            self.config.archive.retention(),
            self.config.archive.interval(),
        );
        self.track(tokio::spawn(gc.run(self.shutdown_tx.subscribe())));

        let election = ElectionLoop::new(Arc::clone(&self.election), self.config.election.cycle());
        self.track(tokio::spawn(election.run(self.shutdown_tx.subscribe())));

        let events = self
            .review_events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(events) = events {
            let reviews = ReviewLoop::new(
                Arc::clone(&self.reviews),
                Arc::clone(&self.bus),
                events,
                system,
                self.config.presence.heartbeat_interval(),
            );
            self.track(tokio::spawn(reviews.run(self.shutdown_tx.subscribe())));
        }
        tracing::info!("swarm started");
        Ok(())
    }

    /// Join `worker` and run its polling loop until shutdown.
    pub async fn spawn_worker(
        self: &Arc<Self>,
        worker: WorkerId,
        tags: BTreeSet<String>,
        agent: Arc<dyn WorkerAgent>,
    ) -> Result<(), SwarmError> {
        if self.is_shutting_down() {
            return Err(SwarmError::ShuttingDown);
        }
        self.join(&worker, tags.iter().cloned()).await?;
        let worker_loop = WorkerLoop::new(Arc::clone(self), worker, tags, agent);
        self.track(tokio::spawn(worker_loop.run(self.shutdown_tx.subscribe())));
        Ok(())
    }

    pub async fn status(&self) -> Result<SwarmStatus, SwarmError> {
        SwarmStatus::collect(self).await
    }

    /// Stop every loop and wait for them. In-flight steps finish first.
    pub async fn shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
        let joins: Vec<_> = self
            .joins
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for join in joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "loop task failed");
            }
        }
        tracing::info!("swarm stopped");
    }
}
