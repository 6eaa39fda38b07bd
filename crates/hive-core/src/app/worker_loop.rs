//! WorkerLoop - 1 worker のポーリングループ
//!
//! # フロー（1 サイクル）
//! 1. heartbeat（presence を更新）
//! 2. mailbox を確認: review 依頼には verdict を RESULT で返し、それ以外は agent へ
//! 3. task を確認: claim 可能で tag が合うタスクを優先度順に claim
//! 4. agent に work させ、結果に応じて PendingReview / Completed / Failed へ遷移
//!
//! 判断はすべて `WorkerAgent` が行う。ループはプロトコルだけを担う。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::swarm::{Swarm, SwarmError};
use crate::board::{ClaimOutcome, TransitionMeta};
use crate::domain::{
    ErrorKind, Message, MessageBody, MessageType, ReviewOutcome, Task, TaskId, TaskKind, TaskStatus, WorkerId,
    WorkerStatus,
};

/// Messages handled per cycle.
const MAILBOX_BATCH: usize = 16;

/// Result of working on a claimed task.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// Finished. Goes to PendingReview or Completed depending on the task.
    Done { note: Option<String> },
    Failed { reason: String },
}

/// The decisions of one worker. The loop handles claims, leases and messages.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    async fn work(&self, task: &Task) -> WorkOutcome;

    /// Verdict on `task`, requested by a review round.
    async fn review(&self, task: &Task) -> (ReviewOutcome, Option<String>);

    /// Any other message. An error nacks it.
    async fn on_message(&self, message: &Message) -> Result<(), String> {
        tracing::debug!(message_id = %message.id, r#type = ?message.message_type, "message ignored");
        Ok(())
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub messages: usize,
    pub reviewed: Vec<TaskId>,
    pub worked: Option<(TaskId, TaskStatus)>,
}

pub struct WorkerLoop {
    swarm: Arc<Swarm>,
    worker: WorkerId,
    tags: BTreeSet<String>,
    agent: Arc<dyn WorkerAgent>,
    poll_interval: Duration,
}

impl WorkerLoop {
    pub fn new(swarm: Arc<Swarm>, worker: WorkerId, tags: BTreeSet<String>, agent: Arc<dyn WorkerAgent>) -> Self {
        let poll_interval = swarm.config().presence.heartbeat_interval();
        Self {
            swarm,
            worker,
            tags,
            agent,
            poll_interval,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub async fn run_once(&self) -> Result<CycleReport, SwarmError> {
        let mut report = CycleReport::default();
        self.swarm
            .heartbeat(&self.worker, WorkerStatus::Idle, None, None)
            .await?;

        self.check_mailbox(&mut report).await?;

        if let Some(task) = self.claim_next().await? {
            // the claim just set the lease; refreshing it here would bump the
            // version `work_on` finishes against
            self.swarm
                .heartbeat(
                    &self.worker,
                    WorkerStatus::Active,
                    None,
                    Some(format!("working on {}", task.id)),
                )
                .await?;
            let task_id = task.id;
            let status = self.work_on(task).await?;
            report.worked = Some((task_id, status));
        }
        Ok(report)
    }

    async fn check_mailbox(&self, report: &mut CycleReport) -> Result<(), SwarmError> {
        let bus = self.swarm.bus();
        while report.messages < MAILBOX_BATCH {
            let Some(message) = bus.receive_next(&self.worker).await? else {
                break;
            };
            report.messages += 1;

            let handled = match &message.body {
                MessageBody::ReviewRequest { task_id, .. } => {
                    let reviewed = self.answer_review(&message).await;
                    if reviewed.is_ok() {
                        report.reviewed.push(*task_id);
                    }
                    reviewed
                }
                _ => self.agent.on_message(&message).await,
            };
            match handled {
                Ok(()) => bus.ack(&self.worker, message.id).await?,
                Err(reason) => {
                    tracing::warn!(worker = %self.worker, message_id = %message.id, %reason, "message handling failed");
                    bus.nack(&self.worker, message.id, reason).await?;
                }
            }
        }
        Ok(())
    }

    async fn answer_review(&self, request: &Message) -> Result<(), String> {
        let MessageBody::ReviewRequest {
            review_id, task_id, ..
        } = &request.body
        else {
            return Err("not a review request".into());
        };
        let task = self
            .swarm
            .gateway()
            .get(*task_id)
            .await
            .map_err(|e| e.to_string())?;
        let (outcome, comments) = self.agent.review(&task).await;
        tracing::info!(worker = %self.worker, task_id = %task_id, ?outcome, "review verdict sent");

        let bus = self.swarm.bus();
        let verdict = bus.reply(
            request,
            MessageType::Result,
            &self.worker,
            MessageBody::ReviewVerdict {
                review_id: *review_id,
                task_id: *task_id,
                outcome,
                comments,
            },
        );
        bus.send(verdict).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Claim the most urgent, oldest task this worker can take.
    async fn claim_next(&self) -> Result<Option<Task>, SwarmError> {
        let tags = self.tags.clone();
        let mut candidates = self
            .swarm
            .gateway()
            .list(move |t: &Task| {
                t.kind == TaskKind::Work
                    && t.status.is_claimable()
                    && (t.required_tags.is_empty() || !t.required_tags.is_disjoint(&tags))
            })
            .collect()
            .await?;
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));

        for task in candidates {
            match self.swarm.gateway().claim(task.id, &self.worker).await {
                Ok(ClaimOutcome::Claimed(task)) => return Ok(Some(task)),
                Ok(ClaimOutcome::Conflict { .. } | ClaimOutcome::DependencyUnmet { .. }) => continue,
                // lost a race with a transition or archival
                Err(e) if e.kind() != ErrorKind::Infrastructure => {
                    tracing::debug!(task_id = %task.id, error = %e, "skipping task");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn work_on(&self, task: Task) -> Result<TaskStatus, SwarmError> {
        let outcome = self.agent.work(&task).await;
        let (to, meta) = match outcome {
            WorkOutcome::Done { note } => {
                let to = if task.requires_review {
                    TaskStatus::PendingReview
                } else {
                    TaskStatus::Completed
                };
                (to, TransitionMeta { note, ..TransitionMeta::default() })
            }
            WorkOutcome::Failed { reason } => (TaskStatus::Failed, TransitionMeta::note(reason)),
        };
        self.swarm
            .gateway()
            .transition(task.id, to, &self.worker, meta.at_version(task.version))
            .await?;
        tracing::info!(worker = %self.worker, task_id = %task.id, ?to, "work finished");
        Ok(to)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(worker = %self.worker, error = %e, "worker cycle failed");
                    }
                }
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        if let Err(e) = self
            .swarm
            .registry()
            .heartbeat(&self.worker, WorkerStatus::Offline, Some("shut down".into()))
        {
            tracing::warn!(worker = %self.worker, error = %e, "final heartbeat failed");
        }
        tracing::debug!(worker = %self.worker, "worker loop stopped");
    }
}
