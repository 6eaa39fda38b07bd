//! ReaperLoop - lease 期限切れの回収とタイムアウト処理
//!
//! # フロー（1 パス）
//! 1. lease が切れた Working タスクを Ready に戻し、retry_count を +1
//! 2. 元の owner に STATUS_UPDATE (LeaseExpired) を送る
//! 3. mailbox の期限切れ・可視性タイムアウトを処理
//! 4. review の締切と未応答リクエストを処理

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::swarm::SwarmError;
use crate::board::{CoordinationGateway, ReclaimedTask};
use crate::bus::{BusSweep, MessageBus};
use crate::domain::{MessageBody, MessageType, Priority, ReviewState, TaskId, WorkerId};
use crate::review::ReviewCoordinator;

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReaperReport {
    pub reclaimed: Vec<ReclaimedTask>,
    pub bus: BusSweep,
    pub reviews: Vec<(TaskId, ReviewState)>,
}

pub struct ReaperLoop {
    gateway: Arc<CoordinationGateway>,
    bus: Arc<MessageBus>,
    reviews: Arc<ReviewCoordinator>,
    sender: WorkerId,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(
        gateway: Arc<CoordinationGateway>,
        bus: Arc<MessageBus>,
        reviews: Arc<ReviewCoordinator>,
        sender: WorkerId,
        interval: Duration,
    ) -> Self {
        Self {
            gateway,
            bus,
            reviews,
            sender,
            interval,
        }
    }

    pub async fn run_once(&self) -> Result<ReaperReport, SwarmError> {
        let reclaimed = self.gateway.reclaim_expired().await?;
        for task in &reclaimed {
            let Some(owner) = &task.previous_owner else {
                continue;
            };
            let notice = self
                .bus
                .message(
                    MessageType::StatusUpdate,
                    &self.sender,
                    owner,
                    MessageBody::LeaseExpired {
                        task_id: task.task_id,
                        retry_count: task.retry_count,
                    },
                )
                .with_priority(Priority::High);
            self.bus.send(notice).await?;
        }

        let bus = self.bus.sweep().await;
        let reviews = self.reviews.check_deadlines().await?;
        Ok(ReaperReport {
            reclaimed,
            bus,
            reviews,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if !report.reclaimed.is_empty() => {
                            tracing::info!(reclaimed = report.reclaimed.len(), "stale leases reclaimed");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "reaper pass failed"),
                    }
                }
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        tracing::debug!("reaper loop stopped");
    }
}
