//! GcLoop - 保持期間を過ぎた終端タスクのアーカイブ
//!
//! # フロー
//! 1. 定期的に Completed / Failed かつ updated_at < now - retention のタスクを検索
//! 2. version を条件に削除（並行更新があればスキップ）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::board::CoordinationGateway;
use crate::domain::{CoordinationError, TaskId};

pub struct GcLoop {
    gateway: Arc<CoordinationGateway>,
    retention: chrono::Duration,
    interval: Duration,
}

impl GcLoop {
    pub fn new(gateway: Arc<CoordinationGateway>, retention: chrono::Duration, interval: Duration) -> Self {
        Self {
            gateway,
            retention,
            interval,
        }
    }

    pub async fn run_once(&self) -> Result<Vec<TaskId>, CoordinationError> {
        self.gateway.archive_expired(self.retention).await
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "archival pass failed");
                    }
                }
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        tracing::debug!("gc loop stopped");
    }
}
