//! Status - swarm 全体のスナップショット
//!
//! board / registry / review / bus / election を 1 回ずつ読み、
//! JSON にそのまま出せる形にまとめる。

use serde::{Deserialize, Serialize};

use super::swarm::{Swarm, SwarmError};
use crate::bus::EscalationRecord;
use crate::domain::{Task, TaskId, TaskKind, TaskStatus, WorkerId, WorkerStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub backlog: usize,
    pub ready: usize,
    pub working: usize,
    pub pending_review: usize,
    pub completed: usize,
    pub reopened: usize,
    pub failed: usize,
}

impl TaskCounts {
    fn count(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Backlog => &mut self.backlog,
            TaskStatus::Ready => &mut self.ready,
            TaskStatus::Working => &mut self.working,
            TaskStatus::PendingReview => &mut self.pending_review,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Reopened => &mut self.reopened,
            TaskStatus::Failed => &mut self.failed,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.backlog
            + self.ready
            + self.working
            + self.pending_review
            + self.completed
            + self.reopened
            + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    /// Staleness-aware status.
    pub status: WorkerStatus,
    pub score: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwarmStatus {
    /// Work tasks only; review sub-tasks are counted in `open_reviews`.
    pub tasks: TaskCounts,
    pub workers: Vec<WorkerSummary>,
    pub open_reviews: Vec<TaskId>,
    pub open_escalations: Vec<EscalationRecord>,
    pub dead_letters: usize,
    pub quarantined: Vec<TaskId>,
    pub leader: Option<WorkerId>,
    pub cycle: u64,
}

impl SwarmStatus {
    pub(crate) async fn collect(swarm: &Swarm) -> Result<Self, SwarmError> {
        let tasks = swarm
            .gateway()
            .list(|t: &Task| t.kind == TaskKind::Work)
            .collect()
            .await?;
        let mut counts = TaskCounts::default();
        for task in &tasks {
            counts.count(task.status);
        }

        let registry = swarm.registry();
        let workers = registry
            .records()
            .into_iter()
            .map(|record| WorkerSummary {
                status: registry.effective_status(&record.id),
                score: record.score,
                tags: record.tags.into_iter().collect(),
                id: record.id,
            })
            .collect();

        let open_reviews = swarm
            .reviews()
            .open_sessions()
            .await
            .into_iter()
            .map(|s| s.task_id)
            .collect();

        let now = swarm.clock().now();
        Ok(Self {
            tasks: counts,
            workers,
            open_reviews,
            open_escalations: swarm.bus().open_escalations(),
            dead_letters: swarm.bus().dead_letters().await.len(),
            quarantined: swarm.gateway().quarantined().await?,
            leader: swarm.election().current_leader(now),
            cycle: swarm.election().cycle(),
        })
    }

    /// Tasks that still need a worker or a reviewer.
    pub fn outstanding(&self) -> usize {
        self.tasks.backlog + self.tasks.ready + self.tasks.working + self.tasks.pending_review + self.tasks.reopened
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::SwarmBuilder;
    use crate::domain::NewTask;

    #[tokio::test]
    async fn counts_work_tasks_by_status() {
        let swarm = SwarmBuilder::default().build().await.unwrap();
        let w1 = WorkerId::new("w1");
        swarm.join(&w1, ["rust"]).await.unwrap();

        let a = swarm.gateway().create(NewTask::new("a"), None).await.unwrap();
        swarm.gateway().create(NewTask::new("b"), None).await.unwrap();
        swarm.gateway().claim(a, &w1).await.unwrap();

        let status = swarm.status().await.unwrap();
        assert_eq!(status.tasks.working, 1);
        assert_eq!(status.tasks.total(), 2);
        assert_eq!(status.outstanding(), 2);
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.workers[0].tags, vec!["rust".to_string()]);
        assert_eq!(status.leader, None);
        assert!(status.open_escalations.is_empty());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["tasks"]["working"], 1);
    }
}
