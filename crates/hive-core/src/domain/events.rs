//! Events - ドメインイベント
//!
//! Gateway / bus / review / election が発生させ、`EventSink` に流す。
//! スコア台帳 (ScoreLedger) と ReviewLoop はこのイベントだけを見て動く。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::election::ScoreReason;
use super::ids::{MessageId, ReviewId, TaskId, WorkerId};
use super::review::ReviewState;
use super::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskCreated {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    TaskClaimed {
        task_id: TaskId,
        worker: WorkerId,
        version: u64,
        at: DateTime<Utc>,
    },
    TaskTransitioned {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        actor: Option<WorkerId>,
        version: u64,
        at: DateTime<Utc>,
    },
    /// Credited to the task owner.
    TaskCompleted {
        task_id: TaskId,
        owner: Option<WorkerId>,
        at: DateTime<Utc>,
    },
    /// `dependent` had all its dependencies completed by `completed`.
    DependentUnblocked {
        completed: TaskId,
        dependent: TaskId,
        credited: Option<WorkerId>,
        at: DateTime<Utc>,
    },
    LeaseReclaimed {
        task_id: TaskId,
        previous_owner: Option<WorkerId>,
        retry_count: u32,
        at: DateTime<Utc>,
    },
    ProtocolViolation {
        worker: WorkerId,
        task_id: Option<TaskId>,
        detail: String,
        at: DateTime<Utc>,
    },
    /// Emitted once per idle stretch that exceeds the configured threshold.
    WorkerIdle {
        worker: WorkerId,
        idle_since: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    ReviewOpened {
        review_id: ReviewId,
        task_id: TaskId,
        reviewers: Vec<WorkerId>,
        at: DateTime<Utc>,
    },
    ReviewResolved {
        review_id: ReviewId,
        task_id: TaskId,
        state: ReviewState,
        at: DateTime<Utc>,
    },
    MessageDeadLettered {
        message_id: MessageId,
        recipient: WorkerId,
        reason: String,
        at: DateTime<Utc>,
    },
    EscalationRaised {
        message_id: MessageId,
        recipient: WorkerId,
        at: DateTime<Utc>,
    },
    LeaderElected {
        cycle: u64,
        leader: WorkerId,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// The ledger adjustment this event carries, if any.
    pub fn score_reason(&self) -> Option<(&WorkerId, ScoreReason)> {
        match self {
            DomainEvent::TaskCompleted {
                owner: Some(owner), ..
            } => Some((owner, ScoreReason::TaskCompleted)),
            DomainEvent::DependentUnblocked {
                credited: Some(worker),
                ..
            } => Some((worker, ScoreReason::DependentUnblocked)),
            DomainEvent::WorkerIdle { worker, .. } => Some((worker, ScoreReason::IdleBeyondThreshold)),
            DomainEvent::ProtocolViolation { worker, .. } => {
                Some((worker, ScoreReason::ProtocolViolation))
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task_created",
            DomainEvent::TaskClaimed { .. } => "task_claimed",
            DomainEvent::TaskTransitioned { .. } => "task_transitioned",
            DomainEvent::TaskCompleted { .. } => "task_completed",
            DomainEvent::DependentUnblocked { .. } => "dependent_unblocked",
            DomainEvent::LeaseReclaimed { .. } => "lease_reclaimed",
            DomainEvent::ProtocolViolation { .. } => "protocol_violation",
            DomainEvent::WorkerIdle { .. } => "worker_idle",
            DomainEvent::ReviewOpened { .. } => "review_opened",
            DomainEvent::ReviewResolved { .. } => "review_resolved",
            DomainEvent::MessageDeadLettered { .. } => "message_dead_lettered",
            DomainEvent::EscalationRaised { .. } => "escalation_raised",
            DomainEvent::LeaderElected { .. } => "leader_elected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn only_ledger_events_carry_a_score_reason() {
        let now = Utc::now();
        let task_id = TaskId::from_ulid(Ulid::new());
        let w = WorkerId::new("w1");

        let completed = DomainEvent::TaskCompleted {
            task_id,
            owner: Some(w.clone()),
            at: now,
        };
        assert_eq!(completed.score_reason(), Some((&w, ScoreReason::TaskCompleted)));

        let orphan = DomainEvent::TaskCompleted {
            task_id,
            owner: None,
            at: now,
        };
        assert_eq!(orphan.score_reason(), None);

        let created = DomainEvent::TaskCreated { task_id, at: now };
        assert_eq!(created.score_reason(), None);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let ev = DomainEvent::LeaderElected {
            cycle: 3,
            leader: WorkerId::new("w2"),
            at: Utc::now(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], ev.name());
    }
}
