//! Task record and the status state machine.
//!
//! Transition table:
//! - Backlog -> Ready
//! - Ready -> Working
//! - Working -> PendingReview | Failed (| Completed when no review is required)
//! - PendingReview -> Completed | Reopened
//! - Reopened -> Ready
//!
//! Every mutation bumps `version` by exactly one and appends one history record
//! per table step.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};

/// Urgency of a task or message. Ordered `High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Created, not yet released for work.
    Backlog,

    /// Dependencies complete; claimable.
    Ready,

    /// Held by exactly one owner under a lease.
    Working,

    /// Work submitted, waiting on reviewers.
    PendingReview,

    /// Accepted.
    Completed,

    /// Review rejected the work; goes back to Ready.
    Reopened,

    /// Given up by its owner.
    Failed,
}

impl TaskStatus {
    /// Whether `self -> next` is a legal step of the transition table.
    ///
    /// Working -> Completed is handled separately (it depends on the task's
    /// review requirement), see [`Task::can_transition_to`].
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Backlog, Ready)
                | (Ready, Working)
                | (Working, PendingReview)
                | (Working, Failed)
                | (PendingReview, Completed)
                | (PendingReview, Reopened)
                | (Reopened, Ready)
        )
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// States from which `claim` may take the task (promoting through Ready).
    pub fn is_claimable(self) -> bool {
        matches!(
            self,
            TaskStatus::Backlog | TaskStatus::Ready | TaskStatus::Reopened
        )
    }

    pub fn all() -> [TaskStatus; 7] {
        use TaskStatus::*;
        [Backlog, Ready, Working, PendingReview, Completed, Reopened, Failed]
    }
}

/// What a task is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Ordinary unit of work.
    Work,

    /// Review sub-task spawned for `parent`; only `reviewer` may claim it.
    Review { parent: TaskId, reviewer: WorkerId },
}

/// One entry of a task's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// `None` for the creation record.
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub actor: Option<WorkerId>,
    pub at: DateTime<Utc>,

    /// Version of the task after this step.
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A task on the board.
///
/// Design:
/// - The store holds the single copy of this record; the gateway is the only writer.
/// - Mutating helpers below only touch the in-memory value. They do not bump the
///   version; the gateway does that once per compare-and-swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub owner: Option<WorkerId>,
    pub dependency_ids: BTreeSet<TaskId>,
    pub version: u64,
    pub history: Vec<TransitionRecord>,
    pub lease_expiry: Option<DateTime<Utc>>,

    /// Times the task was reclaimed from a stale owner.
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub required_tags: BTreeSet<String>,

    /// When false, the owner may go straight from Working to Completed.
    #[serde(default)]
    pub requires_review: bool,

    pub kind: TaskKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Transition check that also accounts for the review requirement.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.status == TaskStatus::Working && next == TaskStatus::Completed {
            return !self.requires_review;
        }
        self.status.can_transition_to(next)
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker)
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Working && self.lease_expiry.is_some_and(|exp| exp <= now)
    }

    /// Review sub-tasks may only be claimed by their assigned reviewer.
    pub fn reserved_for(&self) -> Option<&WorkerId> {
        match &self.kind {
            TaskKind::Work => None,
            TaskKind::Review { reviewer, .. } => Some(reviewer),
        }
    }

    /// Apply one table step to the in-memory record and record it in history.
    ///
    /// `version` is the version the record will carry after the enclosing write.
    pub(crate) fn push_step(
        &mut self,
        to: TaskStatus,
        actor: Option<WorkerId>,
        at: DateTime<Utc>,
        version: u64,
        note: Option<String>,
        metadata: Option<serde_json::Value>,
    ) {
        let from = self.status;
        self.status = to;
        match to {
            TaskStatus::Working => {}
            TaskStatus::Ready => {
                self.owner = None;
                self.lease_expiry = None;
            }
            _ => self.lease_expiry = None,
        }
        self.updated_at = at;
        self.history.push(TransitionRecord {
            from: Some(from),
            to,
            actor,
            at,
            version,
            note,
            metadata,
        });
    }
}

/// Input of `create`: everything the producer decides about a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// Caller-assigned id. Needed when tasks of one batch depend on each other.
    #[serde(default)]
    pub id: Option<TaskId>,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependency_ids: BTreeSet<TaskId>,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default = "default_kind")]
    pub kind: TaskKind,
}

fn default_kind() -> TaskKind {
    TaskKind::Work
}

impl NewTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
            priority: Priority::Medium,
            dependency_ids: BTreeSet::new(),
            required_tags: BTreeSet::new(),
            requires_review: false,
            kind: TaskKind::Work,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependency_ids.insert(dependency);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }

    pub fn with_review(mut self) -> Self {
        self.requires_review = true;
        self
    }

    pub(crate) fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Materialize the record as it is first written (Backlog, version 1).
    pub(crate) fn into_task(
        self,
        id: TaskId,
        actor: Option<WorkerId>,
        now: DateTime<Utc>,
    ) -> Task {
        Task {
            id,
            description: self.description,
            status: TaskStatus::Backlog,
            priority: self.priority,
            owner: None,
            dependency_ids: self.dependency_ids,
            version: 1,
            history: vec![TransitionRecord {
                from: None,
                to: TaskStatus::Backlog,
                actor,
                at: now,
                version: 1,
                note: None,
                metadata: None,
            }],
            lease_expiry: None,
            retry_count: 0,
            required_tags: self.required_tags,
            requires_review: self.requires_review,
            kind: self.kind,
            created_at: now,
            updated_at: now,
        }
    }
}
