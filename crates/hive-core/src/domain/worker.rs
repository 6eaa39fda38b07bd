//! Worker records and presence signals.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkerId;

/// Liveness as reported by the worker, or derived (`Unknown`) when its signal is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Idle,
    Offline,
    Error,
    Unknown,
}

impl WorkerStatus {
    /// May receive new assignments (claims, reviews).
    pub fn is_available(self) -> bool {
        matches!(self, WorkerStatus::Active | WorkerStatus::Idle)
    }
}

/// Last `{status, timestamp}` a worker wrote about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Registry entry for one worker. Never hard-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub tags: BTreeSet<String>,

    /// Status as last reported; see `CapabilityRegistry::effective_status` for the
    /// staleness-aware view.
    pub status: WorkerStatus,
    pub score: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assigned_at: Option<DateTime<Utc>>,

    /// Start of the current idle stretch, if the worker reports Idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_since: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, tags: BTreeSet<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tags,
            status: WorkerStatus::Idle,
            score: 0.0,
            last_heartbeat: now,
            registered_at: now,
            last_assigned_at: None,
            idle_since: Some(now),
            status_message: None,
        }
    }

    /// Apply a heartbeat. Keeps `idle_since` when an idle worker stays idle.
    pub fn apply_signal(&mut self, status: WorkerStatus, message: Option<String>, at: DateTime<Utc>) {
        match (self.status, status) {
            (WorkerStatus::Idle, WorkerStatus::Idle) => {}
            (_, WorkerStatus::Idle) => self.idle_since = Some(at),
            _ => self.idle_since = None,
        }
        self.status = status;
        self.status_message = message;
        self.last_heartbeat = at;
    }

    pub fn presence(&self) -> PresenceRecord {
        PresenceRecord {
            worker_id: self.id.clone(),
            status: self.status,
            last_updated: self.last_heartbeat,
            message: self.status_message.clone(),
        }
    }

    /// Number of `required` tags this worker carries.
    pub fn tag_matches(&self, required: &BTreeSet<String>) -> usize {
        required.intersection(&self.tags).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn idle_since_survives_repeated_idle_heartbeats() {
        let t0 = Utc::now();
        let mut rec = WorkerRecord::new(WorkerId::new("w1"), tags(&["rust"]), t0);
        rec.apply_signal(WorkerStatus::Idle, None, t0 + Duration::seconds(5));
        assert_eq!(rec.idle_since, Some(t0));

        rec.apply_signal(WorkerStatus::Active, None, t0 + Duration::seconds(6));
        assert_eq!(rec.idle_since, None);

        let t7 = t0 + Duration::seconds(7);
        rec.apply_signal(WorkerStatus::Idle, Some("waiting".into()), t7);
        assert_eq!(rec.idle_since, Some(t7));
        assert_eq!(rec.presence().message.as_deref(), Some("waiting"));
    }

    #[test]
    fn counts_matching_tags() {
        let rec = WorkerRecord::new(WorkerId::new("w1"), tags(&["rust", "review"]), Utc::now());
        assert_eq!(rec.tag_matches(&tags(&["rust", "go"])), 1);
        assert_eq!(rec.tag_matches(&tags(&[])), 0);
    }

    #[test]
    fn only_active_and_idle_are_available() {
        assert!(WorkerStatus::Active.is_available());
        assert!(WorkerStatus::Idle.is_available());
        assert!(!WorkerStatus::Unknown.is_available());
        assert!(!WorkerStatus::Error.is_available());
    }
}
