//! CapabilityRegistry - worker identity → capability tags + liveness
//!
//! 読み取り中心。`find` は毎回スナップショットを取ってランキングする。
//! ランキング: (一致タグ数 desc, Idle 優先, 最後に割り当てられたのが古い順, worker id)

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use super::presence;
use crate::domain::{DomainEvent, PresenceRecord, WorkerId, WorkerRecord, WorkerStatus};
use crate::ports::{Clock, EventSink};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("worker id must not be empty")]
    EmptyWorkerId,

    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),
}

#[derive(Default)]
struct State {
    workers: BTreeMap<WorkerId, WorkerRecord>,
    /// idle_since of the stretch already reported per worker, so each stretch
    /// produces one WorkerIdle event.
    idle_reported: HashMap<WorkerId, DateTime<Utc>>,
}

pub struct CapabilityRegistry {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    staleness: Duration,
    idle_threshold: Duration,
}

impl CapabilityRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        staleness: Duration,
        idle_threshold: Duration,
    ) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
            events,
            staleness,
            idle_threshold,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a worker or replace the tags of a known one. Counts as a
    /// liveness signal.
    pub fn register(
        &self,
        worker: &WorkerId,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<WorkerRecord, RegistryError> {
        if worker.is_empty() {
            return Err(RegistryError::EmptyWorkerId);
        }
        let now = self.clock.now();
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        let mut state = self.write();
        let record = match state.workers.get_mut(worker) {
            Some(existing) => {
                existing.tags = tags;
                existing.last_heartbeat = now;
                existing.clone()
            }
            None => {
                let record = WorkerRecord::new(worker.clone(), tags, now);
                state.workers.insert(worker.clone(), record.clone());
                tracing::info!(worker = %worker, tags = ?record.tags, "worker registered");
                record
            }
        };
        Ok(record)
    }

    /// Record a `{status, timestamp}` signal. An unknown worker is created
    /// without tags.
    pub fn heartbeat(
        &self,
        worker: &WorkerId,
        status: WorkerStatus,
        message: Option<String>,
    ) -> Result<PresenceRecord, RegistryError> {
        if worker.is_empty() {
            return Err(RegistryError::EmptyWorkerId);
        }
        let now = self.clock.now();
        let mut state = self.write();
        let record = state
            .workers
            .entry(worker.clone())
            .or_insert_with(|| WorkerRecord::new(worker.clone(), BTreeSet::new(), now));
        let previous = record.status;
        record.apply_signal(status, message, now);
        if previous != status {
            tracing::debug!(worker = %worker, from = ?previous, to = ?status, "worker status changed");
        }
        Ok(record.presence())
    }

    pub fn get(&self, worker: &WorkerId) -> Option<WorkerRecord> {
        self.read().workers.get(worker).cloned()
    }

    pub fn records(&self) -> Vec<WorkerRecord> {
        self.read().workers.values().cloned().collect()
    }

    pub fn presence(&self, worker: &WorkerId) -> Option<PresenceRecord> {
        self.read().workers.get(worker).map(WorkerRecord::presence)
    }

    pub fn effective_status(&self, worker: &WorkerId) -> WorkerStatus {
        let now = self.clock.now();
        self.read()
            .workers
            .get(worker)
            .map(|r| presence::effective_status(r.status, r.last_heartbeat, now, self.staleness))
            .unwrap_or(WorkerStatus::Unknown)
    }

    pub fn registered_at(&self) -> BTreeMap<WorkerId, DateTime<Utc>> {
        self.read()
            .workers
            .iter()
            .map(|(id, r)| (id.clone(), r.registered_at))
            .collect()
    }

    /// Eligible workers for `required` tags, best first.
    ///
    /// Eligible: effective status Active or Idle, not in `exclude`, and at
    /// least one matching tag unless `required` is empty.
    pub fn find(&self, required: &BTreeSet<String>, exclude: &[WorkerId]) -> Vec<WorkerId> {
        let now = self.clock.now();
        let state = self.read();
        let mut candidates: Vec<(usize, bool, Option<DateTime<Utc>>, &WorkerId)> = state
            .workers
            .values()
            .filter(|r| !exclude.contains(&r.id))
            .filter_map(|r| {
                let status =
                    presence::effective_status(r.status, r.last_heartbeat, now, self.staleness);
                if !status.is_available() {
                    return None;
                }
                let matches = r.tag_matches(required);
                if !required.is_empty() && matches == 0 {
                    return None;
                }
                Some((matches, status != WorkerStatus::Idle, r.last_assigned_at, &r.id))
            })
            .collect();
        // None (never assigned) sorts before any timestamp
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(b.3))
        });
        candidates.into_iter().map(|c| c.3.clone()).collect()
    }

    pub fn mark_assigned(&self, worker: &WorkerId) -> Result<(), RegistryError> {
        let now = self.clock.now();
        let mut state = self.write();
        let record = state
            .workers
            .get_mut(worker)
            .ok_or_else(|| RegistryError::UnknownWorker(worker.clone()))?;
        record.last_assigned_at = Some(now);
        Ok(())
    }

    /// Mirror ledger scores onto the records. Unknown workers are ignored.
    pub fn sync_scores(&self, scores: &BTreeMap<WorkerId, f64>) {
        let mut state = self.write();
        for (worker, score) in scores {
            if let Some(record) = state.workers.get_mut(worker) {
                record.score = *score;
            }
        }
    }

    /// Emit `WorkerIdle` for workers idle longer than the threshold, once per
    /// idle stretch. Returns the workers reported by this call.
    pub fn detect_idle(&self) -> Vec<WorkerId> {
        let now = self.clock.now();
        let mut state = self.write();
        let State {
            workers,
            idle_reported,
        } = &mut *state;

        let mut reported = Vec::new();
        for record in workers.values() {
            let Some(idle_since) = record.idle_since else {
                continue;
            };
            if record.status != WorkerStatus::Idle || now - idle_since <= self.idle_threshold {
                continue;
            }
            if idle_reported.get(&record.id) == Some(&idle_since) {
                continue;
            }
            idle_reported.insert(record.id.clone(), idle_since);
            tracing::info!(worker = %record.id, %idle_since, "worker idle beyond threshold");
            self.events.emit(DomainEvent::WorkerIdle {
                worker: record.id.clone(),
                idle_since,
                at: now,
            });
            reported.push(record.id.clone());
        }
        reported
    }
}
