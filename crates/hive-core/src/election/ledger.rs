//! Score ledger fed by domain events.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::domain::{DomainEvent, ScoreReason, ScoreWeights, WorkerId};
use crate::ports::EventSink;

/// Running scores per worker. Adjustments come only from events that carry a
/// `ScoreReason`; everything else is ignored.
#[derive(Debug)]
pub struct ScoreLedger {
    weights: ScoreWeights,
    scores: Mutex<BTreeMap<WorkerId, f64>>,
}

impl ScoreLedger {
    pub fn new(weights: ScoreWeights) -> Self {
        Self {
            weights,
            scores: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Apply one adjustment; returns the new score.
    pub fn apply(&self, worker: &WorkerId, reason: ScoreReason) -> f64 {
        let delta = reason.delta(&self.weights);
        let mut scores = self.scores.lock().unwrap_or_else(|p| p.into_inner());
        let score = scores.entry(worker.clone()).or_insert(0.0);
        *score += delta;
        tracing::debug!(worker = %worker, ?reason, delta, score = *score, "score adjusted");
        *score
    }

    pub fn score(&self, worker: &WorkerId) -> Option<f64> {
        self.scores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(worker)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<WorkerId, f64> {
        self.scores.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }
}

impl EventSink for ScoreLedger {
    fn emit(&self, event: DomainEvent) {
        if let Some((worker, reason)) = event.score_reason() {
            self.apply(worker, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ulid::Ulid;

    use crate::domain::TaskId;

    #[test]
    fn events_move_scores_by_their_weights() {
        let ledger = ScoreLedger::new(ScoreWeights::default());
        let w1 = WorkerId::new("w1");
        let task = TaskId::from_ulid(Ulid::new());
        let now = Utc::now();

        ledger.emit(DomainEvent::TaskCompleted {
            task_id: task,
            owner: Some(w1.clone()),
            at: now,
        });
        ledger.emit(DomainEvent::DependentUnblocked {
            completed: task,
            dependent: TaskId::from_ulid(Ulid::new()),
            credited: Some(w1.clone()),
            at: now,
        });
        ledger.emit(DomainEvent::WorkerIdle {
            worker: w1.clone(),
            idle_since: now,
            at: now,
        });
        ledger.emit(DomainEvent::ProtocolViolation {
            worker: WorkerId::new("w2"),
            task_id: Some(task),
            detail: "not the owner".into(),
            at: now,
        });
        ledger.emit(DomainEvent::TaskCreated { task_id: task, at: now });

        assert_eq!(ledger.score(&w1), Some(11.0));
        assert_eq!(ledger.score(&WorkerId::new("w2")), Some(-15.0));
        assert_eq!(ledger.snapshot().len(), 2);
    }

    #[test]
    fn completion_without_owner_scores_nobody() {
        let ledger = ScoreLedger::new(ScoreWeights::default());
        ledger.emit(DomainEvent::TaskCompleted {
            task_id: TaskId::from_ulid(Ulid::new()),
            owner: None,
            at: Utc::now(),
        });
        assert!(ledger.is_empty());
    }
}
