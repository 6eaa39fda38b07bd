//! CoordinationGateway - the only mutation path into the task board.
//!
//! Every mutating call reads the current record, validates it against the
//! transition table and writes it back with one compare-and-swap keyed on the
//! version it read. Losing writers get `VersionConflict` (or a claim conflict);
//! nothing is ever partially applied.
//!
//! Two system operations step outside the owner/table rules:
//! - `reclaim_expired` moves Working tasks with a lapsed lease back to Ready.
//! - `discard` / `archive_expired` delete records (review sub-tasks, old terminal tasks).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::dependency::DependencyGraph;
use super::listing::{TaskCursor, TaskFilter};
use crate::config::RolesConfig;
use crate::domain::{
    CoordinationError, DomainEvent, NewTask, Task, TaskId, TaskKind, TaskStatus, WorkerId,
};
use crate::ports::{Clock, EventSink, IdGenerator, StoreError, TaskStore};

const SCAN_PAGE: usize = 256;

/// Result of a claim that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the task (or already did; the lease was refreshed).
    Claimed(Task),

    /// Someone else holds it, or won the race for it. Retry later or pick another task.
    Conflict { holder: Option<WorkerId> },

    /// Listed dependencies are not Completed yet.
    DependencyUnmet { pending: Vec<TaskId> },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Optional extras of a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionMeta {
    /// Recorded in the history entry.
    pub note: Option<String>,
    /// Fail with `VersionConflict` unless the task is still at this version.
    pub expected_version: Option<u64>,
    /// Structured metadata stored with the history entry.
    pub data: Option<serde_json::Value>,
}

impl TransitionMeta {
    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A task the sweep took back from its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedTask {
    pub task_id: TaskId,
    pub previous_owner: Option<WorkerId>,
    pub retry_count: u32,
}

pub struct CoordinationGateway {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    lease: Duration,
    /// The only actor allowed to move a task out of PendingReview.
    review_authority: WorkerId,
}

impl CoordinationGateway {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            events,
            lease,
            review_authority: RolesConfig::default().system,
        }
    }

    /// Actor whose verdicts settle PendingReview tasks (`roles.system`).
    pub fn with_review_authority(mut self, authority: WorkerId) -> Self {
        self.review_authority = authority;
        self
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease
    }

    pub fn review_authority(&self) -> &WorkerId {
        &self.review_authority
    }

    fn reject_actor(
        &self,
        task: &Task,
        worker: &WorkerId,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> CoordinationError {
        let detail = format!(
            "{worker} tried {:?} -> {to:?} on a task owned by {:?}",
            task.status, task.owner
        );
        tracing::warn!(task_id = %task.id, worker = %worker, "{detail}");
        self.events.emit(DomainEvent::ProtocolViolation {
            worker: worker.clone(),
            task_id: Some(task.id),
            detail,
            at: now,
        });
        CoordinationError::NotOwner {
            task_id: task.id,
            worker: worker.clone(),
            owner: task.owner.clone(),
        }
    }

    // ========================================
    // create
    // ========================================

    pub async fn create(
        &self,
        task: NewTask,
        actor: Option<&WorkerId>,
    ) -> Result<TaskId, CoordinationError> {
        let ids = self.create_batch(vec![task], actor).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| CoordinationError::Validation("empty batch".into()))
    }

    /// Validate the whole batch, then write it in one all-or-nothing insert.
    ///
    /// Members may depend on each other through caller-assigned ids. Existing
    /// tasks only ever reference ids that existed when they were created, so a
    /// cycle can only run through the batch itself.
    pub async fn create_batch(
        &self,
        tasks: Vec<NewTask>,
        actor: Option<&WorkerId>,
    ) -> Result<Vec<TaskId>, CoordinationError> {
        if tasks.is_empty() {
            return Err(CoordinationError::Validation("empty batch".into()));
        }
        let now = self.clock.now();

        let mut batch_ids = BTreeSet::new();
        let mut records = Vec::with_capacity(tasks.len());
        for new in tasks {
            if new.description.trim().is_empty() {
                return Err(CoordinationError::Validation(
                    "task description must not be empty".into(),
                ));
            }
            let id = new.id.unwrap_or_else(|| self.ids.generate_task_id());
            if !batch_ids.insert(id) {
                return Err(CoordinationError::Validation(format!(
                    "task {id} appears twice in the batch"
                )));
            }
            if new.dependency_ids.contains(&id) {
                return Err(CoordinationError::Validation(format!(
                    "task {id} depends on itself"
                )));
            }
            records.push(new.into_task(id, actor.cloned(), now));
        }

        for task in &records {
            for dep in &task.dependency_ids {
                if batch_ids.contains(dep) {
                    continue;
                }
                if self.store.get(*dep).await?.is_none() {
                    return Err(CoordinationError::Validation(format!(
                        "task {} depends on unknown task {dep}",
                        task.id
                    )));
                }
            }
        }

        if let Some(cycle) = DependencyGraph::from_tasks(&records).detect_cycle() {
            let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            return Err(CoordinationError::Validation(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }

        let ids: Vec<TaskId> = records.iter().map(|t| t.id).collect();
        self.store.insert(records).await?;

        for id in &ids {
            tracing::info!(task_id = %id, "task created");
            self.events.emit(DomainEvent::TaskCreated { task_id: *id, at: now });
        }
        Ok(ids)
    }

    // ========================================
    // read
    // ========================================

    pub async fn get(&self, task_id: TaskId) -> Result<Task, CoordinationError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(CoordinationError::NotFound(task_id))
    }

    /// Lazy, restartable walk over the tasks matching `filter`.
    pub fn list<F>(&self, filter: F) -> TaskCursor
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        let filter: TaskFilter = Arc::new(filter);
        TaskCursor::new(Arc::clone(&self.store), filter)
    }

    pub async fn quarantined(&self) -> Result<Vec<TaskId>, CoordinationError> {
        Ok(self.store.quarantined().await?)
    }

    async fn all_tasks(&self) -> Result<Vec<Task>, CoordinationError> {
        self.list(|_| true).with_page_size(SCAN_PAGE).collect().await
    }

    /// Dependencies of `task` that are not Completed. Archived (missing)
    /// dependencies count as done: only terminal tasks are ever archived and a
    /// Failed dependency is kept until its retention lapses.
    async fn pending_dependencies(&self, task: &Task) -> Result<Vec<TaskId>, CoordinationError> {
        let mut pending = Vec::new();
        for dep in &task.dependency_ids {
            match self.store.get(*dep).await? {
                Some(d) if d.status != TaskStatus::Completed => pending.push(*dep),
                Some(_) => {}
                None => tracing::debug!(task_id = %task.id, dependency = %dep, "dependency archived"),
            }
        }
        Ok(pending)
    }

    // ========================================
    // claim
    // ========================================

    /// Take exclusive ownership of a task.
    ///
    /// Backlog and Reopened tasks are promoted through Ready in the same write.
    /// Claiming a task the caller already holds is idempotent and refreshes
    /// the lease.
    pub async fn claim(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
    ) -> Result<ClaimOutcome, CoordinationError> {
        if worker.is_empty() {
            return Err(CoordinationError::Validation("worker id must not be empty".into()));
        }
        let task = self.get(task_id).await?;
        let now = self.clock.now();

        if task.status == TaskStatus::Working {
            if task.is_owned_by(worker) {
                return match self.write_lease(task, now).await {
                    Ok(task) => Ok(ClaimOutcome::Claimed(task)),
                    Err(CoordinationError::VersionConflict { .. }) => {
                        self.conflict_outcome(task_id).await
                    }
                    Err(e) => Err(e),
                };
            }
            tracing::debug!(task_id = %task_id, worker = %worker, holder = ?task.owner, "claim conflict");
            return Ok(ClaimOutcome::Conflict {
                holder: task.owner.clone(),
            });
        }

        if !task.status.is_claimable() {
            return Err(CoordinationError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Working,
            });
        }

        if let Some(reviewer) = task.reserved_for()
            && reviewer != worker
        {
            return Ok(ClaimOutcome::Conflict {
                holder: Some(reviewer.clone()),
            });
        }

        let pending = self.pending_dependencies(&task).await?;
        if !pending.is_empty() {
            return Ok(ClaimOutcome::DependencyUnmet { pending });
        }

        let expected = task.version;
        let version = expected + 1;
        let mut next = task;
        let mut steps = Vec::new();
        if next.status != TaskStatus::Ready {
            steps.push((next.status, TaskStatus::Ready));
            next.push_step(TaskStatus::Ready, Some(worker.clone()), now, version, None, None);
        }
        steps.push((TaskStatus::Ready, TaskStatus::Working));
        next.push_step(TaskStatus::Working, Some(worker.clone()), now, version, None, None);
        next.owner = Some(worker.clone());
        next.lease_expiry = Some(now + self.lease);
        next.version = version;

        match self.store.compare_and_swap(next.clone(), expected).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => return self.conflict_outcome(task_id).await,
            Err(e) => return Err(e.into()),
        }

        tracing::info!(task_id = %task_id, worker = %worker, version, "task claimed");
        for (from, to) in steps {
            self.events.emit(DomainEvent::TaskTransitioned {
                task_id,
                from,
                to,
                actor: Some(worker.clone()),
                version,
                at: now,
            });
        }
        self.events.emit(DomainEvent::TaskClaimed {
            task_id,
            worker: worker.clone(),
            version,
            at: now,
        });
        Ok(ClaimOutcome::Claimed(next))
    }

    async fn conflict_outcome(&self, task_id: TaskId) -> Result<ClaimOutcome, CoordinationError> {
        let holder = self.store.get(task_id).await?.and_then(|t| t.owner);
        Ok(ClaimOutcome::Conflict { holder })
    }

    /// Owner-only lease extension.
    pub async fn refresh_lease(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
    ) -> Result<Task, CoordinationError> {
        let task = self.get(task_id).await?;
        if task.status != TaskStatus::Working {
            return Err(CoordinationError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Working,
            });
        }
        if !task.is_owned_by(worker) {
            return Err(CoordinationError::NotOwner {
                task_id,
                worker: worker.clone(),
                owner: task.owner,
            });
        }
        let now = self.clock.now();
        self.write_lease(task, now).await
    }

    async fn write_lease(&self, task: Task, now: DateTime<Utc>) -> Result<Task, CoordinationError> {
        let expected = task.version;
        let mut next = task;
        next.lease_expiry = Some(now + self.lease);
        next.version = expected + 1;
        next.updated_at = now;
        self.store.compare_and_swap(next.clone(), expected).await?;
        tracing::debug!(task_id = %next.id, lease_expiry = ?next.lease_expiry, "lease refreshed");
        Ok(next)
    }

    // ========================================
    // transition
    // ========================================

    pub async fn transition(
        &self,
        task_id: TaskId,
        to: TaskStatus,
        worker: &WorkerId,
        meta: TransitionMeta,
    ) -> Result<Task, CoordinationError> {
        let task = self.get(task_id).await?;
        let now = self.clock.now();

        if let Some(expected) = meta.expected_version
            && expected != task.version
        {
            return Err(CoordinationError::VersionConflict {
                task_id,
                expected,
                actual: task.version,
            });
        }

        let from = task.status;
        if !task.can_transition_to(to) {
            return Err(CoordinationError::InvalidTransition { task_id, from, to });
        }

        if from == TaskStatus::Working && !task.is_owned_by(worker) {
            return Err(self.reject_actor(&task, worker, to, now));
        }
        // review verdicts are settled by the review authority alone
        if from == TaskStatus::PendingReview && worker != &self.review_authority {
            return Err(self.reject_actor(&task, worker, to, now));
        }

        if matches!(to, TaskStatus::Ready | TaskStatus::Working) {
            let pending = self.pending_dependencies(&task).await?;
            if !pending.is_empty() {
                return Err(CoordinationError::DependencyUnmet { task_id, pending });
            }
        }
        if to == TaskStatus::Working
            && let Some(reviewer) = task.reserved_for()
            && reviewer != worker
        {
            return Err(CoordinationError::NotOwner {
                task_id,
                worker: worker.clone(),
                owner: Some(reviewer.clone()),
            });
        }

        let expected = task.version;
        let version = expected + 1;
        let mut next = task;
        next.push_step(to, Some(worker.clone()), now, version, meta.note, meta.data);
        if to == TaskStatus::Working {
            next.owner = Some(worker.clone());
            next.lease_expiry = Some(now + self.lease);
        }
        next.version = version;

        self.store.compare_and_swap(next.clone(), expected).await?;

        tracing::info!(task_id = %task_id, worker = %worker, ?from, ?to, version, "task transitioned");
        self.events.emit(DomainEvent::TaskTransitioned {
            task_id,
            from,
            to,
            actor: Some(worker.clone()),
            version,
            at: now,
        });
        if to == TaskStatus::Completed {
            self.events.emit(DomainEvent::TaskCompleted {
                task_id,
                owner: next.owner.clone(),
                at: now,
            });
            // the write is committed; a failed scan only loses the credit
            if let Err(e) = self.announce_unblocked(&next, now).await {
                tracing::warn!(task_id = %task_id, error = %e, "dependent scan failed after completion");
            }
        }
        Ok(next)
    }

    /// Emit `DependentUnblocked` for every task whose last open dependency was `completed`.
    async fn announce_unblocked(
        &self,
        completed: &Task,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        let board = self.all_tasks().await?;
        let graph = DependencyGraph::from_tasks(&board);
        let status: HashMap<TaskId, TaskStatus> = board.iter().map(|t| (t.id, t.status)).collect();

        for dependent in graph.get_waiting_tasks(completed.id) {
            let ready = graph.get_dependencies(dependent).iter().all(|dep| {
                status
                    .get(dep)
                    .is_none_or(|s| *s == TaskStatus::Completed)
            });
            let waiting = status.get(&dependent).is_some_and(|s| s.is_claimable());
            if ready && waiting {
                tracing::debug!(task_id = %dependent, unblocked_by = %completed.id, "dependent unblocked");
                self.events.emit(DomainEvent::DependentUnblocked {
                    completed: completed.id,
                    dependent,
                    credited: completed.owner.clone(),
                    at: now,
                });
            }
        }
        Ok(())
    }

    // ========================================
    // system operations
    // ========================================

    /// Sweep step: every Working task whose lease has lapsed goes back to Ready
    /// with `retry_count + 1`. A task refreshed concurrently is left alone.
    pub async fn reclaim_expired(&self) -> Result<Vec<ReclaimedTask>, CoordinationError> {
        let now = self.clock.now();
        let expired = self
            .list(move |t| t.is_lease_expired(now))
            .with_page_size(SCAN_PAGE)
            .collect()
            .await?;

        let mut reclaimed = Vec::new();
        for task in expired {
            let task_id = task.id;
            let previous_owner = task.owner.clone();
            let expected = task.version;
            let version = expected + 1;
            let mut next = task;
            next.retry_count += 1;
            next.push_step(
                TaskStatus::Ready,
                None,
                now,
                version,
                Some("lease expired".into()),
                None,
            );
            next.version = version;

            match self.store.compare_and_swap(next.clone(), expected).await {
                Ok(()) => {}
                Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {
                    tracing::debug!(task_id = %task_id, "reclaim lost a race, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            tracing::warn!(
                task_id = %task_id,
                previous_owner = ?previous_owner,
                retry_count = next.retry_count,
                "lease expired, task reclaimed"
            );
            self.events.emit(DomainEvent::TaskTransitioned {
                task_id,
                from: TaskStatus::Working,
                to: TaskStatus::Ready,
                actor: None,
                version,
                at: now,
            });
            self.events.emit(DomainEvent::LeaseReclaimed {
                task_id,
                previous_owner: previous_owner.clone(),
                retry_count: next.retry_count,
                at: now,
            });
            reclaimed.push(ReclaimedTask {
                task_id,
                previous_owner,
                retry_count: next.retry_count,
            });
        }
        Ok(reclaimed)
    }

    /// Remove a review sub-task once its session is over, whatever its state.
    pub async fn discard(&self, task_id: TaskId) -> Result<(), CoordinationError> {
        let task = match self.store.get(task_id).await? {
            Some(task) => task,
            None => return Ok(()),
        };
        if !matches!(task.kind, TaskKind::Review { .. }) {
            return Err(CoordinationError::Validation(format!(
                "only review sub-tasks can be discarded, {task_id} is a work task"
            )));
        }
        match self.store.remove(task_id, task.version).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                tracing::debug!(task_id = %task_id, "review sub-task discarded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete Completed/Failed tasks last updated more than `retention` ago.
    pub async fn archive_expired(&self, retention: Duration) -> Result<Vec<TaskId>, CoordinationError> {
        let cutoff = self.clock.now() - retention;
        let stale = self
            .list(move |t| t.status.is_terminal() && t.updated_at < cutoff)
            .with_page_size(SCAN_PAGE)
            .collect()
            .await?;

        let mut archived = Vec::new();
        for task in stale {
            match self.store.remove(task.id, task.version).await {
                Ok(()) => archived.push(task.id),
                Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if !archived.is_empty() {
            tracing::info!(count = archived.len(), "archived terminal tasks");
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Priority};
    use crate::impls::{InMemoryTaskStore, MemoryEventSink};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;

    struct Fixture {
        gateway: CoordinationGateway,
        clock: Arc<FixedClock>,
        events: Arc<MemoryEventSink>,
    }

    fn fixture() -> Fixture {
        fixture_on(Arc::new(InMemoryTaskStore::new()))
    }

    fn fixture_on(store: Arc<dyn TaskStore>) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let events = Arc::new(MemoryEventSink::new());
        let gateway = CoordinationGateway::new(
            store,
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            events.clone(),
            Duration::seconds(30),
        );
        Fixture {
            gateway,
            clock,
            events,
        }
    }

    fn w(id: &str) -> WorkerId {
        WorkerId::new(id)
    }

    async fn claimed(f: &Fixture, id: TaskId, worker: &str) -> Task {
        match f.gateway.claim(id, &w(worker)).await.unwrap() {
            ClaimOutcome::Claimed(task) => task,
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dependency_gating_end_to_end() {
        let f = fixture();
        let b = f.gateway.create(NewTask::new("B"), None).await.unwrap();
        let a = f
            .gateway
            .create(NewTask::new("A").depends_on(b), None)
            .await
            .unwrap();

        assert_eq!(
            f.gateway.claim(a, &w("w1")).await.unwrap(),
            ClaimOutcome::DependencyUnmet { pending: vec![b] }
        );
        claimed(&f, b, "w1").await;
        f.gateway
            .transition(b, TaskStatus::Completed, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();
        let task = claimed(&f, a, "w1").await;
        assert_eq!(task.status, TaskStatus::Working);
        assert_eq!(task.owner, Some(w("w1")));
    }

    #[tokio::test]
    async fn claim_promotes_through_ready_in_one_write() {
        let f = fixture();
        let id = f.gateway.create(NewTask::new("t"), None).await.unwrap();
        let task = claimed(&f, id, "w1").await;

        assert_eq!(task.version, 2);
        let steps: Vec<(Option<TaskStatus>, TaskStatus)> =
            task.history.iter().map(|h| (h.from, h.to)).collect();
        assert_eq!(
            steps,
            vec![
                (None, TaskStatus::Backlog),
                (Some(TaskStatus::Backlog), TaskStatus::Ready),
                (Some(TaskStatus::Ready), TaskStatus::Working),
            ]
        );
        assert_eq!(task.lease_expiry, Some(f.clock.now() + Duration::seconds(30)));
    }

    #[tokio::test]
    async fn same_worker_reclaim_is_idempotent() {
        let f = fixture();
        let id = f.gateway.create(NewTask::new("t"), None).await.unwrap();
        let first = claimed(&f, id, "w1").await;
        f.clock.advance(Duration::seconds(10));
        let second = claimed(&f, id, "w1").await;

        assert_eq!(second.owner, first.owner);
        assert_eq!(second.history.len(), first.history.len());
        assert!(second.lease_expiry > first.lease_expiry);

        assert_eq!(
            f.gateway.claim(id, &w("w2")).await.unwrap(),
            ClaimOutcome::Conflict {
                holder: Some(w("w1"))
            }
        );
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let f = Arc::new(fixture());
        let id = f.gateway.create(NewTask::new("hot"), None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                f.gateway.claim(id, &w(&format!("w{i}"))).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_claimed() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[rstest::rstest]
    #[case::backlog_to_working(TaskStatus::Working)]
    #[case::backlog_to_completed(TaskStatus::Completed)]
    #[case::backlog_to_pending_review(TaskStatus::PendingReview)]
    #[tokio::test]
    async fn illegal_transitions_are_rejected(#[case] to: TaskStatus) {
        let f = fixture();
        let id = f.gateway.create(NewTask::new("t"), None).await.unwrap();
        let err = f
            .gateway
            .transition(id, to, &w("w1"), TransitionMeta::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinationError::InvalidTransition {
                task_id: id,
                from: TaskStatus::Backlog,
                to
            }
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn review_required_blocks_direct_completion() {
        let f = fixture();
        let id = f
            .gateway
            .create(NewTask::new("t").with_review(), None)
            .await
            .unwrap();
        claimed(&f, id, "w1").await;
        let err = f
            .gateway
            .transition(id, TaskStatus::Completed, &w("w1"), TransitionMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidTransition { .. }));
        f.gateway
            .transition(id, TaskStatus::PendingReview, &w("w1"), TransitionMeta::note("done"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let f = fixture();
        let id = f.gateway.create(NewTask::new("t"), None).await.unwrap();
        let err = f
            .gateway
            .transition(
                id,
                TaskStatus::Ready,
                &w("w1"),
                TransitionMeta::default().at_version(7),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            err,
            CoordinationError::VersionConflict {
                task_id: id,
                expected: 7,
                actual: 1
            }
        );
    }

    #[tokio::test]
    async fn non_owner_transition_is_a_protocol_violation() {
        let f = fixture();
        let id = f.gateway.create(NewTask::new("t"), None).await.unwrap();
        claimed(&f, id, "w1").await;
        f.events.drain();

        let err = f
            .gateway
            .transition(id, TaskStatus::Failed, &w("w2"), TransitionMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotOwner { .. }));
        assert!(matches!(
            f.events.snapshot().as_slice(),
            [DomainEvent::ProtocolViolation { worker, .. }] if worker == &w("w2")
        ));
    }

    #[tokio::test]
    async fn batch_rejects_cycles_and_unknown_dependencies_atomically() {
        let f = fixture();
        let ids = UlidGenerator::new(f.clock.clone());
        let (x, y) = (ids.generate_task_id(), ids.generate_task_id());

        let err = f
            .gateway
            .create_batch(
                vec![
                    NewTask::new("x").with_id(x).depends_on(y),
                    NewTask::new("y").with_id(y).depends_on(x),
                ],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(ref m) if m.contains("cycle")));
        assert!(matches!(f.gateway.get(x).await, Err(CoordinationError::NotFound(_))));

        let ghost = ids.generate_task_id();
        let err = f
            .gateway
            .create(NewTask::new("z").depends_on(ghost), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(ref m) if m.contains("unknown")));

        let created = f
            .gateway
            .create_batch(
                vec![
                    NewTask::new("x").with_id(x),
                    NewTask::new("y").with_id(y).depends_on(x),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(created, vec![x, y]);
    }

    #[tokio::test]
    async fn sweep_reclaims_exactly_once_with_retry_increment() {
        let f = fixture();
        let id = f.gateway.create(NewTask::new("t"), None).await.unwrap();
        claimed(&f, id, "w1").await;

        assert!(f.gateway.reclaim_expired().await.unwrap().is_empty());
        f.clock.advance(Duration::seconds(31));

        let reclaimed = f.gateway.reclaim_expired().await.unwrap();
        assert_eq!(
            reclaimed,
            vec![ReclaimedTask {
                task_id: id,
                previous_owner: Some(w("w1")),
                retry_count: 1
            }]
        );
        assert!(f.gateway.reclaim_expired().await.unwrap().is_empty());

        let task = f.gateway.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.owner, None);
        assert_eq!(task.retry_count, 1);
        assert!(claimed(&f, id, "w2").await.is_owned_by(&w("w2")));
    }

    #[tokio::test]
    async fn refreshed_lease_survives_the_sweep() {
        let f = fixture();
        let id = f.gateway.create(NewTask::new("t"), None).await.unwrap();
        claimed(&f, id, "w1").await;
        f.clock.advance(Duration::seconds(20));
        f.gateway.refresh_lease(id, &w("w1")).await.unwrap();
        f.clock.advance(Duration::seconds(20));
        assert!(f.gateway.reclaim_expired().await.unwrap().is_empty());

        assert!(matches!(
            f.gateway.refresh_lease(id, &w("w2")).await,
            Err(CoordinationError::NotOwner { .. })
        ));
    }

    #[tokio::test]
    async fn completion_credits_unblocked_dependents() {
        let f = fixture();
        let b = f.gateway.create(NewTask::new("B"), None).await.unwrap();
        let c = f.gateway.create(NewTask::new("C"), None).await.unwrap();
        let a = f
            .gateway
            .create(NewTask::new("A").depends_on(b), None)
            .await
            .unwrap();
        let d = f
            .gateway
            .create(NewTask::new("D").depends_on(b).depends_on(c), None)
            .await
            .unwrap();
        claimed(&f, b, "w1").await;
        f.events.drain();

        f.gateway
            .transition(b, TaskStatus::Completed, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();

        let unblocked: Vec<TaskId> = f
            .events
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                DomainEvent::DependentUnblocked {
                    dependent, credited, ..
                } => {
                    assert_eq!(credited, Some(w("w1")));
                    Some(dependent)
                }
                _ => None,
            })
            .collect();
        assert_eq!(unblocked, vec![a]);
        assert!(!unblocked.contains(&d));
    }

    #[tokio::test]
    async fn review_subtasks_are_reserved_and_discardable() {
        let f = fixture();
        let parent = f.gateway.create(NewTask::new("p"), None).await.unwrap();
        let sub = f
            .gateway
            .create(
                NewTask::new("review p").with_kind(TaskKind::Review {
                    parent,
                    reviewer: w("r1"),
                }),
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            f.gateway.claim(sub, &w("r2")).await.unwrap(),
            ClaimOutcome::Conflict {
                holder: Some(w("r1"))
            }
        );
        claimed(&f, sub, "r1").await;
        f.gateway.discard(sub).await.unwrap();
        assert!(matches!(f.gateway.get(sub).await, Err(CoordinationError::NotFound(_))));
        assert!(matches!(
            f.gateway.discard(parent).await,
            Err(CoordinationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn archive_removes_only_old_terminal_tasks() {
        let f = fixture();
        let done = f.gateway.create(NewTask::new("done"), None).await.unwrap();
        let open = f
            .gateway
            .create(NewTask::new("open").with_priority(Priority::High), None)
            .await
            .unwrap();
        claimed(&f, done, "w1").await;
        f.gateway
            .transition(done, TaskStatus::Completed, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();

        assert!(f.gateway.archive_expired(Duration::hours(1)).await.unwrap().is_empty());
        f.clock.advance(Duration::hours(2));
        assert_eq!(
            f.gateway.archive_expired(Duration::hours(1)).await.unwrap(),
            vec![done]
        );
        assert!(f.gateway.get(open).await.is_ok());
    }

    #[tokio::test]
    async fn list_filters_lazily() {
        let f = fixture();
        for i in 0..5 {
            let p = if i < 2 { Priority::High } else { Priority::Low };
            f.gateway
                .create(NewTask::new(format!("t{i}")).with_priority(p), None)
                .await
                .unwrap();
        }
        let high = f
            .gateway
            .list(|t| t.priority == Priority::High)
            .collect()
            .await
            .unwrap();
        assert_eq!(high.len(), 2);
    }

    /// Delegates to memory; `scan` fails once `break_scans` is set.
    struct FlakyScanStore {
        inner: InMemoryTaskStore,
        break_scans: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl TaskStore for FlakyScanStore {
        async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
            self.inner.get(id).await
        }

        async fn insert(&self, tasks: Vec<Task>) -> Result<(), StoreError> {
            self.inner.insert(tasks).await
        }

        async fn compare_and_swap(&self, task: Task, expected_version: u64) -> Result<(), StoreError> {
            self.inner.compare_and_swap(task, expected_version).await
        }

        async fn remove(&self, id: TaskId, expected_version: u64) -> Result<(), StoreError> {
            self.inner.remove(id, expected_version).await
        }

        async fn scan(&self, after: Option<TaskId>, limit: usize) -> Result<Vec<Task>, StoreError> {
            if self.break_scans.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Backend("scan unavailable".into()));
            }
            self.inner.scan(after, limit).await
        }
    }

    async fn in_review(f: &Fixture, worker: &str) -> TaskId {
        let id = f
            .gateway
            .create(NewTask::new("t").with_review(), None)
            .await
            .unwrap();
        claimed(f, id, worker).await;
        f.gateway
            .transition(id, TaskStatus::PendingReview, &w(worker), TransitionMeta::default())
            .await
            .unwrap();
        id
    }

    #[rstest::rstest]
    #[case::self_approval(TaskStatus::Completed)]
    #[case::self_reopen(TaskStatus::Reopened)]
    #[tokio::test]
    async fn owner_cannot_settle_their_own_review(#[case] to: TaskStatus) {
        let f = fixture();
        let id = in_review(&f, "w1").await;
        f.events.drain();

        let err = f
            .gateway
            .transition(id, to, &w("w1"), TransitionMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotOwner { .. }));
        assert!(matches!(
            f.events.snapshot().as_slice(),
            [DomainEvent::ProtocolViolation { worker, .. }] if worker == &w("w1")
        ));
        assert_eq!(f.gateway.get(id).await.unwrap().status, TaskStatus::PendingReview);

        let settled = f
            .gateway
            .transition(id, to, f.gateway.review_authority(), TransitionMeta::default())
            .await
            .unwrap();
        assert_eq!(settled.status, to);
    }

    #[tokio::test]
    async fn review_authority_is_configurable() {
        let f = fixture();
        let gateway = CoordinationGateway::new(
            Arc::new(InMemoryTaskStore::new()),
            f.clock.clone(),
            Arc::new(UlidGenerator::new(f.clock.clone())),
            f.events.clone(),
            Duration::seconds(30),
        )
        .with_review_authority(w("panel"));
        let id = gateway.create(NewTask::new("t").with_review(), None).await.unwrap();
        gateway.claim(id, &w("w1")).await.unwrap();
        gateway
            .transition(id, TaskStatus::PendingReview, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();

        let err = gateway
            .transition(id, TaskStatus::Completed, &w("hive"), TransitionMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotOwner { .. }));
        gateway
            .transition(id, TaskStatus::Completed, &w("panel"), TransitionMeta::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn completion_stands_when_dependent_scan_fails() {
        let store = Arc::new(FlakyScanStore {
            inner: InMemoryTaskStore::new(),
            break_scans: std::sync::atomic::AtomicBool::new(false),
        });
        let f = fixture_on(store.clone());
        let b = f.gateway.create(NewTask::new("b"), None).await.unwrap();
        f.gateway.create(NewTask::new("a").depends_on(b), None).await.unwrap();
        claimed(&f, b, "w1").await;

        store.break_scans.store(true, std::sync::atomic::Ordering::SeqCst);
        let done = f
            .gateway
            .transition(b, TaskStatus::Completed, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(f.gateway.get(b).await.unwrap().status, TaskStatus::Completed);
        assert!(f
            .events
            .snapshot()
            .iter()
            .any(|e| matches!(e, DomainEvent::TaskCompleted { .. })));
    }

    #[tokio::test]
    async fn explicit_ready_waits_for_dependencies() {
        let f = fixture();
        let b = f.gateway.create(NewTask::new("b"), None).await.unwrap();
        let a = f.gateway.create(NewTask::new("a").depends_on(b), None).await.unwrap();

        let err = f
            .gateway
            .transition(a, TaskStatus::Ready, &w("w1"), TransitionMeta::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinationError::DependencyUnmet {
                task_id: a,
                pending: vec![b]
            }
        );
        assert!(err.is_retryable());
        assert_eq!(f.gateway.get(a).await.unwrap().status, TaskStatus::Backlog);

        claimed(&f, b, "w1").await;
        f.gateway
            .transition(b, TaskStatus::Completed, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();
        let ready = f
            .gateway
            .transition(a, TaskStatus::Ready, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();
        assert_eq!(ready.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn reopened_task_returns_to_ready_only_when_unblocked() {
        let store = Arc::new(InMemoryTaskStore::new());
        let f = fixture_on(store.clone());
        let now = f.clock.now();
        let dep = NewTask::new("dep").into_task(TaskId::from_ulid(ulid::Ulid::new()), None, now);
        let mut reopened = NewTask::new("redo")
            .depends_on(dep.id)
            .into_task(TaskId::from_ulid(ulid::Ulid::new()), None, now);
        reopened.status = TaskStatus::Reopened;
        let (dep_id, reopened_id) = (dep.id, reopened.id);
        store.insert(vec![dep, reopened]).await.unwrap();

        let err = f
            .gateway
            .transition(reopened_id, TaskStatus::Ready, &w("w1"), TransitionMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::DependencyUnmet { ref pending, .. } if pending == &vec![dep_id]));

        claimed(&f, dep_id, "w1").await;
        f.gateway
            .transition(dep_id, TaskStatus::Completed, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();
        let ready = f
            .gateway
            .transition(reopened_id, TaskStatus::Ready, &w("w1"), TransitionMeta::default())
            .await
            .unwrap();
        assert_eq!(ready.status, TaskStatus::Ready);
        assert_eq!(ready.history.last().map(|h| h.from), Some(Some(TaskStatus::Reopened)));
    }
}
