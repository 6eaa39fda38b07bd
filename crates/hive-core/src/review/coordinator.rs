//! ReviewCoordinator - multi-reviewer consensus rounds
//!
//! # フロー
//! 1. `open`: PendingReview のタスクに対して owner 以外の reviewer を選び、
//!    reviewer ごとに review sub-task を作り COORDINATION_REQUEST を送る
//! 2. `handle_message` / `record_verdict`: RESULT (ReviewVerdict) を集計
//! 3. 結論が出たら gateway 経由でタスクを Completed / Reopened に進め、
//!    sub-task を破棄し、owner に STATUS_UPDATE で通知
//! 4. Disagreement / TimedOut / Unstaffed は arbiter へエスカレーション。
//!    TimedOut / Unstaffed は `arbitrate` まで PendingReview のまま保留
//!
//! 集計ロジック自体は `ReviewSession`（純粋関数）にある。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::board::{CoordinationGateway, TransitionMeta};
use crate::bus::{BusError, Escalation, MessageBus, ReplyAction, ReplyTracker};
use crate::config::{ReviewConfig, RolesConfig};
use crate::domain::{
    CoordinationError, DomainEvent, EscalationReason, Message, MessageBody, MessageType, NewTask,
    Priority, ReviewError, ReviewId, ReviewOutcome, ReviewSession, ReviewState, ReviewTask, TaskId,
    TaskKind, TaskStatus, WorkerId,
};
use crate::ports::{Clock, EventSink, IdGenerator};
use crate::registry::CapabilityRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ReviewFlowError {
    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error(transparent)]
    Board(#[from] CoordinationError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("task {task_id} is {status:?}, reviews start from PendingReview")]
    NotPendingReview { task_id: TaskId, status: TaskStatus },
}

#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub reviewers: usize,
    pub deadline: Duration,
    /// Sender of review requests; reviewers answer to this mailbox.
    pub sender: WorkerId,
    pub arbiter: WorkerId,
}

impl ReviewSettings {
    pub fn from_config(review: &ReviewConfig, roles: &RolesConfig) -> Self {
        Self {
            reviewers: review.reviewers,
            deadline: review.deadline(),
            sender: roles.system.clone(),
            arbiter: roles.arbiter.clone(),
        }
    }
}

struct Book {
    /// Pending and held sessions, by reviewed task.
    open: HashMap<TaskId, ReviewSession>,
    closed: Vec<ReviewSession>,
    replies: ReplyTracker,
}

pub struct ReviewCoordinator {
    gateway: Arc<CoordinationGateway>,
    bus: Arc<MessageBus>,
    registry: Arc<CapabilityRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    settings: ReviewSettings,
    book: Mutex<Book>,
}

impl ReviewCoordinator {
    pub fn new(
        gateway: Arc<CoordinationGateway>,
        bus: Arc<MessageBus>,
        registry: Arc<CapabilityRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
        settings: ReviewSettings,
    ) -> Self {
        let replies = ReplyTracker::new(
            settings.sender.clone(),
            bus.settings().ack_timeout,
            bus.settings().retry.max_attempts,
        );
        Self {
            gateway,
            bus,
            registry,
            clock,
            ids,
            events,
            settings,
            book: Mutex::new(Book {
                open: HashMap::new(),
                closed: Vec::new(),
                replies,
            }),
        }
    }

    pub fn settings(&self) -> &ReviewSettings {
        &self.settings
    }

    // ========================================
    // open
    // ========================================

    /// Start a review round for a task in PendingReview. Idempotent while a
    /// session for the task is open.
    pub async fn open(&self, task_id: TaskId) -> Result<ReviewSession, ReviewFlowError> {
        let mut book = self.book.lock().await;
        if let Some(existing) = book.open.get(&task_id) {
            return Ok(existing.clone());
        }

        let task = self.gateway.get(task_id).await?;
        if matches!(task.kind, TaskKind::Review { .. }) {
            return Err(CoordinationError::Validation(format!("{task_id} is itself a review sub-task")).into());
        }
        if task.status != TaskStatus::PendingReview {
            return Err(ReviewFlowError::NotPendingReview {
                task_id,
                status: task.status,
            });
        }

        let now = self.clock.now();
        let deadline = now + self.settings.deadline;
        let mut session =
            ReviewSession::new(self.ids.generate_review_id(), task_id, task.owner.clone(), deadline, now);

        let exclude: Vec<WorkerId> = task.owner.iter().cloned().collect();
        let reviewers: Vec<WorkerId> = self
            .registry
            .find(&task.required_tags, &exclude)
            .into_iter()
            .take(self.settings.reviewers)
            .collect();

        if reviewers.len() < self.settings.reviewers {
            session.close(ReviewState::Unstaffed, now);
            let detail = format!(
                "task {task_id} needs {} reviewers, {} eligible",
                self.settings.reviewers,
                reviewers.len()
            );
            tracing::warn!(task_id = %task_id, eligible = reviewers.len(), "review unstaffed");
            self.bus
                .escalate(
                    Escalation::new(EscalationReason::ReviewUnstaffed, detail)
                        .for_task(task_id)
                        .to(self.settings.arbiter.clone()),
                )
                .await;
        } else if let Err(err) = self
            .staff(&mut book.replies, &mut session, &task.description, task.priority, &reviewers)
            .await
        {
            for assignment in &session.assignments {
                book.replies.forget(&assignment.request_id);
                if let Err(e) = self.gateway.discard(assignment.review_task_id).await {
                    tracing::warn!(task_id = %assignment.review_task_id, error = %e, "could not discard review sub-task");
                }
            }
            return Err(err);
        }

        tracing::info!(
            task_id = %task_id,
            review_id = %session.id,
            reviewers = ?reviewers,
            state = ?session.state,
            "review opened"
        );
        self.events.emit(DomainEvent::ReviewOpened {
            review_id: session.id,
            task_id,
            reviewers: session.assignments.iter().map(|a| a.reviewer.clone()).collect(),
            at: now,
        });
        book.open.insert(task_id, session.clone());
        Ok(session)
    }

    /// Create one sub-task and one request per reviewer.
    async fn staff(
        &self,
        replies: &mut ReplyTracker,
        session: &mut ReviewSession,
        description: &str,
        priority: Priority,
        reviewers: &[WorkerId],
    ) -> Result<(), ReviewFlowError> {
        let now = self.clock.now();
        for reviewer in reviewers {
            let sub_task = NewTask::new(format!("review {}: {description}", session.task_id))
                .with_priority(priority)
                .with_kind(TaskKind::Review {
                    parent: session.task_id,
                    reviewer: reviewer.clone(),
                });
            let review_task_id = self.gateway.create(sub_task, Some(&self.settings.sender)).await?;

            let request = self
                .bus
                .message(
                    MessageType::CoordinationRequest,
                    &self.settings.sender,
                    reviewer,
                    MessageBody::ReviewRequest {
                        review_id: session.id,
                        task_id: session.task_id,
                        review_task_id,
                        deadline: session.deadline,
                    },
                )
                .with_priority(priority)
                .expiring_at(session.deadline);
            let request_id = request.id;
            session.assignments.push(ReviewTask {
                review_task_id,
                original_task_id: session.task_id,
                reviewer: reviewer.clone(),
                deadline: session.deadline,
                request_id,
                outcome: None,
                comments: None,
                responded_at: None,
            });
            replies.track(&request, now);
            self.bus.send(request).await?;
            if let Err(e) = self.registry.mark_assigned(reviewer) {
                tracing::warn!(reviewer = %reviewer, error = %e, "reviewer vanished from registry");
            }
        }
        Ok(())
    }

    /// Open sessions for PendingReview tasks that have none (startup, missed events).
    pub async fn open_pending(&self) -> Result<Vec<TaskId>, ReviewFlowError> {
        let waiting = self
            .gateway
            .list(|t| t.status == TaskStatus::PendingReview && t.kind == TaskKind::Work)
            .collect()
            .await?;
        let mut opened = Vec::new();
        for task in waiting {
            if self.book.lock().await.open.contains_key(&task.id) {
                continue;
            }
            match self.open(task.id).await {
                Ok(_) => opened.push(task.id),
                // moved on between list and open
                Err(ReviewFlowError::NotPendingReview { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(opened)
    }

    // ========================================
    // verdicts
    // ========================================

    /// Process a message addressed to the review sender. Verdicts are recorded
    /// and acknowledged; everything else only updates reply tracking.
    pub async fn handle_message(&self, message: &Message) -> Result<Option<ReviewState>, ReviewFlowError> {
        self.book.lock().await.replies.observe(message);

        let MessageBody::ReviewVerdict {
            review_id,
            task_id,
            outcome,
            comments,
        } = &message.body
        else {
            return Ok(None);
        };
        let state = self
            .record_verdict(*task_id, Some(*review_id), &message.sender_id, *outcome, comments.clone())
            .await?;

        if message.message_type.expected_responses().contains(&MessageType::Acknowledgement) {
            let ack = self.bus.reply(
                message,
                MessageType::Acknowledgement,
                &self.settings.sender,
                MessageBody::text(format!("verdict recorded, review is {state:?}")),
            );
            self.bus.send(ack).await?;
        }
        Ok(Some(state))
    }

    /// Record one reviewer's verdict; concludes the session once it resolves.
    pub async fn record_verdict(
        &self,
        task_id: TaskId,
        review_id: Option<ReviewId>,
        reviewer: &WorkerId,
        outcome: ReviewOutcome,
        comments: Option<String>,
    ) -> Result<ReviewState, ReviewFlowError> {
        let now = self.clock.now();
        let mut guard = self.book.lock().await;
        let book = &mut *guard;
        let session = book
            .open
            .get_mut(&task_id)
            .filter(|s| review_id.is_none_or(|id| id == s.id))
            .ok_or(ReviewError::NoSession(task_id))?;

        let state = session.record(reviewer, outcome, comments, now)?;
        if let Some(assignment) = session.assignment_for(reviewer) {
            book.replies.forget(&assignment.request_id);
        }
        tracing::info!(task_id = %task_id, reviewer = %reviewer, ?outcome, ?state, "review verdict");
        if state != ReviewState::Pending {
            self.conclude(book, task_id, state, now).await?;
        }
        Ok(state)
    }

    // ========================================
    // resolution
    // ========================================

    async fn conclude(
        &self,
        book: &mut Book,
        task_id: TaskId,
        state: ReviewState,
        now: DateTime<Utc>,
    ) -> Result<(), ReviewFlowError> {
        let Some(session) = book.open.get(&task_id) else {
            return Err(ReviewError::NoSession(task_id).into());
        };
        match state {
            ReviewState::Approved => {
                let note = session.combined_comments();
                self.settle(book, task_id, state, TaskStatus::Completed, note, now).await
            }
            ReviewState::Rejected => {
                let feedback = session.rejection_feedback();
                self.settle(book, task_id, state, TaskStatus::Reopened, feedback, now).await
            }
            ReviewState::Disagreement => {
                let feedback = session.rejection_feedback();
                let detail = format!(
                    "reviewers of {task_id} disagree:\n{}",
                    session.combined_comments().unwrap_or_default()
                );
                self.settle(book, task_id, state, TaskStatus::Reopened, feedback, now).await?;
                self.bus
                    .escalate(
                        Escalation::new(EscalationReason::ReviewDisagreement, detail)
                            .for_task(task_id)
                            .to(self.settings.arbiter.clone()),
                    )
                    .await;
                Ok(())
            }
            ReviewState::TimedOut => {
                let missing = session.missing_reviewers();
                if let Some(session) = book.open.get_mut(&task_id) {
                    session.close(ReviewState::TimedOut, now);
                    for assignment in &session.assignments {
                        book.replies.forget(&assignment.request_id);
                    }
                }
                tracing::warn!(task_id = %task_id, ?missing, "review timed out");
                let detail = format!("review of {task_id} timed out waiting for {missing:?}");
                self.bus
                    .escalate(
                        Escalation::new(EscalationReason::ReviewTimedOut, detail)
                            .for_task(task_id)
                            .to(self.settings.arbiter.clone()),
                    )
                    .await;
                Ok(())
            }
            ReviewState::Pending | ReviewState::Unstaffed => Ok(()),
        }
    }

    /// Move the task out of PendingReview, clean up and close the session.
    async fn settle(
        &self,
        book: &mut Book,
        task_id: TaskId,
        state: ReviewState,
        to: TaskStatus,
        feedback: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ReviewFlowError> {
        let Some(session) = book.open.get(&task_id).cloned() else {
            return Err(ReviewError::NoSession(task_id).into());
        };
        let verdicts: Vec<_> = session
            .assignments
            .iter()
            .map(|a| json!({ "reviewer": a.reviewer, "outcome": a.outcome, "comments": a.comments }))
            .collect();
        let meta = TransitionMeta {
            note: feedback.clone().or_else(|| Some(format!("review {state:?}").to_lowercase())),
            expected_version: None,
            data: Some(json!({ "review_id": session.id, "state": state, "verdicts": verdicts })),
        };

        match self.gateway.transition(task_id, to, &self.settings.sender, meta).await {
            Ok(_) => {}
            Err(e @ (CoordinationError::InvalidTransition { .. } | CoordinationError::NotFound(_))) => {
                tracing::warn!(task_id = %task_id, error = %e, "task left PendingReview outside the review; closing session");
            }
            Err(e) => return Err(e.into()),
        }

        for assignment in &session.assignments {
            book.replies.forget(&assignment.request_id);
            if let Err(e) = self.gateway.discard(assignment.review_task_id).await {
                tracing::warn!(task_id = %assignment.review_task_id, error = %e, "could not discard review sub-task");
            }
        }

        if let Some(owner) = &session.owner {
            let notice = self
                .bus
                .message(
                    MessageType::StatusUpdate,
                    &self.settings.sender,
                    owner,
                    MessageBody::ReviewConcluded {
                        task_id,
                        accepted: to == TaskStatus::Completed,
                        feedback,
                    },
                )
                .with_priority(Priority::High);
            self.bus.send(notice).await?;
        }

        if let Some(mut session) = book.open.remove(&task_id) {
            session.close(state, now);
            book.closed.push(session);
        }
        tracing::info!(task_id = %task_id, ?state, ?to, "review concluded");
        self.events.emit(DomainEvent::ReviewResolved {
            review_id: session.id,
            task_id,
            state,
            at: now,
        });
        Ok(())
    }

    /// Resolve a held (timed-out or unstaffed) session. Any approval completes
    /// the task, a rejection reopens it.
    pub async fn arbitrate(
        &self,
        task_id: TaskId,
        arbiter: &WorkerId,
        outcome: ReviewOutcome,
        note: Option<String>,
    ) -> Result<ReviewState, ReviewFlowError> {
        let now = self.clock.now();
        let mut book = self.book.lock().await;
        let session = book
            .open
            .get(&task_id)
            .ok_or(ReviewError::NoSession(task_id))?;
        if !session.state.is_held() {
            return Err(ReviewError::NotHeld(task_id).into());
        }

        let (state, to) = if outcome.is_approval() {
            (ReviewState::Approved, TaskStatus::Completed)
        } else {
            (ReviewState::Rejected, TaskStatus::Reopened)
        };
        let feedback = Some(match note {
            Some(note) => format!("{arbiter}: {note}"),
            None => format!("{arbiter}: {outcome:?}").to_lowercase(),
        });
        tracing::info!(task_id = %task_id, arbiter = %arbiter, ?outcome, "review arbitrated");
        self.settle(&mut book, task_id, state, to, feedback, now).await?;
        Ok(state)
    }

    /// Deadline pass: resend unanswered requests, then resolve sessions whose
    /// votes or deadline settle them. Returns the sessions that changed state.
    pub async fn check_deadlines(&self) -> Result<Vec<(TaskId, ReviewState)>, ReviewFlowError> {
        let now = self.clock.now();
        let mut book = self.book.lock().await;

        for action in book.replies.overdue(now, self.ids.as_ref()) {
            match action {
                ReplyAction::Resend(request) => {
                    if let MessageBody::ReviewRequest { task_id, .. } = &request.body
                        && let Some(slot) = book
                            .open
                            .get_mut(task_id)
                            .and_then(|s| s.assignments.iter_mut().find(|a| a.reviewer == request.recipient_id))
                    {
                        slot.request_id = request.id;
                    }
                    self.bus.send(request).await?;
                }
                ReplyAction::Escalate { original, missing } => {
                    let task_id = match &original.body {
                        MessageBody::ReviewRequest { task_id, .. } => Some(*task_id),
                        _ => None,
                    };
                    let detail = format!(
                        "{} did not answer {} (missing {missing:?})",
                        original.recipient_id, original.id
                    );
                    let mut escalation =
                        Escalation::new(EscalationReason::ResponseTimeout, detail).with_original(original);
                    if let Some(task_id) = task_id {
                        escalation = escalation.for_task(task_id);
                    }
                    self.bus.escalate(escalation).await;
                }
            }
        }

        let due: Vec<(TaskId, ReviewState)> = book
            .open
            .values()
            .filter(|s| s.state == ReviewState::Pending)
            .map(|s| (s.task_id, s.evaluate(now)))
            .filter(|(_, state)| *state != ReviewState::Pending)
            .collect();
        for (task_id, state) in &due {
            self.conclude(&mut book, *task_id, *state, now).await?;
        }
        Ok(due)
    }

    // ========================================
    // queries
    // ========================================

    /// The open session for `task_id`, or its most recent closed one.
    pub async fn session(&self, task_id: TaskId) -> Option<ReviewSession> {
        let book = self.book.lock().await;
        book.open
            .get(&task_id)
            .or_else(|| book.closed.iter().rev().find(|s| s.task_id == task_id))
            .cloned()
    }

    pub async fn open_sessions(&self) -> Vec<ReviewSession> {
        self.book.lock().await.open.values().cloned().collect()
    }

    pub async fn history(&self) -> Vec<ReviewSession> {
        self.book.lock().await.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusSettings;
    use crate::domain::WorkerStatus;
    use crate::impls::{InMemoryTaskStore, MemoryEventSink};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;

    struct Fixture {
        reviews: ReviewCoordinator,
        gateway: Arc<CoordinationGateway>,
        bus: Arc<MessageBus>,
        registry: Arc<CapabilityRegistry>,
        clock: Arc<FixedClock>,
    }

    fn w(id: &str) -> WorkerId {
        WorkerId::new(id)
    }

    async fn fixture(reviewers: &[&str]) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let events = Arc::new(MemoryEventSink::new());
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let gateway = Arc::new(CoordinationGateway::new(
            Arc::new(InMemoryTaskStore::new()),
            clock.clone(),
            ids.clone(),
            events.clone(),
            Duration::seconds(30),
        ));
        let bus = Arc::new(MessageBus::new(
            clock.clone(),
            ids.clone(),
            events.clone(),
            BusSettings::default(),
        ));
        let registry = Arc::new(CapabilityRegistry::new(
            clock.clone(),
            events.clone(),
            Duration::seconds(3600),
            Duration::seconds(300),
        ));
        for role in ["hive", "coordinator", "arbiter", "author"] {
            bus.open_mailbox(&w(role)).await;
        }
        registry.register(&w("author"), ["rust"]).unwrap();
        for reviewer in reviewers {
            bus.open_mailbox(&w(reviewer)).await;
            registry.register(&w(reviewer), ["rust"]).unwrap();
        }
        let settings = ReviewSettings::from_config(&ReviewConfig::default(), &RolesConfig::default());
        let reviews = ReviewCoordinator::new(
            gateway.clone(),
            bus.clone(),
            registry.clone(),
            clock.clone(),
            ids,
            events,
            settings,
        );
        Fixture {
            reviews,
            gateway,
            bus,
            registry,
            clock,
        }
    }

    /// A task owned by "author", sitting in PendingReview.
    async fn task_in_review(f: &Fixture) -> TaskId {
        let author = w("author");
        let id = f
            .gateway
            .create(NewTask::new("port the parser").with_review().with_tag("rust"), None)
            .await
            .unwrap();
        assert!(f.gateway.claim(id, &author).await.unwrap().is_claimed());
        f.gateway
            .transition(id, TaskStatus::PendingReview, &author, TransitionMeta::default())
            .await
            .unwrap();
        id
    }

    async fn drain(f: &Fixture, worker: &str) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(m) = f.bus.receive_next(&w(worker)).await.unwrap() {
            f.bus.ack(&w(worker), m.id).await.unwrap();
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn opening_picks_reviewers_other_than_the_owner() {
        let f = fixture(&["r1", "r2", "r3"]).await;
        let task_id = task_in_review(&f).await;

        let session = f.reviews.open(task_id).await.unwrap();
        let reviewers: Vec<_> = session.assignments.iter().map(|a| a.reviewer.clone()).collect();
        assert_eq!(reviewers, vec![w("r1"), w("r2")]);
        assert_eq!(f.reviews.open(task_id).await.unwrap().id, session.id);

        let requests = drain(&f, "r1").await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message_type, MessageType::CoordinationRequest);
        assert!(matches!(requests[0].body, MessageBody::ReviewRequest { .. }));

        let sub_task = f.gateway.get(session.assignments[0].review_task_id).await.unwrap();
        assert_eq!(sub_task.reserved_for(), Some(&w("r1")));
        assert!(f.registry.get(&w("r1")).unwrap().last_assigned_at.is_some());
    }

    #[tokio::test]
    async fn unanimous_approval_completes_with_comments() {
        let f = fixture(&["r1", "r2"]).await;
        let task_id = task_in_review(&f).await;
        let session = f.reviews.open(task_id).await.unwrap();

        let state = f
            .reviews
            .record_verdict(task_id, None, &w("r1"), ReviewOutcome::Approved, Some("lgtm".into()))
            .await
            .unwrap();
        assert_eq!(state, ReviewState::Pending);
        let state = f
            .reviews
            .record_verdict(
                task_id,
                Some(session.id),
                &w("r2"),
                ReviewOutcome::ApprovedWithComments,
                Some("rename foo".into()),
            )
            .await
            .unwrap();
        assert_eq!(state, ReviewState::Approved);

        let task = f.gateway.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let note = task.history.last().unwrap().note.clone().unwrap();
        assert!(note.contains("r1: lgtm") && note.contains("r2: rename foo"));

        for a in &session.assignments {
            assert!(matches!(
                f.gateway.get(a.review_task_id).await,
                Err(CoordinationError::NotFound(_))
            ));
        }
        let notices = drain(&f, "author").await;
        assert!(notices.iter().any(|m| matches!(
            m.body,
            MessageBody::ReviewConcluded { accepted: true, .. }
        )));
        assert_eq!(f.reviews.session(task_id).await.unwrap().state, ReviewState::Approved);
    }

    #[tokio::test]
    async fn approval_plus_rejection_reopens_and_escalates() {
        let f = fixture(&["r1", "r2"]).await;
        let task_id = task_in_review(&f).await;
        f.reviews.open(task_id).await.unwrap();

        f.reviews
            .record_verdict(task_id, None, &w("r1"), ReviewOutcome::Approved, None)
            .await
            .unwrap();
        let state = f
            .reviews
            .record_verdict(task_id, None, &w("r2"), ReviewOutcome::Rejected, Some("no tests".into()))
            .await
            .unwrap();
        assert_eq!(state, ReviewState::Disagreement);

        let task = f.gateway.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Reopened);
        assert_eq!(task.history.last().unwrap().note.as_deref(), Some("r2: no tests"));

        let escalations = drain(&f, "arbiter").await;
        assert!(escalations.iter().any(|m| matches!(
            m.body,
            MessageBody::Escalation {
                reason: EscalationReason::ReviewDisagreement,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn first_rejection_closes_the_round() {
        let f = fixture(&["r1", "r2"]).await;
        let task_id = task_in_review(&f).await;
        f.reviews.open(task_id).await.unwrap();

        let state = f
            .reviews
            .record_verdict(task_id, None, &w("r1"), ReviewOutcome::Rejected, Some("wrong approach".into()))
            .await
            .unwrap();
        assert_eq!(state, ReviewState::Rejected);
        assert_eq!(f.gateway.get(task_id).await.unwrap().status, TaskStatus::Reopened);

        let late = f
            .reviews
            .record_verdict(task_id, None, &w("r2"), ReviewOutcome::Approved, None)
            .await;
        assert!(matches!(
            late,
            Err(ReviewFlowError::Review(ReviewError::NoSession(_)))
        ));
        assert!(drain(&f, "arbiter").await.is_empty());
    }

    #[tokio::test]
    async fn lapsed_deadline_holds_the_task_until_arbitration() {
        let f = fixture(&["r1", "r2"]).await;
        let task_id = task_in_review(&f).await;
        f.reviews.open(task_id).await.unwrap();
        f.reviews
            .record_verdict(task_id, None, &w("r1"), ReviewOutcome::Approved, None)
            .await
            .unwrap();

        f.clock.advance(Duration::seconds(601));
        let changed = f.reviews.check_deadlines().await.unwrap();
        assert_eq!(changed, vec![(task_id, ReviewState::TimedOut)]);
        assert_eq!(f.gateway.get(task_id).await.unwrap().status, TaskStatus::PendingReview);

        let arbiter_mail = drain(&f, "arbiter").await;
        assert!(arbiter_mail.iter().any(|m| matches!(
            m.body,
            MessageBody::Escalation {
                reason: EscalationReason::ReviewTimedOut,
                ..
            }
        )));

        let state = f
            .reviews
            .arbitrate(task_id, &w("arbiter"), ReviewOutcome::Approved, Some("good enough".into()))
            .await
            .unwrap();
        assert_eq!(state, ReviewState::Approved);
        let task = f.gateway.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.history.last().unwrap().note.as_deref(), Some("arbiter: good enough"));
    }

    #[tokio::test]
    async fn too_few_reviewers_is_escalated_and_held() {
        let f = fixture(&["r1"]).await;
        let task_id = task_in_review(&f).await;

        let session = f.reviews.open(task_id).await.unwrap();
        assert_eq!(session.state, ReviewState::Unstaffed);
        assert!(session.assignments.is_empty());
        assert!(drain(&f, "arbiter").await.iter().any(|m| matches!(
            m.body,
            MessageBody::Escalation {
                reason: EscalationReason::ReviewUnstaffed,
                ..
            }
        )));

        assert!(matches!(
            f.reviews
                .record_verdict(task_id, None, &w("r1"), ReviewOutcome::Approved, None)
                .await,
            Err(ReviewFlowError::Review(ReviewError::Closed { .. }))
        ));
        let state = f
            .reviews
            .arbitrate(task_id, &w("arbiter"), ReviewOutcome::Rejected, None)
            .await
            .unwrap();
        assert_eq!(state, ReviewState::Rejected);
        assert_eq!(f.gateway.get(task_id).await.unwrap().status, TaskStatus::Reopened);
    }

    #[tokio::test]
    async fn unavailable_workers_are_not_picked() {
        let f = fixture(&["r1", "r2", "r3"]).await;
        f.registry.heartbeat(&w("r1"), WorkerStatus::Offline, None).unwrap();
        let task_id = task_in_review(&f).await;
        let session = f.reviews.open(task_id).await.unwrap();
        let reviewers: Vec<_> = session.assignments.iter().map(|a| a.reviewer.clone()).collect();
        assert_eq!(reviewers, vec![w("r2"), w("r3")]);
    }

    #[tokio::test]
    async fn verdicts_arrive_as_result_messages() {
        let f = fixture(&["r1", "r2"]).await;
        let task_id = task_in_review(&f).await;
        f.reviews.open(task_id).await.unwrap();

        for reviewer in ["r1", "r2"] {
            let request = f.bus.receive_next(&w(reviewer)).await.unwrap().unwrap();
            f.bus.ack(&w(reviewer), request.id).await.unwrap();
            let MessageBody::ReviewRequest { review_id, task_id, .. } = request.body.clone() else {
                panic!("expected a review request");
            };
            let verdict = f
                .bus
                .reply(
                    &request,
                    MessageType::Result,
                    &w(reviewer),
                    MessageBody::ReviewVerdict {
                        review_id,
                        task_id,
                        outcome: ReviewOutcome::Approved,
                        comments: None,
                    },
                )
                .with_priority(Priority::High);
            f.bus.send(verdict).await.unwrap();
        }

        let mut last = None;
        while let Some(m) = f.bus.receive_next(&w("hive")).await.unwrap() {
            last = f.reviews.handle_message(&m).await.unwrap();
            f.bus.ack(&w("hive"), m.id).await.unwrap();
        }
        assert_eq!(last, Some(ReviewState::Approved));
        assert_eq!(f.gateway.get(task_id).await.unwrap().status, TaskStatus::Completed);

        let acks = drain(&f, "r1").await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].message_type, MessageType::Acknowledgement);
    }

    #[tokio::test]
    async fn silent_reviewers_get_the_request_again() {
        let f = fixture(&["r1", "r2"]).await;
        let task_id = task_in_review(&f).await;
        let session = f.reviews.open(task_id).await.unwrap();
        assert_eq!(drain(&f, "r1").await.len(), 1);

        f.clock.advance(Duration::seconds(31));
        assert!(f.reviews.check_deadlines().await.unwrap().is_empty());

        let resent = drain(&f, "r1").await;
        assert_eq!(resent.len(), 1);
        assert_ne!(resent[0].id, session.assignments[0].request_id);
        let current = f.reviews.session(task_id).await.unwrap();
        assert_eq!(current.assignments[0].request_id, resent[0].id);
    }
}
