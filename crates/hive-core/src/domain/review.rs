//! Review sessions: one multi-reviewer consensus round per PendingReview entry.
//!
//! Resolution rules, evaluated after every verdict and on every deadline check:
//! - every reviewer approved (with or without comments) before the deadline -> Approved
//! - a rejection with no approval on record -> Rejected
//! - a rejection next to an approval -> Disagreement
//! - deadline passed with votes missing and no rejection -> TimedOut
//!
//! A rejection is a veto: Rejected and Disagreement both reopen the task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, ReviewId, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approved,
    Rejected,
    ApprovedWithComments,
}

impl ReviewOutcome {
    pub fn is_approval(self) -> bool {
        !matches!(self, ReviewOutcome::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    /// Waiting for verdicts.
    Pending,
    Approved,
    Rejected,
    Disagreement,
    TimedOut,
    /// Not enough eligible reviewers; waiting for the arbiter.
    Unstaffed,
}

impl ReviewState {
    /// The task has left PendingReview because of this session.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ReviewState::Approved | ReviewState::Rejected | ReviewState::Disagreement
        )
    }

    /// The session waits for `arbitrate`.
    pub fn is_held(self) -> bool {
        matches!(self, ReviewState::TimedOut | ReviewState::Unstaffed)
    }
}

/// One reviewer's assignment within a session, backed by a review sub-task on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewTask {
    pub review_task_id: TaskId,
    pub original_task_id: TaskId,
    pub reviewer: WorkerId,
    pub deadline: DateTime<Utc>,
    /// The COORDINATION_REQUEST that asked for this verdict.
    pub request_id: MessageId,
    pub outcome: Option<ReviewOutcome>,
    pub comments: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    #[error("no open review session for task {0}")]
    NoSession(TaskId),

    #[error("review {review} has no assignment for worker {reviewer}")]
    NotAReviewer { review: ReviewId, reviewer: WorkerId },

    #[error("worker {reviewer} already voted in review {review}")]
    AlreadyVoted { review: ReviewId, reviewer: WorkerId },

    #[error("review {review} is closed ({state:?})")]
    Closed { review: ReviewId, state: ReviewState },

    #[error("review {0} deadline has passed")]
    DeadlineLapsed(ReviewId),

    #[error("review for task {0} is not waiting for arbitration")]
    NotHeld(TaskId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSession {
    pub id: ReviewId,
    pub task_id: TaskId,
    /// Owner of the task under review; receives the verdict.
    pub owner: Option<WorkerId>,
    pub assignments: Vec<ReviewTask>,
    pub deadline: DateTime<Utc>,
    pub state: ReviewState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ReviewSession {
    pub fn new(
        id: ReviewId,
        task_id: TaskId,
        owner: Option<WorkerId>,
        deadline: DateTime<Utc>,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            owner,
            assignments: Vec::new(),
            deadline,
            state: ReviewState::Pending,
            opened_at,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_final()
    }

    pub fn assignment_for(&self, reviewer: &WorkerId) -> Option<&ReviewTask> {
        self.assignments.iter().find(|a| &a.reviewer == reviewer)
    }

    /// Record a verdict and return the re-evaluated state.
    pub fn record(
        &mut self,
        reviewer: &WorkerId,
        outcome: ReviewOutcome,
        comments: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ReviewState, ReviewError> {
        if self.state != ReviewState::Pending {
            return Err(ReviewError::Closed {
                review: self.id,
                state: self.state,
            });
        }
        if at > self.deadline {
            return Err(ReviewError::DeadlineLapsed(self.id));
        }
        let review = self.id;
        let slot = self
            .assignments
            .iter_mut()
            .find(|a| &a.reviewer == reviewer)
            .ok_or_else(|| ReviewError::NotAReviewer {
                review,
                reviewer: reviewer.clone(),
            })?;
        if slot.outcome.is_some() {
            return Err(ReviewError::AlreadyVoted {
                review,
                reviewer: reviewer.clone(),
            });
        }
        slot.outcome = Some(outcome);
        slot.comments = comments;
        slot.responded_at = Some(at);
        Ok(self.evaluate(at))
    }

    /// Pure resolution of the current votes at `now`. Does not change `state`.
    pub fn evaluate(&self, now: DateTime<Utc>) -> ReviewState {
        if self.state != ReviewState::Pending {
            return self.state;
        }
        let votes: Vec<ReviewOutcome> = self.assignments.iter().filter_map(|a| a.outcome).collect();
        let rejected = votes.iter().any(|o| !o.is_approval());
        let approved = votes.iter().any(|o| o.is_approval());

        match (rejected, approved) {
            (true, true) => ReviewState::Disagreement,
            (true, false) => ReviewState::Rejected,
            _ if !self.assignments.is_empty() && votes.len() == self.assignments.len() => {
                ReviewState::Approved
            }
            _ if now > self.deadline => ReviewState::TimedOut,
            _ => ReviewState::Pending,
        }
    }

    pub fn close(&mut self, state: ReviewState, at: DateTime<Utc>) {
        self.state = state;
        if state.is_final() {
            self.closed_at = Some(at);
        }
    }

    /// Reviewer comments as `reviewer: text` lines, in assignment order.
    pub fn combined_comments(&self) -> Option<String> {
        self.comments_where(|_| true)
    }

    /// Comments from rejecting reviewers only.
    pub fn rejection_feedback(&self) -> Option<String> {
        self.comments_where(|o| !o.is_approval())
    }

    fn comments_where(&self, keep: impl Fn(ReviewOutcome) -> bool) -> Option<String> {
        let lines: Vec<String> = self
            .assignments
            .iter()
            .filter(|a| a.outcome.is_some_and(&keep))
            .filter_map(|a| a.comments.as_ref().map(|c| format!("{}: {}", a.reviewer, c)))
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    pub fn missing_reviewers(&self) -> Vec<WorkerId> {
        self.assignments
            .iter()
            .filter(|a| a.outcome.is_none())
            .map(|a| a.reviewer.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;
    use ulid::Ulid;

    use ReviewOutcome::*;

    fn session(reviewers: &[&str], now: DateTime<Utc>) -> ReviewSession {
        let task_id = TaskId::from_ulid(Ulid::new());
        let deadline = now + Duration::seconds(60);
        let mut s = ReviewSession::new(
            ReviewId::from_ulid(Ulid::new()),
            task_id,
            Some(WorkerId::new("owner")),
            deadline,
            now,
        );
        for r in reviewers {
            s.assignments.push(ReviewTask {
                review_task_id: TaskId::from_ulid(Ulid::new()),
                original_task_id: task_id,
                reviewer: WorkerId::new(*r),
                deadline,
                request_id: MessageId::from_ulid(Ulid::new()),
                outcome: None,
                comments: None,
                responded_at: None,
            });
        }
        s
    }

    #[rstest]
    #[case::all_approve(&[Approved, ApprovedWithComments], ReviewState::Approved)]
    #[case::one_reject_alone(&[Rejected], ReviewState::Rejected)]
    #[case::approve_then_reject(&[Approved, Rejected], ReviewState::Disagreement)]
    #[case::reject_then_approve_never_completes(&[Rejected, Approved], ReviewState::Rejected)]
    #[case::partial(&[Approved], ReviewState::Pending)]
    fn consensus(#[case] votes: &[ReviewOutcome], #[case] expected: ReviewState) {
        let now = Utc::now();
        let mut s = session(&["r1", "r2"], now);
        let mut last = ReviewState::Pending;
        for (i, vote) in votes.iter().enumerate() {
            let reviewer = WorkerId::new(format!("r{}", i + 1));
            match s.record(&reviewer, *vote, None, now) {
                Ok(state) => {
                    last = state;
                    if state.is_final() {
                        s.close(state, now);
                    }
                }
                Err(ReviewError::Closed { .. }) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(last, expected);
        if votes.contains(&Rejected) {
            assert_ne!(last, ReviewState::Approved);
        }
    }

    #[test]
    fn lapsed_deadline_with_missing_votes_times_out() {
        let now = Utc::now();
        let mut s = session(&["r1", "r2"], now);
        s.record(&WorkerId::new("r1"), Approved, None, now).unwrap();
        assert_eq!(s.evaluate(now + Duration::seconds(61)), ReviewState::TimedOut);
        assert_eq!(s.missing_reviewers(), vec![WorkerId::new("r2")]);
    }

    #[test]
    fn late_and_duplicate_votes_are_refused() {
        let now = Utc::now();
        let mut s = session(&["r1", "r2"], now);
        s.record(&WorkerId::new("r1"), Approved, None, now).unwrap();
        assert!(matches!(
            s.record(&WorkerId::new("r1"), Approved, None, now),
            Err(ReviewError::AlreadyVoted { .. })
        ));
        assert!(matches!(
            s.record(&WorkerId::new("r2"), Approved, None, now + Duration::seconds(61)),
            Err(ReviewError::DeadlineLapsed(_))
        ));
        assert!(matches!(
            s.record(&WorkerId::new("zz"), Approved, None, now),
            Err(ReviewError::NotAReviewer { .. })
        ));
    }

    #[test]
    fn comments_are_concatenated_in_assignment_order() {
        let now = Utc::now();
        let mut s = session(&["r1", "r2"], now);
        s.record(&WorkerId::new("r2"), ApprovedWithComments, Some("nit: naming".into()), now)
            .unwrap();
        s.record(&WorkerId::new("r1"), Approved, Some("lgtm".into()), now)
            .unwrap();
        assert_eq!(
            s.combined_comments().as_deref(),
            Some("r1: lgtm\nr2: nit: naming")
        );
        assert_eq!(s.rejection_feedback(), None);
    }
}
