//! Sender-side enforcement of the expected-response table.
//!
//! The bus never checks that a DIRECTIVE gets its ACKNOWLEDGEMENT and RESULT;
//! the sender tracks what it is still waiting for and decides when to resend
//! or give up.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{Message, MessageId, MessageType, WorkerId};
use crate::ports::IdGenerator;

#[derive(Debug, Clone)]
struct Pending {
    message: Message,
    /// Response types still expected, in order.
    remaining: Vec<MessageType>,
    attempts: u32,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    /// Not a response to anything we are tracking.
    Unrelated,
    /// Expected, but more responses are due.
    Progressed { remaining: Vec<MessageType> },
    /// Last expected response arrived; tracking ended.
    Completed,
    /// Answers a tracked message with a type it should not send.
    Unexpected { expected: Vec<MessageType> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyAction {
    /// Send this copy (fresh id); it is tracked in place of the old one.
    Resend(Message),
    /// Out of attempts.
    Escalate {
        original: Message,
        missing: Vec<MessageType>,
    },
}

#[derive(Debug)]
pub struct ReplyTracker {
    owner: WorkerId,
    timeout: Duration,
    max_attempts: u32,
    pending: HashMap<MessageId, Pending>,
}

impl ReplyTracker {
    pub fn new(owner: WorkerId, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            owner,
            timeout,
            max_attempts,
            pending: HashMap::new(),
        }
    }

    pub fn owner(&self) -> &WorkerId {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_tracking(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }

    /// Start waiting for the responses `message`'s type requires. Returns false
    /// for types that expect nothing.
    pub fn track(&mut self, message: &Message, now: DateTime<Utc>) -> bool {
        let expected = message.message_type.expected_responses();
        if expected.is_empty() {
            return false;
        }
        self.pending.insert(
            message.id,
            Pending {
                message: message.clone(),
                remaining: expected.to_vec(),
                attempts: 1,
                deadline: now + self.timeout,
            },
        );
        true
    }

    /// Match an incoming message against the tracked requests.
    ///
    /// A later expected type may arrive first (a RESULT implies the
    /// ACKNOWLEDGEMENT); everything before it is considered satisfied.
    pub fn observe(&mut self, reply: &Message) -> ReplyStatus {
        let Some(original) = reply.in_response_to else {
            return ReplyStatus::Unrelated;
        };
        let Some(pending) = self.pending.get_mut(&original) else {
            return ReplyStatus::Unrelated;
        };
        let Some(pos) = pending
            .remaining
            .iter()
            .position(|t| *t == reply.message_type)
        else {
            tracing::warn!(
                original = %original,
                got = ?reply.message_type,
                expected = ?pending.remaining,
                "unexpected response type"
            );
            return ReplyStatus::Unexpected {
                expected: pending.remaining.clone(),
            };
        };
        pending.remaining.drain(..=pos);
        if pending.remaining.is_empty() {
            self.pending.remove(&original);
            return ReplyStatus::Completed;
        }
        ReplyStatus::Progressed {
            remaining: pending.remaining.clone(),
        }
    }

    /// Stop tracking without a response (e.g. the request became moot).
    pub fn forget(&mut self, id: &MessageId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Collect requests whose deadline passed. Each is either resent under a
    /// new id or, once `max_attempts` sends went unanswered, dropped for
    /// escalation.
    pub fn overdue(&mut self, now: DateTime<Utc>, ids: &dyn IdGenerator) -> Vec<ReplyAction> {
        let mut lapsed: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        lapsed.sort();

        let mut actions = Vec::with_capacity(lapsed.len());
        for id in lapsed {
            let Some(mut pending) = self.pending.remove(&id) else {
                continue;
            };
            if pending.attempts >= self.max_attempts {
                tracing::warn!(
                    message_id = %id,
                    recipient = %pending.message.recipient_id,
                    attempts = pending.attempts,
                    "no response, giving up"
                );
                actions.push(ReplyAction::Escalate {
                    original: pending.message,
                    missing: pending.remaining,
                });
                continue;
            }
            let mut resend = pending.message.clone();
            resend.id = ids.generate_message_id();
            resend.created_at = now;
            if let Some(expires_at) = pending.message.expires_at
                && expires_at <= now
            {
                resend.expires_at = None;
            }
            pending.attempts += 1;
            pending.deadline = now + self.timeout;
            pending.message = resend.clone();
            tracing::debug!(previous = %id, message_id = %resend.id, attempt = pending.attempts, "resending");
            self.pending.insert(resend.id, pending);
            actions.push(ReplyAction::Resend(resend));
        }
        actions
    }
}
