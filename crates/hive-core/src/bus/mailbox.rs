//! Per-worker mailbox.
//!
//! State:
//! - `queue`: eligible messages keyed by (priority tier, enqueue sequence), so
//!   iteration order is strictly by tier and FIFO within a tier
//! - `inflight`: received but not yet acknowledged; returns to the queue after
//!   the visibility timeout
//! - `seen`: every id ever accepted, kept for the mailbox's lifetime; a second
//!   send of the same id is a no-op
//! - `dead`: expired or repeatedly failed messages, dropped by
//!   `prune_dead_letters` once past the retention window

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Message, MessageId, Priority, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeadLetterReason {
    Expired,
    /// Consumer nacked it on its last allowed attempt.
    ProcessingFailed { detail: String },
    /// Received but never acknowledged, on its last allowed attempt.
    AckTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxFull {
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Back in the queue at its original position.
    Requeued { attempts: u32 },
    DeadLettered(DeadLetter),
}

type QueueKey = (Reverse<Priority>, u64);

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    seq: u64,
    /// Deliveries so far.
    attempts: u32,
}

#[derive(Debug, Clone)]
struct Inflight {
    entry: Entry,
    visible_again_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Mailbox {
    owner: WorkerId,
    capacity: usize,
    next_seq: u64,
    queue: BTreeMap<QueueKey, Entry>,
    inflight: HashMap<MessageId, Inflight>,
    seen: HashSet<MessageId>,
    dead: Vec<DeadLetter>,
}

impl Mailbox {
    pub fn new(owner: WorkerId, capacity: usize) -> Self {
        Self {
            owner,
            capacity,
            next_seq: 0,
            queue: BTreeMap::new(),
            inflight: HashMap::new(),
            seen: HashSet::new(),
            dead: Vec::new(),
        }
    }

    pub fn owner(&self) -> &WorkerId {
        &self.owner
    }

    /// Queued plus in-flight messages.
    pub fn len(&self) -> usize {
        self.queue.len() + self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn push(&mut self, message: Message) -> Result<PushOutcome, MailboxFull> {
        if self.seen.contains(&message.id) {
            return Ok(PushOutcome::Duplicate);
        }
        if self.len() >= self.capacity {
            return Err(MailboxFull {
                capacity: self.capacity,
            });
        }
        Ok(self.enqueue(message))
    }

    /// Like `push`, but never refused for capacity. Used for escalations.
    pub fn push_urgent(&mut self, message: Message) -> PushOutcome {
        if self.seen.contains(&message.id) {
            return PushOutcome::Duplicate;
        }
        self.enqueue(message)
    }

    fn enqueue(&mut self, message: Message) -> PushOutcome {
        self.seen.insert(message.id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert(
            (Reverse(message.priority), seq),
            Entry {
                message,
                seq,
                attempts: 0,
            },
        );
        PushOutcome::Enqueued
    }

    /// Highest-priority, oldest eligible message. It stays in flight until
    /// acked, nacked, or its visibility timeout passes. Expired messages met on
    /// the way are dead-lettered and appended to `buried`.
    pub fn pop(
        &mut self,
        now: DateTime<Utc>,
        ack_timeout: Duration,
        buried: &mut Vec<DeadLetter>,
    ) -> Option<Message> {
        loop {
            let (_, mut entry) = self.queue.pop_first()?;
            if entry.message.is_expired(now) {
                buried.push(self.bury(entry, DeadLetterReason::Expired, now));
                continue;
            }
            entry.attempts += 1;
            let message = entry.message.clone();
            self.inflight.insert(
                message.id,
                Inflight {
                    entry,
                    visible_again_at: now + ack_timeout,
                },
            );
            return Some(message);
        }
    }

    /// Returns false when `id` is not in flight (never received, or already settled).
    pub fn ack(&mut self, id: &MessageId) -> bool {
        self.inflight.remove(id).is_some()
    }

    pub fn nack(
        &mut self,
        id: &MessageId,
        detail: String,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Option<NackOutcome> {
        let inflight = self.inflight.remove(id)?;
        let entry = inflight.entry;
        if entry.attempts >= max_attempts {
            let letter = self.bury(entry, DeadLetterReason::ProcessingFailed { detail }, now);
            return Some(NackOutcome::DeadLettered(letter));
        }
        let attempts = entry.attempts;
        self.requeue(entry);
        Some(NackOutcome::Requeued { attempts })
    }

    /// Periodic maintenance: dead-letter expired messages and return timed-out
    /// in-flight ones to the queue. Returns the messages dead-lettered by this call.
    pub fn sweep(&mut self, now: DateTime<Utc>, max_attempts: u32) -> Vec<DeadLetter> {
        let mut buried = Vec::new();

        let timed_out: Vec<MessageId> = self
            .inflight
            .iter()
            .filter(|(_, f)| f.visible_again_at <= now || f.entry.message.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in timed_out {
            let Some(inflight) = self.inflight.remove(&id) else {
                continue;
            };
            let entry = inflight.entry;
            if entry.message.is_expired(now) {
                buried.push(self.bury(entry, DeadLetterReason::Expired, now));
            } else if entry.attempts >= max_attempts {
                buried.push(self.bury(entry, DeadLetterReason::AckTimeout, now));
            } else {
                tracing::debug!(recipient = %self.owner, message_id = %id, "ack timeout, redelivering");
                self.requeue(entry);
            }
        }

        let expired: Vec<QueueKey> = self
            .queue
            .iter()
            .filter(|(_, e)| e.message.is_expired(now))
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(entry) = self.queue.remove(&key) {
                buried.push(self.bury(entry, DeadLetterReason::Expired, now));
            }
        }
        buried
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead
    }

    /// Drop dead letters recorded before `cutoff`. Returns how many went.
    pub fn prune_dead_letters(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.dead.len();
        self.dead.retain(|l| l.at >= cutoff);
        before - self.dead.len()
    }

    fn requeue(&mut self, entry: Entry) {
        self.queue
            .insert((Reverse(entry.message.priority), entry.seq), entry);
    }

    fn bury(&mut self, entry: Entry, reason: DeadLetterReason, now: DateTime<Utc>) -> DeadLetter {
        tracing::warn!(
            recipient = %self.owner,
            message_id = %entry.message.id,
            ?reason,
            attempts = entry.attempts,
            "message dead-lettered"
        );
        let letter = DeadLetter {
            message: entry.message,
            reason,
            attempts: entry.attempts,
            at: now,
        };
        self.dead.push(letter.clone());
        letter
    }
}
