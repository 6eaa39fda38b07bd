//! MessageBus - worker ごとの mailbox を束ねる配送層
//!
//! # フロー
//! 1. `send`: 検証 → 配送（一時的な失敗は指数バックオフで N 回まで）→ それでも失敗なら
//!    coordinator 宛ての HIGH DIRECTIVE でエスカレーション
//! 2. `receive_next`: 可視性タイムアウト・期限切れの整理 → 最優先・最古の 1 件を返す
//! 3. `ack` / `nack`: 受信側が明示的に完了・失敗を報告
//!
//! エスカレーションは常に新しいメッセージとして宛先付きで送られる。唯一の失敗通知経路。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::mailbox::{DeadLetter, DeadLetterReason, Mailbox, NackOutcome, PushOutcome};
use super::retry::RetryPolicy;
use crate::config::{BusConfig, RolesConfig};
use crate::domain::{
    DomainEvent, EscalationReason, Message, MessageBody, MessageId, MessageType, Priority, TaskId,
    WorkerId,
};
use crate::ports::{Clock, EventSink, IdGenerator};

/// Transient delivery failure. Retried, then escalated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no mailbox for {0}")]
    UnknownRecipient(WorkerId),

    #[error("mailbox of {recipient} is full ({capacity} messages)")]
    MailboxFull { recipient: WorkerId, capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// Rejected at ingress; nothing was enqueued.
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("worker {0} has no mailbox")]
    UnknownMailbox(WorkerId),

    #[error("message {id} is not in flight for {worker}")]
    NotInFlight { worker: WorkerId, id: MessageId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReceipt {
    Enqueued { attempts: u32 },
    /// The recipient already accepted this id; nothing changed.
    Duplicate,
    /// Delivery kept failing; a DIRECTIVE went to the coordinator instead.
    Escalated { escalation: MessageId },
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub retry: RetryPolicy,
    pub ack_timeout: Duration,
    pub mailbox_capacity: usize,
    pub escalation_ttl: Duration,
    pub dead_letter_retention: Duration,
    pub coordinator: WorkerId,
    pub system: WorkerId,
}

impl BusSettings {
    pub fn from_config(bus: &BusConfig, roles: &RolesConfig) -> Self {
        Self {
            retry: bus.retry_policy(),
            ack_timeout: bus.ack_timeout(),
            mailbox_capacity: bus.mailbox_capacity,
            escalation_ttl: bus.escalation_ttl(),
            dead_letter_retention: bus.dead_letter_retention(),
            coordinator: roles.coordinator.clone(),
            system: roles.system.clone(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self::from_config(&BusConfig::default(), &RolesConfig::default())
    }
}

/// What to escalate and to whom (the coordinator unless `to` is set).
#[derive(Debug, Clone)]
pub struct Escalation {
    pub reason: EscalationReason,
    pub detail: String,
    pub task_id: Option<TaskId>,
    pub original: Option<Message>,
    pub recipient: Option<WorkerId>,
}

impl Escalation {
    pub fn new(reason: EscalationReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
            task_id: None,
            original: None,
            recipient: None,
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_original(mut self, message: Message) -> Self {
        self.original = Some(message);
        self
    }

    pub fn to(mut self, recipient: WorkerId) -> Self {
        self.recipient = Some(recipient);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationRecord {
    pub message_id: MessageId,
    pub recipient: WorkerId,
    pub reason: EscalationReason,
    pub detail: String,
    pub task_id: Option<TaskId>,
    pub original_id: Option<MessageId>,
    pub raised_at: DateTime<Utc>,
    /// False when even the escalation could not be put in a mailbox.
    pub delivered: bool,
    /// Set when the recipient acknowledges the DIRECTIVE.
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusSweep {
    pub dead_lettered: usize,
    pub escalated: usize,
    /// Dead letters dropped for age.
    pub pruned: usize,
}

pub struct MessageBus {
    mailboxes: RwLock<HashMap<WorkerId, Arc<Mutex<Mailbox>>>>,
    escalations: StdMutex<Vec<EscalationRecord>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    settings: BusSettings,
}

impl MessageBus {
    pub fn new(
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
        settings: BusSettings,
    ) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            escalations: StdMutex::new(Vec::new()),
            clock,
            ids,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// Create the worker's mailbox if it does not exist. Returns true when created.
    pub async fn open_mailbox(&self, worker: &WorkerId) -> bool {
        let mut boxes = self.mailboxes.write().await;
        if boxes.contains_key(worker) {
            return false;
        }
        boxes.insert(
            worker.clone(),
            Arc::new(Mutex::new(Mailbox::new(
                worker.clone(),
                self.settings.mailbox_capacity,
            ))),
        );
        tracing::debug!(worker = %worker, "mailbox opened");
        true
    }

    pub async fn has_mailbox(&self, worker: &WorkerId) -> bool {
        self.mailboxes.read().await.contains_key(worker)
    }

    async fn mailbox(&self, worker: &WorkerId) -> Option<Arc<Mutex<Mailbox>>> {
        self.mailboxes.read().await.get(worker).cloned()
    }

    async fn all_mailboxes(&self) -> Vec<Arc<Mutex<Mailbox>>> {
        self.mailboxes.read().await.values().cloned().collect()
    }

    // ========================================
    // message construction
    // ========================================

    /// Fresh message with a new id, stamped with the bus clock.
    pub fn message(
        &self,
        message_type: MessageType,
        sender: &WorkerId,
        recipient: &WorkerId,
        body: MessageBody,
    ) -> Message {
        Message::new(
            self.ids.generate_message_id(),
            message_type,
            sender.clone(),
            recipient.clone(),
            body,
            self.clock.now(),
        )
    }

    /// Response to `original`, addressed back to its sender.
    pub fn reply(
        &self,
        original: &Message,
        message_type: MessageType,
        sender: &WorkerId,
        body: MessageBody,
    ) -> Message {
        self.message(message_type, sender, &original.sender_id, body)
            .in_response_to(original.id)
    }

    pub fn validate(&self, message: &Message) -> Result<(), BusError> {
        if message.sender_id.is_empty() {
            return Err(BusError::Validation("sender_id is empty".into()));
        }
        if message.recipient_id.is_empty() {
            return Err(BusError::Validation("recipient_id is empty".into()));
        }
        if message.message_type.is_response() && message.in_response_to.is_none() {
            return Err(BusError::Validation(format!(
                "{:?} must reference the message it answers",
                message.message_type
            )));
        }
        if let Some(expires_at) = message.expires_at
            && expires_at <= message.created_at
        {
            return Err(BusError::Validation("expires_at must be after created_at".into()));
        }
        if !message.body.fits(message.message_type) {
            return Err(BusError::Validation(format!(
                "body does not fit a {:?} message",
                message.message_type
            )));
        }
        Ok(())
    }

    // ========================================
    // send / receive / ack
    // ========================================

    /// Deliver `message`, retrying transient failures with exponential backoff.
    ///
    /// Idempotent per message id: a recipient that already accepted the id
    /// reports `Duplicate`.
    pub async fn send(&self, message: Message) -> Result<SendReceipt, BusError> {
        self.validate(&message)?;
        let policy = &self.settings.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_deliver(&message, false).await {
                Ok(PushOutcome::Enqueued) => {
                    tracing::debug!(
                        message_id = %message.id,
                        recipient = %message.recipient_id,
                        r#type = ?message.message_type,
                        attempt,
                        "message enqueued"
                    );
                    return Ok(SendReceipt::Enqueued { attempts: attempt });
                }
                Ok(PushOutcome::Duplicate) => {
                    tracing::debug!(message_id = %message.id, "duplicate send ignored");
                    return Ok(SendReceipt::Duplicate);
                }
                Err(err) if policy.should_retry(attempt) => {
                    let delay = policy.next_delay(attempt);
                    tracing::debug!(message_id = %message.id, error = %err, attempt, ?delay, "delivery failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::warn!(message_id = %message.id, error = %err, attempt, "delivery failed, escalating");
                    let detail = format!("{err} after {attempt} attempts");
                    let escalation = self
                        .escalate(
                            Escalation::new(EscalationReason::DeliveryFailure, detail)
                                .with_original(message),
                        )
                        .await;
                    return Ok(SendReceipt::Escalated { escalation });
                }
            }
        }
    }

    async fn try_deliver(&self, message: &Message, urgent: bool) -> Result<PushOutcome, DeliveryError> {
        let recipient = &message.recipient_id;
        let mailbox = self
            .mailbox(recipient)
            .await
            .ok_or_else(|| DeliveryError::UnknownRecipient(recipient.clone()))?;
        let mut mailbox = mailbox.lock().await;
        if urgent {
            return Ok(mailbox.push_urgent(message.clone()));
        }
        mailbox
            .push(message.clone())
            .map_err(|full| DeliveryError::MailboxFull {
                recipient: recipient.clone(),
                capacity: full.capacity,
            })
    }

    /// Pop the highest-priority, oldest eligible message for `worker`.
    pub async fn receive_next(&self, worker: &WorkerId) -> Result<Option<Message>, BusError> {
        let mailbox = self
            .mailbox(worker)
            .await
            .ok_or_else(|| BusError::UnknownMailbox(worker.clone()))?;
        let now = self.clock.now();
        let (buried, message) = {
            let mut mailbox = mailbox.lock().await;
            let mut buried = mailbox.sweep(now, self.settings.retry.max_attempts);
            let message = mailbox.pop(now, self.settings.ack_timeout, &mut buried);
            (buried, message)
        };
        self.settle_dead_letters(buried).await;
        Ok(message)
    }

    pub async fn ack(&self, worker: &WorkerId, id: MessageId) -> Result<(), BusError> {
        let mailbox = self
            .mailbox(worker)
            .await
            .ok_or_else(|| BusError::UnknownMailbox(worker.clone()))?;
        if !mailbox.lock().await.ack(&id) {
            return Err(BusError::NotInFlight {
                worker: worker.clone(),
                id,
            });
        }
        let now = self.clock.now();
        let mut escalations = self.escalations.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = escalations
            .iter_mut()
            .find(|r| r.message_id == id && r.resolved_at.is_none())
        {
            record.resolved_at = Some(now);
            tracing::info!(message_id = %id, resolver = %worker, "escalation resolved");
        }
        Ok(())
    }

    /// Report a processing failure. The message is redelivered until it has
    /// been tried `max_attempts` times, then dead-lettered and escalated.
    pub async fn nack(
        &self,
        worker: &WorkerId,
        id: MessageId,
        reason: impl Into<String>,
    ) -> Result<NackOutcome, BusError> {
        let mailbox = self
            .mailbox(worker)
            .await
            .ok_or_else(|| BusError::UnknownMailbox(worker.clone()))?;
        let now = self.clock.now();
        let outcome = mailbox
            .lock()
            .await
            .nack(&id, reason.into(), self.settings.retry.max_attempts, now)
            .ok_or_else(|| BusError::NotInFlight {
                worker: worker.clone(),
                id,
            })?;
        if let NackOutcome::DeadLettered(letter) = &outcome {
            self.settle_dead_letters(vec![letter.clone()]).await;
        }
        Ok(outcome)
    }

    /// Send a fresh copy (new id) of `body` to every open mailbox except the sender's.
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        sender: &WorkerId,
        body: MessageBody,
        priority: Priority,
    ) -> Result<Vec<MessageId>, BusError> {
        let mut recipients: Vec<WorkerId> = self
            .mailboxes
            .read()
            .await
            .keys()
            .filter(|w| *w != sender)
            .cloned()
            .collect();
        recipients.sort();

        let mut sent = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let message = self
                .message(message_type, sender, &recipient, body.clone())
                .with_priority(priority);
            let id = message.id;
            if let SendReceipt::Enqueued { .. } = self.send(message).await? {
                sent.push(id);
            }
        }
        Ok(sent)
    }

    // ========================================
    // failure surface
    // ========================================

    /// Raise an escalation DIRECTIVE. Never refused for mailbox capacity and
    /// never retried; an undeliverable escalation is still recorded.
    pub async fn escalate(&self, escalation: Escalation) -> MessageId {
        let now = self.clock.now();
        let recipient = escalation
            .recipient
            .unwrap_or_else(|| self.settings.coordinator.clone());
        let original_id = escalation.original.as_ref().map(|m| m.id);
        let message = self
            .message(
                MessageType::Directive,
                &self.settings.system,
                &recipient,
                MessageBody::Escalation {
                    reason: escalation.reason,
                    detail: escalation.detail.clone(),
                    task_id: escalation.task_id,
                    original: escalation.original.map(Box::new),
                },
            )
            .with_priority(Priority::High)
            .expiring_at(now + self.settings.escalation_ttl);
        let id = message.id;

        let delivered = match self.try_deliver(&message, true).await {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(message_id = %id, recipient = %recipient, error = %err, "escalation could not be delivered");
                false
            }
        };
        tracing::warn!(
            message_id = %id,
            recipient = %recipient,
            reason = ?escalation.reason,
            detail = %escalation.detail,
            "escalation raised"
        );

        self.escalations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(EscalationRecord {
                message_id: id,
                recipient: recipient.clone(),
                reason: escalation.reason,
                detail: escalation.detail,
                task_id: escalation.task_id,
                original_id,
                raised_at: now,
                delivered,
                resolved_at: None,
            });
        self.events.emit(DomainEvent::EscalationRaised {
            message_id: id,
            recipient,
            at: now,
        });
        id
    }

    /// Dead-letter expired messages and redeliver timed-out ones in every mailbox,
    /// then drop dead letters past the retention window.
    pub async fn sweep(&self) -> BusSweep {
        let now = self.clock.now();
        let cutoff = now - self.settings.dead_letter_retention;
        let mut buried = Vec::new();
        let mut pruned = 0;
        for mailbox in self.all_mailboxes().await {
            let mut mailbox = mailbox.lock().await;
            buried.extend(mailbox.sweep(now, self.settings.retry.max_attempts));
            pruned += mailbox.prune_dead_letters(cutoff);
        }
        if pruned > 0 {
            tracing::debug!(pruned, "old dead letters dropped");
        }
        let dead_lettered = buried.len();
        let escalated = self.settle_dead_letters(buried).await;
        BusSweep {
            dead_lettered,
            escalated,
            pruned,
        }
    }

    /// Emit events for freshly dead-lettered messages and escalate the ones
    /// that failed processing. Returns the number of escalations raised.
    async fn settle_dead_letters(&self, letters: Vec<DeadLetter>) -> usize {
        let mut escalated = 0;
        for letter in letters {
            let reason = match &letter.reason {
                DeadLetterReason::Expired => "expired".to_string(),
                DeadLetterReason::AckTimeout => "ack timeout".to_string(),
                DeadLetterReason::ProcessingFailed { detail } => format!("processing failed: {detail}"),
            };
            self.events.emit(DomainEvent::MessageDeadLettered {
                message_id: letter.message.id,
                recipient: letter.message.recipient_id.clone(),
                reason: reason.clone(),
                at: letter.at,
            });
            if letter.reason == DeadLetterReason::Expired {
                continue;
            }
            if matches!(letter.message.body, MessageBody::Escalation { .. }) {
                tracing::error!(message_id = %letter.message.id, "escalation itself was dead-lettered");
                continue;
            }
            let detail = format!(
                "{} could not process {} after {} attempts: {reason}",
                letter.message.recipient_id, letter.message.id, letter.attempts
            );
            self.escalate(
                Escalation::new(EscalationReason::ProcessingFailure, detail).with_original(letter.message),
            )
            .await;
            escalated += 1;
        }
        escalated
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut out = Vec::new();
        for mailbox in self.all_mailboxes().await {
            out.extend(mailbox.lock().await.dead_letters().iter().cloned());
        }
        out.sort_by_key(|l| l.at);
        out
    }

    pub fn open_escalations(&self) -> Vec<EscalationRecord> {
        self.escalations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.resolved_at.is_none())
            .cloned()
            .collect()
    }

    pub fn escalations(&self) -> Vec<EscalationRecord> {
        self.escalations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Queued plus in-flight messages for `worker`.
    pub async fn pending(&self, worker: &WorkerId) -> usize {
        match self.mailbox(worker).await {
            Some(mailbox) => mailbox.lock().await.len(),
            None => 0,
        }
    }
}
