//! Message model: the closed set of message types and their payloads.
//!
//! `MessageType` fixes which response types a sender should wait for. The bus
//! does not enforce that table; the sender-side `ReplyTracker` does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, ReviewId, TaskId, WorkerId};
use super::review::ReviewOutcome;
use super::task::Priority;
use super::worker::WorkerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Directive,
    RequestForInfo,
    InformationResponse,
    StatusUpdate,
    ErrorReport,
    Acknowledgement,
    Result,
    CoordinationRequest,
    Heartbeat,
}

impl MessageType {
    /// Responses a sender expects, in order.
    pub fn expected_responses(self) -> &'static [MessageType] {
        use MessageType::*;
        match self {
            Directive => &[Acknowledgement, Result],
            CoordinationRequest => &[Acknowledgement, Result],
            RequestForInfo => &[InformationResponse],
            ErrorReport => &[Acknowledgement],
            Result => &[Acknowledgement],
            InformationResponse | StatusUpdate | Acknowledgement | Heartbeat => &[],
        }
    }

    /// Types that only make sense as an answer to an earlier message.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::Acknowledgement | MessageType::Result | MessageType::InformationResponse
        )
    }
}

/// Why something was escalated to a coordinator or arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    DeliveryFailure,
    ProcessingFailure,
    ResponseTimeout,
    ReviewDisagreement,
    ReviewTimedOut,
    ReviewUnstaffed,
}

/// Type-tagged payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Json {
        value: serde_json::Value,
    },
    Heartbeat {
        status: WorkerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
    },
    /// Asks a reviewer to judge `task_id` before `deadline`.
    ReviewRequest {
        review_id: ReviewId,
        task_id: TaskId,
        review_task_id: TaskId,
        deadline: DateTime<Utc>,
    },
    ReviewVerdict {
        review_id: ReviewId,
        task_id: TaskId,
        outcome: ReviewOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comments: Option<String>,
    },
    /// The sweep took the task back from this worker.
    LeaseExpired {
        task_id: TaskId,
        retry_count: u32,
    },
    /// Result of a finished review round, sent to the task's owner.
    ReviewConcluded {
        task_id: TaskId,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    LeaderElected {
        cycle: u64,
        leader: WorkerId,
        effective_at: DateTime<Utc>,
    },
    Escalation {
        reason: EscalationReason,
        detail: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original: Option<Box<Message>>,
    },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text { text: text.into() }
    }

    /// Whether this payload may travel in a message of type `ty`.
    ///
    /// Free-form bodies (text/json) fit every type; structured ones are bound
    /// to the types that carry them.
    pub fn fits(&self, ty: MessageType) -> bool {
        use MessageType as T;
        match self {
            MessageBody::Text { .. } | MessageBody::Json { .. } => true,
            MessageBody::Heartbeat { .. } => ty == T::Heartbeat,
            MessageBody::ReviewRequest { .. } => ty == T::CoordinationRequest,
            MessageBody::ReviewVerdict { .. } => ty == T::Result,
            MessageBody::LeaseExpired { .. }
            | MessageBody::ReviewConcluded { .. }
            | MessageBody::LeaderElected { .. } => ty == T::StatusUpdate,
            MessageBody::Escalation { .. } => matches!(ty, T::Directive | T::ErrorReport),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: WorkerId,
    pub recipient_id: WorkerId,
    pub priority: Priority,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_response_to: Option<MessageId>,
    #[serde(default)]
    pub ack_required: bool,
}

impl Message {
    /// New message with defaults derived from its type: responses expected by
    /// the type turn `ack_required` on.
    pub fn new(
        id: MessageId,
        message_type: MessageType,
        sender_id: WorkerId,
        recipient_id: WorkerId,
        body: MessageBody,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            message_type,
            sender_id,
            recipient_id,
            priority: Priority::Medium,
            body,
            created_at,
            expires_at: None,
            in_response_to: None,
            ack_required: !message_type.expected_responses().is_empty(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn in_response_to(mut self, original: MessageId) -> Self {
        self.in_response_to = Some(original);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn msg(ty: MessageType, body: MessageBody) -> Message {
        Message::new(
            MessageId::from_ulid(Ulid::new()),
            ty,
            WorkerId::new("a"),
            WorkerId::new("b"),
            body,
            Utc::now(),
        )
    }

    #[rstest]
    #[case::directive(MessageType::Directive, &[MessageType::Acknowledgement, MessageType::Result])]
    #[case::request_for_info(MessageType::RequestForInfo, &[MessageType::InformationResponse])]
    #[case::heartbeat(MessageType::Heartbeat, &[])]
    #[case::status(MessageType::StatusUpdate, &[])]
    fn expected_response_table(#[case] ty: MessageType, #[case] expected: &[MessageType]) {
        assert_eq!(ty.expected_responses(), expected);
    }

    #[test]
    fn message_types_serialize_screaming_snake_case() {
        let s = serde_json::to_string(&MessageType::CoordinationRequest).unwrap();
        assert_eq!(s, "\"COORDINATION_REQUEST\"");
        let s = serde_json::to_string(&MessageType::RequestForInfo).unwrap();
        assert_eq!(s, "\"REQUEST_FOR_INFO\"");
    }

    #[test]
    fn ack_required_follows_the_type() {
        assert!(msg(MessageType::Directive, MessageBody::text("do it")).ack_required);
        assert!(!msg(MessageType::StatusUpdate, MessageBody::text("fyi")).ack_required);
    }

    #[test]
    fn structured_bodies_are_bound_to_their_types() {
        let body = MessageBody::LeaseExpired {
            task_id: TaskId::from_ulid(Ulid::new()),
            retry_count: 1,
        };
        assert!(body.fits(MessageType::StatusUpdate));
        assert!(!body.fits(MessageType::Directive));
        assert!(MessageBody::text("x").fits(MessageType::Heartbeat));
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let now = Utc::now();
        let m = msg(MessageType::StatusUpdate, MessageBody::text("x")).expiring_at(now);
        assert!(!m.is_expired(now));
        assert!(m.is_expired(now + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn wire_shape_uses_type_field() {
        let m = msg(MessageType::Heartbeat, MessageBody::text("alive"));
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "HEARTBEAT");
        assert_eq!(v["body"]["kind"], "text");
        assert!(v.get("expires_at").is_none());
    }
}
