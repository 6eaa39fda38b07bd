//! Message bus: per-worker mailboxes, delivery retry, escalation and the
//! sender-side reply tracker.

pub mod mailbox;
pub mod message_bus;
pub mod reply;
pub mod retry;

pub use self::mailbox::{DeadLetter, DeadLetterReason, Mailbox, NackOutcome, PushOutcome};
pub use self::message_bus::{
    BusError, BusSettings, BusSweep, DeliveryError, Escalation, EscalationRecord, MessageBus,
    SendReceipt,
};
pub use self::reply::{ReplyAction, ReplyStatus, ReplyTracker};
pub use self::retry::RetryPolicy;
