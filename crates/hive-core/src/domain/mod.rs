//! Domain model (ids, tasks, messages, workers, reviews, elections, events, errors).

pub mod election;
pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod review;
pub mod task;
pub mod worker;

pub use self::election::{ElectionRecord, ScoreReason, ScoreWeights, TieBreak, TieBreakUsed};
pub use self::errors::{CoordinationError, ErrorKind};
pub use self::events::DomainEvent;
pub use self::ids::{MessageId, ReviewId, TaskId, WorkerId};
pub use self::message::{EscalationReason, Message, MessageBody, MessageType};
pub use self::review::{ReviewError, ReviewOutcome, ReviewSession, ReviewState, ReviewTask};
pub use self::task::{NewTask, Priority, Task, TaskKind, TaskStatus, TransitionRecord};
pub use self::worker::{PresenceRecord, WorkerRecord, WorkerStatus};
