//! Review rounds: reviewer selection, verdict collection and resolution.

pub mod coordinator;

pub use self::coordinator::{ReviewCoordinator, ReviewFlowError, ReviewSettings};
