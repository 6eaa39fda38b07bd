//! Leader election: the event-fed score ledger and the periodic coordinator.

pub mod coordinator;
pub mod ledger;

pub use self::coordinator::{ElectionCoordinator, ElectionSettings};
pub use self::ledger::ScoreLedger;
