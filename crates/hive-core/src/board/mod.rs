//! Task board: the gateway, its dependency graph and the listing cursor.

pub mod dependency;
pub mod gateway;
pub mod listing;

pub use self::dependency::DependencyGraph;
pub use self::gateway::{ClaimOutcome, CoordinationGateway, ReclaimedTask, TransitionMeta};
pub use self::listing::{TaskCursor, TaskFilter};
