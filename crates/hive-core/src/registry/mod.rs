//! Worker registry: capability tags, presence and routing.

pub mod capability;
pub mod presence;

pub use self::capability::{CapabilityRegistry, RegistryError};
pub use self::presence::{effective_status, is_stale};
