//! Swarm configuration.
//!
//! Loaded from TOML; every section and field is optional and falls back to the
//! defaults below. Durations are integer `_ms` / `_secs` fields with `Duration`
//! accessors.
//!
//! ```toml
//! [lease]
//! duration_secs = 30
//!
//! [bus]
//! max_attempts = 3
//! base_delay_ms = 100
//!
//! [election]
//! every_cycles = 5
//! tie_break = "earliest_registration"
//!
//! [election.weights]
//! version = 2
//! task_completed = 10.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::RetryPolicy;
use crate::domain::{ScoreWeights, TieBreak, WorkerId};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub lease: LeaseConfig,
    pub bus: BusConfig,
    pub review: ReviewConfig,
    pub election: ElectionConfig,
    pub presence: PresenceConfig,
    pub roles: RolesConfig,
    pub archive: ArchiveConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a claim stays valid without a refresh.
    pub duration_secs: u64,
    /// Reaper sweep period.
    pub sweep_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 30,
            sweep_interval_ms: 1_000,
        }
    }
}

impl LeaseConfig {
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.duration_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Delivery / processing attempts before escalation.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Received-but-unacknowledged messages return to the queue after this.
    pub ack_timeout_ms: u64,
    pub mailbox_capacity: usize,
    /// Time-to-live of escalation DIRECTIVEs.
    pub escalation_ttl_secs: u64,
    /// Dead letters older than this are dropped by the bus sweep.
    pub dead_letter_retention_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            ack_timeout_ms: 30_000,
            mailbox_capacity: 1_024,
            escalation_ttl_secs: 3_600,
            dead_letter_retention_secs: 86_400,
        }
    }
}

impl BusConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }

    pub fn ack_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.ack_timeout_ms as i64)
    }

    pub fn escalation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.escalation_ttl_secs as i64)
    }

    pub fn dead_letter_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dead_letter_retention_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Distinct reviewers per session. At least two.
    pub reviewers: usize,
    pub deadline_secs: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            reviewers: 2,
            deadline_secs: 600,
        }
    }
}

impl ReviewConfig {
    pub fn deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.deadline_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Elect on every K-th cycle.
    pub every_cycles: u64,
    pub cycle_ms: u64,
    /// The outgoing leader keeps authority this long after an election.
    pub grace_secs: u64,
    /// Idle stretches longer than this are penalized once.
    pub idle_threshold_secs: u64,
    pub tie_break: TieBreak,
    pub weights: ScoreWeights,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            every_cycles: 5,
            cycle_ms: 10_000,
            grace_secs: 30,
            idle_threshold_secs: 300,
            tie_break: TieBreak::LowestWorkerId,
            weights: ScoreWeights::default(),
        }
    }
}

impl ElectionConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs as i64)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_ms: u64,
    /// Signals older than this read as Unknown.
    pub staleness_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            staleness_secs: 30,
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs as i64)
    }
}

/// Well-known mailboxes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    /// Receives delivery/processing escalations.
    pub coordinator: WorkerId,
    /// Receives review disagreements and timeouts.
    pub arbiter: WorkerId,
    /// Sender id of messages the swarm itself produces.
    pub system: WorkerId,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            coordinator: WorkerId::new("coordinator"),
            arbiter: WorkerId::new("arbiter"),
            system: WorkerId::new("hive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Completed/Failed tasks older than this are deleted.
    pub retention_secs: u64,
    pub interval_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 3_600,
            interval_secs: 300,
        }
    }
}

impl ArchiveConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database directory; required for `sled`.
    pub path: Option<PathBuf>,
}

impl HiveConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: HiveConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every section, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, msg: &str| {
            if !ok {
                errors.push(msg.to_string());
            }
        };

        check(self.lease.duration_secs > 0, "lease.duration_secs must be > 0");
        check(self.lease.sweep_interval_ms > 0, "lease.sweep_interval_ms must be > 0");

        check(self.bus.max_attempts >= 1, "bus.max_attempts must be >= 1");
        check(self.bus.multiplier >= 1.0, "bus.multiplier must be >= 1.0");
        check(self.bus.mailbox_capacity > 0, "bus.mailbox_capacity must be > 0");
        check(self.bus.ack_timeout_ms > 0, "bus.ack_timeout_ms must be > 0");

        check(self.review.reviewers >= 2, "review.reviewers must be >= 2");
        check(self.review.deadline_secs > 0, "review.deadline_secs must be > 0");

        check(self.election.every_cycles >= 1, "election.every_cycles must be >= 1");
        check(self.election.cycle_ms > 0, "election.cycle_ms must be > 0");
        let w = &self.election.weights;
        check(
            [w.task_completed, w.dependent_unblocked, w.idle_penalty, w.protocol_violation]
                .iter()
                .all(|v| v.is_finite() && *v >= 0.0),
            "election.weights must be finite and non-negative (penalties are subtracted)",
        );

        check(
            self.presence.staleness_secs * 1_000 > self.presence.heartbeat_interval_ms,
            "presence.staleness_secs must exceed presence.heartbeat_interval_ms",
        );

        check(!self.roles.coordinator.is_empty(), "roles.coordinator must not be empty");
        check(!self.roles.arbiter.is_empty(), "roles.arbiter must not be empty");
        check(!self.roles.system.is_empty(), "roles.system must not be empty");

        check(
            self.store.backend != StoreBackend::Sled || self.store.path.is_some(),
            "store.path is required for the sled backend",
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}
