//! StatusSignal: staleness rules for presence records.
//!
//! A record is only as good as its timestamp. Once it is older than the
//! staleness threshold the worker is treated as `Unknown`, whatever it said
//! last; it stops receiving reviews and its leases run out on their own.

use chrono::{DateTime, Duration, Utc};

use crate::domain::{PresenceRecord, WorkerStatus};

pub fn is_stale(last_updated: DateTime<Utc>, now: DateTime<Utc>, staleness: Duration) -> bool {
    now - last_updated > staleness
}

/// Status to act on at `now`.
pub fn effective_status(
    reported: WorkerStatus,
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
    staleness: Duration,
) -> WorkerStatus {
    if is_stale(last_updated, now, staleness) {
        WorkerStatus::Unknown
    } else {
        reported
    }
}

impl PresenceRecord {
    pub fn effective_status(&self, now: DateTime<Utc>, staleness: Duration) -> WorkerStatus {
        effective_status(self.status, self.last_updated, now, staleness)
    }
}
