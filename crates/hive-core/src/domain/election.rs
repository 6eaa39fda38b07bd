//! Election records and the pure scoring function.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkerId;

/// Versioned score weights. Every adjustment is one of these, applied as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub version: u32,
    pub task_completed: f64,
    pub dependent_unblocked: f64,
    /// Subtracted once per idle stretch beyond the threshold.
    pub idle_penalty: f64,
    pub protocol_violation: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            version: 1,
            task_completed: 10.0,
            dependent_unblocked: 3.0,
            idle_penalty: 2.0,
            protocol_violation: 15.0,
        }
    }
}

/// What the ledger scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreReason {
    TaskCompleted,
    DependentUnblocked,
    IdleBeyondThreshold,
    ProtocolViolation,
}

impl ScoreReason {
    /// Signed adjustment for this reason under `weights`.
    pub fn delta(self, weights: &ScoreWeights) -> f64 {
        match self {
            ScoreReason::TaskCompleted => weights.task_completed,
            ScoreReason::DependentUnblocked => weights.dependent_unblocked,
            ScoreReason::IdleBeyondThreshold => -weights.idle_penalty,
            ScoreReason::ProtocolViolation => -weights.protocol_violation,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lexicographically smallest worker id wins.
    #[default]
    LowestWorkerId,
    /// Earliest `registered_at` wins; falls back to the lowest id.
    EarliestRegistration,
}

/// How the winner was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakUsed {
    /// A single candidate held the maximum score.
    None,
    LowestWorkerId,
    EarliestRegistration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionRecord {
    pub cycle: u64,
    pub scores: BTreeMap<WorkerId, f64>,
    pub winner: WorkerId,
    pub tie_break: TieBreakUsed,
    pub weights_version: u32,
    pub decided_at: DateTime<Utc>,
    /// The previous leader keeps authority until this instant.
    pub effective_at: DateTime<Utc>,
}

/// Pick the winner of a score snapshot. Deterministic for equal inputs.
///
/// `registered_at` is only consulted for `TieBreak::EarliestRegistration`; a
/// candidate missing from it sorts after every registered one.
pub fn pick_winner(
    scores: &BTreeMap<WorkerId, f64>,
    method: TieBreak,
    registered_at: &BTreeMap<WorkerId, DateTime<Utc>>,
) -> Option<(WorkerId, TieBreakUsed)> {
    let top = scores.values().copied().fold(f64::NEG_INFINITY, f64::max);
    let leaders: Vec<&WorkerId> = scores
        .iter()
        .filter(|(_, s)| **s == top)
        .map(|(w, _)| w)
        .collect();

    match leaders.as_slice() {
        [] => None,
        [only] => Some(((*only).clone(), TieBreakUsed::None)),
        tied => {
            // BTreeMap iteration order: ties are already sorted by id.
            let winner = match method {
                TieBreak::LowestWorkerId => tied[0],
                TieBreak::EarliestRegistration => tied
                    .iter()
                    .min_by_key(|w| {
                        let at = registered_at.get(**w).copied();
                        (at.is_none(), at)
                    })
                    .copied()
                    .unwrap_or(tied[0]),
            };
            let used = match method {
                TieBreak::LowestWorkerId => TieBreakUsed::LowestWorkerId,
                TieBreak::EarliestRegistration => TieBreakUsed::EarliestRegistration,
            };
            Some((winner.clone(), used))
        }
    }
}
