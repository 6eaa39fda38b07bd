//! ElectionCoordinator - periodic, score-based leader election
//!
//! `tick` は 1 サイクル。K サイクルごとに台帳のスナップショットから勝者を決め、
//! HIGH priority の STATUS_UPDATE で全 mailbox に通知する。
//! 勝者決定は `pick_winner`（決定的、乱数なし）。
//! 旧リーダーは `effective_at` まで権限を保持する（grace window）。

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use super::ledger::ScoreLedger;
use crate::bus::{BusError, MessageBus};
use crate::config::{ElectionConfig, RolesConfig};
use crate::domain::election::pick_winner;
use crate::domain::{
    DomainEvent, ElectionRecord, MessageBody, MessageType, Priority, TieBreak, WorkerId,
};
use crate::ports::{Clock, EventSink};
use crate::registry::CapabilityRegistry;

#[derive(Debug, Clone)]
pub struct ElectionSettings {
    pub every_cycles: u64,
    pub grace: Duration,
    pub tie_break: TieBreak,
    /// Sender of the announcement.
    pub sender: WorkerId,
}

impl ElectionSettings {
    pub fn from_config(election: &ElectionConfig, roles: &RolesConfig) -> Self {
        Self {
            every_cycles: election.every_cycles.max(1),
            grace: election.grace(),
            tie_break: election.tie_break,
            sender: roles.system.clone(),
        }
    }
}

#[derive(Default)]
struct Rounds {
    cycle: u64,
    history: Vec<ElectionRecord>,
}

pub struct ElectionCoordinator {
    ledger: Arc<ScoreLedger>,
    registry: Arc<CapabilityRegistry>,
    bus: Arc<MessageBus>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    settings: ElectionSettings,
    rounds: Mutex<Rounds>,
}

impl ElectionCoordinator {
    pub fn new(
        ledger: Arc<ScoreLedger>,
        registry: Arc<CapabilityRegistry>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        settings: ElectionSettings,
    ) -> Self {
        Self {
            ledger,
            registry,
            bus,
            clock,
            events,
            settings,
            rounds: Mutex::new(Rounds::default()),
        }
    }

    pub fn ledger(&self) -> &Arc<ScoreLedger> {
        &self.ledger
    }

    pub fn cycle(&self) -> u64 {
        self.rounds.lock().unwrap_or_else(|p| p.into_inner()).cycle
    }

    /// Advance one cycle. Idle penalties are assessed every cycle; an election
    /// runs on every K-th.
    pub async fn tick(&self) -> Result<Option<ElectionRecord>, BusError> {
        let cycle = {
            let mut rounds = self.rounds.lock().unwrap_or_else(|p| p.into_inner());
            rounds.cycle += 1;
            rounds.cycle
        };
        self.registry.detect_idle();
        self.registry.sync_scores(&self.ledger.snapshot());

        if cycle % self.settings.every_cycles != 0 {
            return Ok(None);
        }
        self.elect(cycle).await
    }

    /// Run an election for `cycle` now. An empty ledger elects nobody.
    pub async fn elect(&self, cycle: u64) -> Result<Option<ElectionRecord>, BusError> {
        let scores = self.ledger.snapshot();
        let registered_at = self.registry.registered_at();
        let Some((winner, tie_break)) = pick_winner(&scores, self.settings.tie_break, &registered_at)
        else {
            tracing::debug!(cycle, "no scored candidates, election skipped");
            return Ok(None);
        };

        let now = self.clock.now();
        let record = ElectionRecord {
            cycle,
            scores,
            winner: winner.clone(),
            tie_break,
            weights_version: self.ledger.weights().version,
            decided_at: now,
            effective_at: now + self.settings.grace,
        };
        self.rounds
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .history
            .push(record.clone());

        tracing::info!(cycle, leader = %winner, ?tie_break, effective_at = %record.effective_at, "leader elected");
        self.events.emit(DomainEvent::LeaderElected {
            cycle,
            leader: winner.clone(),
            at: now,
        });
        self.bus
            .broadcast(
                MessageType::StatusUpdate,
                &self.settings.sender,
                MessageBody::LeaderElected {
                    cycle,
                    leader: winner,
                    effective_at: record.effective_at,
                },
                Priority::High,
            )
            .await?;
        Ok(Some(record))
    }

    /// Leader with authority at `now`. During a grace window the outgoing
    /// leader stays in charge; a first leader takes over immediately.
    pub fn current_leader(&self, now: DateTime<Utc>) -> Option<WorkerId> {
        let rounds = self.rounds.lock().unwrap_or_else(|p| p.into_inner());
        rounds
            .history
            .iter()
            .rev()
            .find(|r| r.effective_at <= now)
            .or_else(|| rounds.history.first())
            .map(|r| r.winner.clone())
    }

    pub fn history(&self) -> Vec<ElectionRecord> {
        self.rounds
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .history
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusSettings;
    use crate::domain::{ScoreReason, ScoreWeights, TieBreakUsed, WorkerStatus};
    use crate::impls::FanoutEventSink;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;

    struct Fixture {
        election: ElectionCoordinator,
        ledger: Arc<ScoreLedger>,
        registry: Arc<CapabilityRegistry>,
        bus: Arc<MessageBus>,
        clock: Arc<FixedClock>,
    }

    fn w(id: &str) -> WorkerId {
        WorkerId::new(id)
    }

    async fn fixture(tie_break: TieBreak) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let ledger = Arc::new(ScoreLedger::new(ScoreWeights::default()));
        let events: Arc<dyn EventSink> = Arc::new(FanoutEventSink::new().with(ledger.clone()));
        let registry = Arc::new(CapabilityRegistry::new(
            clock.clone(),
            events.clone(),
            Duration::seconds(3600),
            Duration::seconds(300),
        ));
        let bus = Arc::new(MessageBus::new(
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            events.clone(),
            BusSettings::default(),
        ));
        let settings = ElectionSettings {
            every_cycles: 3,
            grace: Duration::seconds(30),
            tie_break,
            sender: w("hive"),
        };
        let election = ElectionCoordinator::new(
            ledger.clone(),
            registry.clone(),
            bus.clone(),
            clock.clone(),
            events,
            settings,
        );
        Fixture {
            election,
            ledger,
            registry,
            bus,
            clock,
        }
    }

    #[tokio::test]
    async fn elects_every_k_cycles_and_broadcasts() {
        let f = fixture(TieBreak::LowestWorkerId).await;
        for id in ["w1", "w2"] {
            f.registry.register(&w(id), ["rust"]).unwrap();
            f.bus.open_mailbox(&w(id)).await;
        }
        f.ledger.apply(&w("w2"), ScoreReason::TaskCompleted);

        assert_eq!(f.election.tick().await.unwrap(), None);
        assert_eq!(f.election.tick().await.unwrap(), None);
        let record = f.election.tick().await.unwrap().unwrap();
        assert_eq!(record.cycle, 3);
        assert_eq!(record.winner, w("w2"));
        assert_eq!(record.tie_break, TieBreakUsed::None);
        assert_eq!(record.weights_version, 1);
        assert_eq!(f.registry.get(&w("w2")).unwrap().score, 10.0);

        let note = f.bus.receive_next(&w("w1")).await.unwrap().unwrap();
        assert_eq!(note.priority, Priority::High);
        assert!(matches!(
            note.body,
            MessageBody::LeaderElected { cycle: 3, .. }
        ));
    }

    #[tokio::test]
    async fn ties_resolve_the_same_way_every_time() {
        let f = fixture(TieBreak::EarliestRegistration).await;
        f.registry.register(&w("zed"), ["rust"]).unwrap();
        f.clock.advance(Duration::seconds(1));
        f.registry.register(&w("amy"), ["rust"]).unwrap();
        f.ledger.apply(&w("amy"), ScoreReason::TaskCompleted);
        f.ledger.apply(&w("zed"), ScoreReason::TaskCompleted);

        let first = f.election.elect(1).await.unwrap().unwrap();
        let second = f.election.elect(2).await.unwrap().unwrap();
        assert_eq!(first.winner, w("zed"));
        assert_eq!(second.winner, w("zed"));
        assert_eq!(first.tie_break, TieBreakUsed::EarliestRegistration);
    }

    #[tokio::test]
    async fn empty_ledger_elects_nobody() {
        let f = fixture(TieBreak::LowestWorkerId).await;
        f.registry.register(&w("w1"), ["rust"]).unwrap();
        assert_eq!(f.election.elect(1).await.unwrap(), None);
        assert!(f.election.history().is_empty());
        assert_eq!(f.election.current_leader(f.clock.now()), None);
    }

    #[tokio::test]
    async fn outgoing_leader_keeps_authority_through_grace() {
        let f = fixture(TieBreak::LowestWorkerId).await;
        f.ledger.apply(&w("w1"), ScoreReason::TaskCompleted);
        f.election.elect(1).await.unwrap();
        assert_eq!(f.election.current_leader(f.clock.now()), Some(w("w1")));

        f.clock.advance(Duration::seconds(60));
        f.ledger.apply(&w("w2"), ScoreReason::TaskCompleted);
        f.ledger.apply(&w("w2"), ScoreReason::TaskCompleted);
        f.election.elect(2).await.unwrap();

        assert_eq!(f.election.current_leader(f.clock.now()), Some(w("w1")));
        f.clock.advance(Duration::seconds(30));
        assert_eq!(f.election.current_leader(f.clock.now()), Some(w("w2")));
    }

    #[tokio::test]
    async fn long_idle_costs_points() {
        let f = fixture(TieBreak::LowestWorkerId).await;
        f.registry.register(&w("w1"), ["rust"]).unwrap();
        f.clock.advance(Duration::seconds(301));
        f.registry.heartbeat(&w("w1"), WorkerStatus::Idle, None).unwrap();

        f.election.tick().await.unwrap();
        assert_eq!(f.ledger.score(&w("w1")), Some(-2.0));
        assert_eq!(f.registry.get(&w("w1")).unwrap().score, -2.0);
    }
}
