//! SwarmBuilder - 設定からコンポーネントを組み立ててワイヤリングする
//!
//! # Fail-fast 設計
//! - build() 時に設定を検証し、問題があれば BuildError を返す
//! - ストアのオープン失敗も build() で報告
//! - role の mailbox（coordinator / arbiter / system）はここで開く

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::watch;

use super::swarm::Swarm;
use crate::board::CoordinationGateway;
use crate::bus::{BusSettings, MessageBus};
use crate::config::{ConfigError, HiveConfig, StoreBackend};
use crate::election::{ElectionCoordinator, ElectionSettings, ScoreLedger};
use crate::impls::{ChannelEventSink, FanoutEventSink, InMemoryTaskStore, SledTaskStore, TracingEventSink};
use crate::ports::{Clock, EventSink, IdGenerator, StoreError, SystemClock, TaskStore, UlidGenerator};
use crate::registry::CapabilityRegistry;
use crate::review::{ReviewCoordinator, ReviewSettings};

/// BuildError は Swarm 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open task store: {0}")]
    Store(#[from] StoreError),
}

/// # 使用例
/// ```ignore
/// let swarm = SwarmBuilder::new(HiveConfig::load("hive.toml")?)
///     .with_event_sink(Arc::new(my_sink))
///     .build()
///     .await?;
/// swarm.start()?;
/// ```
pub struct SwarmBuilder {
    config: HiveConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn TaskStore>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SwarmBuilder {
    pub fn new(config: HiveConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            sinks: Vec::new(),
        }
    }

    /// Replace the system clock (tests use `FixedClock`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use this store instead of the one `[store]` describes.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Additional receiver of every domain event.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn open_store(&self) -> Result<Arc<dyn TaskStore>, BuildError> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        match (&self.config.store.backend, &self.config.store.path) {
            (StoreBackend::Memory, _) => Ok(Arc::new(InMemoryTaskStore::new())),
            (StoreBackend::Sled, Some(path)) => {
                tracing::info!(path = %path.display(), "opening sled task store");
                Ok(Arc::new(SledTaskStore::open(path)?))
            }
            (StoreBackend::Sled, None) => Err(ConfigError::Invalid(vec![
                "store.path is required for the sled backend".into(),
            ])
            .into()),
        }
    }

    pub async fn build(self) -> Result<Swarm, BuildError> {
        self.config.validate()?;
        let store = self.open_store()?;
        let config = self.config;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let ledger = Arc::new(ScoreLedger::new(config.election.weights.clone()));
        let (review_sink, review_events) = ChannelEventSink::new();

        let mut fanout = FanoutEventSink::new()
            .with(Arc::new(TracingEventSink))
            .with(ledger.clone())
            .with(Arc::new(review_sink));
        for sink in self.sinks {
            fanout.push(sink);
        }
        let events: Arc<dyn EventSink> = Arc::new(fanout);

        let gateway = Arc::new(CoordinationGateway::new(
            store,
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&events),
            config.lease.duration(),
        )
        .with_review_authority(config.roles.system.clone()));
        let bus = Arc::new(MessageBus::new(
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&events),
            BusSettings::from_config(&config.bus, &config.roles),
        ));
        for role in [&config.roles.coordinator, &config.roles.arbiter, &config.roles.system] {
            bus.open_mailbox(role).await;
        }
        let registry = Arc::new(CapabilityRegistry::new(
            Arc::clone(&clock),
            Arc::clone(&events),
            config.presence.staleness(),
            config.election.idle_threshold(),
        ));
        let reviews = Arc::new(ReviewCoordinator::new(
            Arc::clone(&gateway),
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&events),
            ReviewSettings::from_config(&config.review, &config.roles),
        ));
        let election = Arc::new(ElectionCoordinator::new(
            ledger.clone(),
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&clock),
            Arc::clone(&events),
            ElectionSettings::from_config(&config.election, &config.roles),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Swarm {
            config,
            clock,
            gateway,
            bus,
            registry,
            reviews,
            election,
            ledger,
            review_events: StdMutex::new(Some(review_events)),
            shutdown_tx,
            joins: StdMutex::new(Vec::new()),
        })
    }
}

impl Default for SwarmBuilder {
    fn default() -> Self {
        Self::new(HiveConfig::default())
    }
}
