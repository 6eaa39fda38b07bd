//! hive-core
//!
//! Coordination core for a swarm of autonomous workers: a shared task board,
//! prioritized mailboxes, peer review and score-based leader election.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, message, worker, review, election, events, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, EventSink, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTaskStore, SledTaskStore, 各種 EventSink）
//! - **board**: CoordinationGateway（CAS による状態遷移、lease、依存関係）
//! - **bus**: MessageBus（mailbox, retry, escalation, reply tracking）
//! - **registry**: CapabilityRegistry（tag 検索、presence）
//! - **review**: ReviewCoordinator（reviewer 選定、verdict 集計）
//! - **election**: ScoreLedger と ElectionCoordinator
//! - **app**: SwarmBuilder / Swarm とバックグラウンドループ
//! - **config**: TOML 設定

pub mod app;
pub mod board;
pub mod bus;
pub mod config;
pub mod domain;
pub mod election;
pub mod impls;
pub mod ports;
pub mod registry;
pub mod review;
