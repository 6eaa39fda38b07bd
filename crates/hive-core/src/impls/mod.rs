//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: レコード単位ロックの正本（テスト・単一プロセス用）
//! - **SledTaskStore**: sled による永続ストア
//! - **EventSink 各種**: Noop / Tracing / Channel / Memory / Fanout

pub mod event_sinks;
pub mod inmem_store;
pub mod sled_store;

// 主要な型を再エクスポート
pub use self::event_sinks::{
    ChannelEventSink, FanoutEventSink, MemoryEventSink, NoopEventSink, TracingEventSink,
};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::sled_store::SledTaskStore;
