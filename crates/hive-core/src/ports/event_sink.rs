//! EventSink port - イベント記録の抽象化
//!
//! # 実装（impls/event_sinks.rs）
//! - NoopEventSink: 何もしない
//! - ChannelEventSink: tokio mpsc に流す（ReviewLoop が購読）
//! - FanoutEventSink: 複数の sink に配る
//! - ScoreLedger もこの trait を実装し、スコアを直接加算する

use crate::domain::DomainEvent;

/// EventSink はドメインイベントを受け取る
///
/// `emit` は同期・非ブロッキング。CAS 書き込みの直後に呼ばれるので、
/// 重い処理は channel の先でやる。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn emit(&self, event: DomainEvent) {
        (**self).emit(event)
    }
}
