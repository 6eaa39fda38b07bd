//! App - アプリケーション層
//!
//! board / bus / registry / review / election を組み合わせて swarm を動かす。
//!
//! # 主要コンポーネント
//! - **SwarmBuilder**: 設定からの構築とワイヤリング
//! - **Swarm**: 組み立て済みコンポーネントとループの管理
//! - **WorkerLoop**: worker 1 体のループ（heartbeat→mailbox→claim→work→transition）
//! - **ReviewLoop**: PendingReview の検知と verdict の受信
//! - **ReaperLoop**: Lease 期限切れ・未 ack メッセージ・review 期限の回収
//! - **ElectionLoop**: サイクルごとの idle 判定と定期選挙
//! - **GcLoop**: 終端タスクのアーカイブ

pub mod builder;
pub mod election_loop;
pub mod gc_loop;
pub mod reaper_loop;
pub mod review_loop;
pub mod status;
pub mod swarm;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, SwarmBuilder};
pub use self::election_loop::ElectionLoop;
pub use self::gc_loop::GcLoop;
pub use self::reaper_loop::{ReaperLoop, ReaperReport};
pub use self::review_loop::ReviewLoop;
pub use self::status::{SwarmStatus, TaskCounts, WorkerSummary};
pub use self::swarm::{Swarm, SwarmError};
pub use self::worker_loop::{CycleReport, WorkOutcome, WorkerAgent, WorkerLoop};
