//! TaskStore port - タスクの正本（source of truth）
//!
//! ボード上の全タスクはここにだけ存在する。書き込みは CoordinationGateway だけが行う。
//!
//! # 実装
//! - `InMemoryTaskStore`: レコード単位のロック（テスト・単一プロセス用）
//! - `SledTaskStore`: sled のネイティブ compare_and_swap（永続化）

use async_trait::async_trait;

use crate::domain::{CoordinationError, Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {task_id}: expected version {expected}, found {actual}")]
    Conflict {
        task_id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    /// Undecodable record. Already moved to quarantine by the store.
    #[error("task {task_id} is corrupt: {detail}")]
    Corrupt { task_id: TaskId, detail: String },

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for CoordinationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoordinationError::NotFound(id),
            StoreError::Conflict {
                task_id,
                expected,
                actual,
            } => CoordinationError::VersionConflict {
                task_id,
                expected,
                actual,
            },
            StoreError::AlreadyExists(id) => {
                CoordinationError::Validation(format!("task {id} already exists"))
            }
            StoreError::Corrupt { task_id, detail } => {
                CoordinationError::StoreCorruption { task_id, detail }
            }
            StoreError::Backend(msg) => CoordinationError::Storage(msg),
        }
    }
}

/// TaskStore はバージョン付きタスクレコードの保存先
///
/// # 設計原則
/// - 並行制御はレコード単位の CAS だけ（ボード全体のロックはしない）
/// - 順序保証は 1 レコード内のみ
/// - 壊れたレコードはそのレコードだけ隔離し、ストア全体は止めない
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Write new records. All or nothing: if any id exists, nothing is written.
    async fn insert(&self, tasks: Vec<Task>) -> Result<(), StoreError>;

    /// Replace the stored record iff its version is still `expected_version`.
    async fn compare_and_swap(&self, task: Task, expected_version: u64) -> Result<(), StoreError>;

    /// Delete the record iff its version is still `expected_version`.
    async fn remove(&self, id: TaskId, expected_version: u64) -> Result<(), StoreError>;

    /// Up to `limit` records with id greater than `after`, in id order.
    ///
    /// Corrupt records are skipped (and quarantined), never returned as errors.
    async fn scan(&self, after: Option<TaskId>, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Ids of records moved to quarantine.
    async fn quarantined(&self) -> Result<Vec<TaskId>, StoreError> {
        Ok(Vec::new())
    }
}
