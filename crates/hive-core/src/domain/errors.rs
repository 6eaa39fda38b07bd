//! Errors - エラー型と分類
//!
//! Gateway 操作の失敗はすべて `CoordinationError`。`kind()` で運用上の分類を返す。
//! 期待される結果（claim の競合、重複送信など）はエラーではなく outcome enum で表す。

use super::ids::{TaskId, WorkerId};
use super::task::TaskStatus;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: ストアの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Rejected at admission; nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("task {task_id}: transition {from:?} -> {to:?} is not allowed")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        task_id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("task {task_id} is not owned by {worker}")]
    NotOwner {
        task_id: TaskId,
        worker: WorkerId,
        owner: Option<WorkerId>,
    },

    #[error("task {task_id} waits on {} unfinished dependencies", pending.len())]
    DependencyUnmet {
        task_id: TaskId,
        pending: Vec<TaskId>,
    },

    /// The record could not be decoded and was quarantined.
    #[error("task {task_id} is corrupt: {detail}")]
    StoreCorruption { task_id: TaskId, detail: String },

    #[error("store failure: {0}")]
    Storage(String),
}

impl CoordinationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinationError::VersionConflict { .. } | CoordinationError::DependencyUnmet { .. } => {
                ErrorKind::Transient
            }
            CoordinationError::NotFound(_)
            | CoordinationError::Validation(_)
            | CoordinationError::InvalidTransition { .. }
            | CoordinationError::NotOwner { .. } => ErrorKind::Permanent,
            CoordinationError::StoreCorruption { .. } | CoordinationError::Storage(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Re-reading the task and trying again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn conflicts_are_retryable_and_validation_is_not() {
        let task_id = TaskId::from_ulid(Ulid::new());
        let conflict = CoordinationError::VersionConflict {
            task_id,
            expected: 2,
            actual: 3,
        };
        assert!(conflict.is_retryable());
        assert!(!CoordinationError::Validation("cycle".into()).is_retryable());
        assert_eq!(
            CoordinationError::Storage("io".into()).kind(),
            ErrorKind::Infrastructure
        );
    }
}
