//! SledTaskStore - sled による永続ストア
//!
//! # 実装詳細
//! - tree `tasks`: key = TaskId の 16 byte（ULID の順序 = key の順序）、value = JSON
//! - 楽観ロックは sled ネイティブの `compare_and_swap`（バイト列単位）
//! - デコードできないレコードは tree `quarantine` に移してスキップする
//! - sled は同期 API なので `spawn_blocking` で包む

use std::ops::Bound;
use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Tree};

use crate::domain::{Task, TaskId};
use crate::ports::{StoreError, TaskStore};

const TASKS_TREE: &str = "tasks";
const QUARANTINE_TREE: &str = "quarantine";

#[derive(Clone)]
pub struct SledTaskStore {
    tasks: Tree,
    quarantine: Tree,
}

impl SledTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(backend)?;
        Self::from_db(&db)
    }

    /// Store backed by a temporary directory that is removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(backend)?;
        Self::from_db(&db)
    }

    fn from_db(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            tasks: db.open_tree(TASKS_TREE).map_err(backend)?,
            quarantine: db.open_tree(QUARANTINE_TREE).map_err(backend)?,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(SledTaskStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }

    /// Decode a stored value, quarantining it when it cannot be read.
    fn decode(&self, id: TaskId, raw: &IVec) -> Result<Task, StoreError> {
        match serde_json::from_slice::<Task>(raw) {
            Ok(task) => Ok(task),
            Err(e) => {
                let detail = e.to_string();
                tracing::error!(task_id = %id, error = %detail, "corrupt task record, moving to quarantine");
                let key = id.to_bytes();
                self.quarantine.insert(key, raw.clone()).map_err(backend)?;
                // Only drop the bytes we judged corrupt; a concurrent rewrite stays.
                let _ = self
                    .tasks
                    .compare_and_swap(key, Some(raw), None::<&[u8]>)
                    .map_err(backend)?;
                Err(StoreError::Corrupt {
                    task_id: id,
                    detail,
                })
            }
        }
    }

    fn current_version(&self, id: TaskId, raw: Option<IVec>) -> Result<Option<u64>, StoreError> {
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(self.decode(id, &raw)?.version)),
        }
    }
}

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode(task: &Task) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(task).map_err(|e| StoreError::Backend(format!("encode {}: {e}", task.id)))
}

fn id_from_key(key: &[u8]) -> Option<TaskId> {
    let bytes: [u8; 16] = key.try_into().ok()?;
    Some(TaskId::from_bytes(bytes))
}

#[async_trait]
impl TaskStore for SledTaskStore {
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.blocking(move |s| match s.tasks.get(id.to_bytes()).map_err(backend)? {
            None => Ok(None),
            Some(raw) => s.decode(id, &raw).map(Some),
        })
        .await
    }

    async fn insert(&self, tasks: Vec<Task>) -> Result<(), StoreError> {
        let encoded = tasks
            .iter()
            .map(|t| Ok((t.id, t.id.to_bytes().to_vec(), encode(t)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.blocking(move |s| {
            let result = s.tasks.transaction(|tx| {
                for (id, key, _) in &encoded {
                    if tx.get(key.clone())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(*id));
                    }
                }
                for (_, key, value) in &encoded {
                    tx.insert(key.clone(), value.clone())?;
                }
                Ok(())
            });
            match result {
                Ok(()) => Ok(()),
                Err(TransactionError::Abort(id)) => Err(StoreError::AlreadyExists(id)),
                Err(TransactionError::Storage(e)) => Err(backend(e)),
            }
        })
        .await
    }

    async fn compare_and_swap(&self, task: Task, expected_version: u64) -> Result<(), StoreError> {
        let id = task.id;
        let new_bytes = encode(&task)?;
        self.blocking(move |s| {
            let key = id.to_bytes();
            let current = s
                .tasks
                .get(key)
                .map_err(backend)?
                .ok_or(StoreError::NotFound(id))?;
            let actual = s.decode(id, &current)?.version;
            if actual != expected_version {
                return Err(StoreError::Conflict {
                    task_id: id,
                    expected: expected_version,
                    actual,
                });
            }
            match s
                .tasks
                .compare_and_swap(key, Some(&current), Some(new_bytes))
                .map_err(backend)?
            {
                Ok(()) => Ok(()),
                // Someone else wrote between our read and the swap.
                Err(cas) => match s.current_version(id, cas.current)? {
                    None => Err(StoreError::NotFound(id)),
                    Some(actual) => Err(StoreError::Conflict {
                        task_id: id,
                        expected: expected_version,
                        actual,
                    }),
                },
            }
        })
        .await
    }

    async fn remove(&self, id: TaskId, expected_version: u64) -> Result<(), StoreError> {
        self.blocking(move |s| {
            let key = id.to_bytes();
            let current = s
                .tasks
                .get(key)
                .map_err(backend)?
                .ok_or(StoreError::NotFound(id))?;
            let actual = s.decode(id, &current)?.version;
            if actual != expected_version {
                return Err(StoreError::Conflict {
                    task_id: id,
                    expected: expected_version,
                    actual,
                });
            }
            match s
                .tasks
                .compare_and_swap(key, Some(&current), None::<&[u8]>)
                .map_err(backend)?
            {
                Ok(()) => Ok(()),
                Err(cas) => match s.current_version(id, cas.current)? {
                    None => Err(StoreError::NotFound(id)),
                    Some(actual) => Err(StoreError::Conflict {
                        task_id: id,
                        expected: expected_version,
                        actual,
                    }),
                },
            }
        })
        .await
    }

    async fn scan(&self, after: Option<TaskId>, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.blocking(move |s| {
            let lower = match after {
                Some(id) => Bound::Excluded(id.to_bytes().to_vec()),
                None => Bound::Unbounded,
            };
            let mut out = Vec::new();
            for entry in s.tasks.range::<Vec<u8>, _>((lower, Bound::Unbounded)) {
                if out.len() >= limit {
                    break;
                }
                let (key, raw) = entry.map_err(backend)?;
                let Some(id) = id_from_key(&key) else {
                    tracing::warn!(key_len = key.len(), "skipping task entry with malformed key");
                    continue;
                };
                match s.decode(id, &raw) {
                    Ok(task) => out.push(task),
                    Err(StoreError::Corrupt { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(out)
        })
        .await
    }

    async fn quarantined(&self) -> Result<Vec<TaskId>, StoreError> {
        self.blocking(|s| {
            let mut ids = Vec::new();
            for key in s.quarantine.iter().keys() {
                if let Some(id) = id_from_key(&key.map_err(backend)?) {
                    ids.push(id);
                }
            }
            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use chrono::Utc;
    use ulid::Ulid;

    fn task(desc: &str) -> Task {
        NewTask::new(desc).into_task(TaskId::from_ulid(Ulid::new()), None, Utc::now())
    }

    #[tokio::test]
    async fn cas_uses_the_stored_version() {
        let store = SledTaskStore::temporary().unwrap();
        let t = task("persisted");
        store.insert(vec![t.clone()]).await.unwrap();

        let mut next = t.clone();
        next.version = 2;
        next.description = "updated".into();
        store.compare_and_swap(next.clone(), 1).await.unwrap();

        assert!(matches!(
            store.compare_and_swap(next, 1).await,
            Err(StoreError::Conflict { actual: 2, .. })
        ));
        let stored = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.description, "updated");
    }

    #[tokio::test]
    async fn duplicate_in_batch_writes_nothing() {
        let store = SledTaskStore::temporary().unwrap();
        let a = task("a");
        let b = task("b");
        store.insert(vec![a.clone()]).await.unwrap();
        assert_eq!(
            store.insert(vec![b.clone(), a.clone()]).await,
            Err(StoreError::AlreadyExists(a.id))
        );
        assert_eq!(store.get(b.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_records_are_quarantined_without_halting_scan() {
        let store = SledTaskStore::temporary().unwrap();
        let good = task("good");
        store.insert(vec![good.clone()]).await.unwrap();

        let bad_id = TaskId::from_ulid(Ulid::new());
        store
            .tasks
            .insert(bad_id.to_bytes(), &b"{not json"[..])
            .unwrap();

        let listed = store.scan(None, 10).await.unwrap();
        assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![good.id]);
        assert_eq!(store.quarantined().await.unwrap(), vec![bad_id]);
        assert_eq!(store.get(bad_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_reports_corruption_once() {
        let store = SledTaskStore::temporary().unwrap();
        let bad_id = TaskId::from_ulid(Ulid::new());
        store.tasks.insert(bad_id.to_bytes(), &b"\x00"[..]).unwrap();

        assert!(matches!(
            store.get(bad_id).await,
            Err(StoreError::Corrupt { .. })
        ));
        assert_eq!(store.get(bad_id).await.unwrap(), None);
    }
}
