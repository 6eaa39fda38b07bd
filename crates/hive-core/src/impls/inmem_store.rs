//! InMemoryTaskStore - テスト・単一プロセス用の正本
//!
//! # 学習ポイント
//! - マップ全体の RwLock はエントリの追加・削除のときだけ write で取る
//! - CAS はレコード単位の Mutex だけで完結（ボード全体をロックしない）
//! - 削除済みレコードは `None` にしてから外すので、古い Arc を掴んだ CAS は NotFound になる

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::domain::{Task, TaskId};
use crate::ports::{StoreError, TaskStore};

type Slot = Arc<Mutex<Option<Task>>>;

#[derive(Default)]
pub struct InMemoryTaskStore {
    records: RwLock<BTreeMap<TaskId, Slot>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: TaskId) -> Option<Slot> {
        self.records.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let Some(slot) = self.slot(id).await else {
            return Ok(None);
        };
        let guard = slot.lock().await;
        Ok(guard.clone())
    }

    async fn insert(&self, tasks: Vec<Task>) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if let Some(dup) = tasks.iter().find(|t| records.contains_key(&t.id)) {
            return Err(StoreError::AlreadyExists(dup.id));
        }
        for task in tasks {
            records.insert(task.id, Arc::new(Mutex::new(Some(task))));
        }
        Ok(())
    }

    async fn compare_and_swap(&self, task: Task, expected_version: u64) -> Result<(), StoreError> {
        let slot = self
            .slot(task.id)
            .await
            .ok_or(StoreError::NotFound(task.id))?;
        let mut guard = slot.lock().await;
        let current = guard.as_ref().ok_or(StoreError::NotFound(task.id))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                task_id: task.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        *guard = Some(task);
        Ok(())
    }

    async fn remove(&self, id: TaskId, expected_version: u64) -> Result<(), StoreError> {
        let slot = self.slot(id).await.ok_or(StoreError::NotFound(id))?;
        {
            let mut guard = slot.lock().await;
            let current = guard.as_ref().ok_or(StoreError::NotFound(id))?;
            if current.version != expected_version {
                return Err(StoreError::Conflict {
                    task_id: id,
                    expected: expected_version,
                    actual: current.version,
                });
            }
            *guard = None;
        }
        let mut records = self.records.write().await;
        if records.get(&id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            records.remove(&id);
        }
        Ok(())
    }

    async fn scan(&self, after: Option<TaskId>, limit: usize) -> Result<Vec<Task>, StoreError> {
        let slots: Vec<Slot> = {
            let records = self.records.read().await;
            let lower = match after {
                Some(id) => Bound::Excluded(id),
                None => Bound::Unbounded,
            };
            records
                .range((lower, Bound::Unbounded))
                .map(|(_, slot)| Arc::clone(slot))
                .take(limit)
                .collect()
        };
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(task) = slot.lock().await.clone() {
                out.push(task);
            }
        }
        Ok(out)
    }
}
