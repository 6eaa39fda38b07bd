//! Lazy, finite, restartable listing of board tasks.
//!
//! The cursor pages through `TaskStore::scan` in id order, so it sees every task
//! that existed when it started and was not removed before being reached. Tasks
//! created later may or may not appear (ids are time-ordered, so they usually do).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain::{CoordinationError, Task, TaskId};
use crate::ports::TaskStore;

pub type TaskFilter = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

const DEFAULT_PAGE: usize = 64;

pub struct TaskCursor {
    store: Arc<dyn TaskStore>,
    filter: TaskFilter,
    page_size: usize,
    /// Id of the last record fetched from the store (not necessarily yielded).
    fetched_up_to: Option<TaskId>,
    /// Id of the last record handed to the caller.
    position: Option<TaskId>,
    buffer: VecDeque<Task>,
    exhausted: bool,
}

impl TaskCursor {
    pub(crate) fn new(store: Arc<dyn TaskStore>, filter: TaskFilter) -> Self {
        Self {
            store,
            filter,
            page_size: DEFAULT_PAGE,
            fetched_up_to: None,
            position: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Next matching task, or None once the board has been walked.
    pub async fn next(&mut self) -> Result<Option<Task>, CoordinationError> {
        loop {
            if let Some(task) = self.buffer.pop_front() {
                self.position = Some(task.id);
                return Ok(Some(task));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self.store.scan(self.fetched_up_to, self.page_size).await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.fetched_up_to = Some(last.id);
            }
            let filter = &self.filter;
            self.buffer
                .extend(page.into_iter().filter(|task| filter(task)));
        }
    }

    /// Drain the rest of the sequence.
    pub async fn collect(mut self) -> Result<Vec<Task>, CoordinationError> {
        let mut out = Vec::new();
        while let Some(task) = self.next().await? {
            out.push(task);
        }
        Ok(out)
    }

    /// Resume token: pass it to `resume_after` on a fresh cursor to continue
    /// after the last task yielded.
    pub fn position(&self) -> Option<TaskId> {
        self.position
    }

    pub fn resume_after(mut self, position: Option<TaskId>) -> Self {
        self.reset(position);
        self
    }

    /// Start over from the beginning of the board.
    pub fn restart(&mut self) {
        self.reset(None);
    }

    fn reset(&mut self, position: Option<TaskId>) {
        self.fetched_up_to = position;
        self.position = position;
        self.buffer.clear();
        self.exhausted = false;
    }
}
