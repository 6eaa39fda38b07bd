//! Dependency graph for validating and following task dependencies.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! The graph is built on demand from a board scan or an incoming batch; it is
//! never the source of truth.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{Task, TaskId};

pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, BTreeSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: HashMap<TaskId, BTreeSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path.
    Gray,
    /// Fully explored; no cycle through it.
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            reverse_edges: HashMap::new(),
        }
    }

    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut graph = Self::new();
        for task in tasks {
            for dep in &task.dependency_ids {
                graph.add_dependency(task.id, *dep);
            }
        }
        graph
    }

    /// Add a dependency: `task` depends on `depends_on`.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Tasks waiting for `task`, in id order.
    ///
    /// Includes waiters that still have other unfinished dependencies; the caller
    /// decides whether they are unblocked.
    pub fn get_waiting_tasks(&self, task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    pub fn get_dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// First cycle found, as the path `a -> b -> ... -> a`, or None for a DAG.
    ///
    /// Three-color DFS: reaching a Gray node closes a cycle; Black nodes are
    /// skipped, so diamonds and convergent paths are not reported.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color: HashMap<TaskId, Color> = HashMap::new();
        let mut path: Vec<TaskId> = Vec::new();

        let mut roots: Vec<TaskId> = self.edges.keys().copied().collect();
        roots.sort();
        for root in roots {
            if color.contains_key(&root) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(root, &mut color, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: TaskId,
        color: &mut HashMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        color.insert(node, Color::Gray);
        path.push(node);

        if let Some(deps) = self.edges.get(&node) {
            for &dep in deps {
                match color.get(&dep) {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        if let Some(cycle) = self.dfs_cycle(dep, color, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        color.insert(node, Color::Black);
        path.pop();
        None
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
