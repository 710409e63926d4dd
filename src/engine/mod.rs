//! Task registry, graph combinators and the executor.
//!
//! Tasks are registered once under a unique name and are addressed by the
//! [`TaskId`] returned from [`Registry::register`]. Graphs are built from
//! these ids, the names only exist for the command line surface, which looks
//! them up through the same registry.

mod executor;
mod graph;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use crate::engine::executor::{Executor, WeakExecutor};
pub use crate::engine::graph::{Graph, Join};
use crate::error::BuildError;

/// Result of a single executed task.
pub type TaskResult = Result<(), BuildError>;

type ActionPtr = Arc<dyn Fn(&TaskContext) -> TaskResult + Send + Sync>;

/// A typed handle to a registered task.
///
/// A `TaskId` can only be obtained from the registry which owns the task, so
/// a graph built from ids never refers to a missing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

pub(crate) struct Task {
    pub name: Arc<str>,
    action: ActionPtr,
}

impl Task {
    pub(crate) fn run(&self, context: &TaskContext) -> TaskResult {
        (self.action)(context)
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.name)
    }
}

/// Shared cancellation flag. A token is cancelled when it, or any of its
/// ancestors, has been cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
    }
}

/// Passed to every running action.
pub struct TaskContext {
    pub name: Arc<str>,
    token: CancelToken,
}

impl TaskContext {
    pub(crate) fn new(name: Arc<str>, token: CancelToken) -> Self {
        Self { name, token }
    }

    /// Long running actions may poll this and bail out with
    /// [`BuildError::Cancelled`] when inside a fail-fast group.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The table of named build actions, plus composite names bound to graphs.
#[derive(Debug, Default)]
pub struct Registry {
    tasks: Vec<Task>,
    names: HashMap<Arc<str>, TaskId>,
    composites: HashMap<Arc<str>, Graph>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `action` under `name`.
    pub fn register<F>(&mut self, name: &str, action: F) -> Result<TaskId, BuildError>
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        self.ensure_free(name)?;

        let id = TaskId(self.tasks.len());
        let name: Arc<str> = Arc::from(name);

        self.tasks.push(Task {
            name: name.clone(),
            action: Arc::new(action),
        });
        self.names.insert(name, id);

        Ok(id)
    }

    /// Binds a composite name, such as `build`, to a graph.
    pub fn define(&mut self, name: &str, graph: Graph) -> Result<(), BuildError> {
        self.ensure_free(name)?;

        for id in graph.leaves() {
            if id.0 >= self.tasks.len() {
                return Err(BuildError::UnknownTask(format!("#{}", id.0)));
            }
        }

        self.composites.insert(Arc::from(name), graph);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<TaskId, BuildError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| BuildError::UnknownTask(name.to_string()))
    }

    /// Resolves a task or composite name to the graph it stands for.
    pub fn resolve(&self, name: &str) -> Result<Graph, BuildError> {
        if let Some(graph) = self.composites.get(name) {
            return Ok(graph.clone());
        }

        self.lookup(name).map(Graph::Leaf)
    }

    pub fn name(&self, id: TaskId) -> &str {
        &self.tasks[id.0].name
    }

    /// All names, tasks first, in a stable order.
    pub fn names(&self) -> Vec<&str> {
        let mut composites: Vec<&str> = self.composites.keys().map(|n| &**n).collect();
        composites.sort_unstable();

        self.tasks
            .iter()
            .map(|t| &*t.name)
            .chain(composites)
            .collect()
    }

    pub(crate) fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    fn ensure_free(&self, name: &str) -> Result<(), BuildError> {
        if self.names.contains_key(name) || self.composites.contains_key(name) {
            return Err(BuildError::DuplicateTask(name.to_string()));
        }
        Ok(())
    }
}
