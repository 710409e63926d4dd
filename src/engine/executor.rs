use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::sync::mpsc::channel;
use std::thread;
use std::time::Instant;

use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{CancelToken, Graph, Join, Registry, TaskContext, TaskId, TaskResult};
use crate::error::BuildError;
use crate::utils::{as_overhead, get_style_task};

/// Runs graphs of tasks taken from the registry it owns.
///
/// Cloning an executor is cheap, the registry is shared between clones, which
/// lets every watch group run the same tasks from its own thread.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<Registry>,
    style: Option<ProgressStyle>,
}

/// An [`Executor`] that doesn't own its registry.
#[derive(Clone)]
pub struct WeakExecutor {
    registry: Weak<Registry>,
    style: Option<ProgressStyle>,
}

impl WeakExecutor {
    /// `None` once every [`Executor`] of the registry is gone.
    pub fn upgrade(&self) -> Option<Executor> {
        Some(Executor {
            registry: self.registry.upgrade()?,
            style: self.style.clone(),
        })
    }
}

impl Executor {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            style: get_style_task().ok(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A handle for tasks that run other tasks of the same registry. The
    /// registry owns those tasks, so they must not keep it alive.
    pub fn downgrade(&self) -> WeakExecutor {
        WeakExecutor {
            registry: Arc::downgrade(&self.registry),
            style: self.style.clone(),
        }
    }

    /// Runs a task or a composite by name.
    pub fn run(&self, name: &str) -> TaskResult {
        let graph = self.registry.resolve(name)?;
        self.execute(&graph)
    }

    pub fn execute(&self, graph: &Graph) -> TaskResult {
        self.execute_node(graph, &CancelToken::new())
    }

    fn execute_node(&self, graph: &Graph, token: &CancelToken) -> TaskResult {
        match graph {
            Graph::Leaf(id) => self.execute_leaf(*id, token),
            Graph::Sequence(nodes) => {
                for node in nodes {
                    if token.is_cancelled() {
                        return Err(BuildError::Cancelled);
                    }
                    self.execute_node(node, token)?;
                }
                Ok(())
            }
            Graph::Parallel(nodes, join) => self.execute_parallel(nodes, *join, token),
        }
    }

    /// Every member gets its own thread. Results are collected in the order
    /// in which members finish, so the reported failure is the first one to
    /// arrive rather than the first one declared.
    fn execute_parallel(&self, nodes: &[Graph], join: Join, token: &CancelToken) -> TaskResult {
        if nodes.is_empty() {
            return Ok(());
        }

        let token = match join {
            Join::Settle => token.clone(),
            Join::FailFast => token.child(),
        };

        thread::scope(|s| {
            let (tx, rx) = channel::<(usize, TaskResult)>();

            for (i, node) in nodes.iter().enumerate() {
                let tx = tx.clone();
                let token = token.clone();

                s.spawn(move || {
                    let result = self.execute_node(node, &token);
                    // the receiver lives until every member has reported
                    let _ = tx.send((i, result));
                });
            }

            drop(tx);

            let mut failure = None;
            for (i, result) in rx {
                let Err(e) = result else { continue };

                if failure.is_none() {
                    if join == Join::FailFast {
                        token.cancel();
                    }
                    failure = Some(e);
                } else {
                    tracing::warn!("parallel member #{i} also failed: {e}");
                }
            }

            failure.map_or(Ok(()), Err)
        })
    }

    fn execute_leaf(&self, id: TaskId, token: &CancelToken) -> TaskResult {
        if token.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let task = self.registry.task(id);

        let span = tracing::span!(Level::INFO, "task", name = &*task.name);
        if let Some(style) = &self.style {
            span.pb_set_style(style);
        }
        span.pb_set_message(&format!("Running {}", task.name));
        let _enter = span.enter();

        let context = TaskContext::new(task.name.clone(), token.clone());
        let start = Instant::now();

        let result = match catch_unwind(AssertUnwindSafe(|| task.run(&context))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };

                Err(BuildError::Panic(task.name.to_string(), msg))
            }
        };

        match &result {
            Ok(()) => tracing::info!("finished '{}' {}", task.name, as_overhead(start)),
            Err(BuildError::Cancelled) => tracing::info!("cancelled '{}'", task.name),
            Err(e) => tracing::error!("'{}' failed: {e}", task.name),
        }

        result
    }
}
