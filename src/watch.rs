//! Watch mode.
//!
//! Every watch group pairs a set of globs with the task that rebuilds them.
//! The [`Dispatcher`] runs one worker thread per group, so a slow image
//! rebuild never delays a stylesheet. Events arriving while a group is busy
//! are queued, and the worker drains the whole queue before it runs again,
//! which turns a burst of saves into a single rebuild.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::new_debouncer;

use crate::engine::Executor;
use crate::error::BuildError;
use crate::utils::{as_overhead, collapse_watch_paths, glob_base};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// A change to a file matched by one of the groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub group: usize,
    pub path: Utf8PathBuf,
    pub at: Instant,
}

/// Globs bound to the task rebuilding them.
#[derive(Clone)]
pub struct WatchGroup {
    pub task: String,
    pub globs: Vec<String>,
    /// Called after every successful run.
    pub on_success: Option<Callback>,
}

impl WatchGroup {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            globs: Vec::new(),
            on_success: None,
        }
    }

    pub fn glob(mut self, glob: impl Into<String>) -> Self {
        self.globs.push(glob.into());
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for WatchGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGroup")
            .field("task", &self.task)
            .field("globs", &self.globs)
            .finish()
    }
}

struct Worker {
    patterns: Vec<Pattern>,
    sender: Sender<ChangeEvent>,
    thread: JoinHandle<()>,
}

/// Routes change events to per-group workers.
pub struct Dispatcher {
    root: Utf8PathBuf,
    globs: Vec<String>,
    workers: Vec<Worker>,
}

impl Dispatcher {
    /// Spawns a worker per group. Globs are relative to `root`.
    pub fn new(
        executor: Executor,
        root: impl Into<Utf8PathBuf>,
        groups: Vec<WatchGroup>,
    ) -> Result<Self, BuildError> {
        let root = root.into();
        let mut globs = Vec::new();
        let mut workers = Vec::with_capacity(groups.len());

        for group in groups {
            let patterns = group
                .globs
                .iter()
                .map(|glob| Pattern::new(glob))
                .collect::<Result<Vec<_>, _>>()?;

            // unknown tasks are a wiring bug, better caught before any event
            executor.registry().resolve(&group.task)?;

            globs.extend(group.globs.iter().cloned());

            let (sender, receiver) = mpsc::channel();
            let executor = executor.clone();
            let thread = thread::Builder::new()
                .name(format!("watch {}", group.task))
                .spawn(move || work(executor, group, receiver))
                .map_err(|e| BuildError::Other(e.into()))?;

            workers.push(Worker {
                patterns,
                sender,
                thread,
            });
        }

        Ok(Self {
            root,
            globs,
            workers,
        })
    }

    /// Ids of the groups whose globs match `path`. Absolute paths are made
    /// relative to the root first.
    pub fn route(&self, path: &Utf8Path) -> Vec<usize> {
        let path = path.strip_prefix(&self.root).unwrap_or(path);

        self.workers
            .iter()
            .enumerate()
            .filter(|(_, worker)| {
                worker
                    .patterns
                    .iter()
                    .any(|p| p.matches_path(path.as_std_path()))
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Queues the event for its group. Events for unknown groups are dropped.
    pub fn dispatch(&self, event: ChangeEvent) {
        match self.workers.get(event.group) {
            Some(worker) => {
                if worker.sender.send(event).is_err() {
                    tracing::error!("watch worker has stopped");
                }
            }
            None => tracing::warn!("no watch group {}", event.group),
        }
    }

    /// Routes and dispatches a change of `path`. Returns whether any group
    /// was interested.
    pub fn changed(&self, path: &Utf8Path) -> bool {
        let groups = self.route(path);

        for &group in &groups {
            self.dispatch(ChangeEvent {
                group,
                path: path.to_path_buf(),
                at: Instant::now(),
            });
        }

        !groups.is_empty()
    }

    /// The minimal set of directories covering every glob.
    pub fn roots(&self) -> Vec<Utf8PathBuf> {
        let roots: HashSet<_> = self
            .globs
            .iter()
            .map(|glob| self.root.join(glob_base(glob)))
            .collect();

        collapse_watch_paths(roots)
    }

    /// Lets every worker finish its queue, then stops it.
    pub fn shutdown(self) {
        for worker in self.workers {
            drop(worker.sender);
            if worker.thread.join().is_err() {
                tracing::error!("watch worker panicked");
            }
        }
    }
}

fn work(executor: Executor, group: WatchGroup, receiver: Receiver<ChangeEvent>) {
    while let Ok(event) = receiver.recv() {
        let coalesced = 1 + receiver.try_iter().count();
        let s = Instant::now();

        tracing::info!(
            "{} changed ({coalesced} event(s), {}ms ago), running {}",
            event.path,
            event.at.elapsed().as_millis(),
            group.task
        );

        match executor.run(&group.task) {
            Ok(()) => {
                tracing::info!("{} done {}", group.task, as_overhead(s));
                if let Some(callback) = &group.on_success {
                    callback();
                }
            }
            Err(e) => tracing::error!("{} failed: {e}", group.task),
        }
    }
}

/// Feeds filesystem changes under the dispatcher roots into the dispatcher
/// until the watcher goes away.
pub fn watch(dispatcher: &Dispatcher, debounce: Duration) -> Result<(), BuildError> {
    let (tx, rx) = mpsc::channel();
    let mut debouncer = new_debouncer(debounce, None, tx)?;

    for root in dispatcher.roots() {
        if !root.is_dir() {
            tracing::warn!("not watching {root}, no such directory");
            continue;
        }
        tracing::info!("watching {root}");
        debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
    }

    for result in rx {
        let events = match result {
            Ok(events) => events,
            Err(errors) => {
                for e in errors {
                    tracing::error!("watch error: {e}");
                }
                continue;
            }
        };

        let mut seen = HashSet::new();
        for event in events {
            if matches!(event.kind, EventKind::Access(_)) {
                continue;
            }

            for path in &event.paths {
                let Some(path) = Utf8Path::from_path(path) else {
                    continue;
                };
                if seen.insert(path.to_path_buf()) {
                    dispatcher.changed(path);
                }
            }
        }
    }

    Ok(())
}
