//! Side channel for recoverable per-file failures.
//!
//! Pipelines keep going after a file fails to transform. The failure is
//! logged, counted for the exit status of a one-shot build, and forwarded
//! to any registered listener (the reload channel uses this to show build
//! errors in the browser). Only the latest message is kept, a watch session
//! can run for days.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::BuildError;

type Listener = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Reporter {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: AtomicUsize,
    last: Mutex<Option<String>>,
    listeners: Mutex<Vec<Listener>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    pub fn report(&self, error: &BuildError) {
        let message = error.to_string();
        tracing::warn!("{message}");

        if let Ok(listeners) = self.inner.listeners.lock() {
            for listener in listeners.iter() {
                listener(&message);
            }
        }

        self.inner.count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.inner.last.lock() {
            *last = Some(message);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.count() > 0
    }

    /// Failures reported since the reporter was created.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// The most recent message.
    pub fn last(&self) -> Option<String> {
        self.inner.last.lock().ok().and_then(|last| last.clone())
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reporter({} reported)", self.count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_reaches_listeners() {
        let reporter = Reporter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let seen = seen.clone();
            reporter.subscribe(move |msg| seen.lock().unwrap().push(msg.to_string()));
        }

        reporter.report(&BuildError::UnknownTask("x".into()));

        assert!(reporter.has_errors());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(reporter.last().unwrap(), "Task 'x' is not registered");
    }

    #[test]
    fn test_only_the_latest_message_is_kept() {
        let reporter = Reporter::new();
        assert!(reporter.last().is_none());

        for name in ["a", "b", "c"] {
            reporter.report(&BuildError::UnknownTask(name.into()));
        }

        assert_eq!(reporter.count(), 3);
        assert_eq!(reporter.last().unwrap(), "Task 'c' is not registered");
    }
}
