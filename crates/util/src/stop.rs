//! Lifecycle controller owning a node's background work.
//!
//! A [`Stopper`] tracks every task spawned through it. Shutdown happens in two
//! phases: [`Stopper::quiesce`] refuses new tasks, cancels the shared
//! quiescence token and waits for tracked tasks to drain; [`Stopper::stop`]
//! then runs registered closers in registration order.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Errors returned by the stopper.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StopperError {
    /// The stopper is quiescing and refuses new work.
    #[error("stopper is quiescing; cannot run task {0}")]
    Unavailable(&'static str),
}

type CloserFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct StopperState {
    quiescing: bool,
    stopped: bool,
    closers: Vec<CloserFn>,
}

struct Inner {
    tracker: TaskTracker,
    quiesce: CancellationToken,
    stopped: CancellationToken,
    state: Mutex<StopperState>,
}

/// Owns and shuts down a set of asynchronous tasks.
#[derive(Clone)]
pub struct Stopper {
    inner: Arc<Inner>,
}

impl fmt::Debug for Stopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Stopper")
            .field("quiescing", &state.quiescing)
            .field("stopped", &state.stopped)
            .field("tasks", &self.inner.tracker.len())
            .finish()
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopper {
    /// Create a running stopper.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tracker: TaskTracker::new(),
                quiesce: CancellationToken::new(),
                stopped: CancellationToken::new(),
                state: Mutex::new(StopperState::default()),
            }),
        }
    }

    /// Spawn a short-lived task.
    ///
    /// # Errors
    ///
    /// Returns [`StopperError::Unavailable`] once quiescing has begun.
    pub fn run_async_task<F>(&self, name: &'static str, task: F) -> Result<(), StopperError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.inner.state.lock();
        if state.quiescing {
            return Err(StopperError::Unavailable(name));
        }
        trace!(task = name, "spawning task");
        self.inner.tracker.spawn(task);
        Ok(())
    }

    /// Spawn a long-lived worker. The worker receives the quiescence token and
    /// must return once it is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`StopperError::Unavailable`] once quiescing has begun.
    pub fn run_worker<F, Fut>(&self, name: &'static str, worker: F) -> Result<(), StopperError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.quiesce.clone();
        self.run_async_task(name, worker(token))
    }

    /// Token cancelled when quiescing begins.
    #[must_use]
    pub fn should_quiesce(&self) -> CancellationToken {
        self.inner.quiesce.clone()
    }

    /// Whether quiescing has begun.
    #[must_use]
    pub fn is_quiescing(&self) -> bool {
        self.inner.state.lock().quiescing
    }

    /// Whether [`Stopper::stop`] has completed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    /// Register a closer run by [`Stopper::stop`] after all tasks drained.
    /// Closers added after stop completed run immediately.
    pub fn add_closer<F>(&self, closer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.stopped {
            drop(state);
            closer();
            return;
        }
        state.closers.push(Box::new(closer));
    }

    /// Refuse new tasks, cancel the quiescence token and wait for tracked
    /// tasks to finish.
    pub async fn quiesce(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.quiescing {
                debug!(tasks = self.inner.tracker.len(), "quiescing");
                state.quiescing = true;
            }
        }
        self.inner.quiesce.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Quiesce, then run closers. Concurrent callers all return once the
    /// first caller has finished.
    pub async fn stop(&self) {
        self.quiesce().await;
        let closers = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                None
            } else {
                state.stopped = true;
                Some(std::mem::take(&mut state.closers))
            }
        };
        match closers {
            Some(closers) => {
                for closer in closers {
                    closer();
                }
                self.inner.stopped.cancel();
                debug!("stopped");
            }
            None => self.inner.stopped.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn quiesce_waits_for_workers() {
        let stopper = Stopper::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        stopper
            .run_worker("worker", |token| async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        stopper.quiesce().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tasks_are_refused_after_quiesce() {
        let stopper = Stopper::new();
        stopper.quiesce().await;
        let err = stopper.run_async_task("late", async {}).unwrap_err();
        assert_eq!(err, StopperError::Unavailable("late"));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn closers_run_once_in_order() {
        let stopper = Stopper::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            stopper.add_closer(move || order.lock().push(i));
        }
        stopper.stop().await;
        stopper.stop().await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(stopper.is_stopped());
    }

    #[tokio::test]
    async fn closer_added_after_stop_runs_immediately() {
        let stopper = Stopper::new();
        stopper.stop().await;
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        stopper.add_closer(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
