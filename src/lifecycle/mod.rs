//! Task supervision and coordinated shutdown
//!
//! The engine's long-running loops (packet read, stack read, tracker
//! sweep) and its per-connection forwarding sessions all run under one
//! [`TaskManager`]: a shared cancellation token plus task tracking.
//!
//! `add_task(count, body)` keeps up to `count` live instances of an
//! async task body, immediately starting a replacement whenever an
//! instance completes for any reason, until the shared token is
//! cancelled. `stop()` cancels the token and blocks until every
//! supervisor and every live instance has exited; that is the mechanism
//! by which shutdown is guaranteed to terminate every loop.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Supervisor for replicated task bodies and tracked one-off tasks
pub struct TaskManager {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TaskManager {
    /// Create a manager with a fresh cancellation root
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// The shared cancellation token (cloned)
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether `stop` has begun
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run up to `count` concurrent instances of `task`, restarting a
    /// replacement whenever one completes, until cancellation
    ///
    /// Each instance receives a clone of the shared cancellation token.
    /// Adding a task after `stop` is a no-op.
    pub fn add_task<F, Fut>(&self, count: usize, task: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if count == 0 || self.cancel.is_cancelled() {
            return;
        }

        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let slots = Arc::new(Semaphore::new(count));
            let instances = TaskTracker::new();
            loop {
                let permit = tokio::select! {
                    () = cancel.cancelled() => break,
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                if cancel.is_cancelled() {
                    break;
                }
                let body = task(cancel.clone());
                instances.spawn(async move {
                    body.await;
                    drop(permit);
                });
            }
            instances.close();
            instances.wait().await;
        });
    }

    /// Track a one-off task so `stop` waits for it
    ///
    /// Used for per-connection forwarding sessions; the future must
    /// observe the shared cancellation token to terminate on shutdown.
    pub fn spawn_tracked<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        self.tracker.spawn(future);
    }

    /// Cancel the shared token and wait until everything has exited
    ///
    /// Safe to call repeatedly; later calls return once the first
    /// teardown completes.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("task manager stopped");
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
