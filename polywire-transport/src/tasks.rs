//! Background task registry for a single transport.
//!
//! Every long-running piece of a transport (connect/accept, the read loop,
//! per-send writes) is spawned through a [`TaskRegistry`]. Teardown flips the
//! shared shutdown flag, gives tasks a bounded window to finish and aborts
//! whatever is still running.
//!
//! # Blocking Lock Usage
//!
//! `parking_lot::Mutex` guards the JoinHandle list. The lock is never held
//! across `.await` points.

use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long teardown waits for a task before aborting it.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Cooperative cancellation signal handed to connection attempts.
#[derive(Debug, Clone)]
pub struct Cancellation {
    shutdown_rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// Resolve once shutdown is requested (or the registry is gone).
    pub async fn cancelled(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            if shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// True once shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Tracks spawned tasks and supports cooperative shutdown.
#[derive(Debug)]
pub struct TaskRegistry {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token observing this registry's shutdown flag.
    pub fn cancellation(&self) -> Cancellation {
        Cancellation {
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Spawn a task that is dropped as soon as shutdown is requested.
    pub fn spawn_cancellable<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancellation();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Request shutdown without waiting.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Number of tasks that have not finished yet.
    pub fn live_tasks(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Request shutdown, join each task for at most `timeout`, abort stragglers.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        let joins = handles.into_iter().map(|mut handle| async move {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                debug!("task did not stop in time, aborting");
                handle.abort();
            }
        });
        join_all(joins).await;
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}
