//! Cancellation scope, completion barrier and ordered close
//!
//! Every background task a component starts is spawned through a
//! [`ShutdownController`], which gives all of them one cancellation token and
//! one [`TaskTracker`] to wait on. Components that need an explicit close
//! step register themselves; `shutdown()` closes them in registration order
//! and keeps going when one of them fails.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::error::Result;

/// A component with an explicit, fallible close step
#[async_trait]
pub trait Closeable: Send + Sync {
    /// Name used in shutdown logs
    fn name(&self) -> &str;

    async fn close(&self) -> Result<()>;
}

/// One-shot event
///
/// `open` may be called any number of times; `wait` returns immediately once
/// the latch is open.
#[derive(Debug, Default)]
pub struct Latch {
    opened: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the latch; returns `true` for the call that actually opened it
    pub fn open(&self) -> bool {
        let first = !self.opened.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
pub struct ShutdownController {
    token: CancellationToken,
    tracker: TaskTracker,
    components: Mutex<Vec<Arc<dyn Closeable>>>,
    started: AtomicBool,
    finished: Latch,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn a tracked background task
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "spawning background task");
        self.tracker.spawn(async move {
            task.await;
            debug!(task = name, "background task finished");
        })
    }

    /// Append a component to the close plan
    pub fn register(&self, component: Arc<dyn Closeable>) {
        self.components.lock().push(component);
    }

    /// Number of background tasks still running
    pub fn running_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel, close every registered component in order, then wait for all
    /// tracked tasks
    ///
    /// Close failures are logged and never stop later steps. A second call
    /// waits for the first one to finish.
    pub async fn shutdown(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            self.finished.wait().await;
            return;
        }

        self.token.cancel();

        let components = std::mem::take(&mut *self.components.lock());
        for component in components {
            match component.close().await {
                Ok(()) => debug!(component = component.name(), "closed"),
                Err(e) => error!(
                    component = component.name(),
                    error = %e,
                    category = e.category(),
                    "failed to close component"
                ),
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.finished.open();
        info!("shutdown complete");
    }
}

impl std::fmt::Debug for ShutdownController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownController")
            .field("shutting_down", &self.is_shutting_down())
            .field("components", &self.components.lock().len())
            .field("tasks", &self.tracker.len())
            .finish()
    }
}
