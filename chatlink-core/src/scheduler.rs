//! Process-wide dispatcher for continuations and reconnect timers.
//!
//! Connections never call `tokio::spawn` directly; they go through an
//! injected [`Scheduler`] so tests can hold timers and fire them by hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::session::BoxFuture;

/// Runs async continuations and delayed tasks.
pub trait Scheduler: Send + Sync {
    /// Run `task` in the background.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Run `task` once `delay` has elapsed. Timers cannot be cancelled
    /// individually; the task must re-check whatever it depends on.
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>);
}

/// [`Scheduler`] backed by a tokio runtime.
///
/// Create one at startup and share it between all connections. `shutdown`
/// drops every timer that has not fired yet; dropping the scheduler does the
/// same.
pub struct TokioScheduler {
    handle: Handle,
    shutdown: watch::Sender<bool>,
    pending: Arc<AtomicUsize>,
}

impl TokioScheduler {
    pub fn start(handle: Handle) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            handle,
            shutdown,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::start(Handle::current())
    }

    /// Cancel all pending timers and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        tracing::debug!(pending = self.pending_timers(), "Scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Timers scheduled but not yet fired or cancelled.
    pub fn pending_timers(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl Scheduler for TokioScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }

    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        let mut stop = self.shutdown.subscribe();
        if *stop.borrow() {
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Scheduler is shut down, dropping timer");
            return;
        }
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::AcqRel);
        self.handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    pending.fetch_sub(1, Ordering::AcqRel);
                    task();
                }
                _ = stop.wait_for(|stopped| *stopped) => {
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
        });
    }
}
