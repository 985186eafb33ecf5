//! Deferred, cancellable, single-shot execution of handshake/connect
//! actions.
//!
//! At most one pending action exists per session at a time: scheduling a
//! new one cancels whatever was previously pending, the same discipline
//! the teacher's reconnect loop uses for its single cancellation-token
//! slot.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct Pending {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns at most one outstanding deferred action.
#[derive(Default)]
pub struct Scheduler {
    pending: Mutex<Option<Pending>>,
    /// Whether this scheduler was constructed by the session (and must be
    /// shut down on terminate) as opposed to injected by the caller.
    owned: bool,
}

impl Scheduler {
    pub fn owned() -> Self {
        Self {
            pending: Mutex::new(None),
            owned: true,
        }
    }

    pub fn injected() -> Self {
        Self {
            pending: Mutex::new(None),
            owned: false,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Cancels any pending action without scheduling a new one.
    pub fn cancel_pending(&self) {
        if let Some(pending) = self.pending.lock().unwrap().take() {
            pending.cancel.cancel();
            pending.handle.abort();
        }
    }

    /// Schedules `action` to run after `delay`, cancelling whatever was
    /// previously pending.
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel_pending();

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    trace!("scheduled action cancelled before it fired");
                }
                _ = tokio::time::sleep(delay) => {
                    action();
                }
            }
        });

        *self.pending.lock().unwrap() = Some(Pending { cancel, handle });
    }

    /// Shuts the scheduler down, cancelling any pending action. A no-op
    /// (beyond cancellation) for injected schedulers, which the caller
    /// still owns.
    pub fn shutdown(&self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn schedule_fires_after_delay() {
        let scheduler = Scheduler::owned();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        scheduler.schedule(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scheduling_again_cancels_the_previous_action() {
        let scheduler = Scheduler::owned();
        let fired = Arc::new(AtomicU32::new(0));

        let f1 = fired.clone();
        scheduler.schedule(Duration::from_millis(50), move || {
            f1.fetch_add(1, Ordering::SeqCst);
        });

        let f2 = fired.clone();
        scheduler.schedule(Duration::from_millis(10), move || {
            f2.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn shutdown_prevents_a_pending_action_from_firing() {
        let scheduler = Scheduler::owned();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        scheduler.schedule(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
