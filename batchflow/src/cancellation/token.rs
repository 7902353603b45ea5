//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// A callback invoked with the cancellation reason.
pub type CancelCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent: only the first reason is kept. Tasks can poll
/// [`is_cancelled`](Self::is_cancelled) or await [`cancelled`](Self::cancelled).
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<CancelCallback>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new shared token.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a token that is cancelled whenever `self` is.
    #[must_use]
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        let child = Self::new();
        let weak = Arc::downgrade(&child);
        self.on_cancel(move |reason| {
            if let Some(child) = weak.upgrade() {
                child.cancel(reason);
            }
        });
        child
    }

    /// Requests cancellation.
    ///
    /// Callbacks run immediately; a panicking callback is logged and skipped.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        // Flag, reason and callback list change under the callbacks lock.
        let callbacks = {
            let mut callbacks = self.callbacks.write();
            if self
                .cancelled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            *self.reason.write() = Some(reason.clone());
            std::mem::take(&mut *callbacks)
        };
        self.notify.notify_waiters();

        for callback in &callbacks {
            invoke(callback.as_ref(), &reason);
        }
    }

    /// Registers a callback. Runs it at once if already cancelled.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.write();
        if self.is_cancelled() {
            drop(callbacks);
            let reason = self.reason().unwrap_or_default();
            invoke(&callback, &reason);
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn invoke(callback: &(dyn Fn(&str) + Send + Sync), reason: &str) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(reason))) {
        warn!("Cancellation callback panicked: {:?}", e);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        token.cancel("deadline");
        token.cancel("shutdown");

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("deadline"));
    }

    #[test]
    fn test_callbacks_run_once() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel("a");
        token.cancel("b");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let c = counter.clone();
        token.on_cancel(move |reason| {
            assert_eq!(reason, "a");
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_callback_is_suppressed() {
        let token = CancellationToken::new();
        token.on_cancel(|_| panic!("boom"));
        token.cancel("test");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel("child only");
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel("batch aborted");
        assert!(other.is_cancelled());
        assert_eq!(other.reason().as_deref(), Some("batch aborted"));
    }

    #[test]
    fn test_child_created_while_parent_cancels_is_cancelled() {
        for _ in 0..500 {
            let parent = CancellationToken::new();
            let canceller = {
                let parent = parent.clone();
                std::thread::spawn(move || parent.cancel("shutdown"))
            };
            let child = parent.child();
            canceller.join().unwrap();

            assert!(child.is_cancelled());
            assert_eq!(child.reason().as_deref(), Some("shutdown"));
        }
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel("stop");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
