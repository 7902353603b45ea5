//! LIFO cleanup scope for per-item remote resources.

use crate::errors::StageError;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), StageError>> + Send>>;
type CleanupAction = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Outcome of running a [`CleanupScope`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Names of actions that completed.
    pub completed: Vec<String>,
    /// Names and error messages of actions that failed or timed out.
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    /// Returns true if every action completed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Collects release actions and runs them last-registered first.
///
/// Actions still pending when the scope is dropped are spawned onto the
/// current tokio runtime, so a cancelled owner never leaks remote resources.
pub struct CleanupScope {
    label: String,
    per_action_timeout: Duration,
    actions: Mutex<Vec<(String, CleanupAction)>>,
}

impl CleanupScope {
    /// Creates an empty scope.
    #[must_use]
    pub fn new(label: impl Into<String>, per_action_timeout: Duration) -> Self {
        Self {
            label: label.into(),
            per_action_timeout,
            actions: Mutex::new(Vec::new()),
        }
    }

    /// Registers a named release action.
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        let boxed: CleanupAction = Box::new(move || Box::pin(action()));
        self.actions.lock().push((name.into(), boxed));
    }

    /// Returns the number of actions not yet run.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.actions.lock().len()
    }

    /// Runs every pending action in LIFO order.
    ///
    /// Failures and timeouts are logged and collected; they never stop the
    /// remaining actions.
    pub async fn run_all(&self) -> CleanupReport {
        let actions = std::mem::take(&mut *self.actions.lock());
        run_actions(&self.label, self.per_action_timeout, actions).await
    }
}

async fn run_actions(
    label: &str,
    per_action_timeout: Duration,
    actions: Vec<(String, CleanupAction)>,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    for (name, action) in actions.into_iter().rev() {
        match timeout(per_action_timeout, action()).await {
            Ok(Ok(())) => {
                debug!(scope = %label, action = %name, "cleanup action completed");
                report.completed.push(name);
            }
            Ok(Err(e)) => {
                warn!(scope = %label, action = %name, error = %e, "cleanup action failed");
                report.failed.push((name, e.to_string()));
            }
            Err(_) => {
                warn!(
                    scope = %label,
                    action = %name,
                    timeout_ms = per_action_timeout.as_millis() as u64,
                    "cleanup action timed out"
                );
                report.failed.push((name, "timeout".to_string()));
            }
        }
    }

    report
}

impl Drop for CleanupScope {
    fn drop(&mut self) {
        let actions = std::mem::take(&mut *self.actions.lock());
        if actions.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(
                    scope = %self.label,
                    pending = actions.len(),
                    "scope dropped with pending cleanup, running in background"
                );
                let label = self.label.clone();
                let per_action_timeout = self.per_action_timeout;
                handle.spawn(async move {
                    run_actions(&label, per_action_timeout, actions).await;
                });
            }
            Err(_) => {
                warn!(
                    scope = %self.label,
                    pending = actions.len(),
                    "scope dropped outside a runtime, cleanup actions skipped"
                );
            }
        }
    }
}

impl std::fmt::Debug for CleanupScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScope")
            .field("label", &self.label)
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = CleanupScope::new("item-1", Duration::from_secs(1));

        for i in 1..=3 {
            let order = order.clone();
            scope.register(format!("file-{i}"), move || async move {
                order.lock().push(i);
                Ok(())
            });
        }
        assert_eq!(scope.pending_count(), 3);

        let report = scope.run_all().await;

        assert!(report.is_clean());
        assert_eq!(report.completed, vec!["file-3", "file-2", "file-1"]);
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert_eq!(scope.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_remaining_actions() {
        let scope = CleanupScope::new("item-2", Duration::from_secs(1));
        scope.register("ok", || async { Ok(()) });
        scope.register("broken", || async { Err(StageError::upstream("404")) });

        let report = scope.run_all().await;

        assert_eq!(report.completed, vec!["ok"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_action_times_out() {
        let scope = CleanupScope::new("item-3", Duration::from_millis(50));
        scope.register("slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });

        let report = scope.run_all().await;
        assert_eq!(report.failed, vec![("slow".to_string(), "timeout".to_string())]);
    }

    #[tokio::test]
    async fn test_drop_runs_pending_actions() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let scope = CleanupScope::new("item-4", Duration::from_secs(1));
            let ran = ran.clone();
            scope.register("delete", move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        for _ in 0..10 {
            if ran.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
