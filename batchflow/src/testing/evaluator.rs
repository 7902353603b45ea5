use crate::dependency::{DependencyNode, NodeEvaluator};
use crate::errors::StageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Call {
    key: String,
    prompt: String,
    at: Instant,
}

/// A node evaluator driven by a script.
///
/// By default every node succeeds with `"<group>/<name> output"`. Failures and
/// delays can be scripted per node key.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<String, (StageError, usize)>>,
    outputs: Mutex<HashMap<String, String>>,
    delays: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedEvaluator {
    /// Creates an evaluator where every node succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` evaluations of `key` fail with `error`.
    pub fn fail_times(&self, key: impl Into<String>, error: StageError, times: usize) {
        self.failures.lock().insert(key.into(), (error, times));
    }

    /// Sets the output returned for `key`.
    pub fn set_output(&self, key: impl Into<String>, output: impl Into<String>) {
        self.outputs.lock().insert(key.into(), output.into());
    }

    /// Makes every evaluation of `key` take `delay`.
    pub fn set_delay(&self, key: impl Into<String>, delay: Duration) {
        self.delays.lock().insert(key.into(), delay);
    }

    /// Node keys in the order they were evaluated, one entry per call.
    #[must_use]
    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.key.clone()).collect()
    }

    /// Number of evaluations of `key`.
    #[must_use]
    pub fn calls(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.key == key).count()
    }

    /// Total evaluations.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// When each evaluation of `key` started.
    #[must_use]
    pub fn call_times(&self, key: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.key == key)
            .map(|c| c.at)
            .collect()
    }

    /// The prompt of the latest evaluation of `key`.
    #[must_use]
    pub fn prompt_for(&self, key: &str) -> Option<String> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|c| c.key == key)
            .map(|c| c.prompt.clone())
    }

    /// Most evaluations seen running at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeEvaluator for ScriptedEvaluator {
    async fn evaluate(&self, node: &DependencyNode, prompt: &str) -> Result<String, StageError> {
        let key = node.key();
        self.calls.lock().push(Call {
            key: key.clone(),
            prompt: prompt.to_string(),
            at: Instant::now(),
        });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = self.delays.lock().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&key) {
                Some((error, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(error.clone())
                }
                _ => None,
            }
        };
        if let Some(error) = scripted {
            return Err(error);
        }

        Ok(self
            .outputs
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| format!("{key} output")))
    }
}
