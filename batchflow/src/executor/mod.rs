//! Per-stage execution with admission control, deadlines and retries.
//!
//! Each attempt of a stage:
//!
//! 1. takes a permit from the stage's pool, failing with `ResourceExhausted`
//!    if none frees up within the acquire timeout;
//! 2. waits out any memory-pressure delay;
//! 3. runs the stage future under its deadline, dropping it on expiry;
//! 4. releases the permit before any retry wait.
//!
//! Failures are retried per [`RetryPolicy`]. Cancellation of the item's
//! [`CancellationToken`] aborts the current attempt or retry wait.

mod outcome;

pub use outcome::{StageFailure, StageOutcome};

use crate::cancellation::CancellationToken;
use crate::config::OrchestratorConfig;
use crate::core::StageKind;
use crate::errors::{BatchflowError, StageError};
use crate::events::{self, EventSink};
use crate::memory::MemoryGovernor;
use crate::observability::SpanTimer;
use crate::pool::{PoolKind, ResourcePools};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, Instrument};

/// Everything the executor needs to know about one stage run.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// The stage being run.
    pub stage: StageKind,
    /// What the stage works on, for logs and events (item id or node key).
    pub subject: String,
    /// The pool permits are drawn from.
    pub pool: PoolKind,
    /// Deadline per attempt.
    pub timeout: Duration,
    /// Retry policy.
    pub policy: RetryPolicy,
    /// Cancellation scope of the owning item.
    pub cancellation: Option<Arc<CancellationToken>>,
}

impl StageRequest {
    /// Creates a request using the stage's own pool and the default policy.
    #[must_use]
    pub fn new(stage: StageKind, subject: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stage,
            subject: subject.into(),
            pool: PoolKind::for_stage(stage),
            timeout,
            policy: RetryPolicy::default(),
            cancellation: None,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Draws permits from a different pool.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolKind) -> Self {
        self.pool = pool;
        self
    }

    /// Ties the run to a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn cancelled_error(&self) -> Option<StageError> {
        let token = self.cancellation.as_ref()?;
        token.is_cancelled().then(|| {
            StageError::cancelled(token.reason().unwrap_or_else(|| "cancelled".to_string()))
                .with_stage(self.stage)
        })
    }

    fn payload(&self, attempt: u32) -> serde_json::Value {
        json!({
            "stage": self.stage.to_string(),
            "subject": self.subject,
            "attempt": attempt,
        })
    }
}

/// Runs stage functions under pools, deadlines, memory pressure and retries.
///
/// Cloning is cheap; clones share pools and the event sink.
#[derive(Clone)]
pub struct StageExecutor {
    pools: ResourcePools,
    governor: MemoryGovernor,
    sink: Arc<dyn EventSink>,
    acquire_timeout: Duration,
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(pools: ResourcePools, governor: MemoryGovernor, acquire_timeout: Duration) -> Self {
        Self {
            pools,
            governor,
            sink: events::default_sink(),
            acquire_timeout,
        }
    }

    /// Builds pools and the governor from configuration.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, BatchflowError> {
        Ok(Self::new(
            ResourcePools::from_config(&config.pools)?,
            MemoryGovernor::new(&config.memory),
            config.timeouts.acquire(),
        ))
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the memory governor.
    #[must_use]
    pub fn with_governor(mut self, governor: MemoryGovernor) -> Self {
        self.governor = governor;
        self
    }

    /// Returns the pools.
    #[must_use]
    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    /// Returns the memory governor.
    #[must_use]
    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    /// Returns the event sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Runs a stage, retrying per the request's policy.
    ///
    /// `op` is called once per attempt with the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        request: &StageRequest,
        mut op: F,
    ) -> Result<StageOutcome<T>, StageFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let span = info_span!("stage", stage = %request.stage, subject = %request.subject);
        async {
            let timer = SpanTimer::start(format!("{}:{}", request.stage, request.subject));
            let mut state = RetryState::new();
            let mut attempt = 0;

            loop {
                attempt += 1;
                self.sink.try_emit(events::STAGE_STARTED, Some(request.payload(attempt)));

                let error = match self.attempt(request, op(attempt)).await {
                    Ok(value) => return Ok(self.succeed(request, value, attempt, timer)),
                    Err(error) => error,
                };

                match state.decide(&request.policy, &error) {
                    RetryDecision::Retry(delay) => {
                        debug!(
                            attempt,
                            class = %error.class,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %error.message,
                            "stage failed, retry scheduled"
                        );
                        let mut payload = request.payload(attempt);
                        payload["class"] = json!(error.class.as_str());
                        payload["delay_ms"] = json!(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
                        self.sink.try_emit(events::STAGE_RETRY_SCHEDULED, Some(payload));

                        if let Err(cancelled) = self.wait(request, delay).await {
                            return Err(self.fail(request, cancelled, attempt, timer));
                        }
                    }
                    RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                        return Err(self.fail(request, error, attempt, timer));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Runs a single attempt, for callers that schedule their own retries.
    pub async fn run_once<T, Fut>(
        &self,
        request: &StageRequest,
        fut: Fut,
    ) -> Result<StageOutcome<T>, StageFailure>
    where
        Fut: Future<Output = Result<T, StageError>>,
    {
        let timer = SpanTimer::start(format!("{}:{}", request.stage, request.subject));
        self.sink.try_emit(events::STAGE_STARTED, Some(request.payload(1)));
        match self.attempt(request, fut).await {
            Ok(value) => Ok(self.succeed(request, value, 1, timer)),
            Err(error) => Err(self.fail(request, error, 1, timer)),
        }
    }

    async fn attempt<T, Fut>(&self, request: &StageRequest, fut: Fut) -> Result<T, StageError>
    where
        Fut: Future<Output = Result<T, StageError>>,
    {
        if let Some(cancelled) = request.cancelled_error() {
            return Err(cancelled);
        }

        let mut permit = self
            .pools
            .get(request.pool)
            .acquire(self.acquire_timeout)
            .await
            .map_err(|e| e.with_stage(request.stage))?;

        self.governor.throttle().await;

        let deadline = tokio::time::timeout(request.timeout, fut);
        let result = match &request.cancellation {
            Some(token) => {
                tokio::select! {
                    result = deadline => result,
                    () = token.cancelled() => {
                        return Err(request.cancelled_error().unwrap_or_else(|| {
                            StageError::cancelled("cancelled").with_stage(request.stage)
                        }));
                    }
                }
            }
            None => deadline.await,
        };
        permit.release();

        match result {
            Ok(inner) => inner.map_err(|e| e.with_stage(request.stage)),
            Err(_elapsed) => Err(StageError::timeout(request.stage, request.timeout)),
        }
    }

    async fn wait(&self, request: &StageRequest, delay: Duration) -> Result<(), StageError> {
        match &request.cancellation {
            Some(token) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => Ok(()),
                    () = token.cancelled() => Err(request.cancelled_error().unwrap_or_else(|| {
                        StageError::cancelled("cancelled").with_stage(request.stage)
                    })),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    fn succeed<T>(
        &self,
        request: &StageRequest,
        value: T,
        attempts: u32,
        timer: SpanTimer,
    ) -> StageOutcome<T> {
        let duration = timer.finish();
        let mut payload = request.payload(attempts);
        payload["duration_ms"] = json!(duration.as_secs_f64() * 1000.0);
        self.sink.try_emit(events::STAGE_COMPLETED, Some(payload));
        StageOutcome {
            value,
            attempts,
            duration,
        }
    }

    fn fail(
        &self,
        request: &StageRequest,
        error: StageError,
        attempts: u32,
        timer: SpanTimer,
    ) -> StageFailure {
        let duration = timer.finish();
        let error = error.with_stage(request.stage);
        debug!(
            stage = %request.stage,
            subject = %request.subject,
            attempts,
            class = %error.class,
            error = %error.message,
            "stage failed terminally"
        );
        let mut payload = request.payload(attempts);
        payload["class"] = json!(error.class.as_str());
        payload["error"] = json!(error.message);
        self.sink.try_emit(events::STAGE_FAILED, Some(payload));
        StageFailure {
            error,
            attempts,
            duration,
        }
    }
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("pools", &self.pools.snapshot())
            .field("governor", &self.governor)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}
