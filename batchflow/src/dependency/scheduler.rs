//! The dependency scheduler loop.
//!
//! One loop owns all queues. Evaluations run as spawned tasks collected in a
//! `FuturesUnordered`; their results flow back to the loop, which is the only
//! place node state changes.

use super::queue::RetryQueue;
use super::template::render_prompt;
use super::{DependencyNode, NodeEvaluator};
use crate::cancellation::CancellationToken;
use crate::config::RetrySettings;
use crate::core::{FailureRecord, NodeResult, NodeStatus, StageKind};
use crate::errors::{FailureClass, GraphValidationError, StageError};
use crate::events::{self, EventSink};
use crate::executor::{StageExecutor, StageFailure, StageOutcome, StageRequest};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Evaluation = BoxFuture<'static, (usize, Result<StageOutcome<String>, StageFailure>)>;

#[derive(Debug, Default)]
struct NodeState {
    status: NodeStatus,
    dependency: Option<usize>,
    dependants: Vec<usize>,
    output: Option<String>,
    failure: Option<FailureRecord>,
    data_attempts: u32,
    rate_limit_attempts: u32,
}

/// Resolves a forest of dependency nodes.
#[derive(Clone)]
pub struct DependencyScheduler {
    executor: StageExecutor,
    evaluator: Arc<dyn NodeEvaluator>,
    settings: RetrySettings,
    process_timeout: Duration,
    cancellation: Option<Arc<CancellationToken>>,
}

impl DependencyScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(
        executor: StageExecutor,
        evaluator: Arc<dyn NodeEvaluator>,
        settings: RetrySettings,
        process_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            evaluator,
            settings,
            process_timeout,
            cancellation: None,
        }
    }

    /// Ties the run to a cancellation token. Nodes not yet dispatched when it
    /// fires fail as `Cancelled`.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Evaluates every node, returning one result per node in input order.
    ///
    /// Duplicate `(group, name)` pairs reject the whole submission.
    pub async fn run(&self, nodes: Vec<DependencyNode>) -> Result<Vec<NodeResult>, GraphValidationError> {
        let mut nodes = nodes;
        let mut states = link(&mut nodes)?;
        let nodes: Arc<Vec<DependencyNode>> = Arc::new(nodes);
        let mut run = Run {
            scheduler: self,
            nodes: Arc::clone(&nodes),
            states: &mut states,
            ready: VecDeque::new(),
            retry: RetryQueue::new(),
            in_flight: FuturesUnordered::new(),
            pause_until: None,
        };
        run.seed();
        run.drive().await;

        info!(
            nodes = nodes.len(),
            done = states.iter().filter(|s| s.status == NodeStatus::Done).count(),
            failed = states.iter().filter(|s| s.status == NodeStatus::Failed).count(),
            "dependency graph resolved"
        );

        Ok(nodes
            .iter()
            .zip(states)
            .map(|(node, state)| {
                let result = match (state.status, state.output, state.failure) {
                    (NodeStatus::Done, Some(output), _) => NodeResult::done(&node.group, &node.name, output),
                    (_, _, Some(failure)) => NodeResult::failed(&node.group, &node.name, failure),
                    _ => NodeResult::failed(
                        &node.group,
                        &node.name,
                        FailureRecord::new(node.key(), &StageError::fatal("node did not reach a terminal state")),
                    ),
                };
                result.with_attempts(state.data_attempts, state.rate_limit_attempts)
            })
            .collect())
    }

    fn request(&self, node: &DependencyNode) -> StageRequest {
        // Rate limits come straight back to the loop.
        let policy = self.settings.policy().with_rate_limit(self.settings.cooldown(), 0);
        let request = StageRequest::new(StageKind::Process, node.key(), self.process_timeout).with_policy(policy);
        match &self.cancellation {
            Some(token) => request.with_cancellation(token.clone()),
            None => request,
        }
    }

    fn sink(&self) -> &Arc<dyn EventSink> {
        self.executor.sink()
    }
}

impl std::fmt::Debug for DependencyScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyScheduler")
            .field("settings", &self.settings)
            .field("process_timeout", &self.process_timeout)
            .finish_non_exhaustive()
    }
}

/// Validates the submission and wires dependencies.
///
/// A node without an explicit dependency that appends exactly one sibling's
/// name depends on that sibling. A node may append at most one sibling, and
/// only the one it depends on.
fn link(nodes: &mut [DependencyNode]) -> Result<Vec<NodeState>, GraphValidationError> {
    let mut index: HashMap<(String, String), usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if node.name.trim().is_empty() {
            return Err(GraphValidationError::new("node name must not be empty")
                .with_nodes(vec![node.key()]));
        }
        if index.insert((node.group.clone(), node.name.clone()), i).is_some() {
            return Err(GraphValidationError::new(format!(
                "duplicate node '{}' in group '{}'",
                node.name, node.group
            ))
            .with_nodes(vec![node.key()]));
        }
    }

    for node in nodes.iter_mut() {
        let siblings: Vec<String> = node
            .append
            .iter()
            .filter(|p| *p != &node.name && index.contains_key(&(node.group.clone(), (*p).clone())))
            .cloned()
            .collect();
        match (siblings.as_slice(), node.depends_on.as_deref()) {
            ([], _) => {}
            ([only], None) => node.depends_on = Some(only.clone()),
            ([only], Some(dependency)) if only == dependency => {}
            ([only], Some(dependency)) => {
                return Err(GraphValidationError::new(format!(
                    "node '{}' appends the output of '{only}' but depends on '{dependency}'",
                    node.key()
                ))
                .with_nodes(vec![node.key()]));
            }
            _ => {
                return Err(GraphValidationError::new(format!(
                    "node '{}' appends more than one sibling output",
                    node.key()
                ))
                .with_nodes(vec![node.key()]));
            }
        }
    }

    let mut states: Vec<NodeState> = nodes.iter().map(|_| NodeState::default()).collect();
    for (i, node) in nodes.iter().enumerate() {
        let Some(dep_name) = node.depends_on.as_deref() else {
            continue;
        };
        match index.get(&(node.group.clone(), dep_name.to_string())) {
            Some(&dep) if dep == i => {
                return Err(GraphValidationError::new(format!(
                    "node '{}' depends on itself",
                    node.key()
                ))
                .with_nodes(vec![node.key()]));
            }
            Some(&dep) => {
                states[i].dependency = Some(dep);
                states[dep].dependants.push(i);
            }
            None => {
                let error = StageError::data_not_ready(format!("unknown dependency '{dep_name}'"))
                    .with_stage(StageKind::Process);
                states[i].status = NodeStatus::Failed;
                states[i].failure = Some(FailureRecord::new(node.key(), &error).with_attempts(0));
            }
        }
    }
    Ok(states)
}

struct Run<'a> {
    scheduler: &'a DependencyScheduler,
    nodes: Arc<Vec<DependencyNode>>,
    states: &'a mut Vec<NodeState>,
    ready: VecDeque<usize>,
    retry: RetryQueue,
    in_flight: FuturesUnordered<Evaluation>,
    pause_until: Option<Instant>,
}

impl Run<'_> {
    fn seed(&mut self) {
        let failed: Vec<usize> = (0..self.states.len())
            .filter(|&i| self.states[i].status == NodeStatus::Failed)
            .collect();
        for i in failed {
            self.cascade(i);
        }
        for i in 0..self.states.len() {
            if self.states[i].status == NodeStatus::Pending && self.states[i].dependency.is_none() {
                self.states[i].status = NodeStatus::Ready;
                self.ready.push_back(i);
            }
        }
    }

    async fn drive(&mut self) {
        let max_in_flight = self.scheduler.settings.max_in_flight.max(1);

        let token = self.scheduler.cancellation.clone();

        loop {
            let now = Instant::now();
            if let Some(token) = token.as_ref().filter(|t| t.is_cancelled()) {
                self.cancel_parked(token);
            }
            while let Some(entry) = self.retry.pop_ready(now) {
                debug!(node = %self.nodes[entry.node].key(), class = %entry.class, "node eligible again");
                self.states[entry.node].status = NodeStatus::Ready;
                self.ready.push_back(entry.node);
            }

            let paused = self.pause_until.is_some_and(|t| now < t);
            if !paused {
                self.pause_until = None;
                while self.in_flight.len() < max_in_flight {
                    let Some(i) = self.ready.pop_front() else {
                        break;
                    };
                    self.dispatch(i, now);
                }
            }

            if self.in_flight.is_empty() && self.ready.is_empty() && self.retry.is_empty() {
                break;
            }

            let wake_at = match (self.retry.next_deadline(), self.pause_until) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                Some((i, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.complete(i, result);
                }
                () = sleep_until(wake_at), if wake_at.is_some() => {}
                () = cancelled(token.as_deref()), if token.as_ref().is_some_and(|t| !t.is_cancelled()) => {}
                else => {}
            }
        }

        self.strand();
    }

    /// Fails every ready or parked node once the run is cancelled. In-flight
    /// evaluations observe the token themselves.
    fn cancel_parked(&mut self, token: &CancellationToken) {
        if self.ready.is_empty() && self.retry.is_empty() {
            return;
        }
        let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
        let error = StageError::cancelled(reason);
        let parked: Vec<usize> = self
            .ready
            .drain(..)
            .chain(self.retry.drain().into_iter().map(|entry| entry.node))
            .collect();
        debug!(nodes = parked.len(), "run cancelled, failing parked nodes");
        for i in parked {
            if !self.states[i].status.is_terminal() {
                self.fail(i, &error, 0);
            }
        }
        self.pause_until = None;
    }

    fn dispatch(&mut self, i: usize, now: Instant) {
        let scheduler = self.scheduler;
        let nodes = Arc::clone(&self.nodes);
        let node = &nodes[i];

        if let Some(token) = scheduler.cancellation.as_ref().filter(|t| t.is_cancelled()) {
            let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
            self.fail(i, &StageError::cancelled(reason), 0);
            return;
        }

        let dependency_output = self.states[i]
            .dependency
            .and_then(|d| self.states[d].output.clone());
        let prompt = match render_prompt(node, dependency_output.as_deref()) {
            Ok(prompt) => prompt,
            Err(error) => {
                self.data_not_ready(i, &error, now);
                return;
            }
        };

        self.states[i].status = NodeStatus::Running;
        scheduler.sink().try_emit(
            events::NODE_DISPATCHED,
            Some(json!({"group": node.group, "name": node.name})),
        );

        let executor = scheduler.executor.clone();
        let evaluator = Arc::clone(&scheduler.evaluator);
        let request = scheduler.request(node);
        let task_nodes = Arc::clone(&nodes);

        let handle = tokio::spawn(async move {
            let node = &task_nodes[i];
            executor
                .run(&request, |_| evaluator.evaluate(node, &prompt))
                .await
        });
        let evaluation: Evaluation = async move {
            match handle.await {
                Ok(result) => (i, result),
                Err(e) => (
                    i,
                    Err(StageFailure {
                        error: StageError::fatal(format!("evaluation task failed: {e}"))
                            .with_stage(StageKind::Process),
                        attempts: 1,
                        duration: Duration::ZERO,
                    }),
                ),
            }
        }
        .boxed();
        self.in_flight.push(evaluation);
    }

    fn complete(&mut self, i: usize, result: Result<StageOutcome<String>, StageFailure>) {
        let now = Instant::now();
        match result {
            Ok(outcome) => {
                let node = &self.nodes[i];
                debug!(node = %node.key(), attempts = outcome.attempts, "node completed");
                self.scheduler.sink().try_emit(
                    events::NODE_COMPLETED,
                    Some(json!({"group": node.group, "name": node.name, "attempts": outcome.attempts})),
                );
                self.states[i].status = NodeStatus::Done;
                self.states[i].output = Some(outcome.value);

                let dependants = self.states[i].dependants.clone();
                for d in dependants {
                    if self.states[d].status == NodeStatus::Pending {
                        self.states[d].status = NodeStatus::Ready;
                        self.ready.push_back(d);
                    }
                }
            }
            Err(failure) => match failure.error.class {
                FailureClass::RateLimited => self.rate_limited(i, &failure.error, now),
                FailureClass::DataNotReady => self.data_not_ready(i, &failure.error, now),
                _ => self.fail(i, &failure.error, failure.attempts),
            },
        }
    }

    fn rate_limited(&mut self, i: usize, error: &StageError, now: Instant) {
        let scheduler = self.scheduler;
        let settings = &scheduler.settings;
        self.states[i].rate_limit_attempts += 1;
        let attempts = self.states[i].rate_limit_attempts;

        if attempts > settings.max_rate_limit_retries {
            self.fail(i, error, attempts);
            return;
        }

        let cooldown = settings.cooldown();
        let eligible = now + cooldown;
        self.states[i].status = NodeStatus::Pending;
        self.retry.push(i, eligible, attempts, FailureClass::RateLimited);
        if settings.global_rate_limit_pause {
            self.pause_until = Some(self.pause_until.map_or(eligible, |t| t.max(eligible)));
        }

        let node = &self.nodes[i];
        warn!(
            node = %node.key(),
            attempt = attempts,
            cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
            global_pause = settings.global_rate_limit_pause,
            "node rate limited, deferring"
        );
        self.scheduler.sink().try_emit(
            events::NODE_DEFERRED,
            Some(json!({
                "group": node.group,
                "name": node.name,
                "class": FailureClass::RateLimited.as_str(),
                "attempt": attempts,
            })),
        );
    }

    fn data_not_ready(&mut self, i: usize, error: &StageError, now: Instant) {
        let scheduler = self.scheduler;
        let settings = &scheduler.settings;
        self.states[i].data_attempts += 1;
        let attempts = self.states[i].data_attempts;

        if attempts > settings.max_data_dependency_retries {
            self.fail(i, error, attempts);
            return;
        }

        self.states[i].status = NodeStatus::Pending;
        self.retry.push(i, now + settings.data_retry_delay(), attempts, FailureClass::DataNotReady);

        let node = &self.nodes[i];
        debug!(node = %node.key(), attempt = attempts, error = %error.message, "node input not ready, deferring");
        self.scheduler.sink().try_emit(
            events::NODE_DEFERRED,
            Some(json!({
                "group": node.group,
                "name": node.name,
                "class": FailureClass::DataNotReady.as_str(),
                "attempt": attempts,
            })),
        );
    }

    fn fail(&mut self, i: usize, error: &StageError, attempts: u32) {
        let error = error.clone().with_stage(StageKind::Process);
        let key = self.nodes[i].key();
        warn!(node = %key, class = %error.class, error = %error.message, "node failed");
        self.scheduler.sink().try_emit(
            events::NODE_FAILED,
            Some(json!({
                "group": self.nodes[i].group,
                "name": self.nodes[i].name,
                "class": error.class.as_str(),
            })),
        );
        self.states[i].status = NodeStatus::Failed;
        self.states[i].failure = Some(FailureRecord::new(key, &error).with_attempts(attempts));
        self.cascade(i);
    }

    /// Fails every transitive dependant of a failed node.
    fn cascade(&mut self, failed: usize) {
        let mut stack = vec![failed];
        while let Some(parent) = stack.pop() {
            let dependants = self.states[parent].dependants.clone();
            for d in dependants {
                if self.states[d].status.is_terminal() {
                    continue;
                }
                let error = StageError::data_not_ready(format!(
                    "dependency '{}' failed",
                    self.nodes[parent].name
                ))
                .with_stage(StageKind::Process);
                self.states[d].status = NodeStatus::Failed;
                self.states[d].failure =
                    Some(FailureRecord::new(self.nodes[d].key(), &error).with_attempts(0));
                stack.push(d);
            }
        }
    }

    /// Fails nodes whose dependency can never complete.
    fn strand(&mut self) {
        for i in 0..self.states.len() {
            if !self.states[i].status.is_terminal() {
                let error = StageError::data_not_ready("dependency never completed (cycle)")
                    .with_stage(StageKind::Process);
                self.states[i].status = NodeStatus::Failed;
                self.states[i].failure =
                    Some(FailureRecord::new(self.nodes[i].key(), &error).with_attempts(0));
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
