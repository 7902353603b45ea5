//! Dependency-graph scheduling of prompt nodes.
//!
//! Nodes are grouped by item. Within a group a node may depend on one other
//! node and runs only after that node is done, with the dependency's output
//! appended to its prompt. Throttled nodes and nodes whose input is not ready
//! are parked and retried under separate budgets.

mod node;
mod queue;
mod scheduler;
mod template;

pub use node::{DependencyNode, NodeInput};
pub use queue::{RetryEntry, RetryQueue};
pub use scheduler::DependencyScheduler;
pub use template::{display_name, render_prompt, CONTENT_PROPERTY};

use crate::errors::StageError;
use async_trait::async_trait;

/// Evaluates a rendered prompt for a node.
#[async_trait]
pub trait NodeEvaluator: Send + Sync {
    /// Returns the node's output text.
    ///
    /// Throttling must be reported as `RateLimited` and missing input as
    /// `DataNotReady`; the scheduler owns both retry loops.
    async fn evaluate(&self, node: &DependencyNode, prompt: &str) -> Result<String, StageError>;
}
