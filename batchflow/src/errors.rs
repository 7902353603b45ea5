//! Error types for batchflow.
//!
//! Stage failures carry a structured [`FailureClass`] so that retry decisions
//! never depend on matching error message text. Operations that can fail as a
//! whole (configuration, graph validation) return [`BatchflowError`].

use crate::core::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for batchflow operations.
#[derive(Debug, Error)]
pub enum BatchflowError {
    /// A stage failed and the failure could not be absorbed into a result.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// A dependency graph failed validation.
    #[error("{0}")]
    Validation(#[from] GraphValidationError),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of a stage failure.
///
/// The class decides how the failure is retried: see
/// [`RetryPolicy`](crate::retry::RetryPolicy) and the dependency scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The stage exceeded its deadline.
    Timeout,
    /// No pool permit became free within the acquire timeout.
    ResourceExhausted,
    /// The upstream service signalled throttling.
    RateLimited,
    /// A dependency's output was missing or malformed.
    DataNotReady,
    /// Any other remote failure.
    UpstreamFailure,
    /// A non-retryable input or logic error.
    Fatal,
    /// The item's cancellation scope was cancelled.
    Cancelled,
}

impl FailureClass {
    /// Returns true if some component may retry a failure of this class.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::DataNotReady | Self::UpstreamFailure
        )
    }

    /// Returns the snake_case name of the class.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::RateLimited => "rate_limited",
            Self::DataNotReady => "data_not_ready",
            Self::UpstreamFailure => "upstream_failure",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure raised by a stage, a pool or a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{class}: {message}")]
pub struct StageError {
    /// The failure class.
    pub class: FailureClass,
    /// Human-readable description.
    pub message: String,
    /// The stage that raised the error, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            stage: None,
        }
    }

    /// Upstream throttling.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureClass::RateLimited, message)
    }

    /// Any other remote failure.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(FailureClass::UpstreamFailure, message)
    }

    /// A non-retryable error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Fatal, message)
    }

    /// A dependency's data is not available yet.
    #[must_use]
    pub fn data_not_ready(message: impl Into<String>) -> Self {
        Self::new(FailureClass::DataNotReady, message)
    }

    /// Cancellation of the owning item.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(FailureClass::Cancelled, reason)
    }

    /// A stage deadline elapsed.
    #[must_use]
    pub fn timeout(stage: StageKind, after: Duration) -> Self {
        Self::new(
            FailureClass::Timeout,
            format!("stage '{stage}' exceeded its {}ms deadline", after.as_millis()),
        )
        .with_stage(stage)
    }

    /// A pool permit could not be acquired in time.
    #[must_use]
    pub fn resource_exhausted(pool: impl fmt::Display, waited: Duration) -> Self {
        Self::new(
            FailureClass::ResourceExhausted,
            format!("no '{pool}' permit available after {}ms", waited.as_millis()),
        )
    }

    /// Tags the error with the stage that raised it, unless already tagged.
    #[must_use]
    pub fn with_stage(mut self, stage: StageKind) -> Self {
        self.stage.get_or_insert(stage);
        self
    }

    /// Returns true if the error is of the given class.
    #[must_use]
    pub fn is(&self, class: FailureClass) -> bool {
        self.class == class
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("class".to_string(), serde_json::json!(self.class.as_str()));
        map.insert("message".to_string(), serde_json::json!(self.message));
        if let Some(stage) = self.stage {
            map.insert("stage".to_string(), serde_json::json!(stage.to_string()));
        }
        map
    }
}

/// Error raised when a dependency graph submission is malformed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GraphValidationError {
    /// The error message.
    pub message: String,
    /// The nodes involved, as `group/name`.
    pub nodes: Vec<String>,
}

impl GraphValidationError {
    /// Creates a new graph validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
        }
    }

    /// Sets the nodes involved.
    #[must_use]
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("nodes".to_string(), serde_json::json!(self.nodes));
        map
    }
}
