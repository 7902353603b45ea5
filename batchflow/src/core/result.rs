//! Result types reported once an item or node reaches a terminal state.

use super::{NodeStatus, StageKind};
use crate::errors::{FailureClass, StageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Record of a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The item id, or `group/name` for dependency nodes.
    pub subject: String,
    /// Failure class.
    pub class: FailureClass,
    /// Error message.
    pub error: String,
    /// Stage that failed, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a record from a stage error.
    #[must_use]
    pub fn new(subject: impl Into<String>, error: &StageError) -> Self {
        Self {
            subject: subject.into(),
            class: error.class,
            error: error.message.clone(),
            stage: error.stage,
            attempts: 1,
            timestamp: Utc::now(),
        }
    }

    /// Sets the number of attempts made.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Returns true if the class was retryable before its budget ran out.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        self.class.is_retryable()
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("subject".to_string(), serde_json::json!(self.subject));
        map.insert("class".to_string(), serde_json::json!(self.class.as_str()));
        map.insert("error".to_string(), serde_json::json!(self.error));
        map.insert("attempts".to_string(), serde_json::json!(self.attempts));
        map.insert("recoverable".to_string(), serde_json::json!(self.recoverable()));
        map.insert(
            "timestamp".to_string(),
            serde_json::json!(self.timestamp.to_rfc3339()),
        );
        if let Some(stage) = self.stage {
            map.insert("stage".to_string(), serde_json::json!(stage.to_string()));
        }
        map
    }
}

/// Terminal result of one submitted item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult<T> {
    /// The item identity.
    pub item_id: String,
    /// Whether the item succeeded.
    pub success: bool,
    /// Output data on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure details on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
    /// Wall-clock duration of the item's run.
    pub duration_ms: f64,
}

impl<T> ItemResult<T> {
    /// Creates a successful result.
    #[must_use]
    pub fn success(item_id: impl Into<String>, data: T, duration_ms: f64) -> Self {
        Self {
            item_id: item_id.into(),
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(item_id: impl Into<String>, error: FailureRecord, duration_ms: f64) -> Self {
        Self {
            item_id: item_id.into(),
            success: false,
            data: None,
            error: Some(error),
            duration_ms,
        }
    }

    /// Returns true if the item succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Returns the failure class, if the item failed.
    #[must_use]
    pub fn failure_class(&self) -> Option<FailureClass> {
        self.error.as_ref().map(|e| e.class)
    }

    /// Converts into a standard `Result`.
    pub fn into_result(self) -> Result<T, FailureRecord> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            (None, None) => Err(FailureRecord::new(
                self.item_id,
                &StageError::fatal("result carried neither data nor error"),
            )),
        }
    }
}

/// Terminal result of one dependency node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    /// The group (item) the node belongs to.
    pub group: String,
    /// The node name, unique within its group.
    pub name: String,
    /// Terminal status, `Done` or `Failed`.
    pub status: NodeStatus,
    /// Generated output on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Failure details on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
    /// Data-not-ready failures observed.
    pub data_attempts: u32,
    /// Rate-limited failures observed.
    pub rate_limit_attempts: u32,
}

impl NodeResult {
    /// Creates a completed node result.
    #[must_use]
    pub fn done(group: impl Into<String>, name: impl Into<String>, output: String) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            status: NodeStatus::Done,
            output: Some(output),
            error: None,
            data_attempts: 0,
            rate_limit_attempts: 0,
        }
    }

    /// Creates a failed node result.
    #[must_use]
    pub fn failed(group: impl Into<String>, name: impl Into<String>, error: FailureRecord) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            status: NodeStatus::Failed,
            output: None,
            error: Some(error),
            data_attempts: 0,
            rate_limit_attempts: 0,
        }
    }

    /// Records the retry counters observed for the node.
    #[must_use]
    pub fn with_attempts(mut self, data_attempts: u32, rate_limit_attempts: u32) -> Self {
        self.data_attempts = data_attempts;
        self.rate_limit_attempts = rate_limit_attempts;
        self
    }

    /// Returns true if the node completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Done
    }

    /// Returns the node key, `group/name`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }
}
