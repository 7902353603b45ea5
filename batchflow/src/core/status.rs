//! Stage kind and node status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The pipeline stage a piece of work belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Download the source document and split it into sections.
    Split,
    /// Upload section buffers to the remote evaluation service.
    Upload,
    /// Remote evaluation of one section or one prompt node.
    Process,
    /// Release uploaded and temporary resources.
    Cleanup,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [Self; 4] = [Self::Split, Self::Upload, Self::Process, Self::Cleanup];
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split => write!(f, "split"),
            Self::Upload => write!(f, "upload"),
            Self::Process => write!(f, "process"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// The scheduling status of a dependency node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for its dependency.
    #[default]
    Pending,
    /// Dependency satisfied, queued for evaluation.
    Ready,
    /// Currently being evaluated.
    Running,
    /// Evaluated successfully.
    Done,
    /// Permanently failed.
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl NodeStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Split.to_string(), "split");
        assert_eq!(StageKind::Upload.to_string(), "upload");
        assert_eq!(StageKind::Process.to_string(), "process");
        assert_eq!(StageKind::Cleanup.to_string(), "cleanup");
    }

    #[test]
    fn test_stage_kind_order() {
        assert_eq!(StageKind::ALL[0], StageKind::Split);
        assert_eq!(StageKind::ALL[3], StageKind::Cleanup);
    }

    #[test]
    fn test_node_status_is_terminal() {
        assert!(NodeStatus::Done.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(!NodeStatus::Pending.is_terminal());
        assert!(!NodeStatus::Ready.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }

    #[test]
    fn test_node_status_serialize() {
        let json = serde_json::to_string(&NodeStatus::Done).unwrap();
        assert_eq!(json, r#""done""#);

        let deserialized: NodeStatus = serde_json::from_str(r#""failed""#).unwrap();
        assert_eq!(deserialized, NodeStatus::Failed);
    }
}
