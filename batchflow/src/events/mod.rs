//! Lifecycle events.
//!
//! Components report progress through an [`EventSink`] handed to them at
//! construction. Event names are dotted strings grouped by subject
//! (`stage.*`, `batch.*`, `node.*`, `pipeline.*`); payloads are JSON objects.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// A stage attempt is starting.
pub const STAGE_STARTED: &str = "stage.started";
/// A stage failed and will be retried after a delay.
pub const STAGE_RETRY_SCHEDULED: &str = "stage.retry_scheduled";
/// A stage produced its value.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage failed terminally.
pub const STAGE_FAILED: &str = "stage.failed";
/// Every item of a batch reached a terminal state.
pub const BATCH_COMPLETED: &str = "batch.completed";
/// A dependency node was dispatched for evaluation.
pub const NODE_DISPATCHED: &str = "node.dispatched";
/// A dependency node was parked until a later instant.
pub const NODE_DEFERRED: &str = "node.deferred";
/// A dependency node completed.
pub const NODE_COMPLETED: &str = "node.completed";
/// A dependency node failed terminally.
pub const NODE_FAILED: &str = "node.failed";
/// A pipeline item reached a terminal state.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// A remote file could not be removed during cleanup.
pub const CLEANUP_FAILED: &str = "cleanup.failed";

/// Returns the sink used when none is configured.
#[must_use]
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_grouped() {
        for name in [STAGE_STARTED, STAGE_RETRY_SCHEDULED, STAGE_COMPLETED, STAGE_FAILED] {
            assert!(name.starts_with("stage."));
        }
        for name in [NODE_DISPATCHED, NODE_DEFERRED, NODE_COMPLETED, NODE_FAILED] {
            assert!(name.starts_with("node."));
        }
    }

    #[tokio::test]
    async fn test_default_sink_discards() {
        let sink = default_sink();
        sink.emit(BATCH_COMPLETED, None).await;
        sink.try_emit(BATCH_COMPLETED, Some(serde_json::json!({"batch": 0})));
    }
}
