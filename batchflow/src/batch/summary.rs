use crate::core::{FailureRecord, ItemResult};
use crate::errors::FailureClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Aggregate view of a batched run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Items submitted.
    pub total_items: usize,
    /// Size of each batch, in execution order.
    pub batch_sizes: Vec<usize>,
    /// Items that succeeded.
    pub succeeded: usize,
    /// Items that failed.
    pub failed: usize,
    /// One record per failed item, in submission order.
    pub failures: Vec<FailureRecord>,
    /// Wall-clock duration of the whole run.
    pub duration_ms: f64,
}

impl BatchSummary {
    /// Builds a summary from ordered results.
    #[must_use]
    pub fn from_results<T>(results: &[ItemResult<T>], batch_sizes: Vec<usize>, duration_ms: f64) -> Self {
        let failures: Vec<FailureRecord> = results.iter().filter_map(|r| r.error.clone()).collect();
        Self {
            total_items: results.len(),
            batch_sizes,
            succeeded: results.iter().filter(|r| r.success).count(),
            failed: failures.len(),
            failures,
            duration_ms,
        }
    }

    /// Returns the fraction of items that succeeded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total_items as f64
    }

    /// Returns true if any item failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Counts failures per class.
    #[must_use]
    pub fn failures_by_class(&self) -> HashMap<FailureClass, usize> {
        let mut counts = HashMap::new();
        for failure in &self.failures {
            *counts.entry(failure.class).or_insert(0) += 1;
        }
        counts
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("total_items".to_string(), serde_json::json!(self.total_items));
        map.insert("batch_sizes".to_string(), serde_json::json!(self.batch_sizes));
        map.insert("succeeded".to_string(), serde_json::json!(self.succeeded));
        map.insert("failed".to_string(), serde_json::json!(self.failed));
        map.insert("success_rate".to_string(), serde_json::json!(self.success_rate()));
        map.insert("duration_ms".to_string(), serde_json::json!(self.duration_ms));
        map.insert(
            "failures".to_string(),
            serde_json::json!(self.failures.iter().map(FailureRecord::to_dict).collect::<Vec<_>>()),
        );
        map
    }
}
