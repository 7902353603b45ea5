//! Batch scheduling.
//!
//! Items are split into contiguous batches. Every item of a batch runs
//! concurrently and the scheduler waits for all of them to finish before the
//! next batch starts. A failing or panicking item never stops its siblings.

mod summary;

pub use summary::BatchSummary;

use crate::config::BatchConfig;
use crate::core::{FailureRecord, ItemResult};
use crate::errors::{BatchflowError, StageError};
use crate::events::{self, EventSink};
use crate::observability::SpanTimer;
use futures::future::join_all;
use serde_json::json;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Something that can be scheduled in a batch.
pub trait BatchItem: Send + 'static {
    /// Identity used in results.
    fn item_id(&self) -> String;
}

impl BatchItem for String {
    fn item_id(&self) -> String {
        self.clone()
    }
}

/// Ordered results of a batched run plus their summary.
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    /// One result per item, in submission order.
    pub results: Vec<ItemResult<T>>,
    /// Aggregate counts.
    pub summary: BatchSummary,
}

/// Splits `len` items into contiguous ranges of at most `batch_size`.
#[must_use]
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let size = batch_size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Runs items in sequential batches of concurrent work.
#[derive(Clone)]
pub struct BatchScheduler {
    batch_size: usize,
    inter_batch_delay: Duration,
    sink: Arc<dyn EventSink>,
}

impl BatchScheduler {
    /// Creates a scheduler. `batch_size` must be at least 1.
    pub fn new(batch_size: usize, inter_batch_delay: Duration) -> Result<Self, BatchflowError> {
        if batch_size == 0 {
            return Err(BatchflowError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            batch_size,
            inter_batch_delay,
            sink: events::default_sink(),
        })
    }

    /// Creates a scheduler from configuration.
    pub fn from_config(config: &BatchConfig) -> Result<Self, BatchflowError> {
        Self::new(config.batch_size, config.inter_batch_delay())
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the delay between batches.
    #[must_use]
    pub fn inter_batch_delay(&self) -> Duration {
        self.inter_batch_delay
    }

    /// Runs every item through `run_item`, one batch at a time.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, run_item: F) -> BatchReport<T>
    where
        I: BatchItem,
        T: Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = ItemResult<T>> + Send + 'static,
    {
        let timer = SpanTimer::start("batch_run");
        let ranges = partition(items.len(), self.batch_size);
        let batch_count = ranges.len();
        let batch_sizes: Vec<usize> = ranges.iter().map(ExactSizeIterator::len).collect();
        let mut results = Vec::with_capacity(items.len());
        let mut remaining = items.into_iter();

        info!(
            items = batch_sizes.iter().sum::<usize>(),
            batches = batch_count,
            batch_size = self.batch_size,
            "starting batched run"
        );

        for (index, range) in ranges.into_iter().enumerate() {
            let batch: Vec<I> = remaining.by_ref().take(range.len()).collect();
            let batch_results = self.run_batch(batch, &run_item).await;

            let failed = batch_results.iter().filter(|r| !r.success).count();
            debug!(batch = index, size = batch_results.len(), failed, "batch completed");
            self.sink.try_emit(
                events::BATCH_COMPLETED,
                Some(json!({
                    "batch": index,
                    "size": batch_results.len(),
                    "failed": failed,
                    "first_item": range.start,
                })),
            );
            results.extend(batch_results);

            if index + 1 < batch_count && !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
        }

        let summary = BatchSummary::from_results(&results, batch_sizes, timer.elapsed_ms());
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "batched run finished"
        );
        BatchReport { results, summary }
    }

    async fn run_batch<I, T, F, Fut>(&self, batch: Vec<I>, run_item: &F) -> Vec<ItemResult<T>>
    where
        I: BatchItem,
        T: Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = ItemResult<T>> + Send + 'static,
    {
        let (ids, handles): (Vec<String>, Vec<_>) = batch
            .into_iter()
            .map(|item| {
                let id = item.item_id();
                (id, tokio::spawn(run_item(item)))
            })
            .unzip();

        join_all(handles)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, id)| match joined {
                Ok(result) => result,
                Err(e) => {
                    let error = if e.is_panic() {
                        StageError::fatal("item run panicked")
                    } else {
                        StageError::cancelled("item run was aborted")
                    };
                    tracing::warn!(item = %id, error = %e, "item task did not complete");
                    let record = FailureRecord::new(id.clone(), &error);
                    ItemResult::failure(id, record, 0.0)
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("batch_size", &self.batch_size)
            .field("inter_batch_delay", &self.inter_batch_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureClass;
    use crate::events::CollectingEventSink;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item-{i}")).collect()
    }

    #[test]
    fn test_partition() {
        assert_eq!(partition(12, 5), vec![0..5, 5..10, 10..12]);
        assert_eq!(partition(4, 4), vec![0..4]);
        assert_eq!(partition(0, 3), Vec::<Range<usize>>::new());
        assert_eq!(partition(3, 0), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(BatchScheduler::new(0, Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_in_order_with_delay() {
        let sink = Arc::new(CollectingEventSink::new());
        let scheduler = BatchScheduler::new(5, Duration::from_secs(2))
            .unwrap()
            .with_event_sink(sink.clone());
        let started: Arc<Mutex<Vec<(String, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();

        let report = scheduler
            .run(ids(12), |id| {
                let started = started.clone();
                async move {
                    started.lock().push((id.clone(), Instant::now()));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    ItemResult::success(id.clone(), id, 100.0)
                }
            })
            .await;

        assert_eq!(report.summary.batch_sizes, vec![5, 5, 2]);
        let order: Vec<_> = report.results.iter().map(|r| r.item_id.clone()).collect();
        assert_eq!(order, ids(12));

        let started = started.lock().clone();
        let at = |id: &str| started.iter().find(|(i, _)| i == id).map(|(_, t)| *t - origin).unwrap();
        assert!(at("item-4") < Duration::from_millis(100));
        assert!(at("item-5") >= Duration::from_millis(2100));
        assert!(at("item-10") >= Duration::from_millis(4200));
        assert_eq!(sink.count(events::BATCH_COMPLETED), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_after_last_batch() {
        let scheduler = BatchScheduler::new(2, Duration::from_secs(10)).unwrap();
        let start = Instant::now();
        scheduler
            .run(ids(2), |id| async move { ItemResult::success(id, (), 0.0) })
            .await;
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let scheduler = BatchScheduler::new(3, Duration::ZERO).unwrap();
        let report = scheduler
            .run(ids(3), |id| async move {
                if id == "item-1" {
                    let record = FailureRecord::new(id.clone(), &StageError::fatal("bad input"));
                    ItemResult::failure(id, record, 0.0)
                } else {
                    ItemResult::success(id, 1u8, 0.0)
                }
            })
            .await;

        let success: Vec<bool> = report.results.iter().map(|r| r.success).collect();
        assert_eq!(success, vec![true, false, true]);
        assert_eq!(report.summary.failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_item_becomes_fatal() {
        let scheduler = BatchScheduler::new(4, Duration::ZERO).unwrap();
        let report = scheduler
            .run(ids(2), |id| async move {
                assert!(id != "item-0", "item exploded");
                ItemResult::success(id, (), 0.0)
            })
            .await;

        assert_eq!(report.results[0].failure_class(), Some(FailureClass::Fatal));
        assert_eq!(report.results[0].item_id, "item-0");
        assert!(report.results[1].success);
    }
}
