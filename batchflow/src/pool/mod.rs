//! Resource pools for admission control.
//!
//! Each [`ResourcePool`] is a fixed-capacity, semaphore-backed gate for one
//! kind of work. Stages acquire a [`Permit`] before running and give it back
//! when done; dropping a permit releases it, so every exit path (success,
//! failure, timeout, cancellation) returns capacity to the pool.
//!
//! Waiters are served in FIFO order, as guaranteed by
//! [`tokio::sync::Semaphore`].
//!
//! ```ignore
//! use batchflow::pool::{PoolKind, ResourcePool};
//!
//! let pool = ResourcePool::new(PoolKind::Upload, 3)?;
//! let permit = pool.acquire(Duration::from_secs(30)).await?;
//! // upload...
//! drop(permit);
//! ```

use crate::config::PoolConfig;
use crate::core::StageKind;
use crate::errors::{BatchflowError, StageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// The kinds of pooled resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Concurrently active pipelines.
    Pipeline,
    /// Document download and split.
    Split,
    /// Uploads to the remote service.
    Upload,
    /// Remote evaluations.
    Process,
    /// Remote deletes.
    Cleanup,
}

impl PoolKind {
    /// All pool kinds.
    pub const ALL: [PoolKind; 5] = [
        PoolKind::Pipeline,
        PoolKind::Split,
        PoolKind::Upload,
        PoolKind::Process,
        PoolKind::Cleanup,
    ];

    /// Returns the pool a stage draws its permits from.
    #[must_use]
    pub fn for_stage(stage: StageKind) -> Self {
        match stage {
            StageKind::Split => Self::Split,
            StageKind::Upload => Self::Upload,
            StageKind::Process => Self::Process,
            StageKind::Cleanup => Self::Cleanup,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Pipeline => 0,
            Self::Split => 1,
            Self::Upload => 2,
            Self::Process => 3,
            Self::Cleanup => 4,
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pipeline => "pipeline",
            Self::Split => "split",
            Self::Upload => "upload",
            Self::Process => "process",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct Counters {
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl Counters {
    fn record_acquire(&self) {
        let current = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        let mut peak = self.peak.load(Ordering::Relaxed);
        while current > peak {
            match self
                .peak
                .compare_exchange_weak(peak, current, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }

    fn record_release(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A fixed-capacity pool for one resource kind.
///
/// Cloning is cheap; clones share capacity and counters.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    kind: PoolKind,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl ResourcePool {
    /// Creates a pool. Capacity must be at least 1.
    pub fn new(kind: PoolKind, capacity: usize) -> Result<Self, BatchflowError> {
        if capacity == 0 {
            return Err(BatchflowError::Config(format!(
                "pool '{kind}' must have capacity of at least 1"
            )));
        }
        Ok(Self {
            kind,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Waits up to `timeout` for a permit.
    ///
    /// Fails with a `ResourceExhausted` error if none frees up in time.
    pub async fn acquire(&self, timeout: Duration) -> Result<Permit, StageError> {
        let acquire = self.semaphore.clone().acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => Ok(self.wrap(permit)),
            Ok(Err(_closed)) => Err(StageError::fatal(format!("pool '{}' is closed", self.kind))),
            Err(_elapsed) => Err(StageError::resource_exhausted(self.kind, timeout)),
        }
    }

    /// Takes a permit if one is free right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Permit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.wrap(permit))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> Permit {
        self.counters.record_acquire();
        trace!(pool = %self.kind, in_use = self.in_use(), "permit acquired");
        Permit {
            kind: self.kind,
            permit: Some(permit),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Returns a permit to the pool. Releasing twice is a no-op.
    pub fn release(&self, permit: &mut Permit) {
        permit.release();
    }

    /// Returns the pool kind.
    #[must_use]
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Returns the total capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of permits currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.counters.in_use.load(Ordering::SeqCst)
    }

    /// Returns the number of free permits.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Returns the highest `in_use` observed since creation or the last reset.
    #[must_use]
    pub fn peak_in_use(&self) -> usize {
        self.counters.peak.load(Ordering::Relaxed)
    }

    /// Resets the peak counter to the current usage.
    pub fn reset_peak(&self) {
        self.counters.peak.store(self.in_use(), Ordering::Relaxed);
    }

    /// Returns a point-in-time view of the pool.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            kind: self.kind,
            capacity: self.capacity,
            in_use: self.in_use(),
            peak_in_use: self.peak_in_use(),
        }
    }
}

/// One unit of a pool's capacity.
pub struct Permit {
    kind: PoolKind,
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
}

impl Permit {
    /// Returns the pool kind this permit belongs to.
    #[must_use]
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Returns true until the permit has been released.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }

    /// Gives the capacity back. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.counters.record_release();
            drop(permit);
            trace!(pool = %self.kind, "permit released");
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("kind", &self.kind)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Point-in-time usage of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Pool kind.
    pub kind: PoolKind,
    /// Total capacity.
    pub capacity: usize,
    /// Permits held.
    pub in_use: usize,
    /// Highest usage observed.
    pub peak_in_use: usize,
}

/// One pool per [`PoolKind`].
#[derive(Debug, Clone)]
pub struct ResourcePools {
    pools: [ResourcePool; 5],
}

impl ResourcePools {
    /// Builds every pool from configured capacities.
    pub fn from_config(config: &PoolConfig) -> Result<Self, BatchflowError> {
        Ok(Self {
            pools: [
                ResourcePool::new(PoolKind::Pipeline, config.pipeline)?,
                ResourcePool::new(PoolKind::Split, config.split)?,
                ResourcePool::new(PoolKind::Upload, config.upload)?,
                ResourcePool::new(PoolKind::Process, config.process)?,
                ResourcePool::new(PoolKind::Cleanup, config.cleanup)?,
            ],
        })
    }

    /// Returns the pool for a kind.
    #[must_use]
    pub fn get(&self, kind: PoolKind) -> &ResourcePool {
        &self.pools[kind.index()]
    }

    /// Returns the pool a stage draws from.
    #[must_use]
    pub fn for_stage(&self, stage: StageKind) -> &ResourcePool {
        self.get(PoolKind::for_stage(stage))
    }

    /// Returns a snapshot of every pool.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        self.pools.iter().map(ResourcePool::snapshot).collect()
    }

    /// Returns true if no pool has a permit outstanding.
    #[must_use]
    pub fn all_idle(&self) -> bool {
        self.pools.iter().all(|p| p.in_use() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureClass;
    use futures::future::join_all;

    #[test]
    fn test_zero_capacity_rejected() {
        let err = ResourcePool::new(PoolKind::Upload, 0).unwrap_err();
        assert!(matches!(err, BatchflowError::Config(_)));
    }

    #[tokio::test]
    async fn test_peak_never_exceeds_capacity() {
        let pool = ResourcePool::new(PoolKind::Split, 2).unwrap();

        let tasks = (0..10).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _permit = pool.acquire(Duration::from_secs(5)).await.unwrap();
                assert!(pool.in_use() <= 2);
                tokio::time::sleep(Duration::from_millis(5)).await;
            })
        });
        for result in join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(pool.peak_in_use(), 2);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let pool = ResourcePool::new(PoolKind::Upload, 1).unwrap();
        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.class, FailureClass::ResourceExhausted);
        assert!(err.message.contains("upload"));
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pool = ResourcePool::new(PoolKind::Process, 1).unwrap();
        let mut permit = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(permit.is_held());

        pool.release(&mut permit);
        pool.release(&mut permit);
        permit.release();

        assert!(!permit.is_held());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 1);
        drop(permit);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let pool = ResourcePool::new(PoolKind::Cleanup, 1).unwrap();
        let first = pool.try_acquire();
        assert!(first.is_some());
        assert!(pool.try_acquire().is_none());
        drop(first);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_freed_permit() {
        let pool = ResourcePool::new(PoolKind::Pipeline, 1).unwrap();
        let permit = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|p| p.kind()) })
        };
        tokio::task::yield_now().await;
        drop(permit);

        assert_eq!(waiter.await.unwrap().unwrap(), PoolKind::Pipeline);
    }

    #[test]
    fn test_reset_peak() {
        let pool = ResourcePool::new(PoolKind::Split, 3).unwrap();
        let a = pool.try_acquire();
        let b = pool.try_acquire();
        assert_eq!(pool.peak_in_use(), 2);
        drop(a);
        pool.reset_peak();
        assert_eq!(pool.peak_in_use(), 1);
        drop(b);
        assert_eq!(pool.snapshot().in_use, 0);
    }

    #[test]
    fn test_pools_from_config() {
        let pools = ResourcePools::from_config(&PoolConfig::default()).unwrap();
        assert_eq!(pools.get(PoolKind::Split).capacity(), 2);
        assert_eq!(pools.for_stage(StageKind::Upload).kind(), PoolKind::Upload);
        assert_eq!(pools.snapshot().len(), 5);
        assert!(pools.all_idle());
    }
}
