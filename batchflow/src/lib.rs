//! # Batchflow
//!
//! Resource-bounded orchestration of document work against a remote
//! generative service.
//!
//! Batchflow provides:
//!
//! - **Resource pools**: fixed-capacity permits per expensive operation
//! - **Memory-pressure throttling**: admission delays as resident memory grows
//! - **Per-stage execution**: deadlines, per-class retry budgets and backoff
//! - **Batch scheduling**: sequential batches of concurrent items
//! - **Dependency scheduling**: chained prompts with data-not-ready and
//!   rate-limit retry queues
//! - **Guaranteed cleanup**: remote files are deleted on every exit path
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use batchflow::prelude::*;
//!
//! let config = Arc::new(OrchestratorConfig::from_env()?);
//! let orchestrator = Orchestrator::new(config, Collaborators::new(blobs, generative, splitter))?;
//!
//! let item = PipelineItem::new("doc-1", "blob-42", "List the key figures.")
//!     .section("Section 1", "1-4");
//! let result = orchestrator.submit_pipeline(item).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod dependency;
pub mod errors;
pub mod events;
pub mod executor;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod pool;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchItem, BatchReport, BatchScheduler, BatchSummary};
    pub use crate::cancellation::{CancellationToken, CleanupScope};
    pub use crate::config::{
        BatchConfig, MemoryConfig, OrchestratorConfig, PoolConfig, RetrySettings, StageTimeouts,
    };
    pub use crate::core::{FailureRecord, ItemResult, NodeResult, NodeStatus, StageKind};
    pub use crate::dependency::{DependencyNode, DependencyScheduler, NodeEvaluator, NodeInput};
    pub use crate::errors::{BatchflowError, FailureClass, GraphValidationError, StageError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{StageExecutor, StageRequest};
    pub use crate::memory::MemoryGovernor;
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{
        BlobStore, Collaborators, DocumentSplitter, GenerationOutput, GenerativeService,
        Orchestrator, PipelineItem, PipelineShape, RemoteFileRef, SectionOutput, SectionRange,
    };
    pub use crate::pool::{PoolKind, ResourcePool, ResourcePools};
    pub use crate::retry::RetryPolicy;
    pub use std::sync::Arc;
}
