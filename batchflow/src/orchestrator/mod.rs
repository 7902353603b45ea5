//! The orchestrator composes pools, the governor, the stage executor and both
//! schedulers behind three entry points:
//!
//! - [`Orchestrator::submit_pipeline`] runs one document through
//!   split, upload, process and cleanup.
//! - [`Orchestrator::submit_batch`] runs many documents in sequential batches.
//! - [`Orchestrator::submit_dependency_graph`] resolves chained prompts.
//!
//! Every submitted item or node yields exactly one result.

mod collaborators;
mod evaluator;
mod item;

pub use collaborators::{
    BlobHandle, BlobStore, DocumentSplitter, GenerationOutput, GenerativeService, RemoteFileRef,
    SectionRange, SplitSection,
};
pub use evaluator::GenerativeEvaluator;
pub use item::{
    section_file_name, section_instructions, section_number, PipelineContext, PipelineItem,
    PipelineShape, SectionOutput,
};

use crate::batch::{BatchReport, BatchScheduler};
use crate::cancellation::{CancellationToken, CleanupScope};
use crate::config::OrchestratorConfig;
use crate::core::{FailureRecord, ItemResult, NodeResult, StageKind};
use crate::dependency::{DependencyNode, DependencyScheduler};
use crate::errors::{BatchflowError, FailureClass, StageError};
use crate::events::{self, EventSink};
use crate::executor::{StageExecutor, StageRequest};
use crate::memory::MemoryGovernor;
use crate::observability::SpanTimer;
use crate::pool::PoolKind;
use crate::retry::RetryPolicy;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// The external services a pipeline uses.
#[derive(Clone)]
pub struct Collaborators {
    /// Source document storage.
    pub blobs: Arc<dyn BlobStore>,
    /// Remote generative service.
    pub generative: Arc<dyn GenerativeService>,
    /// Document splitter.
    pub splitter: Arc<dyn DocumentSplitter>,
}

impl Collaborators {
    /// Bundles collaborators.
    #[must_use]
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        generative: Arc<dyn GenerativeService>,
        splitter: Arc<dyn DocumentSplitter>,
    ) -> Self {
        Self {
            blobs,
            generative,
            splitter,
        }
    }
}

/// One shared remote file, resolved at most once per name.
type SharedFileSlot = Arc<Mutex<Option<RemoteFileRef>>>;

/// Runs pipelines, batches and dependency graphs under one configuration.
///
/// Cloning is cheap; clones share pools, the shared-file cache and the event
/// sink.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    collaborators: Collaborators,
    executor: StageExecutor,
    shared_files: Arc<parking_lot::Mutex<HashMap<String, SharedFileSlot>>>,
}

impl Orchestrator {
    /// Validates `config` and builds every pool from it.
    pub fn new(
        config: Arc<OrchestratorConfig>,
        collaborators: Collaborators,
    ) -> Result<Self, BatchflowError> {
        config.validate()?;
        let executor = StageExecutor::from_config(&config)?;
        info!(
            pipeline_slots = config.pools.pipeline,
            split_slots = config.pools.split,
            upload_slots = config.pools.upload,
            process_slots = config.pools.process,
            cleanup_slots = config.pools.cleanup,
            "orchestrator ready"
        );
        Ok(Self {
            config,
            collaborators,
            executor,
            shared_files: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        })
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_event_sink(sink);
        self
    }

    /// Replaces the memory governor.
    #[must_use]
    pub fn with_governor(mut self, governor: MemoryGovernor) -> Self {
        self.executor = self.executor.with_governor(governor);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<OrchestratorConfig> {
        &self.config
    }

    /// Returns the stage executor, and through it the pools.
    #[must_use]
    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    fn sink(&self) -> &Arc<dyn EventSink> {
        self.executor.sink()
    }

    /// Runs one item through the pipeline.
    pub async fn submit_pipeline(&self, item: PipelineItem) -> ItemResult<Vec<SectionOutput>> {
        self.submit_pipeline_with_cancellation(item, CancellationToken::new())
            .await
    }

    /// Runs one item through the pipeline, aborting if `token` is cancelled.
    ///
    /// Uploaded files are deleted even when the run is cancelled or fails.
    pub async fn submit_pipeline_with_cancellation(
        &self,
        item: PipelineItem,
        token: Arc<CancellationToken>,
    ) -> ItemResult<Vec<SectionOutput>> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline", item = %item.id, run_id = %run_id);
        async {
            let timer = SpanTimer::start(format!("pipeline:{}", item.id));
            let mut ctx = PipelineContext::new(&item.id);
            ctx.cancellation = token;

            let result = self.run_pipeline(&item, &mut ctx).await;
            ctx.release();

            let duration_ms = timer.elapsed_ms();
            let result = match result {
                Ok(sections) => {
                    info!(sections = sections.len(), duration_ms, "pipeline completed");
                    ItemResult::success(&item.id, sections, duration_ms)
                }
                Err(record) => {
                    warn!(class = %record.class, error = %record.error, duration_ms, "pipeline failed");
                    ItemResult::failure(&item.id, record, duration_ms)
                }
            };
            self.sink().try_emit(
                events::PIPELINE_COMPLETED,
                Some(json!({
                    "item": item.id,
                    "run_id": run_id.to_string(),
                    "success": result.success,
                    "duration_ms": duration_ms,
                })),
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn run_pipeline(
        &self,
        item: &PipelineItem,
        ctx: &mut PipelineContext,
    ) -> Result<Vec<SectionOutput>, FailureRecord> {
        let record = |e: StageError| FailureRecord::new(&item.id, &e);

        let _slot = self
            .executor
            .pools()
            .get(PoolKind::Pipeline)
            .acquire(self.config.timeouts.acquire())
            .await
            .map_err(record)?;

        self.executor.governor().throttle().await;

        let cleanup = CleanupScope::new(
            format!("pipeline:{}", item.id),
            self.config.timeouts.for_stage(StageKind::Cleanup) + self.config.timeouts.acquire(),
        );

        let outcome = match &item.shape {
            PipelineShape::PerItemUpload => self.run_per_item(item, ctx, &cleanup).await,
            PipelineShape::SharedRemoteFile { .. } => self.run_shared(item, ctx).await,
        };

        let report = cleanup.run_all().await;
        for (name, error) in &report.failed {
            self.sink().try_emit(
                events::CLEANUP_FAILED,
                Some(json!({"item": item.id, "file": name, "error": error})),
            );
        }
        outcome
    }

    async fn run_per_item(
        &self,
        item: &PipelineItem,
        ctx: &mut PipelineContext,
        cleanup: &CleanupScope,
    ) -> Result<Vec<SectionOutput>, FailureRecord> {
        let split = self
            .executor
            .run(&self.request(StageKind::Split, item, ctx), |_| {
                let blobs = Arc::clone(&self.collaborators.blobs);
                let splitter = Arc::clone(&self.collaborators.splitter);
                let source_id = item.source_id.clone();
                let ranges = item.sections.clone();
                async move {
                    let bytes = blobs.download(&source_id).await?;
                    splitter.split_by_ranges(&bytes, &ranges).await
                }
            })
            .await
            .map_err(|f| f.to_record(&item.id))?;
        ctx.sections = split.value;

        if ctx.sections.is_empty() {
            let error = StageError::fatal("no sections could be split from the source")
                .with_stage(StageKind::Split);
            return Err(FailureRecord::new(&item.id, &error));
        }
        debug!(sections = ctx.sections.len(), buffered = ctx.buffered_bytes(), "source split");

        let uploads = ctx.sections.iter().enumerate().map(|(index, section)| {
            let request = self.request(StageKind::Upload, item, ctx);
            let name = section_file_name(&item.id, index, &section.bytes);
            async move {
                let result = self
                    .executor
                    .run(&request, |_| {
                        let generative = Arc::clone(&self.collaborators.generative);
                        let bytes = section.bytes.clone();
                        let name = name.clone();
                        async move { generative.upload_file(bytes, &name).await }
                    })
                    .await;
                if let Ok(uploaded) = &result {
                    self.register_delete(cleanup, &item.id, uploaded.value.clone());
                }
                (section.range.clone(), result)
            }
        });
        let uploaded = join_all(uploads).await;
        // Section buffers are no longer needed once every upload has settled.
        ctx.sections.clear();

        let mut targets = Vec::with_capacity(uploaded.len());
        for (range, result) in uploaded {
            match result {
                Ok(outcome) => {
                    ctx.uploaded.push((range.clone(), outcome.value.clone()));
                    targets.push((range, Ok(outcome.value)));
                }
                Err(failure) => targets.push((range, Err(failure.to_record(&item.id)))),
            }
        }

        let sections = self.process_sections(item, ctx, targets).await;
        settle(item, sections)
    }

    async fn run_shared(
        &self,
        item: &PipelineItem,
        ctx: &mut PipelineContext,
    ) -> Result<Vec<SectionOutput>, FailureRecord> {
        let Some(remote_name) = item.shared_remote_name() else {
            return Err(FailureRecord::new(
                &item.id,
                &StageError::fatal("item has no shared remote file"),
            ));
        };

        let file = self.resolve_shared_file(item, ctx, &remote_name).await?;
        ctx.shared_file = Some(file.clone());

        let targets = item
            .sections
            .iter()
            .map(|range| (range.clone(), Ok(file.clone())))
            .collect();
        let sections = self.process_sections(item, ctx, targets).await;
        settle(item, sections)
    }

    /// Finds the shared file by name or uploads the whole source once.
    ///
    /// Items resolving the same name wait for each other; different names
    /// resolve independently.
    async fn resolve_shared_file(
        &self,
        item: &PipelineItem,
        ctx: &mut PipelineContext,
        remote_name: &str,
    ) -> Result<RemoteFileRef, FailureRecord> {
        let slot = Arc::clone(
            self.shared_files
                .lock()
                .entry(remote_name.to_string())
                .or_default(),
        );
        let mut cached = slot.lock().await;
        if let Some(file) = cached.as_ref() {
            return Ok(file.clone());
        }

        let listed = self
            .executor
            .run(&self.request(StageKind::Upload, item, ctx), |_| {
                let generative = Arc::clone(&self.collaborators.generative);
                async move { generative.list_files().await }
            })
            .await
            .map_err(|f| f.to_record(&item.id))?;

        let file = if let Some(existing) = listed.value.into_iter().find(|f| f.name == remote_name) {
            info!(remote = %remote_name, "reusing existing remote file");
            existing
        } else {
            let downloaded = self
                .executor
                .run(&self.request(StageKind::Split, item, ctx), |_| {
                    let blobs = Arc::clone(&self.collaborators.blobs);
                    let source_id = item.source_id.clone();
                    async move { blobs.download(&source_id).await }
                })
                .await
                .map_err(|f| f.to_record(&item.id))?;
            ctx.source = Some(downloaded.value);

            let request = self.request(StageKind::Upload, item, ctx);
            let source = ctx.source.as_deref().unwrap_or_default();
            let uploaded = self
                .executor
                .run(&request, |_| {
                    let generative = Arc::clone(&self.collaborators.generative);
                    let bytes = source.to_vec();
                    let name = remote_name.to_string();
                    async move { generative.upload_file(bytes, &name).await }
                })
                .await;
            ctx.source = None;
            let uploaded = uploaded.map_err(|f| f.to_record(&item.id))?;
            info!(remote = %uploaded.value.name, "uploaded shared remote file");
            uploaded.value
        };

        *cached = Some(file.clone());
        Ok(file)
    }

    /// Generates every section whose file is available. Sections that could
    /// not be uploaded pass through as failures. Output follows input order.
    async fn process_sections(
        &self,
        item: &PipelineItem,
        ctx: &PipelineContext,
        targets: Vec<(SectionRange, Result<RemoteFileRef, FailureRecord>)>,
    ) -> Vec<SectionOutput> {
        let runs = targets.into_iter().map(|(range, file)| {
            let request = self.request(StageKind::Process, item, ctx);
            let instructions = section_instructions(&range, &item.instructions);
            async move {
                let file = match file {
                    Ok(file) => file,
                    Err(record) => return SectionOutput::failed(range, record),
                };
                let section_name = range.name.clone();
                let result = self
                    .executor
                    .run(&request, |_| {
                        let generative = Arc::clone(&self.collaborators.generative);
                        let file = file.clone();
                        let instructions = instructions.clone();
                        let section_name = section_name.clone();
                        async move {
                            let output = generative.generate(Some(&file), &instructions).await?;
                            if output.is_empty() {
                                return Err(StageError::fatal(format!(
                                    "empty response for section '{section_name}'"
                                )));
                            }
                            Ok(output.into_text())
                        }
                    })
                    .await;
                match result {
                    Ok(outcome) => SectionOutput::done(range, outcome.value),
                    Err(failure) => SectionOutput::failed(range, failure.to_record(&item.id)),
                }
            }
        });
        join_all(runs).await
    }

    fn register_delete(&self, cleanup: &CleanupScope, item_id: &str, file: RemoteFileRef) {
        let executor = self.executor.clone();
        let generative = Arc::clone(&self.collaborators.generative);
        let request = StageRequest::new(
            StageKind::Cleanup,
            format!("{item_id}:{}", file.name),
            self.config.timeouts.for_stage(StageKind::Cleanup),
        )
        .with_policy(RetryPolicy::no_retry());

        cleanup.register(file.name.clone(), move || async move {
            executor
                .run_once(&request, generative.delete_file(&file))
                .await
                .map(|_| ())
                .map_err(|failure| failure.error)
        });
    }

    fn request(&self, stage: StageKind, item: &PipelineItem, ctx: &PipelineContext) -> StageRequest {
        StageRequest::new(stage, &item.id, self.config.timeouts.for_stage(stage))
            .with_policy(self.config.retry.policy())
            .with_cancellation(Arc::clone(&ctx.cancellation))
    }

    /// Runs items in batches of `batch_size`, pausing `delay` between batches.
    ///
    /// Results are in submission order.
    pub async fn submit_batch(
        &self,
        items: Vec<PipelineItem>,
        batch_size: usize,
        delay: Duration,
    ) -> Result<Vec<ItemResult<Vec<SectionOutput>>>, BatchflowError> {
        Ok(self
            .submit_batch_with_summary(items, batch_size, delay)
            .await?
            .results)
    }

    /// Like [`Orchestrator::submit_batch`], also returning the batch summary.
    pub async fn submit_batch_with_summary(
        &self,
        items: Vec<PipelineItem>,
        batch_size: usize,
        delay: Duration,
    ) -> Result<BatchReport<Vec<SectionOutput>>, BatchflowError> {
        let scheduler =
            BatchScheduler::new(batch_size, delay)?.with_event_sink(Arc::clone(self.sink()));
        let this = self.clone();
        Ok(scheduler
            .run(items, move |item| {
                let this = this.clone();
                async move { this.submit_pipeline(item).await }
            })
            .await)
    }

    /// Runs items with the configured batch size and delay.
    pub async fn submit_configured_batch(
        &self,
        items: Vec<PipelineItem>,
    ) -> Result<BatchReport<Vec<SectionOutput>>, BatchflowError> {
        let batch = &self.config.batch;
        self.submit_batch_with_summary(items, batch.batch_size, batch.inter_batch_delay())
            .await
    }

    /// Resolves a dependency graph of prompt nodes.
    pub async fn submit_dependency_graph(
        &self,
        nodes: Vec<DependencyNode>,
    ) -> Result<Vec<NodeResult>, BatchflowError> {
        self.submit_dependency_graph_with_files(nodes, HashMap::new())
            .await
    }

    /// Resolves a dependency graph, grounding multimodal nodes in the remote
    /// file attached to their group.
    pub async fn submit_dependency_graph_with_files(
        &self,
        nodes: Vec<DependencyNode>,
        files: HashMap<String, RemoteFileRef>,
    ) -> Result<Vec<NodeResult>, BatchflowError> {
        let evaluator =
            GenerativeEvaluator::new(Arc::clone(&self.collaborators.generative)).with_files(files);
        let scheduler = DependencyScheduler::new(
            self.executor.clone(),
            Arc::new(evaluator),
            self.config.retry.clone(),
            self.config.timeouts.for_stage(StageKind::Process),
        );
        let span = info_span!("dependency_graph", nodes = nodes.len());
        Ok(scheduler.run(nodes).instrument(span).await?)
    }
}

/// Turns section outcomes into the item outcome.
///
/// The item keeps partial results unless it was cancelled or no section
/// produced output.
fn settle(item: &PipelineItem, sections: Vec<SectionOutput>) -> Result<Vec<SectionOutput>, FailureRecord> {
    let mut failures = sections.iter().filter_map(|s| s.error.as_ref());
    if let Some(cancelled) = failures.clone().find(|e| e.class == FailureClass::Cancelled) {
        return Err(cancelled.clone());
    }
    let failed = failures.clone().count();
    if failed > 0 && failed == sections.len() {
        if let Some(first) = failures.next() {
            return Err(first.clone());
        }
    }
    if failed > 0 {
        warn!(item = %item.id, failed, total = sections.len(), "some sections failed");
    }
    Ok(sections)
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}
