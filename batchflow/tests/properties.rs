//! End-to-end checks of the scheduling guarantees through the public API.

use batchflow::config::{MemoryConfig, PoolConfig};
use batchflow::events;
use batchflow::memory::FixedMemoryProbe;
use batchflow::prelude::*;
use batchflow::testing::{FakeBlobStore, FakeGenerativeService, FakeSplitter, ScriptedEvaluator};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

fn idle_governor() -> MemoryGovernor {
    MemoryGovernor::with_probe(&MemoryConfig::default(), Arc::new(FixedMemoryProbe::new(0)))
}

fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.jitter = false;
    config.retry.backoff_base_seconds = 0.01;
    config
}

struct Setup {
    orchestrator: Orchestrator,
    generative: Arc<FakeGenerativeService>,
    sink: Arc<CollectingEventSink>,
}

fn setup(config: OrchestratorConfig) -> Setup {
    let blobs = Arc::new(FakeBlobStore::new());
    for i in 0..16 {
        blobs.insert(format!("blob-{i}"), format!("document {i} body text").into_bytes());
    }
    let generative = Arc::new(FakeGenerativeService::new());
    let sink = Arc::new(CollectingEventSink::new());
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        Collaborators::new(blobs, generative.clone(), Arc::new(FakeSplitter::new())),
    )
    .unwrap()
    .with_governor(idle_governor())
    .with_event_sink(sink.clone());
    Setup {
        orchestrator,
        generative,
        sink,
    }
}

fn document(i: usize) -> PipelineItem {
    PipelineItem::new(format!("doc-{i}"), format!("blob-{i}"), format!("Extract facts of doc-{i}."))
        .section("Section 1", "1-2")
}

fn executor(pools: &PoolConfig) -> StageExecutor {
    StageExecutor::new(
        ResourcePools::from_config(pools).unwrap(),
        idle_governor(),
        Duration::from_secs(600),
    )
}

#[tokio::test(start_paused = true)]
async fn pool_never_exceeds_capacity() {
    let pool = ResourcePool::new(PoolKind::Upload, 2).unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _permit = pool.acquire(Duration::from_secs(60)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(pool.peak_in_use(), 2);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test(start_paused = true)]
async fn process_pool_bounds_remote_calls() {
    let config = test_config().with_pool_capacity(PoolKind::Process, 2);
    let s = setup(config);
    s.generative.set_generate_delay(Duration::from_millis(50));

    let mut item = PipelineItem::new("big", "blob-0", "Summarise.");
    for i in 0..8 {
        item = item.section(format!("Part {i}"), format!("{i}"));
    }
    let result = s.orchestrator.submit_pipeline(item).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(s.generative.peak_in_flight(), 2);
    assert_eq!(
        s.orchestrator.executor().pools().get(PoolKind::Process).peak_in_use(),
        2
    );
}

#[test]
fn governor_delays_follow_thresholds() {
    let probe = FixedMemoryProbe::new(500);
    let governor = MemoryGovernor::with_probe(&MemoryConfig::default(), Arc::new(probe.clone()));

    assert_eq!(governor.decide(&governor.sample()), Duration::ZERO);
    probe.set(800);
    assert_eq!(governor.decide(&governor.sample()), Duration::from_secs(1));
    probe.set(1100);
    assert_eq!(governor.decide(&governor.sample()), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn batches_run_in_order_with_delay() {
    let s = setup(test_config());
    let items: Vec<_> = (0..12).map(document).collect();
    let start = Instant::now();

    let report = s
        .orchestrator
        .submit_batch_with_summary(items, 5, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(report.summary.batch_sizes, vec![5, 5, 2]);
    let ids: Vec<_> = report.results.iter().map(|r| r.item_id.clone()).collect();
    let expected: Vec<_> = (0..12).map(|i| format!("doc-{i}")).collect();
    assert_eq!(ids, expected);
    assert!(start.elapsed() >= Duration::from_secs(4));
    assert_eq!(s.sink.count(events::BATCH_COMPLETED), 3);
    assert_eq!(s.sink.count(events::PIPELINE_COMPLETED), 12);
}

#[tokio::test(start_paused = true)]
async fn failure_is_isolated_to_its_item() {
    let s = setup(test_config());
    s.generative
        .fail_generate_times("doc-2", StageError::fatal("unreadable section"), 1);

    let results = s
        .orchestrator
        .submit_batch((1..=3).map(document).collect(), 3, Duration::ZERO)
        .await
        .unwrap();

    let success: Vec<bool> = results.iter().map(|r| r.success).collect();
    assert_eq!(success, vec![true, false, true]);
    assert_eq!(results[1].failure_class(), Some(FailureClass::Fatal));
    assert!(s.generative.remote_files().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dependency_chain_runs_in_order() {
    let s = setup(test_config());
    let results = s
        .orchestrator
        .submit_dependency_graph(vec![
            DependencyNode::new("doc-1", "c", "C").depends_on("b"),
            DependencyNode::new("doc-1", "b", "B").depends_on("a"),
            DependencyNode::new("doc-1", "a", "A"),
        ])
        .await
        .unwrap();

    assert!(results.iter().all(NodeResult::is_success));
    let templates: Vec<String> = s
        .generative
        .generate_calls()
        .into_iter()
        .map(|(_, prompt)| prompt.lines().next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(templates, vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn data_not_ready_budget_is_bounded() {
    let settings = RetrySettings {
        jitter: false,
        ..RetrySettings::default()
    };
    let max = settings.max_data_dependency_retries;
    let evaluator = Arc::new(ScriptedEvaluator::new());
    evaluator.fail_times("g/a", StageError::data_not_ready("input missing"), 100);
    let scheduler = DependencyScheduler::new(
        executor(&PoolConfig::default()),
        evaluator.clone(),
        settings,
        Duration::from_secs(30),
    );

    let results = scheduler
        .run(vec![DependencyNode::new("g", "a", "A")])
        .await
        .unwrap();

    assert_eq!(results[0].status, NodeStatus::Failed);
    assert_eq!(results[0].data_attempts, max + 1);
    assert_eq!(evaluator.calls("g/a"), max as usize + 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_node_waits_full_cooldown() {
    let settings = RetrySettings {
        jitter: false,
        retry_cooldown_seconds: 45.0,
        ..RetrySettings::default()
    };
    let evaluator = Arc::new(ScriptedEvaluator::new());
    evaluator.fail_times("g/a", StageError::rate_limited("429"), 2);
    let scheduler = DependencyScheduler::new(
        executor(&PoolConfig::default()),
        evaluator.clone(),
        settings,
        Duration::from_secs(30),
    );

    let results = scheduler
        .run(vec![DependencyNode::new("g", "a", "A")])
        .await
        .unwrap();

    assert!(results[0].is_success());
    let times = evaluator.call_times("g/a");
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(45));
    }
}

#[tokio::test(start_paused = true)]
async fn timeouts_do_not_leak_permits() {
    let pools = PoolConfig {
        process: 2,
        ..PoolConfig::default()
    };
    let exec = executor(&pools);
    let request = StageRequest::new(StageKind::Process, "slow", Duration::from_millis(20))
        .with_policy(RetryPolicy::no_retry());

    for _ in 0..25 {
        let failure = exec
            .run(&request, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StageError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(failure.error.class, FailureClass::Timeout);
    }

    assert_eq!(exec.pools().get(PoolKind::Process).in_use(), 0);
    assert!(exec.pools().all_idle());
}

#[tokio::test(start_paused = true)]
async fn every_node_yields_one_result() {
    let evaluator = Arc::new(ScriptedEvaluator::new());
    evaluator.fail_times("g2/root", StageError::fatal("bad prompt"), 1);
    let scheduler = DependencyScheduler::new(
        executor(&PoolConfig::default()),
        evaluator,
        RetrySettings::default(),
        Duration::from_secs(30),
    );

    let nodes = vec![
        DependencyNode::new("g1", "root", "R"),
        DependencyNode::new("g1", "leaf", "L").depends_on("root"),
        DependencyNode::new("g2", "root", "R"),
        DependencyNode::new("g2", "leaf", "L").depends_on("root"),
        DependencyNode::new("g3", "loop-a", "X").depends_on("loop-b"),
        DependencyNode::new("g3", "loop-b", "Y").depends_on("loop-a"),
    ];
    let results = scheduler.run(nodes).await.unwrap();

    let keys: Vec<_> = results.iter().map(NodeResult::key).collect();
    assert_eq!(
        keys,
        vec!["g1/root", "g1/leaf", "g2/root", "g2/leaf", "g3/loop-a", "g3/loop-b"]
    );
    let done: Vec<bool> = results.iter().map(NodeResult::is_success).collect();
    assert_eq!(done, vec![true, true, false, false, false, false]);
}
