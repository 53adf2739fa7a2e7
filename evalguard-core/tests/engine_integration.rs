//! Integration tests for the execution engine.
//!
//! These run the full pipeline (JSONL adapter, mock backend, content cache,
//! shard logs) against temporary directories.

use evalguard_core::artifact::RunArtifact;
use evalguard_core::cache::GenerationCache;
use evalguard_core::config::{EngineConfig, RetryConfig, RunSpec};
use evalguard_core::engine::{Engine, ResumeMode, ShardSelection};
use evalguard_core::error::RunError;
use evalguard_core::types::{Example, Payload, RunMetrics, RunStatus};
use evalguard_core::{JsonlBenchmark, MockBackend, compare};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const N: usize = 40;

/// Write `N` examples to `<dir>/test.jsonl`.
fn write_split(dir: &Path) {
    let lines: Vec<String> = (0..N)
        .map(|i| {
            let ex = Example::new(format!("e{i:03}"))
                .with_input("question", Payload::text(format!("question number {i}")))
                .with_ground_truth(format!("answer {i}"))
                .with_metadata("subject", if i % 2 == 0 { "math" } else { "art" });
            serde_json::to_string(&ex).unwrap()
        })
        .collect();
    std::fs::write(dir.join("test.jsonl"), lines.join("\n") + "\n").unwrap();
}

fn spec() -> RunSpec {
    RunSpec::new("bench", "test", "mock:m", "v1")
}

fn engine(data: &Path, runs: &Path, backend: Arc<MockBackend>, cache: Arc<GenerationCache>) -> Engine {
    Engine::new(Arc::new(JsonlBenchmark::new("bench", data)), backend, cache, runs)
        .with_engine_config(EngineConfig {
            num_shards: 4,
            concurrency: 4,
            ..Default::default()
        })
        .with_retry(RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        })
        .with_code_version("test")
}

fn without_timestamp(mut metrics: RunMetrics) -> RunMetrics {
    metrics.computed_at = None;
    metrics
}

#[tokio::test]
async fn test_full_run_completes() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    write_split(data.path());
    let backend = Arc::new(MockBackend::new("m").with_answer("e000", "wrong"));
    let cache = Arc::new(GenerationCache::in_memory(128));

    let outcome = engine(data.path(), runs.path(), backend.clone(), cache)
        .run(&spec())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Complete);
    assert_eq!(outcome.processed, N);
    assert_eq!(backend.calls() as usize, N);
    let metrics = outcome.metrics.unwrap();
    assert_eq!(metrics.total, N);
    assert_eq!(metrics.correct, N - 1);
    assert_eq!(metrics.slices.len(), 2);

    let artifact = RunArtifact::load(&outcome.run_dir).unwrap();
    assert!(artifact.is_complete());
    assert_eq!(artifact.predictions.len(), N);
    assert_eq!(artifact.run_id(), outcome.run_id);
}

#[tokio::test]
async fn test_completed_run_is_not_reexecuted() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    write_split(data.path());
    let backend = Arc::new(MockBackend::new("m"));
    let cache = Arc::new(GenerationCache::in_memory(128));
    let engine = engine(data.path(), runs.path(), backend.clone(), cache);

    let first = engine.run(&spec()).await.unwrap();
    let second = engine.run(&spec()).await.unwrap();
    assert_eq!(second.status, RunStatus::Complete);
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped, N);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(backend.calls() as usize, N);
}

#[tokio::test]
async fn test_partial_shards_then_resume_converges() {
    let data = tempfile::tempdir().unwrap();
    write_split(data.path());
    let backend = Arc::new(MockBackend::new("m").with_answer("e007", "nope"));

    // Reference: one pass.
    let one_pass_dir = tempfile::tempdir().unwrap();
    let one_pass = engine(
        data.path(),
        one_pass_dir.path(),
        backend.clone(),
        Arc::new(GenerationCache::in_memory(128)),
    )
    .run(&spec())
    .await
    .unwrap();

    // Interrupted: only shards 0 and 1 first, then everything.
    let resumed_dir = tempfile::tempdir().unwrap();
    let partial = engine(
        data.path(),
        resumed_dir.path(),
        backend.clone(),
        Arc::new(GenerationCache::in_memory(128)),
    )
    .with_shards(ShardSelection::Only([0, 1].into_iter().collect()))
    .run(&spec())
    .await
    .unwrap();
    assert_eq!(partial.status, RunStatus::Running);
    assert!(partial.metrics.is_none());
    assert!(partial.processed < N);

    let resumed = engine(
        data.path(),
        resumed_dir.path(),
        backend.clone(),
        Arc::new(GenerationCache::in_memory(128)),
    )
    .run(&spec())
    .await
    .unwrap();
    assert_eq!(resumed.status, RunStatus::Complete);
    assert_eq!(resumed.skipped, partial.processed);
    assert_eq!(partial.processed + resumed.processed, N);
    assert_eq!(resumed.run_id, one_pass.run_id);
    assert_eq!(
        without_timestamp(resumed.metrics.unwrap()),
        without_timestamp(one_pass.metrics.unwrap())
    );
}

#[tokio::test]
async fn test_ranks_follow_manifest_shard_count() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    write_split(data.path());
    let backend = Arc::new(MockBackend::new("m"));
    let cache = Arc::new(GenerationCache::in_memory(128));

    // Rank 0 creates the run with 4 shards and runs shards 0 and 2.
    let first = engine(data.path(), runs.path(), backend.clone(), cache.clone())
        .with_shards(ShardSelection::for_rank(0, 2))
        .run(&spec())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Running);

    // Rank 1 is configured for 2 shards but must cover shards 1 and 3 of the
    // existing 4-shard run.
    let second = engine(data.path(), runs.path(), backend.clone(), cache)
        .with_engine_config(EngineConfig {
            num_shards: 2,
            concurrency: 4,
            ..Default::default()
        })
        .with_shards(ShardSelection::for_rank(1, 2))
        .run(&spec())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Complete);
    assert_eq!(first.processed + second.processed, N);
    assert_eq!(second.metrics.unwrap().total, N);
}

#[tokio::test]
async fn test_failures_become_placeholders() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    write_split(data.path());
    let backend = Arc::new(MockBackend::new("m").failing("e003").flaky("e004", 2));
    let cache = Arc::new(GenerationCache::in_memory(128));

    let outcome = engine(data.path(), runs.path(), backend.clone(), cache)
        .run(&spec())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);
    assert_eq!(outcome.failed, 1);
    // Two retried transient failures on e004.
    assert_eq!(backend.calls() as usize, N + 2);

    let artifact = RunArtifact::load(&outcome.run_dir).unwrap();
    let failed = artifact
        .predictions
        .iter()
        .find(|p| p.example_id == "e003")
        .unwrap();
    assert!(failed.is_failed());
    assert_eq!(failed.correct, Some(false));
    let flaky = artifact
        .predictions
        .iter()
        .find(|p| p.example_id == "e004")
        .unwrap();
    assert_eq!(flaky.correct, Some(true));
    assert_eq!(artifact.metrics.failed, 1);
}

#[tokio::test]
async fn test_shared_cache_serves_second_run() {
    let data = tempfile::tempdir().unwrap();
    write_split(data.path());
    let cache_dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("m"));

    let runs_a = tempfile::tempdir().unwrap();
    let cache = Arc::new(GenerationCache::new(128, cache_dir.path()));
    engine(data.path(), runs_a.path(), backend.clone(), cache)
        .run(&spec())
        .await
        .unwrap();

    // A new process: empty memory tier, same disk tier.
    let runs_b = tempfile::tempdir().unwrap();
    let cache = Arc::new(GenerationCache::new(128, cache_dir.path()));
    let second = engine(data.path(), runs_b.path(), backend.clone(), cache.clone())
        .run(&spec())
        .await
        .unwrap();
    assert_eq!(backend.calls() as usize, N);
    assert_eq!(second.cache_hits, N);
    assert_eq!(cache.stats().disk_hits as usize, N);
}

#[tokio::test]
async fn test_changed_prompt_needs_force() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    let run_dir = runs.path().join("pinned");
    write_split(data.path());
    let backend = Arc::new(MockBackend::new("m"));
    let cache = Arc::new(GenerationCache::in_memory(128));

    let base = engine(data.path(), runs.path(), backend.clone(), cache.clone()).with_run_dir(&run_dir);
    let first = base.run(&spec()).await.unwrap();

    let mut changed = spec();
    changed.prompt_version = "v2".to_string();
    let err = base.run(&changed).await.unwrap_err();
    assert!(matches!(err, RunError::ConfigMismatch { .. }));

    let forced = engine(data.path(), runs.path(), backend.clone(), cache.clone())
        .with_run_dir(&run_dir)
        .with_resume_mode(ResumeMode::Force)
        .run(&changed)
        .await
        .unwrap();
    assert_eq!(forced.status, RunStatus::Complete);
    assert_eq!(forced.processed, 0);
    let artifact = RunArtifact::load(&run_dir).unwrap();
    assert_eq!(artifact.manifest.adopted_run_ids, vec![first.run_id]);

    let fresh = engine(data.path(), runs.path(), backend.clone(), cache)
        .with_run_dir(&run_dir)
        .with_resume_mode(ResumeMode::Fresh)
        .run(&changed)
        .await
        .unwrap();
    assert_eq!(fresh.processed, N);
    assert!(RunArtifact::load(&run_dir).unwrap().manifest.adopted_run_ids.is_empty());
}

#[tokio::test]
async fn test_cancelled_run_resumes() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    write_split(data.path());
    let cache = Arc::new(GenerationCache::in_memory(128));

    let token = CancellationToken::new();
    let slow = Arc::new(MockBackend::new("m").with_delay(Duration::from_secs(30)));
    let engine_slow = engine(data.path(), runs.path(), slow, cache.clone()).with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });
    let err = engine_slow.run(&spec()).await.unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(err, RunError::Cancelled));

    let fast = Arc::new(MockBackend::new("m"));
    let outcome = engine(data.path(), runs.path(), fast.clone(), cache)
        .run(&spec())
        .await
        .unwrap();
    // Abandoned flights left nothing pending or cached behind.
    assert_eq!(outcome.status, RunStatus::Complete);
    assert_eq!(fast.calls() as usize, N);
}

#[tokio::test]
async fn test_run_compared_with_itself() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    write_split(data.path());
    let backend = Arc::new(MockBackend::new("m").with_answer("e001", "x"));
    let outcome = engine(data.path(), runs.path(), backend, Arc::new(GenerationCache::in_memory(64)))
        .run(&spec())
        .await
        .unwrap();

    let artifact = RunArtifact::load(&outcome.run_dir).unwrap();
    let result = compare(&artifact, &artifact, &Default::default()).unwrap();
    assert_eq!(result.summary.unchanged, N);
    assert_eq!(result.summary.improved + result.summary.regressed, 0);
    assert_eq!(result.overall.delta, 0.0);
    assert!(result.warnings.is_empty());
}
