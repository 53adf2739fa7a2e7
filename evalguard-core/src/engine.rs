//! Resumable sharded execution engine.
//!
//! A run streams examples from a [`BenchmarkAdapter`], assigns each to a shard
//! by hashing its id, and hands it to the worker owning that shard. Workers
//! resolve generations strictly through the shared [`GenerationCache`], score
//! them, and append one record per example to their shard's log. The cache's
//! single-flight guarantee is the only synchronization between workers.
//!
//! # Resumption
//!
//! On start the engine reads every shard log of the run directory and skips
//! examples that already have a record (including failed placeholders). A run
//! executed in one pass and the same run interrupted and resumed any number of
//! times converge to the same artifact **provided the backend is deterministic
//! for a given cache key**. Generations that were cached are replayed exactly;
//! ones that were not may differ between attempts, in which case the resumed
//! log mixes outputs from different attempts. That is accepted behavior, not
//! something the engine detects.
//!
//! # Failure
//!
//! An example whose backend call fails permanently, exhausts its retries, or
//! whose payload cannot be fingerprinted is recorded as a failed prediction and
//! the shard moves on. The run is marked complete only when every example of
//! the split (across all shards, including those run by other processes) has
//! a record; aggregate metrics are folded from the full log at that point.
//!
//! # Cancellation
//!
//! Cancelling the token abandons in-flight backend calls. Records already
//! appended stay valid and the cache releases any pending entries, so the next
//! invocation resumes cleanly.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{BenchmarkAdapter, GenerationRequest, ModelBackend};
use crate::artifact::{RunDir, RunManifest, ShardWriter};
use crate::cache::GenerationCache;
use crate::config::{EngineConfig, EvalConfig, RetryConfig, RunSpec};
use crate::error::RunError;
use crate::fingerprint::{self, FINGERPRINT_VERSION};
use crate::metrics;
use crate::retry::with_retry;
use crate::types::{DatasetVersion, Example, Prediction, RunMetrics, RunStatus};

const CHANNEL_CAPACITY: usize = 64;

/// What to do with an existing predictions log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Resume when the log belongs to the same run id; refuse otherwise.
    #[default]
    Auto,
    /// Discard any existing log and start over.
    Fresh,
    /// Adopt an existing log even if it was written under another run id.
    /// A fingerprint version mismatch is still fatal.
    Force,
}

impl std::fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResumeMode::Auto => write!(f, "auto"),
            ResumeMode::Fresh => write!(f, "fresh"),
            ResumeMode::Force => write!(f, "force"),
        }
    }
}

impl std::str::FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fresh" => Ok(Self::Fresh),
            "force" => Ok(Self::Force),
            other => Err(format!(
                "unknown resume mode '{other}' (expected auto, fresh or force)"
            )),
        }
    }
}

/// Which shards this process runs.
///
/// Resolved against the shard count of the run's manifest, which wins over
/// the configured count when an existing run is resumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ShardSelection {
    #[default]
    All,
    Only(BTreeSet<u32>),
    /// Every shard `s` with `s % world_size == rank`.
    Rank { rank: u32, world_size: u32 },
}

impl ShardSelection {
    /// Shards owned by `rank` out of `world_size` processes.
    pub fn for_rank(rank: u32, world_size: u32) -> Self {
        if world_size <= 1 {
            return Self::All;
        }
        Self::Rank { rank, world_size }
    }

    /// Read `RANK` and `WORLD_SIZE` from the environment, as set by common
    /// distributed launchers. Missing or invalid values select all shards.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok()?.trim().parse::<u32>().ok();
        match (read("RANK"), read("WORLD_SIZE")) {
            (Some(rank), Some(world)) if rank < world => Self::for_rank(rank, world),
            _ => Self::All,
        }
    }

    pub fn includes(&self, shard: u32) -> bool {
        match self {
            Self::All => true,
            Self::Only(shards) => shards.contains(&shard),
            Self::Rank { rank, world_size } => shard % world_size == *rank,
        }
    }

    fn resolve(&self, num_shards: u32) -> Vec<u32> {
        (0..num_shards).filter(|s| self.includes(*s)).collect()
    }
}

/// Summary of one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    /// Examples processed by this invocation.
    pub processed: usize,
    /// Examples skipped because a record already existed.
    pub skipped: usize,
    /// Failed placeholders written by this invocation.
    pub failed: usize,
    /// Generations served from the cache during this invocation.
    pub cache_hits: usize,
    /// Present once the run is complete.
    pub metrics: Option<RunMetrics>,
}

/// Drives a benchmark adapter and a model backend through the cache.
pub struct Engine {
    adapter: Arc<dyn BenchmarkAdapter>,
    backend: Arc<dyn ModelBackend>,
    cache: Arc<GenerationCache>,
    config: EngineConfig,
    retry: RetryConfig,
    runs_dir: PathBuf,
    run_dir: Option<PathBuf>,
    resume: ResumeMode,
    selection: ShardSelection,
    code_version: String,
    cancel: CancellationToken,
}

struct WorkerContext {
    adapter: Arc<dyn BenchmarkAdapter>,
    backend: Arc<dyn ModelBackend>,
    cache: Arc<GenerationCache>,
    retry: RetryConfig,
    call_timeout: Duration,
    backend_identity: String,
    request: GenerationRequest,
    run_id: String,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct WorkerSummary {
    processed: usize,
    failed: usize,
    cache_hits: usize,
}

struct ProducerSummary {
    expected: HashSet<String>,
    skipped: usize,
}

impl Engine {
    pub fn new(
        adapter: Arc<dyn BenchmarkAdapter>,
        backend: Arc<dyn ModelBackend>,
        cache: Arc<GenerationCache>,
        runs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            adapter,
            backend,
            cache,
            config: EngineConfig::default(),
            retry: RetryConfig::default(),
            runs_dir: runs_dir.into(),
            run_dir: None,
            resume: ResumeMode::Auto,
            selection: ShardSelection::All,
            code_version: fingerprint::code_version(),
            cancel: CancellationToken::new(),
        }
    }

    /// Take the engine and retry sections of a loaded configuration.
    pub fn with_config(mut self, config: &EvalConfig) -> Self {
        self.config = config.engine.clone();
        self.retry = config.retry.clone();
        self
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Write to an explicit directory instead of `<runs_dir>/<run_id>`.
    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(dir.into());
        self
    }

    pub fn with_resume_mode(mut self, mode: ResumeMode) -> Self {
        self.resume = mode;
        self
    }

    pub fn with_shards(mut self, selection: ShardSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_code_version(mut self, code_version: impl Into<String>) -> Self {
        self.code_version = code_version.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &Arc<GenerationCache> {
        &self.cache
    }

    /// Execute (or resume) the run described by `spec`.
    pub async fn run(&self, spec: &RunSpec) -> Result<RunOutcome, RunError> {
        let dataset = self.adapter.dataset_version(&spec.split)?;
        let run_id = spec.run_id(&dataset, &self.code_version);
        let backend_identity = self.backend.identity();
        if backend_identity != spec.backend {
            warn!(
                spec_backend = %spec.backend,
                backend = %backend_identity,
                "Run spec names a different backend than the one configured"
            );
        }

        let run_dir = match &self.run_dir {
            Some(dir) => RunDir::at(dir),
            None => RunDir::new(&self.runs_dir, &run_id),
        };
        let requested_shards = self.config.num_shards.max(1);
        let manifest = match self.prepare(&run_dir, &run_id, spec, &dataset, requested_shards)? {
            Prepared::Ready(m) => m,
            Prepared::AlreadyComplete(m, metrics) => {
                info!(run_id = %run_id, "Run already complete");
                return Ok(RunOutcome {
                    run_id: m.run_id,
                    run_dir: run_dir.root().to_path_buf(),
                    status: RunStatus::Complete,
                    processed: 0,
                    skipped: metrics.total,
                    failed: 0,
                    cache_hits: 0,
                    metrics: Some(metrics),
                });
            }
        };
        let num_shards = manifest.num_shards;
        let completed = run_dir.completed_ids()?;
        let shards = self.selection.resolve(num_shards);

        info!(
            run_id = %run_id,
            dataset = %dataset,
            num_shards,
            shards = ?shards,
            already_completed = completed.len(),
            "Starting run"
        );

        let run_token = self.cancel.child_token();
        let pool = shards.len().min(self.config.concurrency.max(1)).max(1);
        let context = Arc::new(WorkerContext {
            adapter: self.adapter.clone(),
            backend: self.backend.clone(),
            cache: self.cache.clone(),
            retry: self.retry.clone(),
            call_timeout: Duration::from_secs(self.config.call_timeout_secs),
            backend_identity,
            request: GenerationRequest {
                prompt_version: spec.prompt_version.clone(),
                decode_params: spec.decode_params.clone(),
            },
            run_id: run_id.clone(),
            cancel: run_token.clone(),
        });

        let mut senders = Vec::with_capacity(pool);
        let mut workers = JoinSet::new();
        let mut owner: HashMap<u32, usize> = HashMap::new();
        for worker in 0..pool {
            let owned: Vec<u32> = shards
                .iter()
                .enumerate()
                .filter(|(i, _)| i % pool == worker)
                .map(|(_, s)| *s)
                .collect();
            for shard in &owned {
                owner.insert(*shard, worker);
            }
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            senders.push(tx);
            let writers = owned
                .iter()
                .map(|s| -> std::io::Result<(u32, ShardWriter)> {
                    Ok((*s, ShardWriter::open(&run_dir.shard_path(*s))?))
                })
                .collect::<std::io::Result<HashMap<u32, ShardWriter>>>()?;
            workers.spawn(run_worker(context.clone(), rx, writers));
        }

        let producer = {
            let adapter = self.adapter.clone();
            let split = spec.split.clone();
            let limit = spec.limit;
            let token = run_token.clone();
            tokio::task::spawn_blocking(move || {
                produce(adapter, &split, limit, num_shards, &owner, senders, &completed, &token)
            })
        };

        let mut first_error: Option<RunError> = None;
        let mut totals = WorkerSummary::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(summary)) => {
                    totals.processed += summary.processed;
                    totals.failed += summary.failed;
                    totals.cache_hits += summary.cache_hits;
                }
                Ok(Err(e)) => {
                    run_token.cancel();
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    run_token.cancel();
                    first_error.get_or_insert(RunError::Worker {
                        shard: u32::MAX,
                        message: join_err.to_string(),
                    });
                }
            }
        }
        let produced = match producer.await {
            Ok(result) => result,
            Err(join_err) => Err(RunError::Adapter {
                message: format!("example producer failed: {join_err}"),
            }),
        };

        if self.cancel.is_cancelled() {
            info!(run_id = %run_id, processed = totals.processed, "Run cancelled; log left resumable");
            return Err(RunError::Cancelled);
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        let produced = produced?;

        self.finish(run_dir, manifest, produced, totals)
    }

    /// Reconcile the run directory with the requested run before any work.
    fn prepare(
        &self,
        run_dir: &RunDir,
        run_id: &str,
        spec: &RunSpec,
        dataset: &DatasetVersion,
        num_shards: u32,
    ) -> Result<Prepared, RunError> {
        let fresh = || {
            RunManifest::new(
                run_id,
                spec.clone(),
                dataset.clone(),
                self.code_version.clone(),
                num_shards,
            )
        };

        let existing = run_dir.load_manifest()?;
        let manifest = match (existing, self.resume) {
            // Never reset here: another process may already be appending to
            // its shards of the same run.
            (None, _) => fresh(),
            (Some(_), ResumeMode::Fresh) => {
                info!(run_id = %run_id, "Discarding existing predictions log");
                run_dir.reset()?;
                fresh()
            }
            (Some(existing), mode) => {
                if existing.fingerprint_version != FINGERPRINT_VERSION {
                    return Err(RunError::FingerprintVersionMismatch {
                        expected: FINGERPRINT_VERSION,
                        found: existing.fingerprint_version,
                    });
                }
                if existing.run_id == run_id {
                    if existing.is_complete()
                        && let Some(metrics) = run_dir.load_metrics()?
                    {
                        return Ok(Prepared::AlreadyComplete(existing, metrics));
                    }
                    if existing.num_shards != num_shards {
                        debug!(
                            existing = existing.num_shards,
                            requested = num_shards,
                            "Keeping shard count of the existing run"
                        );
                    }
                    existing
                } else if mode == ResumeMode::Force {
                    warn!(
                        previous = %existing.run_id,
                        current = %run_id,
                        "Forcing resume of a predictions log written under a different run id"
                    );
                    let mut adopted = fresh();
                    adopted.num_shards = existing.num_shards;
                    adopted.created_at = existing.created_at;
                    adopted.adopted_run_ids = existing.adopted_run_ids;
                    adopted.adopted_run_ids.push(existing.run_id);
                    adopted
                } else {
                    return Err(RunError::ConfigMismatch {
                        expected: run_id.to_string(),
                        found: existing.run_id,
                    });
                }
            }
        };

        let mut manifest = manifest;
        manifest.status = RunStatus::Running;
        manifest.updated_at = Utc::now();
        run_dir.save_manifest(&manifest)?;
        Ok(Prepared::Ready(manifest))
    }

    fn finish(
        &self,
        run_dir: RunDir,
        mut manifest: RunManifest,
        produced: ProducerSummary,
        totals: WorkerSummary,
    ) -> Result<RunOutcome, RunError> {
        let predictions: Vec<Prediction> = run_dir
            .read_predictions()?
            .into_iter()
            .filter(|p| produced.expected.contains(&p.example_id))
            .collect();
        let missing = produced.expected.len() - predictions.len();

        let metrics = if missing == 0 {
            let mut metrics = metrics::aggregate(&predictions);
            metrics.computed_at = Some(Utc::now());
            run_dir.save_metrics(&metrics)?;
            manifest.status = RunStatus::Complete;
            info!(
                run_id = %manifest.run_id,
                total = metrics.total,
                accuracy = metrics.overall_accuracy,
                failed = metrics.failed,
                "Run complete"
            );
            Some(metrics)
        } else {
            info!(
                run_id = %manifest.run_id,
                missing,
                "Shards of other processes still pending; run left open"
            );
            None
        };
        manifest.updated_at = Utc::now();
        run_dir.save_manifest(&manifest)?;

        Ok(RunOutcome {
            run_id: manifest.run_id,
            run_dir: run_dir.root().to_path_buf(),
            status: manifest.status,
            processed: totals.processed,
            skipped: produced.skipped,
            failed: totals.failed,
            cache_hits: totals.cache_hits,
            metrics,
        })
    }
}

enum Prepared {
    Ready(RunManifest),
    AlreadyComplete(RunManifest, RunMetrics),
}

/// Stream examples to the workers owning their shards. Runs on a blocking
/// thread since adapters may do synchronous IO.
#[allow(clippy::too_many_arguments)]
fn produce(
    adapter: Arc<dyn BenchmarkAdapter>,
    split: &str,
    limit: Option<u64>,
    num_shards: u32,
    owner: &HashMap<u32, usize>,
    senders: Vec<mpsc::Sender<(u32, Example)>>,
    completed: &HashSet<String>,
    cancel: &CancellationToken,
) -> Result<ProducerSummary, RunError> {
    let mut expected = HashSet::new();
    let mut skipped = 0;
    for item in adapter.load(split, limit)? {
        if cancel.is_cancelled() {
            break;
        }
        let example = item?;
        if !expected.insert(example.id.clone()) {
            warn!(example_id = %example.id, "Duplicate example id in split; ignoring repeat");
            continue;
        }
        if completed.contains(&example.id) {
            skipped += 1;
            continue;
        }
        let shard = fingerprint::shard_of(&example.id, num_shards);
        let Some(&worker) = owner.get(&shard) else {
            continue;
        };
        if senders[worker].blocking_send((shard, example)).is_err() {
            // Worker gone: cancelled or failed. Its error surfaces on join.
            break;
        }
    }
    Ok(ProducerSummary { expected, skipped })
}

async fn run_worker(
    ctx: Arc<WorkerContext>,
    mut rx: mpsc::Receiver<(u32, Example)>,
    mut writers: HashMap<u32, ShardWriter>,
) -> Result<WorkerSummary, RunError> {
    let mut summary = WorkerSummary::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            msg = rx.recv() => msg,
        };
        let Some((shard, example)) = next else {
            break;
        };

        let prediction = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            p = process(&ctx, &example, shard) => p,
        };

        let Some(writer) = writers.get_mut(&shard) else {
            return Err(RunError::Worker {
                shard,
                message: "no log writer for shard".to_string(),
            });
        };
        writer.append(&prediction).map_err(|e| RunError::Worker {
            shard,
            message: format!("cannot append to {}: {e}", writer.path().display()),
        })?;

        summary.processed += 1;
        if prediction.is_failed() {
            summary.failed += 1;
        }
        if prediction.cached {
            summary.cache_hits += 1;
        }
    }
    Ok(summary)
}

/// Produce the record for one example. Never fails: errors become failed
/// placeholders.
async fn process(ctx: &WorkerContext, example: &Example, shard: u32) -> Prediction {
    let identity = match fingerprint::identity(example) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(run_id = %ctx.run_id, example_id = %example.id, error = %e, "Cannot fingerprint example");
            return Prediction::failed(example, format!("fingerprint: {e}"), shard);
        }
    };
    let key = fingerprint::cache_key(
        &identity,
        &ctx.backend_identity,
        &ctx.request.prompt_version,
        &ctx.request.decode_params,
    );

    let result = ctx
        .cache
        .compute_or_get(&key, || {
            with_retry(&ctx.retry, ctx.call_timeout, || {
                ctx.backend.generate(example, &ctx.request)
            })
        })
        .await;

    match result {
        Ok(cached) => {
            let score = ctx.adapter.score(example, &cached.value);
            debug!(
                run_id = %ctx.run_id,
                shard,
                example_id = %example.id,
                source = ?cached.source,
                correct = ?score.correct,
                "Example scored"
            );
            Prediction::scored(example, cached.value, score, shard, cached.source.is_hit())
        }
        Err(e) => {
            warn!(run_id = %ctx.run_id, shard, example_id = %example.id, error = %e, "Generation failed");
            Prediction::failed(example, e.to_string(), shard)
        }
    }
}
