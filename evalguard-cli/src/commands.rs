//! CLI subcommand handlers.
//!
//! Each handler returns the process exit code; errors that abort a command
//! propagate as `anyhow::Error`.

use crate::Commands;
use crate::ConfigAction;
use crate::RunArgs;
use evalguard_core::config::{self, EvalConfig};
use evalguard_core::contamination::{ContaminationScanner, load_manifest, read_records};
use evalguard_core::{
    Engine, GenerationCache, Options, RunArtifact, RunError, RunSpec, ShardSelection, compare,
    default_backends, default_benchmarks, evaluate_gates, persistence, slices,
};
use evalguard_core::types::Example;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code of a run interrupted with Ctrl-C.
const EXIT_CANCELLED: i32 = 130;
/// Exit code when at least one regression gate fails.
const EXIT_GATE_FAILED: i32 = 1;
/// Exit code when the run directory holds a log of a different run.
const EXIT_CONFIG_MISMATCH: i32 = 2;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<i32> {
    match command {
        Commands::Run(args) => handle_run(args, workspace).await,
        Commands::Compare {
            baseline,
            candidate,
            resamples,
            out,
        } => handle_compare(&baseline, &candidate, resamples, out.as_deref(), workspace),
        Commands::Slices {
            run_dir,
            top_k,
            depth,
            min_support,
        } => handle_slices(&run_dir, top_k, depth, min_support, workspace),
        Commands::Scan {
            examples,
            manifest,
            out,
        } => handle_scan(&examples, &manifest, out.as_deref(), workspace),
        Commands::Config { action } => handle_config(action, workspace).map(|()| 0),
    }
}

fn load(workspace: &Path) -> anyhow::Result<EvalConfig> {
    let config = config::load_config(Some(workspace), None)?;
    for warning in config.validate() {
        warn!("{warning}");
    }
    Ok(config)
}

async fn handle_run(args: RunArgs, workspace: &Path) -> anyhow::Result<i32> {
    let mut config = load(workspace)?;
    if let Some(shards) = args.shards {
        config.engine.num_shards = shards;
    }

    let mut adapter_options = Options::new();
    adapter_options.insert(
        "data_dir".to_string(),
        json!(args.data.to_string_lossy()),
    );
    let adapter = default_benchmarks().create(&args.benchmark, &adapter_options)?;

    let mut backend_options = Options::new();
    backend_options.insert("model".to_string(), json!(args.model));
    backend_options.insert("name".to_string(), json!(args.model));
    let backend = default_backends().create(&args.backend, &backend_options)?;

    let capacity = config.cache.memory_capacity;
    let cache = if config.cache.memory_only {
        GenerationCache::in_memory(capacity)
    } else {
        GenerationCache::new(capacity, config.cache_dir(workspace))
    };
    let cache = Arc::new(cache);

    let mut spec = RunSpec::new(
        adapter.name(),
        &args.split,
        backend.identity(),
        &args.prompt_version,
    );
    if let Some(limit) = args.limit {
        spec = spec.with_limit(limit);
    }
    for (name, value) in args.params {
        spec = spec.with_decode_param(name, value);
    }

    let mut engine = Engine::new(adapter, backend, cache.clone(), config.runs_dir(workspace))
        .with_config(&config)
        .with_resume_mode(args.resume)
        .with_shards(ShardSelection::from_env());
    if let Some(run_dir) = &args.run_dir {
        engine = engine.with_run_dir(run_dir);
    }

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });

    let outcome = match engine.run(&spec).await {
        Ok(outcome) => outcome,
        Err(RunError::Cancelled) => {
            eprintln!("Run cancelled. Re-run the same command to resume.");
            return Ok(EXIT_CANCELLED);
        }
        Err(e @ RunError::ConfigMismatch { .. }) => {
            eprintln!("{e}");
            eprintln!("Pass --resume fresh to discard the log or --resume force to adopt it.");
            return Ok(EXIT_CONFIG_MISMATCH);
        }
        Err(e) => return Err(e.into()),
    };

    let stats = cache.stats();
    info!(
        memory_hits = stats.memory_hits,
        disk_hits = stats.disk_hits,
        shared = stats.shared,
        computations = stats.computations,
        corruptions = stats.corruptions,
        hit_rate = stats.hit_rate(),
        "Cache statistics"
    );

    println!("Run {} ({:?})", outcome.run_id, outcome.status);
    println!("  directory: {}", outcome.run_dir.display());
    println!(
        "  processed: {}  skipped: {}  failed: {}  cache hits: {}",
        outcome.processed, outcome.skipped, outcome.failed, outcome.cache_hits
    );
    match &outcome.metrics {
        Some(metrics) => {
            println!(
                "  accuracy: {:.4} ({}/{} scored, {} failed)",
                metrics.overall_accuracy, metrics.correct, metrics.scored, metrics.failed
            );
            for slice in &metrics.slices {
                println!(
                    "    {}={}: {:.4} (n={})",
                    slice.feature, slice.value, slice.accuracy, slice.count
                );
            }
        }
        None => println!("  shards still pending in other processes; metrics not computed yet"),
    }
    Ok(0)
}

fn handle_compare(
    baseline: &Path,
    candidate: &Path,
    resamples: Option<usize>,
    out: Option<&Path>,
    workspace: &Path,
) -> anyhow::Result<i32> {
    let config = load(workspace)?;
    let mut compare_config = config.compare.clone();
    if let Some(resamples) = resamples {
        compare_config.resamples = resamples;
    }

    let baseline = RunArtifact::load(baseline)?;
    let candidate = RunArtifact::load(candidate)?;
    let result = compare(&baseline, &candidate, &compare_config)?;

    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    if let Some(drift) = &result.prompt_drift {
        println!("Prompt drift: {} -> {}", drift.baseline, drift.candidate);
    }

    let s = &result.summary;
    println!(
        "{} -> {}: {} improved, {} regressed, {} unchanged ({} only in baseline, {} only in candidate)",
        result.baseline_run_id,
        result.candidate_run_id,
        s.improved,
        s.regressed,
        s.unchanged,
        s.only_in_baseline,
        s.only_in_candidate
    );
    let overall = &result.overall;
    print!(
        "overall: {:.4} -> {:.4} (delta {:+.4}",
        overall.baseline_accuracy, overall.candidate_accuracy, overall.delta
    );
    if let Some(ci) = &overall.ci {
        print!(", {:.0}% CI [{:+.4}, {:+.4}]", ci.confidence * 100.0, ci.lower, ci.upper);
    }
    println!(", n={})", overall.count);

    let mut worst: Vec<_> = result.slices.iter().filter(|d| d.delta.delta < 0.0).collect();
    worst.sort_by(|a, b| a.delta.delta.total_cmp(&b.delta.delta));
    for slice in worst.iter().take(10) {
        println!(
            "  {}: {:+.4} (n={}{})",
            slice.label(),
            slice.delta.delta,
            slice.delta.count,
            if slice.delta.low_confidence { ", low confidence" } else { "" }
        );
    }

    if let Some(path) = out {
        persistence::atomic_write_json(path, &result)?;
        println!("Comparison written to {}", path.display());
    }

    if compare_config.gates.is_empty() {
        return Ok(0);
    }
    let report = evaluate_gates(&compare_config.gates, &result);
    for outcome in &report.outcomes {
        let mark = if outcome.passed { "PASS" } else { "FAIL" };
        println!("[{mark}] {}", outcome.message);
    }
    if report.passed() {
        Ok(0)
    } else {
        eprintln!("{} regression gate(s) failed", report.failures().count());
        Ok(EXIT_GATE_FAILED)
    }
}

fn handle_slices(
    run_dir: &Path,
    top_k: Option<usize>,
    depth: Option<usize>,
    min_support: Option<usize>,
    workspace: &Path,
) -> anyhow::Result<i32> {
    let mut slice_config = load(workspace)?.slices;
    if let Some(top_k) = top_k {
        slice_config.top_k = top_k;
    }
    if let Some(depth) = depth {
        slice_config.max_depth = depth;
    }
    if let Some(min_support) = min_support {
        slice_config.min_support = min_support;
    }

    let artifact = RunArtifact::load(run_dir)?;
    let report = slices::discover(&artifact, &slice_config)?;

    println!(
        "Run {}: overall accuracy {:.4} over {} examples ({} conjunctions evaluated, {} pruned)",
        report.run_id, report.overall_accuracy, report.total, report.evaluated, report.pruned
    );
    if report.candidates.is_empty() {
        println!("No slice underperforms with at least {} examples.", slice_config.min_support);
        return Ok(0);
    }
    for (rank, candidate) in report.candidates.iter().enumerate() {
        println!(
            "{:>3}. {}  acc {:.4} ({:+.4})  n={}  severity {:.3}  z {:.2}",
            rank + 1,
            candidate.label(),
            candidate.accuracy,
            candidate.delta,
            candidate.count,
            candidate.severity,
            candidate.z_score
        );
    }
    Ok(0)
}

fn handle_scan(
    examples: &Path,
    manifest: &Path,
    out: Option<&Path>,
    workspace: &Path,
) -> anyhow::Result<i32> {
    let config = load(workspace)?;
    let examples: Vec<Example> = read_records(examples)?;
    let records = load_manifest(manifest)?;

    let scanner = ContaminationScanner::new(config.contamination.clone(), &records);
    let report = scanner.scan(&examples);

    println!(
        "{} of {} examples contaminated ({:.2}%), {} skipped",
        report.contaminated,
        report.total_examples,
        report.contamination_rate * 100.0,
        report.skipped.len()
    );
    for (kind, count) in &report.matches_by_kind {
        println!("  {kind}: {count}");
    }
    for example in &report.examples {
        let best = example.matches.first().map(|m| m.record_id.as_str()).unwrap_or("-");
        println!(
            "  {} [{:?}] best {:.3} ({})",
            example.example_id, example.level, example.best_score, best
        );
    }
    for skipped in &report.skipped {
        eprintln!("skipped {}: {}", skipped.example_id, skipped.reason);
    }

    if let Some(path) = out {
        persistence::atomic_write_json(path, &report)?;
        println!("Report written to {}", path.display());
    }
    Ok(0)
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = config::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let toml_str = EvalConfig::default().to_toml_string()?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
