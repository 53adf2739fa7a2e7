//! evalguard CLI: regression runs, comparisons and data audits from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// evalguard: reproducible regression testing for model evaluations
#[derive(Parser, Debug)]
#[command(name = "evalguard", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.evalguard/`)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Execute (or resume) an evaluation run
    Run(RunArgs),
    /// Compare two completed runs and evaluate regression gates
    Compare {
        /// Baseline run directory
        baseline: PathBuf,
        /// Candidate run directory
        candidate: PathBuf,
        /// Bootstrap resamples (overrides config)
        #[arg(long)]
        resamples: Option<usize>,
        /// Write the full comparison as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Find underperforming metadata conjunctions in a run
    Slices {
        /// Run directory
        run_dir: PathBuf,
        #[arg(long)]
        top_k: Option<usize>,
        /// Maximum conjunction depth
        #[arg(long)]
        depth: Option<usize>,
        #[arg(long)]
        min_support: Option<usize>,
    },
    /// Scan evaluation examples against a training manifest
    Scan {
        /// JSONL file of evaluation examples
        #[arg(long)]
        examples: PathBuf,
        /// JSONL training manifest
        #[arg(long)]
        manifest: PathBuf,
        /// Write the full report as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Registered benchmark adapter (e.g. jsonl)
    #[arg(long)]
    benchmark: String,
    /// Data directory handed to the adapter
    #[arg(long)]
    data: PathBuf,
    #[arg(long, default_value = "test")]
    split: String,
    /// Registered model backend (e.g. openai, mock)
    #[arg(long)]
    backend: String,
    #[arg(long)]
    model: String,
    /// Evaluate at most N examples
    #[arg(long)]
    limit: Option<u64>,
    /// Number of shards (overrides config)
    #[arg(long)]
    shards: Option<u32>,
    #[arg(long, default_value = "v1")]
    prompt_version: String,
    /// Decode parameter as KEY=VALUE; VALUE is parsed as JSON when possible
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, serde_json::Value)>,
    /// Run directory to write to instead of `<runs_dir>/<run_id>`
    #[arg(long)]
    run_dir: Option<PathBuf>,
    /// Resume mode: auto, fresh, force
    #[arg(long, default_value = "auto")]
    resume: evalguard_core::ResumeMode,
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = evalguard_core::config::data_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "evalguard.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let code = commands::handle_command(cli.command, &workspace).await?;
    if code != 0 {
        // Flush the file layer before exiting.
        drop(_guard);
        std::process::exit(code);
    }
    Ok(())
}
