//! Configuration system for evalguard.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config -> environment variables -> explicit overrides.
//!
//! [`RunSpec`] lives here too. It is the identity-bearing part of a run: the
//! fields that decide what a run *is* and therefore feed its `run_id`. The
//! sections of [`EvalConfig`] are operational knobs that never change it.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::fingerprint::{self, DecodeParams};
use crate::gates::RegressionGate;
use crate::types::DatasetVersion;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub compare: CompareConfig,
    #[serde(default)]
    pub slices: SliceConfig,
    #[serde(default)]
    pub contamination: ContaminationConfig,
}

/// Content-addressed cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries held in the in-process LRU tier (default: 4096).
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// Directory of the persistent tier. Defaults to `<workspace>/.evalguard/cache`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Disable the persistent tier entirely (memory only).
    #[serde(default)]
    pub memory_only: bool,
}

fn default_memory_capacity() -> usize {
    4096
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_capacity(),
            dir: None,
            memory_only: false,
        }
    }
}

/// Execution engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of shards the example set is partitioned into (default: 4).
    #[serde(default = "default_num_shards")]
    pub num_shards: u32,
    /// Upper bound on concurrent workers (default: 8).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Timeout of a single backend call in seconds (default: 120).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Root of run directories. Defaults to `<workspace>/.evalguard/runs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs_dir: Option<PathBuf>,
}

fn default_num_shards() -> u32 {
    4
}
fn default_concurrency() -> usize {
    8
}
fn default_call_timeout_secs() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_shards: default_num_shards(),
            concurrency: default_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
            runs_dir: None,
        }
    }
}

/// Backoff policy for transient backend failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Regression comparator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareConfig {
    /// Bootstrap resamples (default: 1000).
    #[serde(default = "default_resamples")]
    pub resamples: usize,
    /// Two-sided confidence level of the reported intervals (default: 0.95).
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Slices with fewer matched pairs are flagged low-confidence (default: 30).
    #[serde(default = "default_min_slice_count")]
    pub min_slice_count: usize,
    /// Seed of the bootstrap resampler, so intervals are reproducible.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Regression gates evaluated by `evalguard compare`.
    #[serde(default)]
    pub gates: Vec<RegressionGate>,
}

fn default_resamples() -> usize {
    1000
}
fn default_confidence() -> f64 {
    0.95
}
fn default_min_slice_count() -> usize {
    30
}
fn default_seed() -> u64 {
    42
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            resamples: default_resamples(),
            confidence: default_confidence(),
            min_slice_count: default_min_slice_count(),
            seed: default_seed(),
            gates: Vec::new(),
        }
    }
}

/// Slice discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceConfig {
    /// Minimum examples a conjunction must cover to be kept or extended.
    #[serde(default = "default_min_support")]
    pub min_support: usize,
    /// Maximum number of (feature, value) pairs in a conjunction.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_min_support() -> usize {
    10
}
fn default_max_depth() -> usize {
    3
}
fn default_top_k() -> usize {
    20
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            min_support: default_min_support(),
            max_depth: default_max_depth(),
            top_k: default_top_k(),
        }
    }
}

/// Contamination scanner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContaminationConfig {
    #[serde(default = "default_num_permutations")]
    pub num_permutations: usize,
    /// LSH bands; `bands * rows` must not exceed `num_permutations`.
    #[serde(default = "default_bands")]
    pub bands: usize,
    #[serde(default = "default_rows")]
    pub rows: usize,
    #[serde(default = "default_shingle_size")]
    pub shingle_size: usize,
    /// Minimum estimated Jaccard similarity of a reported text match.
    #[serde(default = "default_text_threshold")]
    pub text_threshold: f64,
    /// Maximum Hamming distance of a reported image match.
    #[serde(default = "default_image_max_distance")]
    pub image_max_distance: u32,
    /// Input field holding the question text. When unset, every text input is
    /// joined in field-name order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_field: Option<String>,
}

fn default_num_permutations() -> usize {
    128
}
fn default_bands() -> usize {
    16
}
fn default_rows() -> usize {
    8
}
fn default_shingle_size() -> usize {
    5
}
fn default_text_threshold() -> f64 {
    0.9
}
fn default_image_max_distance() -> u32 {
    10
}

impl Default for ContaminationConfig {
    fn default() -> Self {
        Self {
            num_permutations: default_num_permutations(),
            bands: default_bands(),
            rows: default_rows(),
            shingle_size: default_shingle_size(),
            text_threshold: default_text_threshold(),
            image_max_distance: default_image_max_distance(),
            text_field: None,
        }
    }
}

impl EvalConfig {
    /// Reject settings no run or analysis can work with.
    pub fn check(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if self.engine.call_timeout_secs == 0 {
            return invalid("engine.call_timeout_secs must be at least 1".to_string());
        }
        if !(self.compare.confidence > 0.0 && self.compare.confidence < 1.0) {
            return invalid(format!(
                "compare.confidence is {}; expected a value strictly between 0 and 1",
                self.compare.confidence
            ));
        }
        let c = &self.contamination;
        if c.bands * c.rows > c.num_permutations {
            return invalid(format!(
                "contamination.bands * rows = {} exceeds num_permutations = {}",
                c.bands * c.rows,
                c.num_permutations
            ));
        }
        Ok(())
    }

    /// Human-readable warnings about suspicious settings. Never fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.cache.memory_capacity == 0 {
            warnings.push("cache.memory_capacity is 0; the memory tier holds one entry".to_string());
        }
        if self.engine.num_shards == 0 {
            warnings.push("engine.num_shards is 0; treated as 1".to_string());
        }
        if self.engine.concurrency == 0 {
            warnings.push("engine.concurrency is 0; treated as 1".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "retry.backoff_multiplier is {}; delays shrink between attempts",
                self.retry.backoff_multiplier
            ));
        }
        if self.compare.resamples < 1000 {
            warnings.push(format!(
                "compare.resamples is {} (<1000); confidence intervals will be noisy",
                self.compare.resamples
            ));
        }
        if self.slices.min_support == 0 {
            warnings.push("slices.min_support is 0; every conjunction is extended".to_string());
        }
        let c = &self.contamination;
        if c.bands * c.rows < c.num_permutations {
            warnings.push(format!(
                "contamination.bands * rows = {} but num_permutations = {}; extra permutations are unused",
                c.bands * c.rows,
                c.num_permutations
            ));
        }
        if !(0.0..=1.0).contains(&c.text_threshold) {
            warnings.push(format!(
                "contamination.text_threshold is {}; expected a value in [0, 1]",
                c.text_threshold
            ));
        }
        if c.image_max_distance > 32 {
            warnings.push(format!(
                "contamination.image_max_distance is {} of 64 bits; unrelated images will match",
                c.image_max_distance
            ));
        }

        warnings
    }

    /// Directory of the persistent cache tier.
    pub fn cache_dir(&self, workspace: &Path) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| workspace.join(".evalguard").join("cache"))
    }

    /// Root directory of run artifacts.
    pub fn runs_dir(&self, workspace: &Path) -> PathBuf {
        self.engine
            .runs_dir
            .clone()
            .unwrap_or_else(|| workspace.join(".evalguard").join("runs"))
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Identity-bearing description of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub benchmark: String,
    pub split: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Backend identity, e.g. `openai:gpt-4o`.
    pub backend: String,
    pub prompt_version: String,
    #[serde(default)]
    pub decode_params: DecodeParams,
    /// Adapter- or backend-specific options that change results.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl RunSpec {
    pub fn new(
        benchmark: impl Into<String>,
        split: impl Into<String>,
        backend: impl Into<String>,
        prompt_version: impl Into<String>,
    ) -> Self {
        Self {
            benchmark: benchmark.into(),
            split: split.into(),
            limit: None,
            backend: backend.into(),
            prompt_version: prompt_version.into(),
            decode_params: DecodeParams::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_decode_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.decode_params.insert(name.into(), value);
        self
    }

    /// JSON form hashed into the run id.
    pub fn identity_value(&self) -> serde_json::Value {
        let params: serde_json::Map<String, serde_json::Value> = self
            .decode_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let options: serde_json::Map<String, serde_json::Value> = self
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::json!({
            "benchmark": self.benchmark,
            "split": self.split,
            "limit": self.limit,
            "backend": self.backend,
            "prompt_version": self.prompt_version,
            "decode_params": params,
            "options": options,
        })
    }

    /// Deterministic run id for this spec on `dataset` at `code_version`.
    pub fn run_id(&self, dataset: &DatasetVersion, code_version: &str) -> String {
        fingerprint::run_id(&self.identity_value(), dataset, code_version)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "evalguard", "evalguard")
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".evalguard").join("config.toml")
}

/// Path of the user-level config file, when a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

/// Platform data directory (log files).
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.data_dir().to_path_buf())
}

/// Load configuration with layered merging.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (`EVALGUARD_ENGINE__NUM_SHARDS`, ...)
/// 3. Workspace-local config (`.evalguard/config.toml`)
/// 4. User config (`~/.config/evalguard/config.toml`)
/// 5. Built-in defaults
///
/// The merged result must pass [`EvalConfig::check`].
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EvalConfig>,
) -> Result<EvalConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(EvalConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("EVALGUARD_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: EvalConfig = figment.extract().map_err(Box::new)?;
    config.check()?;
    Ok(config)
}
