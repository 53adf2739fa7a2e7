//! # evalguard core
//!
//! Execution and analysis backbone of the evalguard regression harness.
//! Provides the fingerprint library, the content-addressed cache, the
//! resumable sharded engine, the regression comparator, slice discovery
//! and the contamination scanner, plus configuration and fundamental types.

pub mod adapter;
pub mod artifact;
pub mod backends;
pub mod cache;
pub mod compare;
pub mod config;
pub mod contamination;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod gates;
pub mod jsonl;
pub mod metrics;
pub mod persistence;
pub mod retry;
pub mod slices;
pub mod stats;
pub mod types;

// Re-export commonly used types at the crate root.
pub use adapter::{
    BenchmarkAdapter, GenerationRequest, ModelBackend, Options, Registry, default_backends,
    default_benchmarks,
};
pub use artifact::{RunArtifact, RunDir, RunManifest};
pub use backends::{MockBackend, OpenAiBackend};
pub use cache::{CacheStats, ContentCache, GenerationCache};
pub use compare::{ChangeKind, ComparisonResult, compare};
pub use config::{EvalConfig, RunSpec, load_config};
pub use contamination::{ContaminationReport, ContaminationScanner, TrainingRecord};
pub use engine::{Engine, ResumeMode, RunOutcome, ShardSelection};
pub use error::{
    AnalysisError, BackendError, CacheError, ConfigError, FingerprintError, RegistryError,
    RunError,
};
pub use gates::{GateReport, RegressionGate, evaluate_gates};
pub use jsonl::JsonlBenchmark;
pub use slices::{SliceCandidate, SliceReport};
pub use types::{
    DatasetVersion, Example, Generation, MediaSource, Payload, Prediction, RunMetrics, RunStatus,
    Score, SliceAssignment,
};
