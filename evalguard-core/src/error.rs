//! Error types for the evalguard core library.
//!
//! Uses `thiserror` for public API error types with structured variants per
//! concern: fingerprinting, model backends, the content cache, run execution,
//! artifact analysis, configuration and the plugin registries.

use std::path::PathBuf;

/// Errors raised while fingerprinting a payload.
///
/// Non-fatal to callers: the engine records the example as failed and the
/// contamination scanner skips it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("text is empty after normalization")]
    EmptyText,

    #[error("cannot decode payload: {reason}")]
    Decode { reason: String },

    #[error("cannot read media at {path}: {reason}")]
    Media { path: PathBuf, reason: String },

    #[error("image buffer of {len} bytes does not match {width}x{height}")]
    InvalidDimensions { width: u32, height: u32, len: usize },
}

/// Outcome of a failed backend call.
///
/// `RateLimited`, `Timeout` and `Transient` are retried with backoff;
/// `Permanent` fails immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("permanent failure: {message}")]
    Permanent { message: String },
}

impl BackendError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent {
            message: msg.into(),
        }
    }

    /// Whether the retry policy should try this call again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }
}

/// Errors from the persistent cache tier.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry {key} failed integrity check: {reason}")]
    Corruption { key: String, reason: String },

    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(
        "existing predictions log belongs to run {found}, current configuration is run {expected}; start a fresh run or force the resume"
    )]
    ConfigMismatch { expected: String, found: String },

    #[error(
        "existing run was fingerprinted with version {found}, current version is {expected}; cached keys are not comparable"
    )]
    FingerprintVersionMismatch { expected: u32, found: u32 },

    #[error("run was cancelled")]
    Cancelled,

    #[error("benchmark adapter failed: {message}")]
    Adapter { message: String },

    #[error("worker for shard {shard} failed: {message}")]
    Worker { shard: u32, message: String },

    #[error("run IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the comparator, slice discovery and the contamination scanner.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("run artifact not found at {path}")]
    MissingArtifact { path: PathBuf },

    #[error("{}:{line}: {reason}", path.display())]
    InvalidRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("run {run_id} cannot be analysed: {reason}")]
    SchemaMismatch { run_id: String, reason: String },

    #[error("artifact IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact parse error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Errors from the adapter and backend registration tables.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{kind} '{name}' already registered")]
    AlreadyRegistered { kind: String, name: String },

    #[error("unknown {kind}: '{name}'. Available: {available}")]
    Unknown {
        kind: String,
        name: String,
        available: String,
    },

    #[error("cannot create {kind} '{name}': {reason}")]
    Construction {
        kind: String,
        name: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_classification() {
        assert!(BackendError::RateLimited { retry_after_secs: 3 }.is_transient());
        assert!(BackendError::Timeout { timeout_secs: 30 }.is_transient());
        assert!(BackendError::transient("connection reset").is_transient());
        assert!(!BackendError::permanent("image too large").is_transient());
    }

    #[test]
    fn test_error_display_run() {
        let err = RunError::ConfigMismatch {
            expected: "abc".into(),
            found: "def".into(),
        };
        assert!(err.to_string().starts_with(
            "existing predictions log belongs to run def, current configuration is run abc"
        ));
    }

    #[test]
    fn test_error_display_fingerprint() {
        let err = FingerprintError::InvalidDimensions {
            width: 4,
            height: 4,
            len: 3,
        };
        assert_eq!(
            err.to_string(),
            "image buffer of 3 bytes does not match 4x4"
        );
    }

    #[test]
    fn test_registry_error_lists_available() {
        let err = RegistryError::Unknown {
            kind: "backend".into(),
            name: "vllm".into(),
            available: "openai".into(),
        };
        assert_eq!(
            err.to_string(),
            "unknown backend: 'vllm'. Available: openai"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RunError = io_err.into();
        assert!(matches!(err, RunError::Io(_)));
    }
}
