//! Capability interfaces for the two external collaborators of a run, and the
//! registration tables that select them by name.
//!
//! A [`BenchmarkAdapter`] produces examples and scores generations; a
//! [`ModelBackend`] turns an example into a [`Generation`]. Implementations are
//! registered in a [`Registry`] at startup and looked up by name, e.g. from the
//! command line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{BackendError, RegistryError, RunError};
use crate::fingerprint::DecodeParams;
use crate::types::{DatasetVersion, Example, Generation, Score};

/// Lazy, restartable sequence of examples.
pub type ExampleStream = Box<dyn Iterator<Item = Result<Example, RunError>> + Send>;

/// Free-form construction options passed to registry factories.
pub type Options = BTreeMap<String, serde_json::Value>;

/// Produces examples for a split and scores generations against them.
pub trait BenchmarkAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Descriptor of the data behind `split`. Feeds the run id.
    fn dataset_version(&self, split: &str) -> Result<DatasetVersion, RunError>;

    /// Stream the examples of `split`, at most `limit` of them.
    ///
    /// Calling this twice with the same arguments must yield the same examples
    /// in the same order.
    fn load(&self, split: &str, limit: Option<u64>) -> Result<ExampleStream, RunError>;

    /// Score a generation. `correct` is `None` when ground truth is withheld.
    fn score(&self, example: &Example, generation: &Generation) -> Score;
}

/// Per-run parameters of a generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt_version: String,
    #[serde(default)]
    pub decode_params: DecodeParams,
}

/// An opaque model endpoint.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Stable identity of the model behind this backend, e.g. `openai:gpt-4o`.
    /// Part of every cache key.
    fn identity(&self) -> String;

    async fn generate(
        &self,
        example: &Example,
        request: &GenerationRequest,
    ) -> Result<Generation, BackendError>;
}

type Factory<T> = Box<dyn Fn(&Options) -> Result<Arc<T>, String> + Send + Sync>;

/// Name-to-factory table for one kind of plugin.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory under `name`. Names are unique.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&Options) -> Result<Arc<T>, String> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered {
                kind: self.kind.to_string(),
                name,
            });
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Instantiate the plugin registered under `name`.
    pub fn create(&self, name: &str, options: &Options) -> Result<Arc<T>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::Unknown {
                kind: self.kind.to_string(),
                name: name.to_string(),
                available: self.names().join(", "),
            })?;
        factory(options).map_err(|reason| RegistryError::Construction {
            kind: self.kind.to_string(),
            name: name.to_string(),
            reason,
        })
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Benchmark table with the built-in adapters registered.
pub fn default_benchmarks() -> Registry<dyn BenchmarkAdapter> {
    let mut registry: Registry<dyn BenchmarkAdapter> = Registry::new("benchmark");
    let _ = registry.register("jsonl", |options: &Options| {
        let adapter = crate::jsonl::JsonlBenchmark::from_options(options)?;
        Ok(Arc::new(adapter) as Arc<dyn BenchmarkAdapter>)
    });
    registry
}

/// Backend table with the built-in backends registered.
pub fn default_backends() -> Registry<dyn ModelBackend> {
    let mut registry: Registry<dyn ModelBackend> = Registry::new("backend");
    let _ = registry.register("openai", |options: &Options| {
        let backend = crate::backends::OpenAiBackend::from_options(options)?;
        Ok(Arc::new(backend) as Arc<dyn ModelBackend>)
    });
    let _ = registry.register("mock", |options: &Options| {
        let backend = crate::backends::MockBackend::from_options(options);
        Ok(Arc::new(backend) as Arc<dyn ModelBackend>)
    });
    registry
}

/// Fetch a required string option.
pub fn required_str<'a>(options: &'a Options, key: &str) -> Result<&'a str, String> {
    options
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing required option '{key}'"))
}

/// Fetch an optional string option.
pub fn optional_str<'a>(options: &'a Options, key: &str) -> Option<&'a str> {
    options.get(key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Plain(String);

    impl Greeter for Plain {
        fn greet(&self) -> String {
            format!("hello {}", self.0)
        }
    }

    fn registry() -> Registry<dyn Greeter> {
        let mut r: Registry<dyn Greeter> = Registry::new("greeter");
        r.register("plain", |opts: &Options| {
            let who = required_str(opts, "who")?;
            Ok(Arc::new(Plain(who.to_string())) as Arc<dyn Greeter>)
        })
        .unwrap();
        r
    }

    #[test]
    fn test_registry_create() {
        let mut opts = Options::new();
        opts.insert("who".into(), serde_json::json!("world"));
        let g = registry().create("plain", &opts).unwrap();
        assert_eq!(g.greet(), "hello world");
    }

    #[test]
    fn test_registry_duplicate_name() {
        let mut r = registry();
        let err = r
            .register("plain", |_: &Options| {
                Ok(Arc::new(Plain("x".into())) as Arc<dyn Greeter>)
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn test_registry_unknown_lists_available() {
        let err = registry().create("fancy", &Options::new()).err().unwrap();
        assert_eq!(err.to_string(), "unknown greeter: 'fancy'. Available: plain");
    }

    #[test]
    fn test_registry_construction_error() {
        let err = registry().create("plain", &Options::new()).err().unwrap();
        assert!(matches!(err, RegistryError::Construction { .. }));
        assert!(err.to_string().contains("missing required option 'who'"));
    }

    #[test]
    fn test_default_tables() {
        assert_eq!(default_benchmarks().names(), vec!["jsonl"]);
        assert_eq!(default_backends().names(), vec!["mock", "openai"]);
    }
}
