//! A scripted backend for testing and dry runs.
//!
//! Answers are looked up by example id, falling back to a fixed default or,
//! when none is set, to the example's own ground truth (a perfect model).
//! Failures can be scripted per example: permanent ones always fail, flaky
//! ones fail transiently a set number of times before succeeding.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::adapter::{GenerationRequest, ModelBackend, Options, optional_str};
use crate::error::BackendError;
use crate::types::{Example, Generation};

pub struct MockBackend {
    name: String,
    answers: HashMap<String, String>,
    default_answer: Option<String>,
    permanent: HashSet<String>,
    flaky: Mutex<HashMap<String, u32>>,
    delay: Duration,
    calls: AtomicU32,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            answers: HashMap::new(),
            default_answer: None,
            permanent: HashSet::new(),
            flaky: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    /// Options: `name`, `answer` (default answer for every example).
    pub fn from_options(options: &Options) -> Self {
        let mut backend = Self::new(optional_str(options, "name").unwrap_or("mock"));
        backend.default_answer = optional_str(options, "answer").map(str::to_string);
        backend
    }

    pub fn with_answer(mut self, example_id: impl Into<String>, answer: impl Into<String>) -> Self {
        self.answers.insert(example_id.into(), answer.into());
        self
    }

    pub fn with_default_answer(mut self, answer: impl Into<String>) -> Self {
        self.default_answer = Some(answer.into());
        self
    }

    /// Always fail `example_id` with a permanent error.
    pub fn failing(mut self, example_id: impl Into<String>) -> Self {
        self.permanent.insert(example_id.into());
        self
    }

    /// Fail `example_id` transiently `times` times, then succeed.
    pub fn flaky(self, example_id: impl Into<String>, times: u32) -> Self {
        self.flaky
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(example_id.into(), times);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `generate` calls received so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer_for(&self, example: &Example) -> String {
        if let Some(answer) = self.answers.get(&example.id) {
            return answer.clone();
        }
        if let Some(answer) = &self.default_answer {
            return answer.clone();
        }
        match &example.ground_truth {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(items) => items
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn identity(&self) -> String {
        format!("mock:{}", self.name)
    }

    async fn generate(
        &self,
        example: &Example,
        _request: &GenerationRequest,
    ) -> Result<Generation, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.permanent.contains(&example.id) {
            return Err(BackendError::permanent(format!(
                "backend rejected example {}",
                example.id
            )));
        }
        {
            let mut flaky = self.flaky.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(remaining) = flaky.get_mut(&example.id)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(BackendError::transient("simulated connection reset"));
            }
        }

        let mut generation = Generation::text(self.answer_for(example));
        generation.latency_ms = self.delay.as_secs_f64() * 1000.0;
        Ok(generation)
    }
}
