//! Built-in benchmark adapter over JSONL files.
//!
//! Each split lives in `<data_dir>/<split>.jsonl`, one [`Example`] per line.
//! Scoring is a generic normalized exact match against the ground truth,
//! which may be a string, a number, or a list of accepted answers.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::adapter::{BenchmarkAdapter, ExampleStream, Options, optional_str, required_str};
use crate::error::RunError;
use crate::fingerprint::{normalize_text, sha256_hex};
use crate::types::{DatasetVersion, Example, Generation, Score};

pub struct JsonlBenchmark {
    name: String,
    version: String,
    data_dir: PathBuf,
}

impl JsonlBenchmark {
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: "1".to_string(),
            data_dir: data_dir.into(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Options: `data_dir` (required), `name`, `version`.
    pub fn from_options(options: &Options) -> Result<Self, String> {
        let data_dir = PathBuf::from(required_str(options, "data_dir")?);
        let name = optional_str(options, "name")
            .map(str::to_string)
            .or_else(|| {
                data_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "jsonl".to_string());
        let mut adapter = Self::new(name, data_dir);
        if let Some(version) = optional_str(options, "version") {
            adapter = adapter.with_version(version);
        }
        Ok(adapter)
    }

    pub fn split_path(&self, split: &str) -> PathBuf {
        self.data_dir.join(format!("{split}.jsonl"))
    }
}

fn read_split(path: &Path) -> Result<Vec<u8>, RunError> {
    std::fs::read(path).map_err(|e| RunError::Adapter {
        message: format!("cannot read {}: {e}", path.display()),
    })
}

impl BenchmarkAdapter for JsonlBenchmark {
    fn name(&self) -> &str {
        &self.name
    }

    fn dataset_version(&self, split: &str) -> Result<DatasetVersion, RunError> {
        let bytes = read_split(&self.split_path(split))?;
        let num_examples = bytes
            .split(|b| *b == b'\n')
            .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
            .count() as u64;
        Ok(DatasetVersion {
            name: self.name.clone(),
            version: self.version.clone(),
            split: split.to_string(),
            num_examples: Some(num_examples),
            content_hash: sha256_hex(&bytes),
        })
    }

    fn load(&self, split: &str, limit: Option<u64>) -> Result<ExampleStream, RunError> {
        let path = self.split_path(split);
        let file = File::open(&path).map_err(|e| RunError::Adapter {
            message: format!("cannot open {}: {e}", path.display()),
        })?;
        let source = path.display().to_string();
        let examples = BufReader::new(file)
            .lines()
            .enumerate()
            .filter_map(move |(idx, line)| match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(serde_json::from_str::<Example>(&line).map_err(|e| {
                    RunError::Adapter {
                        message: format!("{source}:{}: {e}", idx + 1),
                    }
                })),
                Err(e) => Some(Err(RunError::Io(e))),
            });
        let limit = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(Box::new(examples.take(limit)))
    }

    fn score(&self, example: &Example, generation: &Generation) -> Score {
        let answer = generation
            .extracted_answer
            .as_deref()
            .unwrap_or(&generation.raw_output);
        let correct = accepted_answers(&example.ground_truth).map(|accepted| {
            let answer = normalize_text(answer);
            accepted.iter().any(|a| normalize_text(a) == answer)
        });
        let mut score = Score {
            correct,
            ..Default::default()
        };
        if let Some(c) = correct {
            score
                .metrics
                .insert("exact_match".to_string(), if c { 1.0 } else { 0.0 });
        }
        score
    }
}

/// Accepted answer strings, or `None` when ground truth is withheld.
fn accepted_answers(ground_truth: &serde_json::Value) -> Option<Vec<String>> {
    use serde_json::Value;
    match ground_truth {
        Value::Null => None,
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        other => Some(vec![other.to_string()]),
    }
}
