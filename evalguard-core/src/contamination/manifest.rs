//! Training manifests and other JSONL record files.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::AnalysisError;
use crate::types::MediaSource;

/// One record of a training corpus manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<MediaSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

impl TrainingRecord {
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: Some(text.into()),
            image: None,
            source: None,
            license: None,
        }
    }

    pub fn image(id: impl Into<String>, image: MediaSource) -> Self {
        Self {
            id: id.into(),
            text: None,
            image: Some(image),
            source: None,
            license: None,
        }
    }
}

/// Read every non-blank line of a JSONL file as a `T`.
///
/// Unlike the predictions log, these are external inputs: a malformed line is
/// an error carrying its line number.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, AnalysisError> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AnalysisError::MissingArtifact {
                path: path.to_path_buf(),
            }
        } else {
            AnalysisError::Io(e)
        }
    })?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| AnalysisError::InvalidRecord {
            path: path.to_path_buf(),
            line: index + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

pub fn load_manifest(path: &Path) -> Result<Vec<TrainingRecord>, AnalysisError> {
    read_records(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, r#"{{"id": "t1", "text": "hello world", "source": "web"}}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, r#"{{"id": "t2", "image": {{"source": "inline", "data": "AAE="}}}}"#).unwrap();
        drop(f);

        let records = load_manifest(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source.as_deref(), Some("web"));
        assert_eq!(records[1].image, Some(MediaSource::inline(&[0, 1])));
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(&path, "{\"id\": \"a\"}\nnot json\n").unwrap();
        match load_manifest(&path) {
            Err(AnalysisError::InvalidRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_manifest(&dir.path().join("nope.jsonl")),
            Err(AnalysisError::MissingArtifact { .. })
        ));
    }
}
