//! Extraction input and analysis result artifacts.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use hccflow_core::{AnalysisResult, ExtractionArtifact, ResultArtifact};
use tracing::{debug, info, warn};

use crate::StoreError;

/// Where extraction artifacts come from and analysis results go.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch and parse an extraction artifact.
    async fn fetch_extraction(&self, reference: &str) -> Result<ExtractionArtifact, StoreError>;

    /// Persist a result, replacing any earlier result for the same document.
    ///
    /// Returns the result reference.
    async fn save_result(&self, result: &AnalysisResult) -> Result<String, StoreError>;

    /// Persist the partial result of a rejected document next to, never over,
    /// its analysed result. Returns the reference.
    async fn save_rejected(&self, result: &AnalysisResult) -> Result<String, StoreError>;

    async fn load_result(&self, reference: &str) -> Result<ResultArtifact, StoreError>;

    /// References of every extraction artifact waiting in the input area.
    async fn list_inputs(&self) -> Result<Vec<String>, StoreError>;
}

/// Result file name for a document: `{document_id}_analyzed.json`.
pub fn result_file_name(document_id: &str) -> Result<String, StoreError> {
    file_name(document_id, "analyzed")
}

/// Partial result of a rejected document: `{document_id}_rejected.json`.
pub fn rejected_file_name(document_id: &str) -> Result<String, StoreError> {
    file_name(document_id, "rejected")
}

fn file_name(document_id: &str, suffix: &str) -> Result<String, StoreError> {
    let id = document_id.trim();
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) || id.contains("..") {
        return Err(StoreError::InvalidReference(document_id.to_string()));
    }
    Ok(format!("{id}_{suffix}.json"))
}

/// Artifacts as JSON files in an input and an output directory.
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl LocalArtifacts {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Resolve a reference under `root`.
    ///
    /// Relative references are joined onto `root`; absolute ones must already
    /// point inside it. `..` is never allowed.
    fn resolve(root: &Path, reference: &str) -> Result<PathBuf, StoreError> {
        let path = Path::new(reference.trim());
        if reference.trim().is_empty()
            || path.components().any(|c| matches!(c, Component::ParentDir))
        {
            return Err(StoreError::InvalidReference(reference.to_string()));
        }
        if path.is_absolute() {
            if path.starts_with(root) {
                return Ok(path.to_path_buf());
            }
            return Err(StoreError::InvalidReference(reference.to_string()));
        }
        Ok(root.join(path))
    }

    /// Write `name` in the output directory through a temp file and rename,
    /// so readers never see a partially written file.
    async fn write_atomic(&self, name: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let dir = self.output_dir.clone();
        let target = dir.join(name);

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| StoreError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Other(format!("result write task failed: {e}")))?
    }

    async fn read(path: &Path, reference: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ArtifactNotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifacts {
    async fn fetch_extraction(&self, reference: &str) -> Result<ExtractionArtifact, StoreError> {
        let path = Self::resolve(&self.input_dir, reference)?;
        debug!(path = %path.display(), "reading extraction artifact");
        let bytes = Self::read(&path, reference).await?;
        ExtractionArtifact::from_slice(&bytes).map_err(|source| StoreError::InvalidArtifact {
            reference: reference.to_string(),
            source,
        })
    }

    async fn save_result(&self, result: &AnalysisResult) -> Result<String, StoreError> {
        let name = result_file_name(result.document_id())?;
        let bytes = serde_json::to_vec_pretty(&result.to_artifact())?;
        self.write_atomic(&name, bytes).await?;
        info!(document_id = result.document_id(), file = %name, "result saved");
        Ok(name)
    }

    async fn save_rejected(&self, result: &AnalysisResult) -> Result<String, StoreError> {
        let name = rejected_file_name(result.document_id())?;
        let bytes = serde_json::to_vec_pretty(&result.to_artifact())?;
        self.write_atomic(&name, bytes).await?;
        warn!(document_id = result.document_id(), file = %name, "rejected result saved");
        Ok(name)
    }

    async fn load_result(&self, reference: &str) -> Result<ResultArtifact, StoreError> {
        let path = Self::resolve(&self.output_dir, reference)?;
        let bytes = Self::read(&path, reference).await?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::InvalidArtifact {
            reference: reference.to_string(),
            source,
        })
    }

    async fn list_inputs(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.input_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %self.input_dir.display(), "input directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && entry.file_type().await?.is_file()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hccflow_core::{Condition, Determination, Method, finalize};
    use serde_json::Map;

    const EXTRACTION: &str = r#"{
        "document_id": "doc-1",
        "conditions": [
            {"id": "cond-1", "name": "Type 2 diabetes", "icd_code": "E11.65"}
        ]
    }"#;

    fn store(dir: &tempfile::TempDir) -> LocalArtifacts {
        LocalArtifacts::new(dir.path().join("in"), dir.path().join("out"))
    }

    fn result(document_id: &str, confidence: f64) -> AnalysisResult {
        let condition = Condition {
            id: "cond-1".into(),
            name: "Type 2 diabetes".into(),
            icd_code: Some("E11.65".into()),
            icd_description: None,
            details: None,
            ordering: 0,
            metadata: Map::new(),
        };
        let det = Determination::new(true, None, None, confidence, "r", Method::Deterministic);
        finalize(document_id, vec![(condition, det)], vec![], 0.9)
    }

    #[test]
    fn result_file_names() {
        assert_eq!(result_file_name("doc-1").unwrap(), "doc-1_analyzed.json");
        assert_eq!(rejected_file_name("doc-1").unwrap(), "doc-1_rejected.json");
        assert!(rejected_file_name("../x").is_err());
        for bad in ["", "  ", "../etc", "a/b", "a\\b", ".hidden"] {
            assert!(result_file_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn fetches_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        std::fs::create_dir_all(s.input_dir()).unwrap();
        std::fs::write(s.input_dir().join("doc-1.json"), EXTRACTION).unwrap();

        let artifact = s.fetch_extraction("doc-1.json").await.unwrap();
        assert_eq!(artifact.document_id, "doc-1");
        assert_eq!(artifact.conditions.len(), 1);

        let abs = s.input_dir().join("doc-1.json");
        assert!(s.fetch_extraction(abs.to_str().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_artifact_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(&dir).fetch_extraction("nope.json").await.unwrap_err();
        assert!(matches!(err, StoreError::ArtifactNotFound(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn invalid_artifact_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        std::fs::create_dir_all(s.input_dir()).unwrap();
        std::fs::write(s.input_dir().join("bad.json"), "{not json").unwrap();

        let err = s.fetch_extraction("bad.json").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArtifact { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn rejects_references_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        for bad in ["../secret.json", "/etc/passwd", ""] {
            let err = s.fetch_extraction(bad).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidReference(_)), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn save_overwrites_previous_result() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        let first = s.save_result(&result("doc-1", 0.5)).await.unwrap();
        let second = s.save_result(&result("doc-1", 1.0)).await.unwrap();
        assert_eq!(first, "doc-1_analyzed.json");
        assert_eq!(first, second);

        let loaded = s.load_result(&second).await.unwrap();
        assert_eq!(loaded.metadata.metrics.confidence_avg, 1.0);

        let files: Vec<_> = std::fs::read_dir(s.output_dir()).unwrap().collect();
        assert_eq!(files.len(), 1, "no temp files left behind");
    }

    #[tokio::test]
    async fn rejected_result_leaves_analyzed_result_alone() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        let good = s.save_result(&result("doc-1", 0.8)).await.unwrap();
        let rejected = s.save_rejected(&result("doc-1", 0.0)).await.unwrap();
        assert_eq!(rejected, "doc-1_rejected.json");

        let kept = s.load_result(&good).await.unwrap();
        assert_eq!(kept.metadata.metrics.confidence_avg, 0.8);
        let partial = s.load_result(&rejected).await.unwrap();
        assert_eq!(partial.metadata.metrics.confidence_avg, 0.0);
    }

    #[tokio::test]
    async fn lists_json_inputs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        std::fs::create_dir_all(s.input_dir().join("nested.json")).unwrap();
        for name in ["b.json", "a.json", "notes.txt"] {
            std::fs::write(s.input_dir().join(name), EXTRACTION).unwrap();
        }

        assert_eq!(s.list_inputs().await.unwrap(), vec!["a.json", "b.json"]);
    }

    #[tokio::test]
    async fn missing_input_dir_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).list_inputs().await.unwrap().is_empty());
    }
}
