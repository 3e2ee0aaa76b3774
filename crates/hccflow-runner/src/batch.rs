//! Batch mode: analyse every extraction artifact waiting in the input area.

use std::sync::Arc;

use hccflow_ai::{Pipeline, PipelineError};
use hccflow_store::{ArtifactStore, DocumentStatus, StatusSink, StoreError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Success,
    /// Analysed, but there was nothing to classify.
    Warning,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file: String,
    pub document_id: Option<String>,
    pub status: FileStatus,
    pub message: String,
    pub output_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
}

impl BatchReport {
    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }
}

/// Run every input artifact through `pipeline` on a pool of `concurrency`
/// workers. Reports come back in input-file order.
pub async fn run_batch(
    pipeline: Arc<Pipeline>,
    artifacts: Arc<dyn ArtifactStore>,
    status: Arc<dyn StatusSink>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<BatchReport, StoreError> {
    let inputs = artifacts.list_inputs().await?;
    info!(files = inputs.len(), "batch started");

    let mut pool = WorkerPool::new(concurrency);
    for (position, file) in inputs.into_iter().enumerate() {
        let pipeline = pipeline.clone();
        let artifacts = artifacts.clone();
        let status = status.clone();
        let cancel = cancel.clone();
        pool.spawn(async move {
            let report = analyse_file(&pipeline, artifacts.as_ref(), status.as_ref(), file, &cancel).await;
            (position, report)
        })
        .await;
    }

    let mut done = pool.join_all().await;
    done.sort_by_key(|(position, _)| *position);
    let report = BatchReport {
        files: done.into_iter().map(|(_, r)| r).collect(),
    };

    info!(
        success = report.count(FileStatus::Success),
        warning = report.count(FileStatus::Warning),
        error = report.count(FileStatus::Error),
        "batch finished"
    );
    Ok(report)
}

async fn analyse_file(
    pipeline: &Pipeline,
    artifacts: &dyn ArtifactStore,
    status: &dyn StatusSink,
    file: String,
    cancel: &CancellationToken,
) -> FileReport {
    let failed = |file: String, document_id: Option<String>, message: String| {
        error!(file = %file, error = %message, "batch file failed");
        FileReport {
            file,
            document_id,
            status: FileStatus::Error,
            message,
            output_file: None,
        }
    };

    let artifact = match artifacts.fetch_extraction(&file).await {
        Ok(a) => a,
        Err(e) => return failed(file, None, e.to_string()),
    };
    let document_id = artifact.document_id.clone();
    record(status, &document_id, DocumentStatus::Analyzing, None);

    let run = pipeline
        .run(&document_id, artifact.into_conditions(), cancel)
        .await;
    if let Some(e) = run.error() {
        let message = match e {
            PipelineError::InvalidInput => run
                .result
                .errors()
                .first()
                .map_or_else(|| e.to_string(), |err| err.to_string()),
            PipelineError::Cancelled => e.to_string(),
        };
        record(status, &document_id, DocumentStatus::Failed, Some(&message));
        return failed(file, Some(document_id), message);
    }

    let output_file = match artifacts.save_result(&run.result).await {
        Ok(name) => name,
        Err(e) => {
            let message = e.to_string();
            record(status, &document_id, DocumentStatus::Failed, Some(&message));
            return failed(file, Some(document_id), message);
        }
    };
    if let Err(e) = status.record_analyzed(&document_id, &output_file, run.result.metrics()) {
        warn!(document_id = %document_id, error = %e, "could not record status");
    }

    let m = run.result.metrics();
    let (file_status, message) = if m.total_conditions == 0 {
        (FileStatus::Warning, hccflow_ai::pipeline::NO_CONDITIONS.to_string())
    } else {
        (
            FileStatus::Success,
            format!(
                "{} conditions, {} HCC-relevant, average confidence {:.2}",
                m.total_conditions, m.hcc_relevant_count, m.confidence_avg
            ),
        )
    };

    FileReport {
        file,
        document_id: Some(document_id),
        status: file_status,
        message,
        output_file: Some(output_file),
    }
}

fn record(status: &dyn StatusSink, document_id: &str, s: DocumentStatus, detail: Option<&str>) {
    if let Err(e) = status.record_status(document_id, s, detail) {
        warn!(document_id, error = %e, "could not record status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Fixture};
    use hccflow_core::ResultArtifact;

    async fn batch(fx: &Fixture) -> BatchReport {
        run_batch(
            fx.pipeline.clone(),
            fx.artifacts.clone(),
            fx.status.clone(),
            2,
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn reports_each_file_in_order() {
        let fx = Fixture::new(None);
        fx.write_input("a.json", &testing::extraction("doc-a", &[("c1", "E11.65"), ("c2", "I10")]));
        fx.write_input("b.json", &testing::extraction("doc-b", &[]));
        fx.write_input("c.json", "{broken");
        fx.write_input("d.json", &testing::extraction("doc-d", &[("c1", "K21.9"), ("c1", "I10")]));

        let report = batch(&fx).await;
        let statuses: Vec<_> = report.files.iter().map(|f| (f.file.as_str(), f.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("a.json", FileStatus::Success),
                ("b.json", FileStatus::Warning),
                ("c.json", FileStatus::Error),
                ("d.json", FileStatus::Error),
            ]
        );

        let a = &report.files[0];
        assert_eq!(a.document_id.as_deref(), Some("doc-a"));
        assert_eq!(a.output_file.as_deref(), Some("doc-a_analyzed.json"));
        let saved: ResultArtifact = fx.read_output("doc-a_analyzed.json");
        assert_eq!(saved.metadata.metrics.hcc_relevant_count, 2);

        assert_eq!(report.files[1].message, "no conditions found to analyze");
        assert!(report.files[3].message.contains("duplicate condition id"));
        assert_eq!(fx.status.last_status("doc-d"), Some(DocumentStatus::Failed));
        assert_eq!(report.count(FileStatus::Error), 2);
    }

    #[tokio::test]
    async fn empty_input_dir() {
        let fx = Fixture::new(None);
        let report = batch(&fx).await;
        assert!(report.files.is_empty());
    }

    #[tokio::test]
    async fn report_serializes_lowercase_status() {
        let report = BatchReport {
            files: vec![FileReport {
                file: "a.json".into(),
                document_id: Some("doc-a".into()),
                status: FileStatus::Warning,
                message: "m".into(),
                output_file: None,
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["files"][0]["status"], "warning");
    }
}
