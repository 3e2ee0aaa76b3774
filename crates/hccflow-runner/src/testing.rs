//! Shared fixtures for runner, consumer and batch tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hccflow_ai::{
    GenerateRequest, GenerateResponse, InferenceBackend, InferenceClient, InferenceError, Pipeline,
    ReferenceHandle, RetryPolicy,
};
use hccflow_core::{
    AnalyzerConfig, EscalationPolicy, InferenceSettings, ReferenceColumns, RunnerSettings,
};
use hccflow_store::{ArtifactStore, LocalArtifacts, MemorySink, StatusSink};
use hccflow_sync::{Broker, MemoryBroker};
use serde::de::DeserializeOwned;
use tempfile::TempDir;

use crate::runner::Runner;

const CODES: &str = "ICD-10-CM Codes,Description,Tags
E1165,Type 2 diabetes with hyperglycemia,Diabetes
I10,Essential hypertension,Hypertension
";

pub struct Fixture {
    _dir: TempDir,
    pub artifacts: Arc<LocalArtifacts>,
    pub broker: Arc<MemoryBroker>,
    pub status: Arc<MemorySink>,
    pub pipeline: Arc<Pipeline>,
}

impl Fixture {
    /// Reference index with E11.65 and I10, escalation below 0.9, baseline 0.8.
    pub fn new(backend: Option<Arc<dyn InferenceBackend>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let codes = dir.path().join("codes.csv");
        std::fs::write(&codes, CODES).unwrap();

        let config = config(codes, backend.is_some());
        let reference = ReferenceHandle::load(&config.reference_path, &config.reference_columns).unwrap();
        let client = backend.map(|b| {
            let settings = config.inference.clone().unwrap();
            InferenceClient::new(b, &settings).with_policy(RetryPolicy {
                max_retries: 1,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                timeout: Duration::from_millis(200),
            })
        });

        Self {
            artifacts: Arc::new(LocalArtifacts::new(dir.path().join("in"), dir.path().join("out"))),
            broker: Arc::new(MemoryBroker::new()),
            status: Arc::new(MemorySink::new()),
            pipeline: Arc::new(Pipeline::new(reference, &config, client)),
            _dir: dir,
        }
    }

    pub fn runner(&self, max_delivery_attempts: u32) -> Runner {
        let settings = RunnerSettings {
            max_delivery_attempts,
            ..RunnerSettings::default()
        };
        Runner::new(
            self.pipeline.clone(),
            self.artifacts.clone() as Arc<dyn ArtifactStore>,
            self.broker.clone() as Arc<dyn Broker>,
            self.status.clone() as Arc<dyn StatusSink>,
            &settings,
        )
    }

    pub fn write_input(&self, name: &str, content: &str) {
        std::fs::create_dir_all(self.artifacts.input_dir()).unwrap();
        std::fs::write(self.artifacts.input_dir().join(name), content).unwrap();
    }

    pub fn read_output<T: DeserializeOwned>(&self, name: &str) -> T {
        let bytes = std::fs::read(self.artifacts.output_dir().join(name)).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}

fn config(reference_path: PathBuf, with_inference: bool) -> AnalyzerConfig {
    AnalyzerConfig {
        reference_path,
        reference_columns: ReferenceColumns::default(),
        escalation: EscalationPolicy {
            threshold: 0.9,
            escalate_all: false,
        },
        no_match_confidence: 0.8,
        high_confidence_cutoff: 0.9,
        inference: with_inference
            .then(|| InferenceSettings::new("http://inference.invalid", "test-key", "test-model")),
        runner: RunnerSettings::default(),
    }
}

/// Extraction artifact JSON with `(id, code)` conditions.
pub fn extraction(document_id: &str, conditions: &[(&str, &str)]) -> String {
    let conditions: Vec<_> = conditions
        .iter()
        .map(|(id, code)| {
            serde_json::json!({
                "id": id,
                "name": format!("condition {id}"),
                "icd_code": code,
            })
        })
        .collect();
    serde_json::json!({ "document_id": document_id, "conditions": conditions }).to_string()
}

/// `extraction.completed` event with correlation id `corr-{document_id}`.
pub fn event(document_id: &str, reference: &str) -> String {
    serde_json::json!({
        "message_type": "extraction.completed",
        "document_id": document_id,
        "artifact_reference": reference,
        "correlation_id": format!("corr-{document_id}"),
    })
    .to_string()
}

struct DownBackend;

#[async_trait]
impl InferenceBackend for DownBackend {
    async fn generate(&self, _: &GenerateRequest) -> Result<GenerateResponse, InferenceError> {
        Err(InferenceError::Server {
            status: 503,
            body: "overloaded".into(),
        })
    }
}

/// Fails every call with a 503.
pub fn down_backend() -> Arc<dyn InferenceBackend> {
    Arc::new(DownBackend)
}

struct StuckBackend;

#[async_trait]
impl InferenceBackend for StuckBackend {
    async fn generate(&self, _: &GenerateRequest) -> Result<GenerateResponse, InferenceError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(InferenceError::Timeout(Duration::from_secs(3600)))
    }
}

/// Never answers; every call ends in the client timeout.
pub fn stuck_backend() -> Arc<dyn InferenceBackend> {
    Arc::new(StuckBackend)
}
