//! Per-delivery lifecycle.
//!
//! ```text
//! Received → Fetching → Processing → Persisting → Publishing → Acked
//! ```
//!
//! Failure exits are `Nacked` (requeued for redelivery) and `DeadLettered`.
//! A message is acknowledged only after its result is persisted and the
//! completion event published; redelivery overwrites the earlier result and
//! republishes.

use std::sync::Arc;

use hccflow_ai::{Pipeline, PipelineError};
use hccflow_core::message::ANALYSIS_COMPLETED_KEY;
use hccflow_core::{
    AnalysisCompleted, AnalysisResult, ExtractionArtifact, ExtractionCompleted, RunnerSettings,
};
use hccflow_store::{ArtifactStore, DocumentStatus, StatusSink, StoreError};
use hccflow_sync::{Broker, Delivery};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Fetching,
    Processing,
    Persisting,
    Publishing,
    Acked,
    Nacked,
    DeadLettered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Persisting => "persisting",
            Self::Publishing => "publishing",
            Self::Acked => "acked",
            Self::Nacked => "nacked",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    DeadLettered,
}

/// What happened to one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub outcome: DeliveryOutcome,
    pub document_id: Option<String>,
    pub correlation_id: Option<String>,
    pub result_reference: Option<String>,
    /// Why the delivery was requeued or dead-lettered.
    pub reason: Option<String>,
    pub trail: Vec<DeliveryState>,
}

/// A delivery in progress.
struct Tracked<'a> {
    delivery: &'a Delivery,
    document_id: Option<String>,
    correlation_id: Option<String>,
    result_reference: Option<String>,
    trail: Vec<DeliveryState>,
}

impl<'a> Tracked<'a> {
    fn new(delivery: &'a Delivery) -> Self {
        Self {
            delivery,
            document_id: None,
            correlation_id: None,
            result_reference: None,
            trail: vec![DeliveryState::Received],
        }
    }

    fn advance(&mut self, state: DeliveryState) {
        debug!(
            tag = %self.delivery.tag,
            document_id = self.document_id.as_deref().unwrap_or("-"),
            state = state.as_str(),
            "delivery state"
        );
        self.trail.push(state);
    }

    fn finish(mut self, outcome: DeliveryOutcome, reason: Option<String>) -> DeliveryReport {
        self.trail.push(match outcome {
            DeliveryOutcome::Acked => DeliveryState::Acked,
            DeliveryOutcome::Requeued => DeliveryState::Nacked,
            DeliveryOutcome::DeadLettered => DeliveryState::DeadLettered,
        });
        DeliveryReport {
            outcome,
            document_id: self.document_id,
            correlation_id: self.correlation_id,
            result_reference: self.result_reference,
            reason,
            trail: self.trail,
        }
    }
}

enum Failure {
    /// May succeed on redelivery; counts against the attempt limit.
    Transient(String),
    /// Shutdown interrupted the work.
    Interrupted,
    Permanent(String),
}

fn store_failure(e: StoreError) -> Failure {
    if e.is_transient() {
        Failure::Transient(e.to_string())
    } else {
        Failure::Permanent(e.to_string())
    }
}

/// Drives deliveries from the broker through the pipeline.
///
/// Shared across workers; every delivery is handled independently.
pub struct Runner {
    pipeline: Arc<Pipeline>,
    artifacts: Arc<dyn ArtifactStore>,
    broker: Arc<dyn Broker>,
    status: Arc<dyn StatusSink>,
    max_delivery_attempts: u32,
}

impl Runner {
    pub fn new(
        pipeline: Arc<Pipeline>,
        artifacts: Arc<dyn ArtifactStore>,
        broker: Arc<dyn Broker>,
        status: Arc<dyn StatusSink>,
        settings: &RunnerSettings,
    ) -> Self {
        Self {
            pipeline,
            artifacts,
            broker,
            status,
            max_delivery_attempts: settings.max_delivery_attempts.max(1),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Process one delivery and settle it with the broker.
    pub async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) -> DeliveryReport {
        let mut tracked = Tracked::new(&delivery);

        let event = match ExtractionCompleted::from_slice(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                let reason = format!("poison message: {e}");
                return self.dead_letter(tracked, reason).await;
            }
        };
        tracked.document_id = Some(event.document_id.clone());
        tracked.correlation_id = Some(event.correlation_id.clone());
        info!(
            document_id = %event.document_id,
            correlation_id = %event.correlation_id,
            redeliveries = delivery.redelivery_count,
            "processing extraction event"
        );
        self.note_status(&event.document_id, DocumentStatus::Analyzing, None);

        match self.process(&event, &mut tracked, cancel).await {
            Ok(reference) => {
                tracked.result_reference = Some(reference);
                self.ack(tracked).await
            }
            Err(Failure::Interrupted) => self.requeue(tracked, "interrupted by shutdown".into()).await,
            Err(Failure::Transient(reason)) => self.retry_or_dead_letter(tracked, reason).await,
            Err(Failure::Permanent(reason)) => self.dead_letter(tracked, reason).await,
        }
    }

    async fn process(
        &self,
        event: &ExtractionCompleted,
        tracked: &mut Tracked<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, Failure> {
        tracked.advance(DeliveryState::Fetching);
        let artifact = self.fetch(event).await?;
        if artifact.document_id != event.document_id {
            warn!(
                document_id = %event.document_id,
                artifact_document_id = %artifact.document_id,
                "artifact document id differs from event; using the event's"
            );
        }

        tracked.advance(DeliveryState::Processing);
        let run = self
            .pipeline
            .run(&event.document_id, artifact.into_conditions(), cancel)
            .await;

        match run.error() {
            Some(PipelineError::Cancelled) => return Err(Failure::Interrupted),
            Some(PipelineError::InvalidInput) => {
                tracked.advance(DeliveryState::Persisting);
                // Partial result goes to its own artifact; an earlier analysed
                // result for this document stays in place.
                if let Err(e) = self.artifacts.save_rejected(&run.result).await {
                    warn!(document_id = %event.document_id, error = %e, "could not save partial result");
                }
                let detail = run
                    .result
                    .errors()
                    .first()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                return Err(Failure::Permanent(format!("invalid input: {detail}")));
            }
            None => {}
        }

        tracked.advance(DeliveryState::Persisting);
        let reference = self.persist(&run.result).await?;

        tracked.advance(DeliveryState::Publishing);
        self.publish(&run.result, &reference, &event.correlation_id)
            .await?;
        Ok(reference)
    }

    async fn fetch(&self, event: &ExtractionCompleted) -> Result<ExtractionArtifact, Failure> {
        if let Some(content) = &event.extracted_content {
            debug!(document_id = %event.document_id, "using inline extraction content");
            return ExtractionArtifact::from_slice(content.as_bytes()).map_err(|e| {
                Failure::Permanent(format!("invalid inline extraction content: {e}"))
            });
        }
        self.artifacts
            .fetch_extraction(&event.artifact_reference)
            .await
            .map_err(store_failure)
    }

    async fn persist(&self, result: &AnalysisResult) -> Result<String, Failure> {
        let reference = self
            .artifacts
            .save_result(result)
            .await
            .map_err(store_failure)?;
        self.status
            .record_analyzed(result.document_id(), &reference, result.metrics())
            .map_err(store_failure)?;
        Ok(reference)
    }

    async fn publish(
        &self,
        result: &AnalysisResult,
        reference: &str,
        correlation_id: &str,
    ) -> Result<(), Failure> {
        let payload = AnalysisCompleted::new(result, reference, correlation_id)
            .to_vec()
            .map_err(|e| Failure::Permanent(format!("could not encode completion event: {e}")))?;
        self.broker
            .publish(ANALYSIS_COMPLETED_KEY, &payload)
            .await
            .map_err(|e| Failure::Transient(format!("publish failed: {e}")))
    }

    // ── Settlement ──

    async fn ack(&self, tracked: Tracked<'_>) -> DeliveryReport {
        if let Err(e) = self.broker.ack(&tracked.delivery.tag).await {
            // The result is already persisted and published; a redelivery
            // just overwrites and republishes.
            warn!(tag = %tracked.delivery.tag, error = %e, "ack failed");
        }
        info!(
            document_id = tracked.document_id.as_deref().unwrap_or("-"),
            result = tracked.result_reference.as_deref().unwrap_or("-"),
            "delivery acked"
        );
        tracked.finish(DeliveryOutcome::Acked, None)
    }

    async fn requeue(&self, tracked: Tracked<'_>, reason: String) -> DeliveryReport {
        warn!(
            document_id = tracked.document_id.as_deref().unwrap_or("-"),
            attempt = tracked.delivery.redelivery_count + 1,
            max_attempts = self.max_delivery_attempts,
            reason = %reason,
            "requeueing delivery"
        );
        if let Err(e) = self.broker.nack(&tracked.delivery.tag, true).await {
            error!(tag = %tracked.delivery.tag, error = %e, "nack failed");
        }
        tracked.finish(DeliveryOutcome::Requeued, Some(reason))
    }

    async fn retry_or_dead_letter(&self, tracked: Tracked<'_>, reason: String) -> DeliveryReport {
        let attempt = tracked.delivery.redelivery_count + 1;
        if attempt < self.max_delivery_attempts {
            return self.requeue(tracked, reason).await;
        }
        let reason = format!("gave up after {attempt} delivery attempts: {reason}");
        self.dead_letter(tracked, reason).await
    }

    async fn dead_letter(&self, tracked: Tracked<'_>, reason: String) -> DeliveryReport {
        let document_id = tracked.document_id.as_deref();
        let correlation_id = tracked.correlation_id.as_deref();
        error!(
            tag = %tracked.delivery.tag,
            document_id = document_id.unwrap_or("-"),
            correlation_id = correlation_id.unwrap_or("-"),
            reason = %reason,
            "dead-lettering delivery"
        );

        if let Err(e) = self.broker.dead_letter(&tracked.delivery.tag, &reason).await {
            error!(tag = %tracked.delivery.tag, error = %e, "dead-letter failed");
        }
        if let Err(e) = self
            .status
            .record_dead_letter(document_id, correlation_id, &reason)
        {
            error!(error = %e, "could not record dead letter");
        }
        if let Some(id) = document_id {
            self.note_status(id, DocumentStatus::Failed, Some(&reason));
        }
        tracked.finish(DeliveryOutcome::DeadLettered, Some(reason))
    }

    fn note_status(&self, document_id: &str, status: DocumentStatus, detail: Option<&str>) {
        if let Err(e) = self.status.record_status(document_id, status, detail) {
            warn!(document_id, status = status.as_str(), error = %e, "could not record status");
        }
    }
}
