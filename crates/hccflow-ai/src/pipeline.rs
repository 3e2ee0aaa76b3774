//! Per-document classification pipeline.
//!
//! An explicit state machine with a fixed, forward-only transition set:
//!
//! ```text
//! Start → IndexReady → ConditionsPrepared → DeterministicPassComplete
//!       → (InferencePassComplete | SkippedInference) → Finalized
//! ```
//!
//! Any non-terminal state may move to `Errored`, which still carries whatever
//! partial [`AnalysisResult`] exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hccflow_core::{
    AnalysisResult, AnalyzerConfig, Condition, ConditionError, Determination, EscalationPolicy,
    Method, finalize,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::inference::{EscalatedCondition, InferenceClient, InferenceError};
use crate::matcher::Matcher;
use crate::reference::{ReferenceHandle, ReferenceIndex};

pub const NO_CONDITIONS: &str = "no conditions found to analyze";

/// Why a run ended in `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Document-level contract violation (empty or duplicate condition ids).
    #[error("invalid input")]
    InvalidInput,
    /// Shutdown interrupted the inference pass.
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    IndexReady,
    ConditionsPrepared,
    DeterministicPassComplete,
    InferencePassComplete,
    SkippedInference,
    Finalized,
    Errored(PipelineError),
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::IndexReady => "index_ready",
            Self::ConditionsPrepared => "conditions_prepared",
            Self::DeterministicPassComplete => "deterministic_pass_complete",
            Self::InferencePassComplete => "inference_pass_complete",
            Self::SkippedInference => "skipped_inference",
            Self::Finalized => "finalized",
            Self::Errored(_) => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Errored(_))
    }

    /// Whether `next` is a legal transition from `self`.
    pub fn can_advance_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (s, Errored(_)) => !s.is_terminal(),
            (Start, IndexReady)
            | (IndexReady, ConditionsPrepared)
            | (ConditionsPrepared, DeterministicPassComplete)
            | (DeterministicPassComplete, InferencePassComplete)
            | (DeterministicPassComplete, SkippedInference)
            | (InferencePassComplete, Finalized)
            | (SkippedInference, Finalized) => true,
            _ => false,
        }
    }
}

/// States visited by one run, in order.
struct Trail {
    document_id: String,
    states: Vec<PipelineState>,
}

impl Trail {
    fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            states: vec![PipelineState::Start],
        }
    }

    fn current(&self) -> PipelineState {
        self.states
            .last()
            .copied()
            .unwrap_or(PipelineState::Start)
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.current().can_advance_to(next),
            "illegal pipeline transition {:?} -> {:?}",
            self.current(),
            next
        );
        debug!(document_id = %self.document_id, state = next.as_str(), "pipeline state");
        self.states.push(next);
    }
}

/// The outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub result: AnalysisResult,
    pub trail: Vec<PipelineState>,
}

impl PipelineRun {
    pub fn state(&self) -> PipelineState {
        self.trail
            .last()
            .copied()
            .unwrap_or(PipelineState::Start)
    }

    pub fn error(&self) -> Option<PipelineError> {
        match self.state() {
            PipelineState::Errored(e) => Some(e),
            _ => None,
        }
    }

    pub fn inference_skipped(&self) -> bool {
        self.trail.contains(&PipelineState::SkippedInference)
    }
}

/// Runs documents through the deterministic and inference passes.
///
/// Shared across workers; holds no per-document state.
pub struct Pipeline {
    reference: ReferenceHandle,
    matcher: Matcher,
    escalation: EscalationPolicy,
    inference: Option<InferenceClient>,
    batch_size: usize,
    reference_sample: usize,
    high_confidence_cutoff: f64,
}

impl Pipeline {
    pub fn new(
        reference: ReferenceHandle,
        config: &AnalyzerConfig,
        inference: Option<InferenceClient>,
    ) -> Self {
        let (batch_size, reference_sample) = config
            .inference
            .as_ref()
            .map_or((1, 0), |s| (s.batch_size.max(1), s.reference_sample));

        Self {
            reference,
            matcher: Matcher::new(config.no_match_confidence),
            escalation: config.escalation,
            inference,
            batch_size,
            reference_sample,
            high_confidence_cutoff: config.high_confidence_cutoff,
        }
    }

    pub fn reference(&self) -> &ReferenceHandle {
        &self.reference
    }

    /// Run one document.
    ///
    /// Never fails: per-condition problems land in the result's error list,
    /// document-level problems end the run in `Errored` with a partial result.
    pub async fn run(
        &self,
        document_id: &str,
        conditions: Vec<Condition>,
        cancel: &CancellationToken,
    ) -> PipelineRun {
        let mut trail = Trail::new(document_id);

        let index = self.reference.current();
        trail.advance(PipelineState::IndexReady);

        let mut errors = Vec::new();
        if let Err(e) = check_ids(&conditions) {
            warn!(document_id, error = %e.message, "rejecting document");
            errors.push(e);
            return self.errored(trail, PipelineError::InvalidInput, document_id, Vec::new(), errors);
        }
        if conditions.is_empty() {
            errors.push(ConditionError::document(NO_CONDITIONS));
        }
        trail.advance(PipelineState::ConditionsPrepared);

        let (determinations, escalated) = self.deterministic_pass(&conditions, &index, &mut errors);
        trail.advance(PipelineState::DeterministicPassComplete);

        let determinations = match (&self.inference, escalated.is_empty()) {
            (Some(client), false) => {
                match self.inference_pass(client, &index, escalated, cancel).await {
                    Ok(updates) => {
                        record_fallbacks(&updates, &mut errors);
                        trail.advance(PipelineState::InferencePassComplete);
                        merge(determinations, updates)
                    }
                    Err(Interrupted { completed }) => {
                        debug!(document_id, kept = completed.len(), "inference pass interrupted");
                        record_fallbacks(&completed, &mut errors);
                        let pairs = pair(conditions, merge(determinations, completed));
                        return self.errored(trail, PipelineError::Cancelled, document_id, pairs, errors);
                    }
                }
            }
            _ => {
                trail.advance(PipelineState::SkippedInference);
                determinations
            }
        };

        let result = finalize(
            document_id,
            pair(conditions, determinations),
            errors,
            self.high_confidence_cutoff,
        );
        trail.advance(PipelineState::Finalized);

        let m = result.metrics();
        info!(
            document_id,
            total = m.total_conditions,
            relevant = m.hcc_relevant_count,
            high_confidence = m.high_confidence_count,
            confidence_avg = m.confidence_avg,
            errors = m.error_count,
            "document analysed"
        );

        PipelineRun {
            result,
            trail: trail.states,
        }
    }

    fn deterministic_pass(
        &self,
        conditions: &[Condition],
        index: &ReferenceIndex,
        errors: &mut Vec<ConditionError>,
    ) -> (HashMap<String, Determination>, Vec<EscalatedCondition>) {
        let mut determinations = HashMap::with_capacity(conditions.len());
        let mut escalated = Vec::new();

        for condition in conditions {
            let outcome = self.matcher.match_condition(condition, index);
            let escalate = outcome.forces_escalation()
                || self.escalation.should_escalate(outcome.determination.confidence);

            if let Some(err) = outcome.validation {
                errors.push(err.into());
            }
            if escalate {
                escalated.push(EscalatedCondition {
                    condition: condition.clone(),
                    deterministic: outcome.determination.clone(),
                });
            }
            determinations.insert(condition.id.clone(), outcome.determination);
        }

        debug!(
            conditions = conditions.len(),
            escalated = escalated.len(),
            "deterministic pass complete"
        );
        (determinations, escalated)
    }

    async fn inference_pass(
        &self,
        client: &InferenceClient,
        index: &Arc<ReferenceIndex>,
        escalated: Vec<EscalatedCondition>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Determination)>, Interrupted> {
        let sample = index.sample(self.reference_sample);
        let mut updates = Vec::with_capacity(escalated.len());

        for chunk in escalated.chunks(self.batch_size) {
            match client.classify(chunk, sample, cancel).await {
                Ok(batch) => updates.extend(batch),
                Err(InferenceError::Cancelled) => return Err(Interrupted { completed: updates }),
                Err(e) => {
                    let error = e.to_string();
                    updates.extend(
                        chunk
                            .iter()
                            .map(|item| (item.condition.id.clone(), client.fallback(item, &error))),
                    );
                }
            }
        }

        Ok(updates)
    }

    fn errored(
        &self,
        mut trail: Trail,
        error: PipelineError,
        document_id: &str,
        pairs: Vec<(Condition, Determination)>,
        errors: Vec<ConditionError>,
    ) -> PipelineRun {
        trail.advance(PipelineState::Errored(error));
        warn!(document_id, error = %error, "pipeline errored");
        PipelineRun {
            result: finalize(document_id, pairs, errors, self.high_confidence_cutoff),
            trail: trail.states,
        }
    }
}

/// The inference pass stopped on cancellation. Batches that finished before
/// it are kept.
struct Interrupted {
    completed: Vec<(String, Determination)>,
}

/// One document error per condition that fell back after inference failed.
fn record_fallbacks(updates: &[(String, Determination)], errors: &mut Vec<ConditionError>) {
    for (id, d) in updates {
        if d.method == Method::InferenceFallback {
            let cause = d.error.as_deref().unwrap_or("unknown error");
            errors.push(ConditionError::condition(
                id.clone(),
                format!("inference failed: {cause}"),
            ));
        }
    }
}

fn check_ids(conditions: &[Condition]) -> Result<(), ConditionError> {
    let mut seen = HashSet::with_capacity(conditions.len());
    for (i, c) in conditions.iter().enumerate() {
        if c.id.trim().is_empty() {
            return Err(ConditionError::document(format!(
                "condition at position {i} has an empty id"
            )));
        }
        if !seen.insert(c.id.as_str()) {
            return Err(ConditionError::document(format!(
                "duplicate condition id {:?}",
                c.id
            )));
        }
    }
    Ok(())
}

fn merge(
    mut determinations: HashMap<String, Determination>,
    updates: Vec<(String, Determination)>,
) -> HashMap<String, Determination> {
    for (id, d) in updates {
        if let Some(slot) = determinations.get_mut(&id) {
            *slot = d;
        }
    }
    determinations
}

fn pair(
    conditions: Vec<Condition>,
    mut determinations: HashMap<String, Determination>,
) -> Vec<(Condition, Determination)> {
    conditions
        .into_iter()
        .filter_map(|c| determinations.remove(&c.id).map(|d| (c, d)))
        .collect()
}
