//! Shared configuration, validated once at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CODE_COLUMN: &str = "ICD-10-CM Codes";
pub const DEFAULT_DESCRIPTION_COLUMN: &str = "Description";
pub const DEFAULT_CATEGORY_COLUMN: &str = "Tags";

/// Column names the reference table must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceColumns {
    pub code: String,
    pub description: String,
    pub category: String,
}

impl Default for ReferenceColumns {
    fn default() -> Self {
        Self {
            code: DEFAULT_CODE_COLUMN.to_string(),
            description: DEFAULT_DESCRIPTION_COLUMN.to_string(),
            category: DEFAULT_CATEGORY_COLUMN.to_string(),
        }
    }
}

/// When a condition goes to the inference pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationPolicy {
    /// Escalate when deterministic confidence is strictly below this.
    pub threshold: f64,
    /// Escalate every condition regardless of confidence.
    pub escalate_all: bool,
}

impl EscalationPolicy {
    pub fn should_escalate(&self, deterministic_confidence: f64) -> bool {
        self.escalate_all || deterministic_confidence < self.threshold
    }
}

/// External inference model settings.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSettings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Upper bound on a single model call.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Conditions per model call.
    pub batch_size: usize,
    /// Confidence ceiling applied to fallback determinations.
    pub fallback_confidence: f64,
    /// Reference entries included in the prompt as examples.
    pub reference_sample: usize,
    pub max_tokens: u32,
}

impl InferenceSettings {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(60),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            batch_size: 20,
            fallback_confidence: 0.3,
            reference_sample: 50,
            max_tokens: 2048,
        }
    }
}

/// Message runner and worker pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub worker_concurrency: usize,
    /// Deliveries (first + redeliveries) before a message is dead-lettered.
    pub max_delivery_attempts: u32,
    pub shutdown_grace: Duration,
    /// Sleep between empty receives.
    pub poll_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            max_delivery_attempts: 5,
            shutdown_grace: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Everything the analyzer needs to start.
///
/// `escalation.threshold` and `no_match_confidence` have no defaults: they are
/// deployment-tuned and must be supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    pub reference_path: PathBuf,
    pub reference_columns: ReferenceColumns,
    pub escalation: EscalationPolicy,
    /// Deterministic confidence when a code is absent from the reference.
    pub no_match_confidence: f64,
    pub high_confidence_cutoff: f64,
    /// `None` disables the inference pass.
    pub inference: Option<InferenceSettings>,
    pub runner: RunnerSettings,
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        probability("escalation threshold", self.escalation.threshold)?;
        probability("no-match confidence", self.no_match_confidence)?;
        probability("high-confidence cutoff", self.high_confidence_cutoff)?;

        if self.runner.worker_concurrency == 0 {
            return Err(ConfigError::Zero("worker concurrency"));
        }
        if self.runner.max_delivery_attempts == 0 {
            return Err(ConfigError::Zero("max delivery attempts"));
        }

        match &self.inference {
            None if self.escalation.escalate_all => {
                return Err(ConfigError::EscalateAllWithoutInference);
            }
            None => {}
            Some(inf) => {
                if inf.api_key.trim().is_empty() {
                    return Err(ConfigError::MissingApiKey);
                }
                if inf.batch_size == 0 {
                    return Err(ConfigError::Zero("inference batch size"));
                }
                probability("fallback confidence", inf.fallback_confidence)?;
            }
        }

        Ok(())
    }
}

fn probability(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, value })
    }
}
