//! Per-condition relevance determinations.

use serde::{Deserialize, Serialize};

/// How a determination was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Reference table lookup only.
    Deterministic,
    /// Model output accepted for this condition.
    Inference,
    /// Inference was attempted and gave up; deterministic view retained.
    InferenceFallback,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Inference => "inference",
            Self::InferenceFallback => "inference-fallback",
        }
    }
}

/// The relevance decision for one condition.
///
/// Built whole by one of the constructors; confidence is always clamped into
/// `[0, 1]` and NaN becomes 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Determination {
    pub relevant: bool,
    pub hcc_code: Option<String>,
    pub category: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub method: Method,
    pub error: Option<String>,
}

impl Determination {
    pub fn new(
        relevant: bool,
        hcc_code: Option<String>,
        category: Option<String>,
        confidence: f64,
        reasoning: impl Into<String>,
        method: Method,
    ) -> Self {
        Self {
            relevant,
            hcc_code,
            category,
            confidence: clamp_confidence(confidence),
            reasoning: reasoning.into(),
            method,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Degrade to an inference fallback.
    ///
    /// Keeps the relevance, code, and category, caps confidence at `ceiling`,
    /// and records the error that ended the inference attempt.
    pub fn into_fallback(self, ceiling: f64, error: impl Into<String>) -> Self {
        let reasoning = format!(
            "inference unavailable; deterministic determination retained: {}",
            self.reasoning
        );
        Self {
            confidence: clamp_confidence(self.confidence.min(ceiling)),
            reasoning,
            method: Method::InferenceFallback,
            error: Some(error.into()),
            ..self
        }
    }
}

/// Clamp into `[0, 1]`; NaN maps to 0.
pub fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}
