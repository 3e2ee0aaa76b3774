//! Deterministic pass: exact lookup of a condition's code in the reference index.

use hccflow_core::{Condition, Determination, Method, ValidationError, is_well_formed};

use crate::reference::ReferenceIndex;

pub const DIRECT_MATCH: &str = "direct code match";
pub const NO_MATCH: &str = "no match in reference index";

/// Outcome of matching one condition.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub determination: Determination,
    /// Set when the code was missing or malformed.
    pub validation: Option<ValidationError>,
}

impl MatchOutcome {
    /// Validation failures always go to the inference pass.
    pub fn forces_escalation(&self) -> bool {
        self.validation.is_some()
    }
}

/// Reference-table matcher. Never calls out to inference.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    no_match_confidence: f64,
}

impl Matcher {
    pub fn new(no_match_confidence: f64) -> Self {
        Self {
            no_match_confidence,
        }
    }

    pub fn match_condition(&self, condition: &Condition, index: &ReferenceIndex) -> MatchOutcome {
        let Some(code) = condition.normalized_code() else {
            let err = ValidationError::MissingCode {
                condition_id: condition.id.clone(),
            };
            return provisional("missing code", err);
        };

        if !is_well_formed(&code) {
            let err = ValidationError::MalformedCode {
                condition_id: condition.id.clone(),
                code: condition.icd_code.clone().unwrap_or_default(),
            };
            return provisional("malformed code", err);
        }

        let determination = match index.lookup(&code) {
            Some(entry) => Determination::new(
                true,
                Some(code),
                entry.category_label(),
                1.0,
                DIRECT_MATCH,
                Method::Deterministic,
            ),
            None => Determination::new(
                false,
                None,
                None,
                self.no_match_confidence,
                NO_MATCH,
                Method::Deterministic,
            ),
        };

        MatchOutcome {
            determination,
            validation: None,
        }
    }
}

fn provisional(reasoning: &str, err: ValidationError) -> MatchOutcome {
    let determination = Determination::new(false, None, None, 0.0, reasoning, Method::Deterministic)
        .with_error(err.to_string());
    MatchOutcome {
        determination,
        validation: Some(err),
    }
}
