//! Conditions as handed over by the extraction stage.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::code::normalize_code;

/// A medical condition extracted from a clinical document.
///
/// Immutable once received. `ordering` is the position in the extraction
/// artifact and is assigned by [`ExtractionArtifact::into_conditions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icd_code: Option<String>,
    #[serde(default)]
    pub icd_description: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(skip)]
    pub ordering: usize,
    /// Extraction metadata (`extraction_method`, `status`, ...), passed through.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Condition {
    /// Normalised source code, or `None` when the code is missing or blank.
    pub fn normalized_code(&self) -> Option<String> {
        self.icd_code
            .as_deref()
            .map(normalize_code)
            .filter(|c| !c.is_empty())
    }
}

/// The extraction stage's output for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionArtifact {
    pub document_id: String,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExtractionArtifact {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Consume the artifact, numbering conditions in document order.
    pub fn into_conditions(self) -> Vec<Condition> {
        self.conditions
            .into_iter()
            .enumerate()
            .map(|(i, mut c)| {
                c.ordering = i;
                c
            })
            .collect()
    }
}
