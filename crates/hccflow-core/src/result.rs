//! Document-level analysis results and their persisted artifact shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::Condition;
use crate::determination::Determination;
use crate::error::ConditionError;

/// A condition paired with its single determination.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedCondition {
    pub condition: Condition,
    pub determination: Determination,
}

/// Aggregate metrics, recomputed wholly from the determination set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetrics {
    pub total_conditions: usize,
    pub hcc_relevant_count: usize,
    pub high_confidence_count: usize,
    pub confidence_avg: f64,
    pub error_count: usize,
}

/// The outcome of analysing one document.
///
/// Only [`finalize`](crate::aggregate::finalize) builds these, so the metrics
/// always agree with the conditions and errors they describe.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub(crate) document_id: String,
    pub(crate) conditions: Vec<AnalyzedCondition>,
    pub(crate) metrics: AnalysisMetrics,
    pub(crate) errors: Vec<ConditionError>,
}

impl AnalysisResult {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Conditions in document order.
    pub fn conditions(&self) -> &[AnalyzedCondition] {
        &self.conditions
    }

    pub fn metrics(&self) -> &AnalysisMetrics {
        &self.metrics
    }

    pub fn errors(&self) -> &[ConditionError] {
        &self.errors
    }

    /// Determination for a condition id, if present.
    pub fn determination(&self, condition_id: &str) -> Option<&Determination> {
        self.conditions
            .iter()
            .find(|a| a.condition.id == condition_id)
            .map(|a| &a.determination)
    }

    /// Build the persisted/exchanged artifact.
    pub fn to_artifact(&self) -> ResultArtifact {
        ResultArtifact {
            document_id: self.document_id.clone(),
            conditions: self.conditions.iter().map(ArtifactCondition::from).collect(),
            metadata: ArtifactMetadata {
                document_id: self.document_id.clone(),
                metrics: self.metrics.clone(),
            },
            errors: self.errors.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Persisted result document. Field names are stable for downstream readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub document_id: String,
    pub conditions: Vec<ArtifactCondition>,
    pub metadata: ArtifactMetadata,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub document_id: String,
    #[serde(flatten)]
    pub metrics: AnalysisMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactCondition {
    pub id: String,
    pub name: String,
    pub icd_code: Option<String>,
    pub icd_description: Option<String>,
    pub details: Option<String>,
    pub hcc_relevant: bool,
    pub hcc_code: Option<String>,
    pub hcc_category: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub metadata: Map<String, Value>,
}

impl From<&AnalyzedCondition> for ArtifactCondition {
    fn from(a: &AnalyzedCondition) -> Self {
        let c = &a.condition;
        let d = &a.determination;

        let mut metadata = c.metadata.clone();
        metadata
            .entry("extraction_method")
            .or_insert(Value::Null);
        metadata.entry("status").or_insert(Value::Null);
        metadata.insert(
            "icd_code_no_dot".into(),
            c.normalized_code().map_or(Value::Null, Value::String),
        );
        metadata.insert("is_hcc_relevant".into(), Value::Bool(d.relevant));
        metadata.insert("analysis_source".into(), d.method.as_str().into());
        if let Some(err) = &d.error {
            metadata.insert("analysis_error".into(), err.clone().into());
        }

        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            icd_code: c.icd_code.clone(),
            icd_description: c.icd_description.clone(),
            details: c.details.clone(),
            hcc_relevant: d.relevant,
            hcc_code: d.hcc_code.clone(),
            hcc_category: d.category.clone(),
            confidence: d.confidence,
            reasoning: d.reasoning.clone(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::finalize;
    use crate::determination::Method;

    fn condition(id: &str, code: Option<&str>) -> Condition {
        let mut metadata = Map::new();
        metadata.insert("status".into(), "Chronic".into());
        Condition {
            id: id.into(),
            name: format!("condition {id}"),
            icd_code: code.map(String::from),
            icd_description: None,
            details: Some("stable".into()),
            ordering: 0,
            metadata,
        }
    }

    #[test]
    fn artifact_has_stable_field_names() {
        let pairs = vec![(
            condition("cond-1", Some("E11.65")),
            Determination::new(
                true,
                Some("E1165".into()),
                Some("Diabetes".into()),
                1.0,
                "direct code match",
                Method::Deterministic,
            ),
        )];
        let result = finalize("doc-1", pairs, vec![], 0.9);
        let json = serde_json::to_value(result.to_artifact()).unwrap();

        assert_eq!(json["document_id"], "doc-1");
        let c = &json["conditions"][0];
        for key in [
            "id",
            "name",
            "icd_code",
            "icd_description",
            "details",
            "hcc_relevant",
            "hcc_code",
            "hcc_category",
            "confidence",
            "reasoning",
        ] {
            assert!(c.get(key).is_some(), "missing condition field {key}");
        }
        assert_eq!(c["metadata"]["icd_code_no_dot"], "E1165");
        assert_eq!(c["metadata"]["is_hcc_relevant"], true);
        assert_eq!(c["metadata"]["status"], "Chronic");
        assert!(c["metadata"]["extraction_method"].is_null());
        assert_eq!(c["metadata"]["analysis_source"], "deterministic");

        let m = &json["metadata"];
        assert_eq!(m["document_id"], "doc-1");
        assert_eq!(m["total_conditions"], 1);
        assert_eq!(m["hcc_relevant_count"], 1);
        assert_eq!(m["high_confidence_count"], 1);
        assert_eq!(m["confidence_avg"], 1.0);
        assert_eq!(m["error_count"], 0);
        assert!(json["errors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn artifact_records_errors_and_fallback_source() {
        let det = Determination::new(false, None, None, 0.0, "missing code", Method::Deterministic)
            .into_fallback(0.3, "rate limited");
        let result = finalize(
            "doc-2",
            vec![(condition("cond-1", None), det)],
            vec![ConditionError::condition("cond-1", "missing code")],
            0.9,
        );
        let artifact = result.to_artifact();

        assert_eq!(artifact.errors, vec!["condition cond-1: missing code"]);
        let meta = &artifact.conditions[0].metadata;
        assert_eq!(meta["analysis_source"], "inference-fallback");
        assert_eq!(meta["analysis_error"], "rate limited");
        assert!(meta["icd_code_no_dot"].is_null());
    }

    #[test]
    fn artifact_reads_back() {
        let result = finalize("doc-3", vec![], vec![], 0.9);
        let json = serde_json::to_string(&result.to_artifact()).unwrap();
        let parsed: ResultArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.document_id, "doc-3");
        assert_eq!(parsed.metadata.metrics.total_conditions, 0);
    }
}
