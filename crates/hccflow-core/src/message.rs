//! Inbound and outbound event schemas.
//!
//! Payloads are parsed into explicit types and rejected on shape mismatch;
//! nothing downstream touches loosely-typed JSON.

use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::result::{AnalysisMetrics, AnalysisResult};

pub const EXTRACTION_COMPLETED: &str = "extraction.completed";
pub const EXTRACTION_COMPLETED_KEY: &str = "document.extraction.completed";
pub const ANALYSIS_COMPLETED: &str = "analysis.completed";
pub const ANALYSIS_COMPLETED_KEY: &str = "document.analysis.completed";

/// "Conditions for this document are ready."
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionCompleted {
    pub document_id: String,
    pub artifact_reference: String,
    pub correlation_id: String,
    /// Extraction artifact JSON carried inline, used instead of fetching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_content: Option<String>,
}

#[derive(Deserialize)]
struct RawExtractionCompleted {
    message_type: Option<String>,
    document_id: Option<String>,
    #[serde(alias = "extraction_result_path")]
    artifact_reference: Option<String>,
    correlation_id: Option<String>,
    extracted_content: Option<String>,
}

impl ExtractionCompleted {
    /// Parse and validate an inbound payload.
    ///
    /// A missing correlation id is generated; everything else missing is a
    /// [`MessageError`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        let raw: RawExtractionCompleted = serde_json::from_slice(bytes)?;

        if let Some(t) = raw.message_type
            && t != EXTRACTION_COMPLETED
        {
            return Err(MessageError::UnexpectedType(t));
        }

        let document_id = non_blank(raw.document_id).ok_or(MessageError::MissingField("document_id"))?;
        let artifact_reference =
            non_blank(raw.artifact_reference).ok_or(MessageError::MissingField("artifact_reference"))?;
        let correlation_id =
            non_blank(raw.correlation_id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            document_id,
            artifact_reference,
            correlation_id,
            extracted_content: non_blank(raw.extracted_content),
        })
    }
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

/// "Analysis for this document is persisted."
///
/// Delivered at least once; consumers upsert by `document_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCompleted {
    pub message_type: String,
    pub document_id: String,
    pub result_reference: String,
    pub correlation_id: String,
    pub metadata: AnalysisMetrics,
    /// RFC 3339.
    pub timestamp: String,
}

impl AnalysisCompleted {
    pub fn new(result: &AnalysisResult, result_reference: &str, correlation_id: &str) -> Self {
        Self {
            message_type: ANALYSIS_COMPLETED.to_string(),
            document_id: result.document_id().to_string(),
            result_reference: result_reference.to_string(),
            correlation_id: correlation_id.to_string(),
            metadata: result.metrics().clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
