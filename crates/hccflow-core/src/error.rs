use thiserror::Error;

/// Invalid configuration. Fatal at startup: the process must not start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("escalate-all requires an inference endpoint")]
    EscalateAllWithoutInference,

    #[error("inference endpoint configured without an API key")]
    MissingApiKey,

    #[error("reference data: {0}")]
    Reference(String),

    #[error("{0}")]
    Other(String),
}

/// A per-condition validation failure. Recorded, never fatal to a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("condition {condition_id} has no code")]
    MissingCode { condition_id: String },

    #[error("condition {condition_id} has malformed code {code:?}")]
    MalformedCode { condition_id: String, code: String },
}

impl ValidationError {
    pub fn condition_id(&self) -> &str {
        match self {
            Self::MissingCode { condition_id } | Self::MalformedCode { condition_id, .. } => {
                condition_id
            }
        }
    }
}

/// An inbound event that does not match its schema (poison message).
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("unexpected message type {0:?}")]
    UnexpectedType(String),
}

/// An error entry in an analysis result.
///
/// `condition_id` is `None` for document-level errors.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionError {
    pub condition_id: Option<String>,
    pub message: String,
}

impl ConditionError {
    pub fn document(message: impl Into<String>) -> Self {
        Self {
            condition_id: None,
            message: message.into(),
        }
    }

    pub fn condition(condition_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            condition_id: Some(condition_id.into()),
            message: message.into(),
        }
    }
}

impl From<ValidationError> for ConditionError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::MissingCode { condition_id } => {
                Self::condition(condition_id, "missing code")
            }
            ValidationError::MalformedCode { condition_id, code } => {
                Self::condition(condition_id, format!("malformed code {code:?}"))
            }
        }
    }
}

impl std::fmt::Display for ConditionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.condition_id {
            Some(id) => write!(f, "condition {id}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}
