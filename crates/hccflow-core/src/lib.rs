pub mod aggregate;
pub mod code;
pub mod condition;
pub mod config;
pub mod determination;
pub mod error;
pub mod message;
pub mod result;

pub use aggregate::finalize;
pub use code::{is_well_formed, normalize_code, with_dot};
pub use condition::{Condition, ExtractionArtifact};
pub use config::{
    AnalyzerConfig, EscalationPolicy, InferenceSettings, ReferenceColumns, RunnerSettings,
};
pub use determination::{Determination, Method};
pub use error::{ConditionError, ConfigError, MessageError, ValidationError};
pub use message::{AnalysisCompleted, ExtractionCompleted};
pub use result::{AnalysisMetrics, AnalysisResult, AnalyzedCondition, ResultArtifact};
