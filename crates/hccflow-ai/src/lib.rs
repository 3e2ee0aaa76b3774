//! Classification layer: reference index, deterministic matcher, LLM
//! inference client, and the pipeline that ties them together per document.

pub mod inference;
pub mod matcher;
pub mod pipeline;
pub mod prompt;
pub mod reference;

pub use inference::{
    EscalatedCondition, GenerateRequest, GenerateResponse, HttpBackend, InferenceBackend,
    InferenceClient, InferenceError, RetryPolicy,
};
pub use matcher::{MatchOutcome, Matcher};
pub use pipeline::{Pipeline, PipelineError, PipelineRun, PipelineState};
pub use reference::{
    ReferenceEntry, ReferenceError, ReferenceHandle, ReferenceIndex, ReferenceSummary,
};
