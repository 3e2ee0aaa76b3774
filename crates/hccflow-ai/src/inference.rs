//! LLM inference client for escalated conditions.
//!
//! The client owns retry, backoff, timeout and fallback. Backends only turn a
//! [`GenerateRequest`] into text; [`HttpBackend`] speaks a Messages-style JSON
//! API, tests plug in scripted backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hccflow_core::{Condition, Determination, InferenceSettings, Method};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prompt::{SYSTEM_PROMPT, build_user_prompt};
use crate::reference::ReferenceEntry;

pub const NO_DETERMINATION: &str = "no determination returned";

const API_VERSION: &str = "2023-06-01";

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference call timed out after {0:?}")]
    Timeout(Duration),
    #[error("inference endpoint rate limited the request")]
    RateLimited,
    #[error("inference endpoint returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("inference request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed inference output: {0}")]
    Malformed(String),
    #[error("inference cancelled")]
    Cancelled,
}

impl InferenceError {
    /// Worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. } | Self::Cancelled)
    }
}

// ── Backend ──

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    pub tokens_used: u32,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, InferenceError>;
}

/// Messages-style HTTP backend (`POST {endpoint}/v1/messages`).
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [UserMessage<'a>; 1],
}

#[derive(Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl HttpBackend {
    /// `endpoint` is the API base, like `https://api.anthropic.com`.
    pub fn new(endpoint: &str, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let base = endpoint.trim_end_matches('/');
        let url = if base.ends_with("/v1/messages") {
            base.to_string()
        } else {
            format!("{base}/v1/messages")
        };
        Self {
            client: reqwest::Client::new(),
            url,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn from_settings(settings: &InferenceSettings) -> Self {
        Self::new(&settings.endpoint, settings.api_key.clone(), settings.model.clone())
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, InferenceError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system_prompt,
            messages: [UserMessage {
                role: "user",
                content: &request.user_prompt,
            }],
        };

        debug!(url = %self.url, model = %self.model, "calling inference endpoint");
        let resp = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if status.as_u16() == 429 {
            return Err(InferenceError::RateLimited);
        }
        if status.is_server_error() {
            return Err(InferenceError::Server {
                status: status.as_u16(),
                body: text,
            });
        }
        if !status.is_success() {
            return Err(InferenceError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_messages_body(&text)
    }
}

fn parse_messages_body(body: &str) -> Result<GenerateResponse, InferenceError> {
    let parsed: MessagesResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::Malformed(e.to_string()))?;
    let text: String = parsed.content.into_iter().filter_map(|b| b.text).collect();
    let tokens_used = parsed
        .usage
        .map(|u| u.input_tokens + u.output_tokens)
        .unwrap_or(0);
    Ok(GenerateResponse { text, tokens_used })
}

// ── Retry policy ──

/// Bounded retry with exponential backoff and ±20% jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on each attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &InferenceSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            timeout: settings.timeout,
        }
    }

    /// `min(base * 2^retry, max)` before jitter.
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay before retry number `retry` (0-based), jittered by U(0.8, 1.2).
    pub fn backoff(&self, retry: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        self.backoff_ceiling(retry).mul_f64(jitter)
    }
}

// ── Client ──

/// A condition sent to inference together with its deterministic view.
#[derive(Debug, Clone)]
pub struct EscalatedCondition {
    pub condition: Condition,
    pub deterministic: Determination,
}

pub struct InferenceClient {
    backend: Arc<dyn InferenceBackend>,
    policy: RetryPolicy,
    fallback_confidence: f64,
    max_tokens: u32,
    temperature: f32,
}

impl InferenceClient {
    pub fn new(backend: Arc<dyn InferenceBackend>, settings: &InferenceSettings) -> Self {
        Self {
            backend,
            policy: RetryPolicy::from_settings(settings),
            fallback_confidence: settings.fallback_confidence,
            max_tokens: settings.max_tokens,
            temperature: 0.0,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify one batch.
    ///
    /// Always returns one determination per input condition, in input order:
    /// model output where it was valid, a fallback otherwise. The only error
    /// is [`InferenceError::Cancelled`].
    pub async fn classify(
        &self,
        batch: &[EscalatedCondition],
        reference: &[ReferenceEntry],
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Determination)>, InferenceError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let request = GenerateRequest {
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_prompt: build_user_prompt(batch, reference),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut last_error: Option<InferenceError> = None;

        for attempt in 0..=self.policy.max_retries {
            if cancel.is_cancelled() {
                return Err(InferenceError::Cancelled);
            }
            if attempt > 0 {
                let delay = self.policy.backoff(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = match tokio::time::timeout(self.policy.timeout, self.backend.generate(&request))
                .await
            {
                Ok(Ok(resp)) => parse_response(&resp.text).map(|entries| (entries, resp.tokens_used)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(InferenceError::Timeout(self.policy.timeout)),
            };

            match outcome {
                Ok((entries, tokens_used)) => {
                    info!(
                        conditions = batch.len(),
                        returned = entries.len(),
                        tokens_used,
                        attempt,
                        "inference batch complete"
                    );
                    return Ok(self.merge(batch, entries));
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "inference attempt failed");
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "inference rejected, not retrying");
                    last_error = Some(e);
                    break;
                }
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "inference failed".to_string());
        warn!(conditions = batch.len(), error = %error, "inference unavailable, using fallback");

        Ok(batch
            .iter()
            .map(|item| (item.condition.id.clone(), self.fallback(item, &error)))
            .collect())
    }

    /// The deterministic view of `item`, degraded to an inference fallback.
    pub fn fallback(&self, item: &EscalatedCondition, error: &str) -> Determination {
        item.deterministic
            .clone()
            .into_fallback(self.fallback_confidence, error)
    }

    /// Merge model entries back onto the batch by condition id.
    fn merge(
        &self,
        batch: &[EscalatedCondition],
        entries: Vec<Result<ResponseEntry, RejectedEntry>>,
    ) -> Vec<(String, Determination)> {
        let mut accepted: HashMap<String, ResponseEntry> = HashMap::new();
        let mut rejected: HashMap<String, String> = HashMap::new();

        for entry in entries {
            match entry {
                Ok(e) => {
                    if !accepted.contains_key(&e.id) && !rejected.contains_key(&e.id) {
                        accepted.insert(e.id.clone(), e);
                    }
                }
                Err(r) => {
                    warn!(id = ?r.id, reason = %r.reason, "rejected inference entry");
                    if let Some(id) = r.id
                        && !accepted.contains_key(&id)
                    {
                        rejected.entry(id).or_insert(r.reason);
                    }
                }
            }
        }

        batch
            .iter()
            .map(|item| {
                let id = &item.condition.id;
                let determination = match accepted.remove(id) {
                    Some(e) => Determination::new(
                        e.hcc_relevant,
                        e.hcc_code,
                        e.hcc_category,
                        e.confidence,
                        e.reasoning.unwrap_or_default(),
                        Method::Inference,
                    ),
                    None => {
                        let error = rejected
                            .remove(id)
                            .unwrap_or_else(|| NO_DETERMINATION.to_string());
                        self.fallback(item, &error)
                    }
                };
                (id.clone(), determination)
            })
            .collect()
    }
}

// ── Response parsing ──

#[derive(Debug, Deserialize)]
struct ResponseBody {
    conditions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ResponseEntry {
    id: String,
    hcc_relevant: bool,
    #[serde(default)]
    hcc_code: Option<String>,
    #[serde(default)]
    hcc_category: Option<String>,
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct RejectedEntry {
    id: Option<String>,
    reason: String,
}

/// Parse model text into per-entry results.
///
/// Tries the raw text, then the body of a fenced code block, then the
/// outermost `{ … }` span. A body that yields none of these is malformed.
fn parse_response(text: &str) -> Result<Vec<Result<ResponseEntry, RejectedEntry>>, InferenceError> {
    let body = candidates(text)
        .into_iter()
        .find_map(|c| serde_json::from_str::<ResponseBody>(c).ok())
        .ok_or_else(|| {
            let preview: String = text.chars().take(120).collect();
            InferenceError::Malformed(format!("no conditions object in response: {preview:?}"))
        })?;

    Ok(body.conditions.into_iter().map(validate_entry).collect())
}

fn candidates(text: &str) -> Vec<&str> {
    let mut out = vec![text.trim()];

    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        // Skip a language tag on the fence line.
        let body_start = after.find('\n').map_or(0, |i| i + 1);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            out.push(body[..end].trim());
        }
    }

    if let (Some(open), Some(close)) = (text.find('{'), text.rfind('}'))
        && open < close
    {
        out.push(&text[open..=close]);
    }

    out
}

fn validate_entry(value: serde_json::Value) -> Result<ResponseEntry, RejectedEntry> {
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from);

    let entry: ResponseEntry = serde_json::from_value(value).map_err(|e| RejectedEntry {
        id: id.clone(),
        reason: format!("invalid determination returned: {e}"),
    })?;

    if !entry.confidence.is_finite() || !(0.0..=1.0).contains(&entry.confidence) {
        return Err(RejectedEntry {
            id,
            reason: format!(
                "invalid determination returned: confidence {} outside [0, 1]",
                entry.confidence
            ),
        });
    }

    Ok(entry)
}
