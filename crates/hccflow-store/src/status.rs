//! Per-document processing status.
//!
//! The runner reports lifecycle transitions here; what sits behind the sink
//! is opaque to it. [`DuckStatusSink`](crate::DuckStatusSink) is the
//! persistent implementation, [`NoopSink`] disables status tracking.

use std::sync::Mutex;

use hccflow_core::AnalysisMetrics;

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Analyzing,
    Analyzed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Analyzed => "analyzed",
            Self::Failed => "failed",
        }
    }
}

pub trait StatusSink: Send + Sync {
    /// Upsert the status row for a document.
    fn record_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Mark a document analysed, with its result reference and metrics.
    fn record_analyzed(
        &self,
        document_id: &str,
        result_reference: &str,
        metrics: &AnalysisMetrics,
    ) -> Result<(), StoreError>;

    /// Append to the dead-letter log.
    fn record_dead_letter(
        &self,
        document_id: Option<&str>,
        correlation_id: Option<&str>,
        reason: &str,
    ) -> Result<(), StoreError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl StatusSink for NoopSink {
    fn record_status(&self, _: &str, _: DocumentStatus, _: Option<&str>) -> Result<(), StoreError> {
        Ok(())
    }

    fn record_analyzed(&self, _: &str, _: &str, _: &AnalysisMetrics) -> Result<(), StoreError> {
        Ok(())
    }

    fn record_dead_letter(&self, _: Option<&str>, _: Option<&str>, _: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Status {
        document_id: String,
        status: DocumentStatus,
        detail: Option<String>,
    },
    Analyzed {
        document_id: String,
        result_reference: String,
        metrics: AnalysisMetrics,
    },
    DeadLetter {
        document_id: Option<String>,
        correlation_id: Option<String>,
        reason: String,
    },
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StatusEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// The latest status recorded for a document.
    pub fn last_status(&self, document_id: &str) -> Option<DocumentStatus> {
        self.events().into_iter().rev().find_map(|e| match e {
            StatusEvent::Status {
                document_id: id,
                status,
                ..
            } if id == document_id => Some(status),
            StatusEvent::Analyzed {
                document_id: id, ..
            } if id == document_id => Some(DocumentStatus::Analyzed),
            _ => None,
        })
    }

    pub fn dead_letters(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                StatusEvent::DeadLetter { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: StatusEvent) -> Result<(), StoreError> {
        self.events
            .lock()
            .map_err(|_| StoreError::Other("status sink lock poisoned".into()))?
            .push(event);
        Ok(())
    }
}

impl StatusSink for MemorySink {
    fn record_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        self.push(StatusEvent::Status {
            document_id: document_id.to_string(),
            status,
            detail: detail.map(String::from),
        })
    }

    fn record_analyzed(
        &self,
        document_id: &str,
        result_reference: &str,
        metrics: &AnalysisMetrics,
    ) -> Result<(), StoreError> {
        self.push(StatusEvent::Analyzed {
            document_id: document_id.to_string(),
            result_reference: result_reference.to_string(),
            metrics: metrics.clone(),
        })
    }

    fn record_dead_letter(
        &self,
        document_id: Option<&str>,
        correlation_id: Option<&str>,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.push(StatusEvent::DeadLetter {
            document_id: document_id.map(String::from),
            correlation_id: correlation_id.map(String::from),
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_tracks_latest_status() {
        let sink = MemorySink::new();
        sink.record_status("doc-1", DocumentStatus::Analyzing, None).unwrap();
        assert_eq!(sink.last_status("doc-1"), Some(DocumentStatus::Analyzing));

        sink.record_analyzed("doc-1", "doc-1_analyzed.json", &AnalysisMetrics::default())
            .unwrap();
        assert_eq!(sink.last_status("doc-1"), Some(DocumentStatus::Analyzed));
        assert_eq!(sink.last_status("doc-2"), None);
    }

    #[test]
    fn memory_sink_dead_letters() {
        let sink = MemorySink::new();
        sink.record_dead_letter(None, None, "malformed event JSON").unwrap();
        assert_eq!(sink.dead_letters(), vec!["malformed event JSON"]);
    }

    #[test]
    fn status_strings() {
        assert_eq!(DocumentStatus::Analyzing.as_str(), "analyzing");
        assert_eq!(DocumentStatus::Analyzed.as_str(), "analyzed");
        assert_eq!(DocumentStatus::Failed.as_str(), "failed");
    }
}
