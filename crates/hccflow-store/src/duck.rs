//! DuckDB-backed document status sink.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use duckdb::{Connection, OptionalExt, params};
use hccflow_core::AnalysisMetrics;
use tracing::info;

use crate::StoreError;
use crate::status::{DocumentStatus, StatusSink};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS document_status (
    document_id            VARCHAR PRIMARY KEY,
    status                 VARCHAR NOT NULL,
    detail                 VARCHAR,
    result_reference       VARCHAR,
    total_conditions       BIGINT,
    hcc_relevant_count     BIGINT,
    high_confidence_count  BIGINT,
    confidence_avg         DOUBLE,
    error_count            BIGINT,
    updated_at             TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS dead_letters (
    document_id       VARCHAR,
    correlation_id    VARCHAR,
    reason            VARCHAR NOT NULL,
    dead_lettered_at  TIMESTAMPTZ NOT NULL
);
";

/// One row of `document_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRow {
    pub document_id: String,
    pub status: String,
    pub detail: Option<String>,
    pub result_reference: Option<String>,
    pub total_conditions: Option<i64>,
    pub hcc_relevant_count: Option<i64>,
    pub confidence_avg: Option<f64>,
}

/// Document status and dead-letter log in DuckDB.
///
/// In-memory with [`open`](Self::open), file-backed with
/// [`open_persistent`](Self::open_persistent). Rows are keyed by document id
/// and overwritten on reprocessing.
pub struct DuckStatusSink {
    conn: Mutex<Connection>,
}

impl DuckStatusSink {
    /// Open an in-memory DuckDB database.
    pub fn open() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Open or create a persistent DuckDB database at the given path.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        let sink = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "status database opened");
        Ok(sink)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Other("status connection lock poisoned".into()))
    }

    pub fn status(&self, document_id: &str) -> Result<Option<StatusRow>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT document_id, status, detail, result_reference,
                        total_conditions, hcc_relevant_count, confidence_avg
                 FROM document_status WHERE document_id = ?",
                [document_id],
                |row| {
                    Ok(StatusRow {
                        document_id: row.get(0)?,
                        status: row.get(1)?,
                        detail: row.get(2)?,
                        result_reference: row.get(3)?,
                        total_conditions: row.get(4)?,
                        hcc_relevant_count: row.get(5)?,
                        confidence_avg: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ── Counts ──

    pub fn status_count(&self) -> Result<usize, StoreError> {
        self.count_table("document_status")
    }

    pub fn dead_letter_count(&self) -> Result<usize, StoreError> {
        self.count_table("dead_letters")
    }

    fn count_table(&self, table: &str) -> Result<usize, StoreError> {
        let sql = format!("SELECT count(*)::BIGINT AS cnt FROM {table}");
        let count: i64 = self.conn()?.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl StatusSink for DuckStatusSink {
    fn record_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO document_status (document_id, status, detail, updated_at)
             VALUES (?, ?, ?, now())",
            params![document_id, status.as_str(), detail],
        )?;
        Ok(())
    }

    fn record_analyzed(
        &self,
        document_id: &str,
        result_reference: &str,
        metrics: &AnalysisMetrics,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO document_status
                (document_id, status, detail, result_reference, total_conditions,
                 hcc_relevant_count, high_confidence_count, confidence_avg, error_count, updated_at)
             VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, now())",
            params![
                document_id,
                DocumentStatus::Analyzed.as_str(),
                result_reference,
                metrics.total_conditions as i64,
                metrics.hcc_relevant_count as i64,
                metrics.high_confidence_count as i64,
                metrics.confidence_avg,
                metrics.error_count as i64,
            ],
        )?;
        Ok(())
    }

    fn record_dead_letter(
        &self,
        document_id: Option<&str>,
        correlation_id: Option<&str>,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO dead_letters (document_id, correlation_id, reason, dead_lettered_at)
             VALUES (?, ?, ?, now())",
            params![document_id, correlation_id, reason],
        )?;
        Ok(())
    }
}
