//! Reference code table: ICD-10 codes known to map to an HCC category.
//!
//! Loaded from CSV or Parquet into Arrow record batches, then indexed by
//! normalised code for O(1) lookup. The index is immutable once built; the
//! process shares it through a [`ReferenceHandle`] and replaces it wholesale
//! on reload.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Seek;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, LargeStringArray, StringArray, StringViewArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use hccflow_core::config::ReferenceColumns;
use hccflow_core::{ConfigError, normalize_code};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::errors::ParquetError;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Separators between labels in a multi-valued category cell.
const CATEGORY_SEPARATORS: &[char] = &[';', '|'];

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("reference table has no column {0:?}")]
    MissingColumn(String),
    #[error("unsupported reference file {0} (expected .csv or .parquet)")]
    UnsupportedFormat(PathBuf),
    #[error("reference table contains no codes")]
    Empty,
    #[error("reference load task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ReferenceError> for ConfigError {
    fn from(e: ReferenceError) -> Self {
        ConfigError::Reference(e.to_string())
    }
}

/// One row of the reference table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEntry {
    /// Lookup key, see [`normalize_code`].
    pub code: String,
    /// The code as written in the table.
    pub display_code: String,
    pub description: String,
    pub categories: Vec<String>,
}

impl ReferenceEntry {
    /// Category labels joined for display, `None` when the row has none.
    pub fn category_label(&self) -> Option<String> {
        if self.categories.is_empty() {
            None
        } else {
            Some(self.categories.join("; "))
        }
    }
}

/// Summary statistics for a ReferenceIndex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSummary {
    pub entries: usize,
    pub distinct_categories: usize,
    /// Rows dropped for a null or blank code.
    pub skipped_rows: usize,
    /// Rows dropped because their code was already indexed.
    pub duplicate_rows: usize,
}

/// Reference codes keyed by normalised code.
#[derive(Debug, Clone)]
pub struct ReferenceIndex {
    entries: Vec<ReferenceEntry>,
    by_code: HashMap<String, usize>,
    skipped_rows: usize,
    duplicate_rows: usize,
}

impl ReferenceIndex {
    /// Load a `.csv` (header row required) or `.parquet` reference table.
    pub fn load(path: &Path, columns: &ReferenceColumns) -> Result<Self, ReferenceError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let (schema, batches) = match ext.as_deref() {
            Some("csv") => read_csv(path)?,
            Some("parquet") => read_parquet(path)?,
            _ => return Err(ReferenceError::UnsupportedFormat(path.to_path_buf())),
        };
        check_columns(&schema, columns)?;

        let index = Self::from_batches(&batches, columns)?;
        let summary = index.summary();
        info!(
            path = %path.display(),
            entries = summary.entries,
            categories = summary.distinct_categories,
            skipped = summary.skipped_rows,
            duplicates = summary.duplicate_rows,
            "reference index loaded"
        );
        Ok(index)
    }

    /// Build an index from Arrow batches carrying the configured columns.
    ///
    /// Rows with a null or blank code are skipped; for codes that normalise
    /// to the same key the first row wins.
    pub fn from_batches(
        batches: &[RecordBatch],
        columns: &ReferenceColumns,
    ) -> Result<Self, ReferenceError> {
        let mut entries = Vec::new();
        let mut by_code = HashMap::new();
        let mut skipped_rows = 0;
        let mut duplicate_rows = 0;

        for batch in batches {
            check_columns(batch.schema().as_ref(), columns)?;
            let code_col = column(batch, &columns.code)?;
            let desc_col = column(batch, &columns.description)?;
            let cat_col = column(batch, &columns.category)?;

            for row in 0..batch.num_rows() {
                let Some(raw) = get_string(code_col, row) else {
                    skipped_rows += 1;
                    continue;
                };
                let code = normalize_code(&raw);
                if code.is_empty() {
                    skipped_rows += 1;
                    continue;
                }
                if by_code.contains_key(&code) {
                    duplicate_rows += 1;
                    continue;
                }

                let description = get_string(desc_col, row).unwrap_or_default();
                let categories = get_string(cat_col, row)
                    .map(|c| split_categories(&c))
                    .unwrap_or_default();

                by_code.insert(code.clone(), entries.len());
                entries.push(ReferenceEntry {
                    code,
                    display_code: raw.trim().to_string(),
                    description: description.trim().to_string(),
                    categories,
                });
            }
        }

        if entries.is_empty() {
            return Err(ReferenceError::Empty);
        }

        Ok(Self {
            entries,
            by_code,
            skipped_rows,
            duplicate_rows,
        })
    }

    /// Look up a normalised code.
    pub fn lookup(&self, normalized_code: &str) -> Option<&ReferenceEntry> {
        self.by_code.get(normalized_code).map(|&i| &self.entries[i])
    }

    /// The first `n` entries in table order.
    pub fn sample(&self, n: usize) -> &[ReferenceEntry] {
        &self.entries[..n.min(self.entries.len())]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> ReferenceSummary {
        let categories: HashSet<&str> = self
            .entries
            .iter()
            .flat_map(|e| e.categories.iter().map(|s| s.as_str()))
            .collect();

        ReferenceSummary {
            entries: self.entries.len(),
            distinct_categories: categories.len(),
            skipped_rows: self.skipped_rows,
            duplicate_rows: self.duplicate_rows,
        }
    }
}

// ── Shared handle ──

/// Process-wide reference index with copy-on-write replacement.
///
/// Readers take an `Arc` snapshot with [`current`](Self::current) and keep it
/// for the whole document; a concurrent reload never changes what an
/// in-flight document sees.
#[derive(Clone)]
pub struct ReferenceHandle {
    tx: Arc<watch::Sender<Arc<ReferenceIndex>>>,
}

impl ReferenceHandle {
    pub fn new(index: ReferenceIndex) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(index));
        Self { tx: Arc::new(tx) }
    }

    /// Load the initial index. Failure here is startup-fatal.
    pub fn load(path: &Path, columns: &ReferenceColumns) -> Result<Self, ReferenceError> {
        Ok(Self::new(ReferenceIndex::load(path, columns)?))
    }

    pub fn current(&self) -> Arc<ReferenceIndex> {
        self.tx.borrow().clone()
    }

    /// Observe swaps.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ReferenceIndex>> {
        self.tx.subscribe()
    }

    /// Swap in an already-built index.
    pub fn replace(&self, index: ReferenceIndex) {
        let entries = index.len();
        self.tx.send_replace(Arc::new(index));
        info!(entries, "reference index swapped");
    }

    /// Rebuild from `path` off to the side, then swap.
    ///
    /// On failure the current index stays in place and the error is returned.
    pub async fn reload(&self, path: PathBuf, columns: ReferenceColumns) -> Result<(), ReferenceError> {
        let loaded =
            tokio::task::spawn_blocking(move || ReferenceIndex::load(&path, &columns)).await?;
        match loaded {
            Ok(index) => {
                self.replace(index);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "reference reload failed, keeping current index");
                Err(e)
            }
        }
    }
}

// ── File readers ──

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ReferenceError + '_ {
    move |source| ReferenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a CSV with every column as nullable Utf8; codes like "0100" must not
/// be coerced to integers.
fn read_csv(path: &Path) -> Result<(Schema, Vec<RecordBatch>), ReferenceError> {
    let mut file = File::open(path).map_err(io_error(path))?;
    let (inferred, _) = arrow::csv::reader::Format::default()
        .with_header(true)
        .infer_schema(&mut file, Some(1))?;
    file.rewind().map_err(io_error(path))?;

    let fields: Vec<Field> = inferred
        .fields()
        .iter()
        .map(|f| Field::new(f.name(), DataType::Utf8, true))
        .collect();
    let schema = Schema::new(fields);

    let reader = arrow::csv::ReaderBuilder::new(Arc::new(schema.clone()))
        .with_header(true)
        .build(file)?;
    let batches = reader.collect::<Result<Vec<_>, ArrowError>>()?;
    Ok((schema, batches))
}

fn read_parquet(path: &Path) -> Result<(Schema, Vec<RecordBatch>), ReferenceError> {
    let file = File::open(path).map_err(io_error(path))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().as_ref().clone();
    let batches = builder.build()?.collect::<Result<Vec<_>, ArrowError>>()?;
    Ok((schema, batches))
}

fn check_columns(schema: &Schema, columns: &ReferenceColumns) -> Result<(), ReferenceError> {
    for name in [&columns.code, &columns.description, &columns.category] {
        if schema.column_with_name(name).is_none() {
            return Err(ReferenceError::MissingColumn(name.clone()));
        }
    }
    Ok(())
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a dyn Array, ReferenceError> {
    batch
        .column_by_name(name)
        .map(|c| c.as_ref())
        .ok_or_else(|| ReferenceError::MissingColumn(name.to_string()))
}

fn split_categories(cell: &str) -> Vec<String> {
    cell.split(CATEGORY_SEPARATORS)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ── Arrow extraction helpers ──

/// Extract a non-blank string value (Utf8, LargeUtf8 or Utf8View).
fn get_string(col: &dyn Array, row: usize) -> Option<String> {
    if col.is_null(row) {
        return None;
    }
    let any = col.as_any();
    let value = if let Some(arr) = any.downcast_ref::<StringArray>() {
        arr.value(row)
    } else if let Some(arr) = any.downcast_ref::<LargeStringArray>() {
        arr.value(row)
    } else if let Some(arr) = any.downcast_ref::<StringViewArray>() {
        arr.value(row)
    } else {
        return None;
    };
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
