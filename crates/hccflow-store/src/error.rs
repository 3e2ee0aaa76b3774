use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("invalid artifact {reference}: {source}")]
    InvalidArtifact {
        reference: String,
        source: serde_json::Error,
    },

    #[error("invalid artifact reference {0:?}")]
    InvalidReference(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] ::duckdb::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// A missing artifact counts: the producer may not have finished writing it.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::InvalidArtifact { .. } | Self::InvalidReference(_)
        )
    }
}
