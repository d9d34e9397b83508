//! Error types for the `audit-rag` crate.

use thiserror::Error;

/// Errors that can occur while indexing, retrieving, or auditing.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The subject document could not be turned into pages.
    #[error("Unreadable document '{document}': {reason}")]
    UnreadableDocument {
        /// Name of the document that failed.
        document: String,
        /// A short human-readable cause.
        reason: String,
    },

    /// The subject document produced no indexable text.
    #[error("Document '{0}' contains no indexable text")]
    EmptyDocument(String),

    /// A checklist row or file could not be used.
    #[error("Malformed checklist entry in '{checklist}' (row {row}): {reason}")]
    MalformedChecklistEntry {
        /// The checklist identifier.
        checklist: String,
        /// The 1-based data row, or 0 for a file-level problem.
        row: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Building a new store generation failed; the previous one stays active.
    #[error("Refresh of store '{store}' failed: {reason}")]
    StoreRefreshFailure {
        /// The store that failed to refresh.
        store: String,
        /// A description of the failure.
        reason: String,
    },

    /// Memory or disk usage is above the configured budget.
    #[error("Resource budget exceeded: {detail}")]
    ResourceBudgetExceeded {
        /// Which metric is over budget and by how much.
        detail: String,
    },

    /// The reasoning/summarization capability failed.
    #[error("Reasoning capability error: {0}")]
    ReasoningCapabilityError(String),

    /// An error occurred during embedding generation.
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingError {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A vector index operation failed (dimension mismatch, corrupt file).
    #[error("Index error: {0}")]
    IndexError(String),

    /// No checklist is registered under the requested identifier.
    #[error("Unknown checklist: {0}")]
    UnknownChecklist(String),

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Persisting a result set failed.
    #[error("Result sink error: {0}")]
    SinkError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// A convenience result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
