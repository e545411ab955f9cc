//! Error types for the engine and its collaborators

use thiserror::Error;

/// Failure reported by an external collaborator (embedding, reasoning, live reads)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Worth retrying: timeouts, rate limits, server errors
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying will not help: bad request, malformed response
    #[error("{0}")]
    Permanent(String),
    /// The service answered, but the requested sheet or cell does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::Transient(m) | ServiceError::Permanent(m) | ServiceError::NotFound(m) => m,
        }
    }
}

/// Engine error kinds surfaced to callers
#[derive(Debug, Error)]
pub enum SenseError {
    /// The workbook could not be turned into records at all
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// No index has been built for this spreadsheet yet
    #[error("spreadsheet '{spreadsheet_id}' needs indexing")]
    IndexUnavailable { spreadsheet_id: String },

    /// An external call failed permanently or exhausted its retries
    #[error("{service} failed after {attempts} attempt(s): {message}")]
    ExternalService {
        service: String,
        attempts: usize,
        message: String,
    },

    /// A live read named a sheet or cell the spreadsheet does not have
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller cancelled the session or rebuild
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl SenseError {
    /// Short machine-readable label, used by the CLI's JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            SenseError::Extraction(_) => "extraction_error",
            SenseError::IndexUnavailable { .. } => "index_unavailable",
            SenseError::ExternalService { .. } => "external_service_failure",
            SenseError::NotFound(_) => "not_found",
            SenseError::Cancelled => "cancelled",
            SenseError::Config(_) => "config_error",
            SenseError::Io(_) => "io_error",
            SenseError::Serialization(_) => "serialization_error",
        }
    }
}

pub type SenseResult<T> = std::result::Result<T, SenseError>;
