use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Template not found: {resource_type} template '{name}' (version {version})")]
    TemplateNotFound {
        name: String,
        version: String,
        resource_type: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Gave up on {operation} after {attempts} attempts: {last_conflict}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_conflict: String,
    },

    /// The resource was persisted but neither a request message nor a failed
    /// marker could be recorded for it.
    #[error(
        "Resource {resource_id} was created but could not be dispatched ({cause}) \
         and could not be marked as failed ({mark_error})"
    )]
    Orphaned {
        resource_id: String,
        cause: String,
        mark_error: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Errors caused by the request itself. These are surfaced to the caller
    /// as-is and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Validation(_)
                | OrchestratorError::TemplateNotFound { .. }
                | OrchestratorError::NotFound(_)
        )
    }

    /// Errors that may succeed when the same operation is attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Conflict(_)
                | OrchestratorError::ChannelUnavailable(_)
                | OrchestratorError::RetryExhausted { .. }
                | OrchestratorError::Orphaned { .. }
                | OrchestratorError::Database(_)
        )
    }

    /// Errors that should be reported to clients as "service unavailable".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ChannelUnavailable(_) | OrchestratorError::Orphaned { .. }
        )
    }
}
