use serde::Deserialize;
use serde::Serialize;

/// A single validation finding, surfaced to the caller in the synchronous
/// error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub code: String,
    pub severity: String,
    pub location: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(code: &str, location: &str, message: &str) -> Self {
        Self {
            code: code.to_owned(),
            severity: "error".to_owned(),
            location: location.to_owned(),
            message: message.to_owned(),
        }
    }
}

/// The pipeline error taxonomy. Retryability drives how the worker
/// runtime disposes of the in-flight message.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Input violates the contract; terminalizes the submission.
    #[error("validation failed with {} issue(s)", .0.len())]
    Validation(Vec<ValidationIssue>),

    /// A semantic business rule failed; same handling as validation.
    #[error("business rule violated: {code}: {message}")]
    BusinessRule { code: String, message: String },

    /// Object store, database or bus hiccup; the bus redelivers.
    #[error("transient infrastructure failure: {0}")]
    TransientInfrastructure(#[source] anyhow::Error),

    /// Payer-side failure. 5xx/timeouts are retryable with backoff; 4xx
    /// are business outcomes and never retried.
    #[error("payer error {code}: {message}")]
    Payer {
        code: String,
        message: String,
        retryable: bool,
    },

    /// Undeserializable envelope; goes straight to the DLQ.
    #[error("poison message: {0}")]
    Poison(String),

    /// Missing object for a recorded payload pointer.
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
}

impl PipelineError {
    pub fn transient(e: impl Into<anyhow::Error>) -> Self {
        Self::TransientInfrastructure(e.into())
    }

    /// Retryable errors are surfaced to the bus for redelivery;
    /// everything else terminalizes the stage.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::TransientInfrastructure(_) => true,
            PipelineError::Payer { retryable, .. } => *retryable,
            PipelineError::Validation(_)
            | PipelineError::BusinessRule { .. }
            | PipelineError::Poison(_)
            | PipelineError::NotFound { .. } => false,
        }
    }

    /// Short machine code recorded on the tracker and event rows.
    pub fn code(&self) -> String {
        match self {
            PipelineError::Validation(_) => "VALIDATION_FAILED".to_owned(),
            PipelineError::BusinessRule { code, .. } => code.clone(),
            PipelineError::TransientInfrastructure(_) => "TRANSIENT_INFRASTRUCTURE".to_owned(),
            PipelineError::Payer { code, .. } => code.clone(),
            PipelineError::Poison(_) => "POISON_MESSAGE".to_owned(),
            PipelineError::NotFound { .. } => "OBJECT_NOT_FOUND".to_owned(),
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::transient(e)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::transient(e)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        // malformed JSON reaching a handler is a contract violation, not
        // an infrastructure hiccup
        PipelineError::Poison(e.to_string())
    }
}
