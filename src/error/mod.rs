use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Langbase error: {0}")]
    Langbase(#[from] LangbaseError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Analysis instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    #[error("Concurrent modification of instance {instance_id} (expected version {expected})")]
    Conflict { instance_id: String, expected: i64 },

    #[error("Invalid status transition for {instance_id}: {from} -> {to}")]
    InvalidTransition {
        instance_id: String,
        from: String,
        to: String,
    },

    #[error("Instance {instance_id} is terminal ({status})")]
    TerminalInstance { instance_id: String, status: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Langbase API errors
#[derive(Debug, Error)]
pub enum LangbaseError {
    #[error("Langbase unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LangbaseError {
    /// Whether a retry of the same request may succeed.
    ///
    /// Timeouts, connection failures, rate limiting and server-side errors
    /// are transient. Other 4xx responses and undecodable envelopes mean the
    /// request itself is wrong and retrying cannot help.
    pub fn is_transient(&self) -> bool {
        match self {
            LangbaseError::Unavailable { .. } | LangbaseError::Timeout { .. } => true,
            LangbaseError::Api { status, .. } => {
                matches!(status, 408 | 429) || (500..=599).contains(status)
            }
            LangbaseError::InvalidResponse { .. } => false,
            LangbaseError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        }
    }
}

/// Stage-local errors.
///
/// These never cross the executor boundary as `Err`: the executor folds them
/// into a [`crate::pipeline::StageResult`] outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Reasoning service failed transiently after {attempts} attempt(s): {message}")]
    TransientService { message: String, attempts: u32 },

    #[error("Reasoning service rejected the request: {message}")]
    Service { message: String },

    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Stage {stage_id} has unmet dependencies: {}", missing.join(", "))]
    DependencyNotMet {
        stage_id: String,
        missing: Vec<String>,
    },

    #[error("Input insufficient to proceed: {question}")]
    UserInputInsufficient { question: String },

    #[error("Checkpoint failed: {message}")]
    Checkpoint { message: String },
}

impl StageError {
    /// The persisted error kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::TransientService { .. } => ErrorKind::TransientServiceError,
            StageError::Service { .. } => ErrorKind::ServiceError,
            StageError::Validation { .. } => ErrorKind::ValidationError,
            StageError::DependencyNotMet { .. } => ErrorKind::DependencyNotMet,
            StageError::UserInputInsufficient { .. } => ErrorKind::UserInputInsufficient,
            StageError::Checkpoint { .. } => ErrorKind::CheckpointError,
        }
    }
}

/// Orchestrator API errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline definition: {message}")]
    InvalidDefinition { message: String },

    #[error("Instance {instance_id} is not awaiting clarification (status: {status})")]
    NotAwaitingClarification { instance_id: String, status: String },

    #[error("Instance {instance_id} is already {status}")]
    AlreadyTerminal { instance_id: String, status: String },

    #[error("Clarification answer cannot be empty")]
    EmptyAnswer,

    #[error("Drain timed out with {active} stage execution(s) still active")]
    ShutdownInterrupted { active: usize },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Error kinds persisted on a failed chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retries against the reasoning service were exhausted.
    TransientServiceError,
    /// The reasoning service rejected the request permanently.
    ServiceError,
    /// A required anchor field was missing after the corrective re-attempt.
    ValidationError,
    /// A stage was dispatched before its dependencies completed.
    DependencyNotMet,
    /// Recorded for audit only; it pauses rather than fails an instance.
    UserInputInsufficient,
    /// The owner cancelled the analysis.
    UserCancelled,
    /// The stage result could not be checkpointed.
    CheckpointError,
}

impl ErrorKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientServiceError => "transient_service_error",
            ErrorKind::ServiceError => "service_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::DependencyNotMet => "dependency_not_met",
            ErrorKind::UserInputInsufficient => "user_input_insufficient",
            ErrorKind::UserCancelled => "user_cancelled",
            ErrorKind::CheckpointError => "checkpoint_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transient_service_error" => Ok(ErrorKind::TransientServiceError),
            "service_error" => Ok(ErrorKind::ServiceError),
            "validation_error" => Ok(ErrorKind::ValidationError),
            "dependency_not_met" => Ok(ErrorKind::DependencyNotMet),
            "user_input_insufficient" => Ok(ErrorKind::UserInputInsufficient),
            "user_cancelled" => Ok(ErrorKind::UserCancelled),
            "checkpoint_error" => Ok(ErrorKind::CheckpointError),
            _ => Err(format!("Unknown error kind: {}", s)),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for Langbase operations
pub type LangbaseResult<T> = Result<T, LangbaseError>;

/// Result type alias for orchestrator operations
pub type PipelineResult<T> = Result<T, PipelineError>;
