//! Typed error hierarchy for Shipwright.
//!
//! Four enums cover the four subsystems:
//! - `LlmError`: transport failures talking to the model provider
//! - `StoreError`: job store, secret store and artifact store failures
//! - `StepError`: a pipeline step that could not produce a result
//! - `TransitionError`: a user-triggered transition rejected by its guard
//!
//! The `Display` text of `LlmError` and `StepError` ends up in a job's
//! `error_message`, so it is written for the person who owns the job.

use thiserror::Error;

use crate::pipeline::models::JobStatus;

/// Errors from the model provider transport.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("The model provider rejected your API key. Check the key saved for your account and try again.")]
    InvalidCredential,

    #[error("The model provider is overloaded or rate limiting requests (HTTP {status}). Wait a moment and retry.")]
    Overloaded { status: u16 },

    #[error("The model provider rejected the request: {message}")]
    BadRequest { message: String },

    #[error("The model provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Could not reach the model provider: {0}")]
    Network(String),

    #[error("The model provider reported an error mid-response: {0}")]
    Stream(String),

    #[error("The model hit its output limit and the partial output could not be parsed.")]
    Truncated,

    #[error("The model provider sent a response that could not be understood: {0}")]
    Malformed(String),
}

/// Errors from the persistence collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job {id} is {actual}, expected {expected}")]
    StatusMismatch {
        id: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Invalid artifact key '{0}'")]
    InvalidKey(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Errors raised inside a pipeline step. The dispatcher turns every one of
/// these into a `failed` job carrying the display text.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("No API key is configured for this account. Add your model provider key and retry.")]
    MissingCredential,

    #[error("Cannot run this step: the {what} has not been generated yet.")]
    MissingInput { what: &'static str },

    #[error("{0}")]
    Generation(String),

    #[error("Could not load job data: {0}")]
    Load(String),

    #[error("Failed to store generated files: {0}")]
    Artifact(String),

    #[error("Failed to save step results: {0}")]
    Persistence(String),
}

impl From<LlmError> for StepError {
    fn from(err: LlmError) -> Self {
        Self::Generation(err.to_string())
    }
}

/// Errors from user- or system-triggered state transitions.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("{message}")]
    InvalidState { message: String, actual: JobStatus },

    #[error("{0}")]
    Invalid(String),

    #[error("Failed to enqueue next step: {0}")]
    Enqueue(#[source] anyhow::Error),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::NotFound { id },
            StoreError::StatusMismatch { actual, expected, .. } => Self::InvalidState {
                message: format!("job is {actual}, expected {expected}"),
                actual,
            },
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_messages_are_user_facing() {
        assert!(LlmError::InvalidCredential.to_string().contains("API key"));
        let overloaded = LlmError::Overloaded { status: 529 };
        assert!(overloaded.to_string().contains("529"));
    }

    #[test]
    fn test_status_mismatch_converts_to_invalid_state() {
        let err: TransitionError = StoreError::StatusMismatch {
            id: "j1".into(),
            expected: JobStatus::SpecReady,
            actual: JobStatus::Failed,
        }
        .into();
        match err {
            TransitionError::InvalidState { actual, message } => {
                assert_eq!(actual, JobStatus::Failed);
                assert!(message.contains("spec_ready"));
            }
            other => panic!("Expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn test_store_not_found_converts_to_transition_not_found() {
        let err: TransitionError = StoreError::NotFound { id: "j9".into() }.into();
        assert!(matches!(err, TransitionError::NotFound { ref id } if id == "j9"));
    }

    #[test]
    fn test_step_error_wraps_llm_error_message() {
        let err: StepError = LlmError::InvalidCredential.into();
        assert_eq!(err.to_string(), LlmError::InvalidCredential.to_string());
    }

    #[test]
    fn test_all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&LlmError::Truncated);
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&StepError::MissingCredential);
        assert_std_error(&TransitionError::NotFound { id: "x".into() });
    }
}
