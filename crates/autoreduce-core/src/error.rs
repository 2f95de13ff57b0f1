// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for autoreduce-core.
//!
//! Provides a unified error type for handler, store and channel failures.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while processing lifecycle messages.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No reduction run matches the (experiment, run number, run version) triple.
    #[error("Reduction run not found: experiment {rb_number}, run {run_number}, version {run_version}")]
    RunNotFound {
        /// RB number of the experiment.
        rb_number: String,
        /// Run number.
        run_number: i64,
        /// Run version.
        run_version: i32,
    },

    /// The experiment referenced by a message does not exist.
    #[error("Experiment '{rb_number}' not found")]
    ExperimentNotFound {
        /// RB number of the experiment.
        rb_number: String,
    },

    /// A run was asked to move to a status its current status does not allow.
    #[error("Invalid transition for run {run_number} v{run_version}: cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        /// Run number.
        run_number: i64,
        /// Run version.
        run_version: i32,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Reduction script lookup failed.
    #[error("Script error for instrument '{instrument}': {details}")]
    ScriptError {
        /// Instrument name.
        instrument: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Publishing a message to a destination failed.
    #[error("Failed to publish to '{destination}': {details}")]
    PublishFailed {
        /// Destination tag.
        destination: String,
        /// Error details.
        details: String,
    },

    /// Publishing a scheduled retry failed. The run stays in Error with no
    /// pending retry, so this is reported to the caller instead of swallowed.
    #[error("Failed to schedule retry of run {run_number} v{run_version}: {details}")]
    RetryPublishFailed {
        /// Run number.
        run_number: i64,
        /// Version created for the retry.
        run_version: i32,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::ExperimentNotFound { .. } => "EXPERIMENT_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::ScriptError { .. } => "SCRIPT_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::RetryPublishFailed { .. } => "RETRY_PUBLISH_FAILED",
        }
    }

    /// Whether the error must be surfaced to the consumer rather than logged
    /// and forgotten.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RetryPublishFailed { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::RunNotFound {
                    rb_number: "1234".to_string(),
                    run_number: 100,
                    run_version: 0,
                },
                "RUN_NOT_FOUND",
            ),
            (
                CoreError::ExperimentNotFound {
                    rb_number: "1234".to_string(),
                },
                "EXPERIMENT_NOT_FOUND",
            ),
            (
                CoreError::InvalidTransition {
                    run_number: 100,
                    run_version: 0,
                    from: "Completed".to_string(),
                    to: "Processing".to_string(),
                },
                "INVALID_TRANSITION",
            ),
            (
                CoreError::ValidationError {
                    field: "instrument".to_string(),
                    message: "is required".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                CoreError::ScriptError {
                    instrument: "WISH".to_string(),
                    details: "permission denied".to_string(),
                },
                "SCRIPT_ERROR",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (
                CoreError::PublishFailed {
                    destination: "/queue/ReductionPending".to_string(),
                    details: "closed".to_string(),
                },
                "PUBLISH_FAILED",
            ),
            (
                CoreError::RetryPublishFailed {
                    run_number: 100,
                    run_version: 3,
                    details: "closed".to_string(),
                },
                "RETRY_PUBLISH_FAILED",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::RunNotFound {
            rb_number: "1234".to_string(),
            run_number: 100,
            run_version: 2,
        };
        assert_eq!(
            err.to_string(),
            "Reduction run not found: experiment 1234, run 100, version 2"
        );

        let err = CoreError::InvalidTransition {
            run_number: 100,
            run_version: 0,
            from: "Completed".to_string(),
            to: "Processing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for run 100 v0: cannot move from 'Completed' to 'Processing'"
        );

        let err = CoreError::DatabaseError {
            operation: "insert".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Database error during 'insert': connection refused"
        );
    }

    #[test]
    fn test_only_retry_publish_is_fatal() {
        assert!(
            CoreError::RetryPublishFailed {
                run_number: 1,
                run_version: 1,
                details: "x".to_string()
            }
            .is_fatal()
        );
        assert!(
            !CoreError::PublishFailed {
                destination: "x".to_string(),
                details: "y".to_string()
            }
            .is_fatal()
        );
        assert!(
            !CoreError::ExperimentNotFound {
                rb_number: "x".to_string()
            }
            .is_fatal()
        );
    }
}
