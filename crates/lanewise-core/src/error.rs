// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for lanewise-core.
//!
//! Lock conflicts are a distinct kind so callers and the heartbeat can tell
//! "someone else advanced this process" apart from genuine failures.

use thiserror::Error;
use uuid::Uuid;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while driving processes and their side effects.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Another writer holds or already advanced the row this step needed.
    ///
    /// Never retried locally; the heartbeat's orphan recovery picks up
    /// abandoned work.
    #[error("Lock conflict on {entity} '{id}': {reason}")]
    LockConflict {
        /// Table the conflicting row lives in.
        entity: &'static str,
        /// Row identifier.
        id: Uuid,
        /// What was expected and not found.
        reason: String,
    },

    /// Process was not found.
    #[error("Process '{process_id}' not found")]
    ProcessNotFound {
        /// The process ID that was not found.
        process_id: Uuid,
    },

    /// Activity manager was not found.
    #[error("Activity manager '{activity_manager_id}' not found")]
    ActivityManagerNotFound {
        /// The activity manager ID that was not found.
        activity_manager_id: Uuid,
    },

    /// Workflow was not found.
    #[error("Workflow '{workflow}' not found")]
    WorkflowNotFound {
        /// Workflow id or name.
        workflow: String,
    },

    /// Blueprint does not contain the referenced node, or no node type is
    /// registered for it.
    #[error("Node '{node_id}' not found")]
    NodeNotFound {
        /// The node ID that could not be resolved.
        node_id: String,
    },

    /// Entity is in an invalid state for the requested operation.
    #[error("{entity} '{id}' has invalid status '{actual}' for {operation}")]
    InvalidStatus {
        /// Entity kind (process, activity_manager, ...).
        entity: &'static str,
        /// Entity identifier.
        id: Uuid,
        /// The operation that was attempted.
        operation: &'static str,
        /// The actual status.
        actual: String,
    },

    /// Actor is not allowed to act on the resource.
    #[error("Actor is not allowed to {operation}")]
    Forbidden {
        /// The operation that was refused.
        operation: &'static str,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Expression evaluation failed.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Engine wiring or configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LockConflict { .. } => "LOCK_CONFLICT",
            Self::ProcessNotFound { .. } => "PROCESS_NOT_FOUND",
            Self::ActivityManagerNotFound { .. } => "ACTIVITY_MANAGER_NOT_FOUND",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::NodeNotFound { .. } => "NODE_NOT_FOUND",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Evaluation(_) => "EVALUATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether this error means a concurrent writer won the race.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }

    pub(crate) fn lock_conflict(entity: &'static str, id: Uuid, reason: impl Into<String>) -> Self {
        Self::LockConflict {
            entity,
            id,
            reason: reason.into(),
        }
    }
}

/// Postgres SQLSTATE raised by `FOR UPDATE NOWAIT` when the row is held.
const LOCK_NOT_AVAILABLE: &str = "55P03";

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.code().as_deref() == Some(LOCK_NOT_AVAILABLE)
        {
            return EngineError::LockConflict {
                entity: "row",
                id: Uuid::nil(),
                reason: db.message().to_string(),
            };
        }
        EngineError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let id = Uuid::new_v4();
        let test_cases = vec![
            (
                EngineError::lock_conflict("process", id, "pointer moved"),
                "LOCK_CONFLICT",
            ),
            (
                EngineError::ProcessNotFound { process_id: id },
                "PROCESS_NOT_FOUND",
            ),
            (
                EngineError::ActivityManagerNotFound {
                    activity_manager_id: id,
                },
                "ACTIVITY_MANAGER_NOT_FOUND",
            ),
            (
                EngineError::NodeNotFound {
                    node_id: "2".to_string(),
                },
                "NODE_NOT_FOUND",
            ),
            (
                EngineError::InvalidStatus {
                    entity: "process",
                    id,
                    operation: "continue",
                    actual: "finished".to_string(),
                },
                "INVALID_STATUS",
            ),
            (
                EngineError::Forbidden {
                    operation: "commit activity",
                },
                "FORBIDDEN",
            ),
            (
                EngineError::Config("missing store".to_string()),
                "CONFIG_ERROR",
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
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();

        let err = EngineError::ProcessNotFound { process_id: id };
        assert_eq!(
            err.to_string(),
            "Process '00000000-0000-0000-0000-000000000000' not found"
        );

        let err = EngineError::InvalidStatus {
            entity: "process",
            id,
            operation: "abort",
            actual: "finished".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "process '00000000-0000-0000-0000-000000000000' has invalid status 'finished' for abort"
        );

        let err = EngineError::Validation {
            field: "activities".to_string(),
            message: "no activity committed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Validation error for 'activities': no activity committed"
        );
    }

    #[test]
    fn test_lock_conflict_predicate() {
        let held = EngineError::lock_conflict("process_state", Uuid::nil(), "held");
        assert!(held.is_lock_conflict());
        assert!(!EngineError::Evaluation("boom".to_string()).is_lock_conflict());
    }

    #[test]
    fn test_row_not_found_is_database_error() {
        let err: EngineError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
