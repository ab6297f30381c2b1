//! Typed error hierarchy for the Bosun orchestration core.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestratorError` — routing and decision-tree failures
//! - `LockError` — file-lock acquisition and release failures
//! - `SessionError` — session-state persistence failures

use thiserror::Error;

/// Errors from the orchestration router.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("FATAL: Unknown project state: {state}. Valid states: {valid}")]
    UnknownProjectState { state: String, valid: String },

    #[error("Lock ownership lost for resource '{resource}' during {operation}")]
    LockOwnershipLost { resource: String, operation: String },

    #[error("Workflow executor failed in phase {phase}: {message}")]
    ExecutorFailed { phase: String, message: String },

    #[error("Config resolution failed: {0}")]
    ConfigResolution(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the file-based lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Corrupted lock file at {path}: {message}")]
    Corrupted { path: std::path::PathBuf, message: String },

    #[error("Failed to write lock file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove lock file at {path}: {source}")]
    ReleaseFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the session-state store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to read session file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write session file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session file is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Session schema invalid: {}", errors.join("; "))]
    SchemaInvalid { errors: Vec<String> },

    #[error("No session state exists at {path}")]
    NotFound { path: std::path::PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_project_state_names_value_and_valid_set() {
        let err = OrchestratorError::UnknownProjectState {
            state: "QUANTUM".to_string(),
            valid: "NO_CONFIG, GREENFIELD, EXISTING_NO_DOCS, EXISTING_WITH_DOCS".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("FATAL: Unknown project state: QUANTUM"));
        assert!(msg.contains("Valid states:"));
        assert!(msg.contains("GREENFIELD"));
    }

    #[test]
    fn lock_ownership_lost_is_matchable() {
        let err = OrchestratorError::LockOwnershipLost {
            resource: "orchestration".to_string(),
            operation: "story_execution".to_string(),
        };
        match &err {
            OrchestratorError::LockOwnershipLost { resource, .. } => {
                assert_eq!(resource, "orchestration");
            }
            _ => panic!("Expected LockOwnershipLost"),
        }
    }

    #[test]
    fn lock_error_corrupted_carries_path_and_message() {
        use std::path::PathBuf;
        let err = LockError::Corrupted {
            path: PathBuf::from("/tmp/locks/orchestration.lock"),
            message: "expected value at line 1".to_string(),
        };
        match &err {
            LockError::Corrupted { path, message } => {
                assert_eq!(path, &PathBuf::from("/tmp/locks/orchestration.lock"));
                assert!(message.contains("line 1"));
            }
            _ => panic!("Expected Corrupted"),
        }
    }

    #[test]
    fn lock_error_write_failed_carries_path() {
        use std::path::PathBuf;
        let path = PathBuf::from("/tmp/locks/orchestration.lock");
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = LockError::WriteFailed {
            path: path.clone(),
            source: io_err,
        };
        match &err {
            LockError::WriteFailed { path: p, source: s } => {
                assert_eq!(p, &path);
                assert_eq!(s.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected WriteFailed"),
        }
    }

    #[test]
    fn session_schema_invalid_joins_all_errors() {
        let err = SessionError::SchemaInvalid {
            errors: vec![
                "Missing session_state object".to_string(),
                "Invalid last_updated timestamp".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Missing session_state object"));
        assert!(msg.contains("Invalid last_updated timestamp"));
    }

    #[test]
    fn orchestrator_error_converts_from_lock_error() {
        let inner = LockError::Corrupted {
            path: std::path::PathBuf::from("/tmp/x.lock"),
            message: "bad json".to_string(),
        };
        let err: OrchestratorError = inner.into();
        match &err {
            OrchestratorError::Lock(LockError::Corrupted { message, .. }) => {
                assert_eq!(message, "bad json");
            }
            _ => panic!("Expected OrchestratorError::Lock(Corrupted)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let orch_err = OrchestratorError::ConfigResolution("bad yaml".into());
        assert_std_error(&orch_err);
        let lock_err = LockError::Corrupted {
            path: std::path::PathBuf::from("/tmp/x.lock"),
            message: "bad json".into(),
        };
        assert_std_error(&lock_err);
        let session_err = SessionError::SchemaInvalid { errors: vec![] };
        assert_std_error(&session_err);
    }
}
