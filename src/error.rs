//! Error types for Brickyard

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, executing or cleaning operations
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Build-phase (permanent) errors
    // =========================================================================
    /// Not enough free capacity on any candidate device
    #[error("No space: {0}")]
    NoSpace(String),

    /// Entity missing from the store
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Entity is owned by another pending operation or otherwise unavailable
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request cannot be satisfied as stated
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Transient errors
    // =========================================================================
    /// Write transaction could not acquire the store lock in time
    #[error("Store transaction conflict: write lock not acquired within {0:?}")]
    TxConflict(Duration),

    /// In-flight operation limit reached or build retries exhausted
    #[error("Server busy. Retry operation later.")]
    TooManyOperations,

    /// Exec asked the manager to roll back, rebuild and re-run
    #[error("Operation requested a retry: {0}")]
    Retry(Box<Error>),

    // =========================================================================
    // Remote errors
    // =========================================================================
    /// A remote command failed, timed out or reported a semantic failure
    #[error("Command '{command}' failed on {host}: {reason}")]
    Command {
        host: String,
        command: String,
        reason: String,
    },

    /// Host could not be reached at all; nothing ran
    #[error("Host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    /// Structured command output could not be parsed
    #[error("Unable to parse output of '{command}': {reason}")]
    Parse { command: String, reason: String },

    /// Remote volume manager does not know the volume
    #[error("Volume {0} does not exist")]
    VolumeDoesNotExist(String),

    /// Exec failed and the undo failed too
    #[error("{original} (rollback failed: {rollback})")]
    Rollback {
        original: Box<Error>,
        rollback: Box<Error>,
    },

    // =========================================================================
    // Ambient errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn command(
        host: impl Into<String>,
        command: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Command {
            host: host.into(),
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn unreachable(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Unreachable {
            host: host.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(command: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Parse {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the caller should look at the server logs and retry the
    /// operation, as opposed to a condition that will not change on retry.
    pub fn is_retryable_hint(&self) -> bool {
        match self {
            Error::TxConflict(_)
            | Error::TooManyOperations
            | Error::Retry(_)
            | Error::Command { .. }
            | Error::Unreachable { .. }
            | Error::Parse { .. }
            | Error::Rollback { .. }
            | Error::Io(_) => true,
            Error::NoSpace(_)
            | Error::NotFound { .. }
            | Error::Conflict(_)
            | Error::InvalidRequest(_)
            | Error::VolumeDoesNotExist(_)
            | Error::Config(_)
            | Error::Serde(_)
            | Error::Internal(_) => false,
        }
    }

    /// Human readable summary for callers of the operation manager
    pub fn remediation(&self) -> String {
        if self.is_retryable_hint() {
            format!("{}. See logs for details and retry the operation.", self)
        } else {
            self.to_string()
        }
    }

    /// Unwrap a retry request to the error that caused it
    pub fn into_retry_cause(self) -> Self {
        match self {
            Error::Retry(inner) => *inner,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_hint_classification() {
        assert!(Error::command("h1", "lvremove -f vg/lv", "exit 5").is_retryable_hint());
        assert!(Error::TooManyOperations.is_retryable_hint());
        assert!(!Error::NoSpace("no device".into()).is_retryable_hint());
        assert!(!Error::not_found("volume", "abc").is_retryable_hint());
    }

    #[test]
    fn test_remediation_text() {
        let msg = Error::command("h1", "mkfs.xfs", "boom").remediation();
        assert!(msg.ends_with("retry the operation."));

        let msg = Error::InvalidRequest("volume still has 2 snapshots".into()).remediation();
        assert_eq!(msg, "Invalid request: volume still has 2 snapshots");
    }

    #[test]
    fn test_rollback_error_reports_both() {
        let err = Error::Rollback {
            original: Box::new(Error::command("h1", "gluster volume start v", "down")),
            rollback: Box::new(Error::command("h1", "lvremove -f vg/tp", "busy")),
        };
        let text = err.to_string();
        assert!(text.contains("volume start"));
        assert!(text.contains("lvremove"));
    }

    #[test]
    fn test_into_retry_cause() {
        let err = Error::Retry(Box::new(Error::Conflict("x".into())));
        assert!(matches!(err.into_retry_cause(), Error::Conflict(_)));
    }
}
