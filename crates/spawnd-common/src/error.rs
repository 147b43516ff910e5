//! Unified error types for the spawnd workspace.
//!
//! Every crate in the workspace reports failures through [`SpawnError`].
//! Errors raised inside a freshly cloned child never travel as values;
//! they are flattened to a message on the error pipe and come back to the
//! parent as [`SpawnError::ChildSetup`].

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// An I/O operation on a filesystem path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A system call without an associated path failed.
    #[error("{operation} failed: {source}")]
    Os {
        /// Name of the failed operation.
        operation: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// The child process failed while setting itself up before `execve()`.
    #[error("failed to spawn child process: {message}")]
    ChildSetup {
        /// Message the child wrote to the error pipe.
        message: String,
    },

    /// A wire message could not be decoded or encoded.
    #[error("malformed payload: {message}")]
    MalformedPayload {
        /// What was wrong with the payload.
        message: String,
    },

    /// The spawn request was refused by policy.
    #[error("spawn rejected: {message}")]
    Rejected {
        /// Reason for the rejection.
        message: String,
    },

    /// The connection to the spawner is gone.
    #[error("spawner connection closed")]
    Disconnected,

    /// Processes in a cgroup could not be terminated.
    #[error("{message}")]
    CgroupKill {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl SpawnError {
    /// Wraps the current `errno` for a path-less system call.
    #[must_use]
    pub fn last_os_error(operation: &'static str) -> Self {
        Self::Os {
            operation,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Builds a [`SpawnError::MalformedPayload`] from anything printable.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SpawnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_setup_error_carries_pipe_message() {
        let err = SpawnError::ChildSetup {
            message: "mount('/proc') failed: Operation not permitted".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to spawn child process: mount('/proc') failed: Operation not permitted"
        );
    }

    #[test]
    fn os_error_names_operation() {
        let err = SpawnError::Os {
            operation: "clone3",
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        };
        assert!(err.to_string().starts_with("clone3 failed:"));
    }
}
