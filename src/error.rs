//! Error taxonomy for the isolation layer
//!
//! Every adapter and the lifecycle manager report failures through
//! [`IsolationError`]. The variants map onto how callers are expected to react:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────────┐
//! │ Unavailable          │ host dependency missing, never retried       │
//! │ Definition           │ definition file missing or unparseable       │
//! │ AllocationExhausted  │ no free TAP index / CID for this create      │
//! │ ReadinessTimeout     │ a socket or file never appeared in time      │
//! │ Exec                 │ control channel or engine exec failed        │
//! ├──────────────────────┼──────────────────────────────────────────────┤
//! │ NotFound, Unknown*   │ lookup results from the lifecycle manager    │
//! └──────────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Teardown problems have no variant: destroy paths log and continue.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, IsolationError>;

/// Errors raised by isolation backends and the lifecycle manager
#[derive(Debug, Error)]
pub enum IsolationError {
    /// The backend's host dependency is missing (engine, hypervisor, ...)
    #[error("isolation backend '{backend}' is not available on this host")]
    Unavailable { backend: String },

    /// Missing or unparseable definition file
    #[error("invalid definition {}: {reason}", .path.display())]
    Definition { path: PathBuf, reason: String },

    /// No free identity (TAP index, CID) left in the allowed range
    #[error("allocation exhausted: {0}")]
    AllocationExhausted(String),

    /// A socket or file did not appear within its bound
    #[error("{what} not ready after {waited:?}{}", format_diagnostics(.diagnostics))]
    ReadinessTimeout {
        what: String,
        waited: Duration,
        diagnostics: Option<String>,
    },

    /// Command execution inside the environment failed
    #[error("exec failed: {0}")]
    Exec(String),

    /// A helper process could not be started or exited unsuccessfully
    #[error("failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// No environment is tracked for the agent
    #[error("no environment for agent '{0}'")]
    NotFound(String),

    /// The agent already owns an environment
    #[error("agent '{0}' already has an environment")]
    AlreadyExists(String),

    /// The named isolation configuration was not discovered
    #[error("unknown isolation config '{0}'")]
    UnknownConfig(String),

    /// No adapter is registered for the backend type
    #[error("no adapter registered for backend type '{0}'")]
    UnknownBackend(String),

    /// The backend does not implement an optional capability
    #[error("backend '{backend}' does not support {capability}")]
    Unsupported {
        backend: String,
        capability: &'static str,
    },

    /// Persisted state could not be read or written
    #[error("state store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IsolationError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            IsolationError::Unavailable { .. } => "unavailable",
            IsolationError::Definition { .. } => "definition",
            IsolationError::AllocationExhausted(_) => "allocation_exhausted",
            IsolationError::ReadinessTimeout { .. } => "readiness_timeout",
            IsolationError::Exec(_) => "exec",
            IsolationError::Spawn { .. } => "spawn",
            IsolationError::NotFound(_) => "not_found",
            IsolationError::AlreadyExists(_) => "already_exists",
            IsolationError::UnknownConfig(_) => "unknown_config",
            IsolationError::UnknownBackend(_) => "unknown_backend",
            IsolationError::Unsupported { .. } => "unsupported",
            IsolationError::Store(_) => "store",
            IsolationError::Io(_) => "io",
        }
    }

    pub(crate) fn definition(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        IsolationError::Definition {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn spawn(program: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        IsolationError::Spawn {
            program: program.into(),
            reason: reason.to_string(),
        }
    }
}

fn format_diagnostics(diagnostics: &Option<String>) -> String {
    match diagnostics {
        Some(text) if !text.trim().is_empty() => format!("\n--- last console output ---\n{}", text.trim_end()),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_timeout_includes_console_tail() {
        let err = IsolationError::ReadinessTimeout {
            what: "supervisor API socket".to_string(),
            waited: Duration::from_secs(10),
            diagnostics: Some("kernel panic: VFS unable to mount root\n".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("supervisor API socket not ready after 10s"));
        assert!(msg.contains("kernel panic"));
    }

    #[test]
    fn test_readiness_timeout_without_diagnostics() {
        let err = IsolationError::ReadinessTimeout {
            what: "virtiofs socket".to_string(),
            waited: Duration::from_secs(5),
            diagnostics: None,
        };
        assert_eq!(err.to_string(), "virtiofs socket not ready after 5s");
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(IsolationError::NotFound("a".into()).kind(), "not_found");
        assert_eq!(
            IsolationError::AllocationExhausted("tap".into()).kind(),
            "allocation_exhausted"
        );
    }
}
