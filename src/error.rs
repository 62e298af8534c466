//! Error taxonomy for the execution core.
//!
//! `Display` on every variant is the message shown to the end user. Low-level
//! causes are kept as `#[source]` or in `detail` fields so they can be logged
//! without leaking into the user-facing text.

use thiserror::Error;

/// Errors surfaced by the execution core.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The requested language has no profile. Raised before any resource is allocated.
    #[error("Language '{0}' is not supported")]
    UnsupportedLanguage(String),

    /// A language-specific structural precondition failed before container start.
    #[error("{language}: {reason}")]
    CompileTargetMismatch { language: String, reason: String },

    /// The per-execution directory could not be created or written.
    #[error("Could not prepare an execution workspace")]
    WorkspaceCreation(#[source] std::io::Error),

    /// The per-execution directory could not be removed. Logged, never returned to callers.
    #[error("Could not clean up execution workspace")]
    WorkspaceCleanup(#[source] std::io::Error),

    /// The runtime refused to create or start the container.
    #[error("Failed to start execution container")]
    ContainerStart { detail: String },

    /// Wall-clock budget exceeded.
    #[error("Execution timed out after {timeout_ms} ms")]
    ExecutionTimeout { timeout_ms: u64 },

    /// The container engine is unreachable and no fallback path applies.
    #[error("{0} requires the container runtime, which is currently unavailable")]
    RuntimeUnavailable(String),

    /// No live or recently finished execution with this id.
    #[error("Execution '{0}' was not found")]
    SessionNotFound(String),

    /// Input could not be delivered to a running execution.
    #[error("Could not deliver input to execution '{execution_id}'")]
    SessionInput {
        execution_id: String,
        #[source]
        source: std::io::Error,
    },

    /// The companion execution service failed.
    #[error("Execution service request failed")]
    Remote { detail: String },
}

impl ExecError {
    /// Diagnostic detail for logs, if any beyond the user message.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::ContainerStart { detail } | Self::Remote { detail } => Some(detail.clone()),
            Self::WorkspaceCreation(e) | Self::WorkspaceCleanup(e) => Some(e.to_string()),
            Self::SessionInput { source, .. } => Some(source.to_string()),
            Self::UnsupportedLanguage(id) | Self::SessionNotFound(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// Stable machine-readable kind, used by the HTTP surface.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::CompileTargetMismatch { .. } => "compile_target_mismatch",
            Self::WorkspaceCreation(_) => "workspace_creation",
            Self::WorkspaceCleanup(_) => "workspace_cleanup",
            Self::ContainerStart { .. } => "container_start",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionInput { .. } => "session_input",
            Self::Remote { .. } => "remote",
        }
    }
}
