//! Execution backends.
//!
//! A backend accepts execution requests and manages follow-up input and
//! cancellation. [`LocalBackend`] runs containers on this host (with the
//! fallback engine behind it); [`RemoteBackend`] delegates to a companion
//! execution service speaking the same HTTP contract.

mod local;
mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

#[cfg(test)]
pub(crate) use local::tests::fake_backend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::health::{HealthReport, LanguageStatus};

/// A request to run code. Transient, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Keep the program alive for follow-up input when it blocks on stdin.
    #[serde(default)]
    pub interactive: bool,
}

/// How a result was produced, and therefore which isolation applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMethod {
    Docker,
    Fallback,
}

/// Terminal or intermediate state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    CompileError,
    TimedOut,
    WaitingForInput,
    /// Still running after input was delivered, no prompt seen yet.
    Running,
    Stopped,
    /// The language cannot run on the available execution path.
    Unavailable,
    RuntimeError,
}

/// Outcome of one execution. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, when the program exited on its own.
    pub exit_code: Option<i64>,
    pub execution_method: ExecutionMethod,
    pub status: ExecutionStatus,
    pub is_waiting_for_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_prompt: Option<String>,
    #[serde(rename = "memoryUsageKB", default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_kb: Option<u64>,
    pub language: String,
    #[serde(default)]
    pub timed_out: bool,
    /// Present while the execution can accept `send_input` / `stop`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub const fn succeeded(&self) -> bool {
        matches!(self.status, ExecutionStatus::Completed) && matches!(self.exit_code, Some(0))
    }
}

/// Anything that can execute code and steer running executions.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run code, either to completion or until it blocks on input.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError>;

    /// Deliver one line of input to a running execution.
    async fn send_input(&self, execution_id: &str, input: &str)
        -> Result<ExecutionResult, ExecError>;

    /// Stop a running execution. Stopping twice returns the final result again.
    async fn stop(&self, execution_id: &str) -> Result<ExecutionResult, ExecError>;

    /// Runtime availability. `force` bypasses any cached probe.
    async fn health(&self, force: bool) -> HealthReport;

    async fn languages(&self) -> Vec<LanguageStatus>;
}
