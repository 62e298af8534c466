//! In-process backend: containers on this host, fallback engine behind them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{ExecutionBackend, ExecutionRequest, ExecutionResult};
use crate::engine::ContainerEngine;
use crate::error::ExecError;
use crate::health::{HealthProbe, HealthReport, LanguageStatus};
use crate::session::ExecutionRegistry;

/// Backend that runs executions on the local container runtime.
pub struct LocalBackend {
    engine: ContainerEngine,
    sessions: Arc<ExecutionRegistry>,
    probe: Arc<HealthProbe>,
}

impl LocalBackend {
    /// `engine` must have been built with the same `sessions` and `probe`.
    pub fn new(engine: ContainerEngine, probe: Arc<HealthProbe>) -> Self {
        let sessions = Arc::clone(engine.sessions());
        Self {
            engine,
            sessions,
            probe,
        }
    }

    pub const fn sessions(&self) -> &Arc<ExecutionRegistry> {
        &self.sessions
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    #[instrument(skip(self, request), fields(language = %request.language))]
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        debug!(code_len = request.code.len(), "Executing code");
        self.engine.run(&request).await
    }

    async fn send_input(&self, execution_id: &str, input: &str) -> Result<ExecutionResult, ExecError> {
        self.sessions.send_input(execution_id, input).await
    }

    async fn stop(&self, execution_id: &str) -> Result<ExecutionResult, ExecError> {
        self.sessions.stop(execution_id).await
    }

    async fn health(&self, force: bool) -> HealthReport {
        self.probe.report(force).await
    }

    async fn languages(&self) -> Vec<LanguageStatus> {
        self.probe.supported_languages().await
    }
}
