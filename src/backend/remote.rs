//! Backend that delegates to a companion execution service.
//!
//! The service speaks the same HTTP contract this daemon serves, so a
//! thin front instance can forward to a pool of execution hosts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::{ExecutionBackend, ExecutionRequest, ExecutionResult};
use crate::error::ExecError;
use crate::health::{HealthReport, LanguageStatus};
use crate::http::{Envelope, HealthBody, SendInputBody, StopBody};

/// HTTP client for a remote execution service.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client,
    base_url: String,
    timeout: Duration,
    api_token: Option<String>,
}

impl RemoteBackend {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        api_token: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            api_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }

    fn transport_error(&self, e: &reqwest::Error) -> ExecError {
        if e.is_timeout() {
            ExecError::ExecutionTimeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            ExecError::Remote {
                detail: e.to_string(),
            }
        }
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ExecError> {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| self.transport_error(&e))?;
        let status = response.status();
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| self.transport_error(&e))?;
        debug!(path, %status, success = envelope.success, "Execution service replied");
        unwrap_envelope(envelope)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, reqwest::Error> {
        self.client
            .get(self.url(path))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

/// Turn a service envelope back into a typed result, restoring the error
/// kinds callers branch on.
fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, ExecError> {
    if envelope.success {
        if let Some(data) = envelope.data {
            return Ok(data);
        }
    }
    let detail = envelope
        .details
        .or(envelope.error)
        .unwrap_or_default();
    Err(match envelope.kind.as_deref() {
        Some("unsupported_language") => ExecError::UnsupportedLanguage(detail),
        Some("session_not_found") => ExecError::SessionNotFound(detail),
        _ => ExecError::Remote { detail },
    })
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    #[instrument(skip(self, request), fields(language = %request.language, url = %self.base_url))]
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        self.post("execute", &request).await
    }

    async fn send_input(&self, execution_id: &str, input: &str) -> Result<ExecutionResult, ExecError> {
        let body = SendInputBody {
            execution_id: execution_id.to_string(),
            input: input.to_string(),
        };
        self.post("execute/send-input", &body).await
    }

    async fn stop(&self, execution_id: &str) -> Result<ExecutionResult, ExecError> {
        let body = StopBody {
            execution_id: execution_id.to_string(),
        };
        self.post("execute/stop", &body).await
    }

    async fn health(&self, force: bool) -> HealthReport {
        let path = if force { "docker-status" } else { "health" };
        match self.get::<HealthBody>(path).await {
            Ok(body) => body.report,
            Err(e) => {
                warn!(url = %self.base_url, error = %e, "Execution service unreachable");
                HealthReport {
                    status: "error".to_string(),
                    docker_available: false,
                    details: format!("Execution service unreachable: {e}"),
                    fallback_enabled: false,
                }
            }
        }
    }

    async fn languages(&self) -> Vec<LanguageStatus> {
        match self.get::<Envelope<Vec<LanguageStatus>>>("languages").await {
            Ok(envelope) => envelope.data.unwrap_or_default(),
            Err(e) => {
                warn!(url = %self.base_url, error = %e, "Failed to list remote languages");
                Vec::new()
            }
        }
    }
}
