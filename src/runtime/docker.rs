//! Docker implementation of [`ContainerRuntime`] over bollard.

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    InspectContainerOptions, RemoveContainerOptionsBuilder, StartContainerOptions,
    StatsOptionsBuilder, StopContainerOptionsBuilder, WaitContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info, instrument};

use super::{
    ContainerIo, ContainerRuntime, ContainerSpec, OutputChunk, RuntimeError, RuntimeInfo,
};
use crate::language::NetworkPolicy;

const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Seconds the daemon waits after SIGTERM before killing on stop.
const STOP_GRACE_SECS: i32 = 1;

impl From<BollardError> for RuntimeError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404, ..
            } => Self::NotFound,
            BollardError::DockerResponseServerError {
                status_code: 304, ..
            } => Self::NotModified,
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => Self::Conflict(message),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => Self::Api(format!("{status_code}: {message}")),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Runtime client backed by a Docker-compatible daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Result<Docker, String>,
}

impl DockerRuntime {
    /// Connect using `host` (unix socket path, `unix://`, `tcp://` or
    /// `http://`), or the local defaults when `None`.
    ///
    /// Connecting does not contact the daemon; a bad address yields a client
    /// whose every call reports the runtime as unavailable.
    pub fn connect(host: Option<&str>) -> Self {
        let client = match host {
            None => Docker::connect_with_local_defaults(),
            Some(h) if h.starts_with("unix://") || h.starts_with('/') => Docker::connect_with_socket(
                h.trim_start_matches("unix://"),
                CLIENT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            Some(h) => {
                let addr = h.strip_prefix("tcp://").map_or_else(
                    || h.to_string(),
                    |rest| format!("http://{rest}"),
                );
                Docker::connect_with_http(&addr, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        };
        let client = client.map_err(|e| e.to_string());
        if let Err(e) = &client {
            info!(host = ?host, error = %e, "Container runtime client could not be configured");
        }
        Self { client }
    }

    fn docker(&self) -> Result<&Docker, RuntimeError> {
        self.client
            .as_ref()
            .map_err(|e| RuntimeError::Unavailable(e.clone()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let version = self.docker()?.version().await?;
        Ok(RuntimeInfo {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
        })
    }

    #[instrument(skip(self))]
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let docker = self.docker()?;
        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "Pulling image");
        let (from_image, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let (network_mode, dns) = match spec.network {
            NetworkPolicy::Disabled => ("none", None),
            NetworkPolicy::LimitedDns => ("bridge", Some(spec.dns.clone())),
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            tty: Some(spec.tty),
            open_stdin: Some(true),
            stdin_once: Some(false),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(spec.network == NetworkPolicy::Disabled),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                pids_limit: Some(spec.pids_limit),
                network_mode: Some(network_mode.to_string()),
                dns,
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let response = self
            .docker()?
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await?;
        for warning in &response.warnings {
            debug!(warning = %warning, "Container create warning");
        }
        Ok(response.id)
    }

    async fn attach(&self, id: &str) -> Result<ContainerIo, RuntimeError> {
        let results = self
            .docker()?
            .attach_container(
                id,
                Some(
                    AttachContainerOptionsBuilder::new()
                        .stdin(true)
                        .stdout(true)
                        .stderr(true)
                        .stream(true)
                        .logs(true)
                        .build(),
                ),
            )
            .await?;

        let output = results.output.map(|item| {
            item.map(|log| match log {
                LogOutput::StdErr { message } => OutputChunk::Stderr(message.to_vec()),
                other => OutputChunk::Stdout(other.into_bytes().to_vec()),
            })
            .map_err(RuntimeError::from)
        });

        Ok(ContainerIo {
            output: Box::pin(output),
            input: results.input,
        })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker()?
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self.docker()?.wait_container(id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Api("wait stream ended without a status".into())),
        }
    }

    async fn memory_usage(&self, id: &str) -> Result<Option<u64>, RuntimeError> {
        let mut stream = self.docker()?.stats(
            id,
            Some(StatsOptionsBuilder::new().stream(false).one_shot(true).build()),
        );
        match stream.next().await {
            Some(Ok(stats)) => Ok(stats
                .memory_stats
                .and_then(|mem| mem.max_usage.or(mem.usage))
                .filter(|bytes| *bytes > 0)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        let inspect = self
            .docker()?
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(inspect
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker()?
            .stop_container(
                id,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker()?
            .remove_container(
                id,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await?;
        Ok(())
    }
}
