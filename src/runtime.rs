//! Container runtime client.
//!
//! [`ContainerRuntime`] is the only seam between the execution core and the
//! container engine. The engine receives it as a constructed value, so tests
//! substitute a scripted runtime instead of talking to a daemon.

mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerRuntime;

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::language::{LanguageProfile, NetworkPolicy};

/// Shell prelude that turns off terminal echo before running the program,
/// so delivered input does not reappear in the captured output.
const NO_ECHO_PRELUDE: &str = "stty -echo 2>/dev/null; exec \"$@\"";

/// Label attached to every container this daemon creates.
pub const MANAGED_LABEL: &str = "code-sandbox.managed";

/// Errors reported by the runtime client, classified by meaning rather than text.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("container not found")]
    NotFound,
    #[error("container already in the requested state")]
    NotModified,
    #[error("conflicting container operation: {0}")]
    Conflict(String),
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("container runtime error: {0}")]
    Api(String),
}

impl RuntimeError {
    /// The container is already gone or already stopped.
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound | Self::NotModified)
    }
}

/// Liveness details returned by [`ContainerRuntime::info`].
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub version: String,
    pub api_version: String,
}

/// One chunk read from an attached container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, RuntimeError>> + Send>>;
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Attached I/O of a container.
pub struct ContainerIo {
    pub output: OutputStream,
    pub input: InputSink,
}

/// Container creation parameters derived from a profile and a workspace.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub network: NetworkPolicy,
    pub dns: Vec<String>,
    pub pids_limit: i64,
    pub tty: bool,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Build the spec for one execution: workspace bind-mounted read-only at
    /// the profile's work dir, attached stdio with a pseudo-TTY.
    pub fn for_execution(profile: &LanguageProfile, workspace_dir: &Path, name: String) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (profile.cpu_share_fraction * 1_000_000_000.0) as i64;
        Self {
            name,
            image: profile.base_image.clone(),
            cmd: without_echo(&profile.run_command),
            env: profile.env.clone(),
            working_dir: profile.work_dir.clone(),
            binds: vec![format!("{}:{}:ro", workspace_dir.display(), profile.work_dir)],
            memory_bytes: profile.memory_limit_bytes,
            nano_cpus,
            network: profile.network,
            dns: profile.dns_servers.clone(),
            pids_limit: 128,
            tty: true,
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (
                    "code-sandbox.language".to_string(),
                    profile.language.id().to_string(),
                ),
            ]),
        }
    }
}

fn without_echo(command: &[String]) -> Vec<String> {
    let mut cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        NO_ECHO_PRELUDE.to_string(),
        "sh".to_string(),
    ];
    cmd.extend_from_slice(command);
    cmd
}

/// Control API of a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lightweight liveness call.
    async fn info(&self) -> Result<RuntimeInfo, RuntimeError>;

    /// Make sure `image` is present locally, pulling it when missing.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Attach to stdin and the combined stdout/stderr stream.
    async fn attach(&self, id: &str) -> Result<ContainerIo, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Wait for the container to exit and return its exit code.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Memory usage in bytes, if the runtime reports it.
    async fn memory_usage(&self, id: &str) -> Result<Option<u64>, RuntimeError>;

    /// Whether the container is running. `NotFound` if it no longer exists.
    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError>;

    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove the container.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}
