//! code-sandbox daemon
//!
//! Serves the execution core over HTTP (default) or MCP stdio.
//! Configuration comes from `CODE_SANDBOX_CONFIG` and environment overrides.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use code_sandbox_daemon::backend::{ExecutionBackend, LocalBackend, RemoteBackend};
use code_sandbox_daemon::config::Config;
use code_sandbox_daemon::engine::{ContainerEngine, EngineConfig};
use code_sandbox_daemon::fallback::{self, FallbackEngine};
use code_sandbox_daemon::health::{HealthProbe, ProbeConfig};
use code_sandbox_daemon::http::{self, AppState};
use code_sandbox_daemon::language::LanguageRegistry;
use code_sandbox_daemon::lesson::{JsonLessonStore, LessonStore};
use code_sandbox_daemon::mcp;
use code_sandbox_daemon::runtime::DockerRuntime;
use code_sandbox_daemon::session::ExecutionRegistry;
use code_sandbox_daemon::workspace::WorkspaceManager;

#[derive(Parser, Debug)]
#[command(name = "code-sandbox-daemon")]
#[command(about = "Container-isolated execution service for untrusted code")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// HTTP listen address (overrides LISTEN_ADDR)
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Evaluate one JavaScript job from stdin (spawned by the fallback engine)
    #[arg(long = "js-worker", hide = true)]
    js_worker: bool,
}

/// Fallback wall-clock limit when no global timeout is configured.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the execution backend. The registry is returned for local
/// backends so the caller can run the reaper and shut sessions down.
fn build_backend(config: &Config) -> Result<(Arc<dyn ExecutionBackend>, Option<Arc<ExecutionRegistry>>)> {
    if let Some(url) = &config.execution_service_url {
        info!(url = %url, timeout = ?config.service_timeout(), "Delegating to execution service");
        let remote = RemoteBackend::new(url, config.service_timeout(), config.api_token.clone())
            .context("Failed to build execution service client")?;
        return Ok((Arc::new(remote), None));
    }

    let runtime = Arc::new(DockerRuntime::connect(config.docker_host.as_deref()));
    let languages = Arc::new(LanguageRegistry::new(config.execution_timeout()));
    let probe = Arc::new(HealthProbe::new(
        runtime.clone(),
        Arc::clone(&languages),
        config.enable_local_fallback,
        ProbeConfig::default(),
    ));
    let fallback = if config.enable_local_fallback {
        let engine = FallbackEngine::new(
            config.python_bin.clone(),
            config.execution_timeout().unwrap_or(FALLBACK_TIMEOUT),
        );
        match std::env::current_exe() {
            Ok(exe) => Some(engine.with_js_worker(exe)),
            Err(e) => {
                warn!(error = %e, "Cannot locate own executable, JavaScript fallback runs in-process");
                Some(engine)
            }
        }
    } else {
        None
    };
    let sessions = ExecutionRegistry::new(config.session_config());
    let engine = ContainerEngine::new(
        runtime,
        languages,
        WorkspaceManager::new(&config.workspace_root),
        Arc::clone(&probe),
        fallback,
        Arc::clone(&sessions),
        EngineConfig::default(),
    );

    info!(
        workspace_root = %config.workspace_root.display(),
        fallback = config.enable_local_fallback,
        "Using local container runtime"
    );
    Ok((Arc::new(LocalBackend::new(engine, probe)), Some(sessions)))
}

fn load_lessons(config: &Config) -> Result<Arc<dyn LessonStore>> {
    let store = match &config.lessons_file {
        Some(path) => JsonLessonStore::load(path)?,
        None => JsonLessonStore::default(),
    };
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.js_worker {
        return fallback::run_js_worker().await;
    }

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let (backend, sessions) = build_backend(&config)?;
    let reaper = sessions.as_ref().map(ExecutionRegistry::start_reaper);

    if args.stdio {
        mcp::serve_stdio(backend).await?;
    } else {
        let addr = args.listen.unwrap_or_else(|| config.listen_addr.clone());
        let state = AppState {
            backend,
            lessons: load_lessons(&config)?,
            api_token: config.api_token.clone(),
        };
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;
        info!(addr = %addr, "HTTP server listening");
        axum::serve(listener, http::router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server error")?;
    }

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    if let Some(sessions) = sessions {
        sessions.destroy_all().await;
    }
    info!("Shut down");
    Ok(())
}
