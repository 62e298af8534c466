//! Execution session registry.
//!
//! Interactive executions that block on stdin stay alive here so later
//! requests can deliver more input or stop them. A supervisor task per
//! session waits for the container to exit and enforces the language's
//! wall-clock budget; a reaper task tears down sessions that sit idle or
//! outlive their maximum lifetime.
//!
//! Every terminal path (exit, stop, reap, shutdown) goes through
//! [`ExecutionSession::finish`], which runs teardown exactly once and keeps
//! the final result so repeated `stop` calls return it again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify, OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::backend::ExecutionResult;
use crate::container::ContainerHandle;
use crate::engine::{
    build_result, observe, sample_memory, EngineConfig, Observed, Outcome, RunningProgram,
    StdinHandle,
};
use crate::error::ExecError;
use crate::language::Language;
use crate::output::OutputBuffer;
use crate::runtime::ContainerRuntime;

/// Parsed session configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session can go without input before the reaper stops it.
    pub idle_timeout: Duration,

    /// Maximum total lifetime of a session, regardless of activity.
    pub max_lifetime: Duration,

    /// Interval between reaper sweeps.
    pub reaper_interval: Duration,

    /// How long final results of ended sessions stay retrievable.
    pub finished_retention: Duration,

    /// How long `send_input` waits for the program to exit or prompt again.
    pub input_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(60),
            finished_retention: Duration::from_secs(300),
            input_settle: Duration::from_secs(2),
        }
    }
}

/// A running container waiting on (or processing) interactive input.
pub struct ExecutionSession {
    pub id: String,

    /// When this session was registered.
    pub created_at: Instant,

    /// Last time input was delivered (for idle timeout).
    last_used: Mutex<Instant>,

    language: Language,
    started: Instant,
    /// Wall-clock budget, restarted by every delivered input.
    timeout: Duration,
    input_delivered: Notify,
    container: Arc<ContainerHandle>,
    stdin: StdinHandle,
    output: Arc<OutputBuffer>,
    runtime: Arc<dyn ContainerRuntime>,
    engine: EngineConfig,

    /// Owned resources; taken by the one teardown that runs.
    program: Mutex<Option<RunningProgram>>,

    /// Serializes input deliveries in arrival order.
    input_lock: Mutex<()>,

    result: OnceCell<ExecutionResult>,
}

impl ExecutionSession {
    pub fn new(
        id: String,
        program: RunningProgram,
        runtime: Arc<dyn ContainerRuntime>,
        engine: EngineConfig,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            created_at: now,
            last_used: Mutex::new(now),
            language: program.language,
            started: program.started,
            timeout: program.timeout,
            input_delivered: Notify::new(),
            container: Arc::clone(&program.container),
            stdin: Arc::clone(&program.stdin),
            output: Arc::clone(&program.output),
            runtime,
            engine,
            program: Mutex::new(Some(program)),
            input_lock: Mutex::new(()),
            result: OnceCell::new(),
        })
    }

    async fn touch(&self) {
        *self.last_used.lock().await = Instant::now();
    }

    async fn is_idle_expired(&self, timeout: Duration) -> bool {
        self.last_used.lock().await.elapsed() > timeout
    }

    fn is_lifetime_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    /// Intermediate result for a session that is still alive.
    fn partial(&self, outcome: &Outcome) -> ExecutionResult {
        build_result(
            self.language,
            &self.output.snapshot(),
            outcome,
            None,
            self.started.elapsed(),
            Some(self.id.clone()),
        )
    }

    /// End the session with `outcome` and return its final result.
    ///
    /// Only the first caller's outcome counts; later callers wait for the
    /// teardown in progress and receive the same result.
    pub async fn finish(&self, outcome: Outcome) -> ExecutionResult {
        self.result
            .get_or_init(|| async {
                if let Outcome::Exited(_) = outcome {
                    self.output.wait_closed(self.engine.drain_timeout).await;
                    self.container.mark_exited().await;
                }
                let memory = sample_memory(self.runtime.as_ref(), self.container.id()).await;
                let state = self.output.snapshot();
                let elapsed = self.started.elapsed();
                if let Some(program) = self.program.lock().await.take() {
                    program.shutdown(self.runtime.as_ref()).await;
                }
                info!(execution = %self.id, outcome = ?outcome, "Session finished");
                build_result(
                    self.language,
                    &state,
                    &outcome,
                    memory,
                    elapsed,
                    Some(self.id.clone()),
                )
            })
            .await
            .clone()
    }

    /// Outcome of the container exiting (or vanishing) on its own.
    async fn wait_exit(&self) -> Outcome {
        match self.runtime.wait(self.container.id()).await {
            Ok(code) => Outcome::Exited(code),
            Err(e) => Outcome::Failed(format!("Lost track of the container: {e}")),
        }
    }

    /// Wait for the container to end, enforcing the wall-clock budget.
    ///
    /// The budget runs from the latest delivered input (or registration)
    /// and is suspended while the program sits at a prompt; a prompt nobody
    /// answers is left to the idle reaper.
    async fn supervise(&self) -> Outcome {
        let exit = self.wait_exit();
        tokio::pin!(exit);

        loop {
            let budget_start = *self.last_used.lock().await;
            let deadline = tokio::time::Instant::from_std(budget_start + self.timeout);
            tokio::select! {
                outcome = &mut exit => return outcome,
                () = tokio::time::sleep_until(deadline) => {}
            }
            if self.last_used.lock().await.elapsed() < self.timeout {
                continue;
            }

            let at_prompt = tokio::select! {
                outcome = &mut exit => return outcome,
                at_prompt = self.at_prompt() => at_prompt,
            };
            if !at_prompt {
                warn!(execution = %self.id, timeout = ?self.timeout, "Session exceeded its time budget");
                return Outcome::TimedOut(self.timeout);
            }
            tokio::select! {
                outcome = &mut exit => return outcome,
                () = self.input_delivered.notified() => {}
            }
        }
    }

    /// A prompt is detected and the program stays silent for the grace period.
    async fn at_prompt(&self) -> bool {
        let before = self.output.snapshot();
        if !before.waiting {
            return false;
        }
        tokio::time::sleep(self.engine.prompt_grace).await;
        let after = self.output.snapshot();
        after.waiting && after.generation == before.generation
    }
}

/// Tracks live interactive executions by id.
///
/// Thread-safe: `RwLock` for the session maps, a per-session input lock for
/// arrival-order delivery, and a once-only final result per session.
pub struct ExecutionRegistry {
    sessions: RwLock<HashMap<String, Arc<ExecutionSession>>>,
    finished: RwLock<HashMap<String, (ExecutionResult, Instant)>>,
    config: SessionConfig,
}

impl ExecutionRegistry {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn get(&self, id: &str) -> Option<Arc<ExecutionSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn finished_result(&self, id: &str) -> Option<ExecutionResult> {
        self.finished.read().await.get(id).map(|(r, _)| r.clone())
    }

    /// Track `session` and supervise its container until it exits.
    pub async fn register(self: &Arc<Self>, session: Arc<ExecutionSession>) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::clone(&session));
        debug!(execution = %session.id, "Registered session");

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = session.supervise().await;
            let result = session.finish(outcome).await;
            registry.retire(&session.id, result).await;
        });
    }

    /// Move a finished session out of the live map. The final result is
    /// recorded first so a concurrent `stop` always finds one of the two.
    async fn retire(&self, id: &str, result: ExecutionResult) {
        self.finished
            .write()
            .await
            .insert(id.to_string(), (result, Instant::now()));
        self.sessions.write().await.remove(id);
    }

    /// Deliver one line of input and report what the program did next:
    /// exited (final result), prompted again, or is still running.
    pub async fn send_input(&self, id: &str, input: &str) -> Result<ExecutionResult, ExecError> {
        let Some(session) = self.get(id).await else {
            return self
                .finished_result(id)
                .await
                .ok_or_else(|| ExecError::SessionNotFound(id.to_string()));
        };

        let _guard = session.input_lock.lock().await;
        if let Some(result) = session.result.get() {
            return Ok(result.clone());
        }
        session.touch().await;

        let written = async {
            let mut sink = session.stdin.lock().await;
            sink.write_all(input.trim_end_matches(['\r', '\n']).as_bytes()).await?;
            sink.write_all(b"\n").await?;
            sink.flush().await
        }
        .await;
        if let Err(source) = written {
            return Err(ExecError::SessionInput {
                execution_id: id.to_string(),
                source,
            });
        }
        session.output.mark_input_delivered();
        session.input_delivered.notify_one();
        debug!(execution = %id, "Delivered input");

        let deadline = tokio::time::Instant::now() + self.config.input_settle;
        let observed = observe(
            &session.output,
            session.runtime.wait(session.container.id()),
            deadline,
            session.engine.prompt_grace,
        )
        .await;

        match observed {
            Observed::Exited(Ok(code)) => {
                let result = session.finish(Outcome::Exited(code)).await;
                self.retire(id, result.clone()).await;
                Ok(result)
            }
            Observed::Exited(Err(e)) => {
                let result = session
                    .finish(Outcome::Failed(format!("Lost track of the container: {e}")))
                    .await;
                self.retire(id, result.clone()).await;
                Ok(result)
            }
            Observed::Waiting => Ok(session.partial(&Outcome::WaitingForInput)),
            Observed::Deadline => Ok(session.partial(&Outcome::Running)),
        }
    }

    /// Stop a session. Stopping an ended session returns its final result.
    pub async fn stop(&self, id: &str) -> Result<ExecutionResult, ExecError> {
        if let Some(session) = self.get(id).await {
            let result = session.finish(Outcome::Stopped).await;
            self.retire(id, result.clone()).await;
            info!(execution = %id, "Stopped session");
            return Ok(result);
        }
        self.finished_result(id)
            .await
            .ok_or_else(|| ExecError::SessionNotFound(id.to_string()))
    }

    /// Clean up expired sessions (called by the reaper task).
    pub async fn cleanup_expired(&self) {
        let expired: Vec<Arc<ExecutionSession>> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for (id, session) in sessions.iter() {
                let idle_expired = session.is_idle_expired(self.config.idle_timeout).await;
                let lifetime_expired = session.is_lifetime_expired(self.config.max_lifetime);

                if idle_expired || lifetime_expired {
                    let reason = if lifetime_expired {
                        "max lifetime"
                    } else {
                        "idle timeout"
                    };
                    debug!(execution = %id, reason = %reason, "Session expired");
                    expired.push(Arc::clone(session));
                }
            }
            expired
        };

        for session in expired {
            info!(execution = %session.id, "Reaping expired session");
            let result = session.finish(Outcome::Stopped).await;
            self.retire(&session.id, result).await;
        }

        let retention = self.config.finished_retention;
        self.finished
            .write()
            .await
            .retain(|_, (_, at)| at.elapsed() <= retention);
    }

    /// Stop every live session (called on shutdown).
    pub async fn destroy_all(&self) {
        let all: Vec<Arc<ExecutionSession>> = self.sessions.read().await.values().cloned().collect();
        for session in all {
            info!(execution = %session.id, "Destroying session");
            let result = session.finish(Outcome::Stopped).await;
            self.retire(&session.id, result).await;
        }
    }

    /// Start the background reaper task.
    ///
    /// Returns a `JoinHandle` that runs until cancelled. The reaper
    /// checks for expired sessions every `reaper_interval`.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.reaper_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                debug!("Reaper sweep");
                registry.cleanup_expired().await;
            }
        })
    }
}
