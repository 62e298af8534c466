//! Container execution engine.
//!
//! Runs one request inside a fresh container: resolve the profile, divert to
//! the fallback engine when containers cannot run the language, prepare a
//! workspace, create/attach/start the container, feed stdin line by line,
//! watch output for input prompts, enforce the wall-clock timeout, and tear
//! everything down on every path.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::{ExecutionMethod, ExecutionRequest, ExecutionResult, ExecutionStatus};
use crate::container::ContainerHandle;
use crate::error::ExecError;
use crate::fallback::FallbackEngine;
use crate::health::HealthProbe;
use crate::language::{Language, LanguageProfile, LanguageRegistry, COMPILE_FAILED_EXIT};
use crate::output::{spawn_reader, OutputBuffer, OutputState};
use crate::runtime::{ContainerRuntime, ContainerSpec, InputSink, RuntimeError};
use crate::session::{ExecutionRegistry, ExecutionSession};
use crate::workspace::{normalize_stdin, SessionWorkspace, WorkspaceManager};

/// Shared, lock-guarded stdin of a running container.
pub type StdinHandle = Arc<Mutex<InputSink>>;

/// Timing knobs of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause before each automatically delivered stdin line.
    pub input_line_delay: Duration,
    /// How long a detected prompt must stay unanswered (and the program
    /// silent) before the execution is reported as waiting for input.
    pub prompt_grace: Duration,
    /// How long to wait for trailing output after the container exits.
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_line_delay: Duration::from_millis(50),
            prompt_grace: Duration::from_millis(300),
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// How an execution ended (or paused).
#[derive(Debug, Clone)]
pub enum Outcome {
    Exited(i64),
    TimedOut(Duration),
    WaitingForInput,
    /// Still running, no prompt detected yet.
    Running,
    Stopped,
    Failed(String),
}

/// What [`observe`] saw first.
#[derive(Debug)]
pub enum Observed {
    Exited(Result<i64, RuntimeError>),
    Deadline,
    Waiting,
}

/// Watch `output` until the program exits, the deadline passes, or a
/// detected prompt stays unanswered for `grace`.
///
/// Detection itself runs in the reader task after every chunk; this loop
/// only confirms it, restarting the grace period on every new chunk.
pub async fn observe<F>(
    output: &OutputBuffer,
    exit: F,
    deadline: tokio::time::Instant,
    grace: Duration,
) -> Observed
where
    F: Future<Output = Result<i64, RuntimeError>>,
{
    tokio::pin!(exit);
    let expired = tokio::time::sleep_until(deadline);
    tokio::pin!(expired);
    let mut rx = output.subscribe();

    loop {
        let waiting = rx.borrow_and_update().waiting;
        tokio::select! {
            biased;
            status = &mut exit => return Observed::Exited(status),
            () = &mut expired => return Observed::Deadline,
            changed = rx.changed() => {
                if changed.is_err() {
                    // buffer gone; only exit or deadline can end the wait now
                    let status = tokio::select! {
                        status = &mut exit => Observed::Exited(status),
                        () = &mut expired => Observed::Deadline,
                    };
                    return status;
                }
            }
            () = tokio::time::sleep(grace), if waiting => return Observed::Waiting,
        }
    }
}

/// Build the caller-facing result from captured output and an outcome.
pub fn build_result(
    language: Language,
    state: &OutputState,
    outcome: &Outcome,
    memory_usage_kb: Option<u64>,
    elapsed: Duration,
    execution_id: Option<String>,
) -> ExecutionResult {
    let mut stdout = state.stdout.trim().to_string();
    let mut stderr = state.stderr.trim().to_string();
    let mut exit_code = None;
    let mut waiting_prompt = None;

    let status = match outcome {
        Outcome::Exited(code) => {
            exit_code = Some(*code);
            if language.is_compiled() && *code == COMPILE_FAILED_EXIT {
                // pseudo-TTY output arrives on one stream; diagnostics belong in stderr
                if stderr.is_empty() {
                    std::mem::swap(&mut stdout, &mut stderr);
                }
                ExecutionStatus::CompileError
            } else {
                ExecutionStatus::Completed
            }
        }
        Outcome::TimedOut(limit) => {
            append_line(
                &mut stderr,
                &format!("Execution timed out after {} ms", limit.as_millis()),
            );
            ExecutionStatus::TimedOut
        }
        Outcome::WaitingForInput => {
            waiting_prompt = state.prompt.clone();
            ExecutionStatus::WaitingForInput
        }
        Outcome::Running => ExecutionStatus::Running,
        Outcome::Stopped => ExecutionStatus::Stopped,
        Outcome::Failed(message) => {
            append_line(&mut stderr, message);
            ExecutionStatus::RuntimeError
        }
    };

    let is_waiting_for_input = status == ExecutionStatus::WaitingForInput;
    ExecutionResult {
        stdout,
        stderr,
        exit_code,
        execution_method: ExecutionMethod::Docker,
        status,
        is_waiting_for_input,
        waiting_prompt,
        memory_usage_kb,
        language: language.id().to_string(),
        timed_out: status == ExecutionStatus::TimedOut,
        execution_id,
        execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
    }
}

fn append_line(text: &mut String, line: &str) {
    if !text.is_empty() {
        text.push('\n');
    }
    text.push_str(line);
}

/// Best-effort memory sample in KiB. Stats failures never fail an execution.
pub async fn sample_memory(runtime: &dyn ContainerRuntime, id: &str) -> Option<u64> {
    match runtime.memory_usage(id).await {
        Ok(bytes) => bytes.map(|b| b / 1024),
        Err(e) => {
            debug!(container = %id, error = %e, "Memory stats unavailable");
            None
        }
    }
}

/// A started container with everything needed to drive or hand it off.
pub struct RunningProgram {
    pub language: Language,
    pub workspace: SessionWorkspace,
    pub container: Arc<ContainerHandle>,
    pub stdin: StdinHandle,
    pub output: Arc<OutputBuffer>,
    pub reader: JoinHandle<()>,
    pub feeder: Option<JoinHandle<()>>,
    pub started: Instant,
    /// Wall-clock budget of the language profile.
    pub timeout: Duration,
}

impl RunningProgram {
    /// Tear the container down, stop the I/O tasks and remove the workspace.
    pub async fn shutdown(mut self, runtime: &dyn ContainerRuntime) {
        self.container.teardown(runtime).await;
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        self.reader.abort();
        if let Err(e) = self.workspace.cleanup() {
            warn!(error = ?e.detail(), "Workspace cleanup failed");
        }
    }
}

/// Write `lines` to the container one at a time, pausing before each.
fn spawn_feeder(
    stdin: StdinHandle,
    output: Arc<OutputBuffer>,
    text: String,
    delay: Duration,
) -> JoinHandle<()> {
    output.set_input_pending(true);
    tokio::spawn(async move {
        for line in text.lines() {
            tokio::time::sleep(delay).await;
            let mut sink = stdin.lock().await;
            let written = async {
                sink.write_all(line.as_bytes()).await?;
                sink.write_all(b"\n").await?;
                sink.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!(error = %e, "Stopped feeding stdin");
                break;
            }
        }
        output.set_input_pending(false);
    })
}

/// Runs requests in containers, diverting to the fallback engine when needed.
pub struct ContainerEngine {
    runtime: Arc<dyn ContainerRuntime>,
    languages: Arc<LanguageRegistry>,
    workspaces: WorkspaceManager,
    probe: Arc<HealthProbe>,
    fallback: Option<FallbackEngine>,
    sessions: Arc<ExecutionRegistry>,
    config: EngineConfig,
}

impl ContainerEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        languages: Arc<LanguageRegistry>,
        workspaces: WorkspaceManager,
        probe: Arc<HealthProbe>,
        fallback: Option<FallbackEngine>,
        sessions: Arc<ExecutionRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            runtime,
            languages,
            workspaces,
            probe,
            fallback,
            sessions,
            config,
        }
    }

    pub const fn sessions(&self) -> &Arc<ExecutionRegistry> {
        &self.sessions
    }

    /// Execute a request.
    ///
    /// Unsupported languages and failed language preconditions are rejected
    /// before any workspace or container exists.
    #[instrument(skip(self, request), fields(language = %request.language, interactive = request.interactive))]
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        let profile = self.languages.profile(&request.language)?;
        let language = profile.language;

        if !self.probe.check_language(language).await {
            return match &self.fallback {
                Some(fallback) => {
                    info!(%language, "Container runtime unavailable, using fallback");
                    Ok(fallback
                        .run(language, &request.code, request.stdin.as_deref())
                        .await)
                }
                None => Err(ExecError::RuntimeUnavailable(
                    language.display_name().to_string(),
                )),
            };
        }

        let source = profile.prepare_source(&request.code)?;
        let program = self
            .launch(profile, &source, request.stdin.as_deref())
            .await?;

        if request.interactive {
            Ok(self.run_session(profile, program).await)
        } else {
            Ok(self.run_to_completion(profile, program).await)
        }
    }

    /// Create the workspace and container, attach, start, and begin feeding stdin.
    async fn launch(
        &self,
        profile: &LanguageProfile,
        source: &str,
        stdin: Option<&str>,
    ) -> Result<RunningProgram, ExecError> {
        let started = Instant::now();
        let mut workspace = self.workspaces.create()?;
        workspace.write_source(source, profile)?;
        let stdin_text = match stdin {
            Some(text) => {
                workspace.write_stdin(text)?;
                normalize_stdin(text)
            }
            None => None,
        };

        let spec = ContainerSpec::for_execution(
            profile,
            workspace.dir(),
            format!("code-sandbox-{}", workspace.session_id()),
        );
        let id = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| ExecError::ContainerStart {
                detail: e.to_string(),
            })?;
        let container = ContainerHandle::new(id);
        debug!(container = %container.id(), "Created container");

        // attach before start so early output is not lost
        let attached = async {
            let io = self.runtime.attach(container.id()).await?;
            self.runtime.start(container.id()).await?;
            Ok::<_, RuntimeError>(io)
        }
        .await;
        let io = match attached {
            Ok(io) => io,
            Err(e) => {
                container.teardown(self.runtime.as_ref()).await;
                return Err(ExecError::ContainerStart {
                    detail: e.to_string(),
                });
            }
        };
        container.mark_running().await;

        let output = OutputBuffer::new(profile.language);
        let reader = spawn_reader(io.output, Arc::clone(&output));
        let stdin: StdinHandle = Arc::new(Mutex::new(io.input));
        let feeder = stdin_text.map(|text| {
            spawn_feeder(
                Arc::clone(&stdin),
                Arc::clone(&output),
                text,
                self.config.input_line_delay,
            )
        });

        Ok(RunningProgram {
            language: profile.language,
            workspace,
            container,
            stdin,
            output,
            reader,
            feeder,
            started,
            timeout: profile.timeout,
        })
    }

    async fn observe_program(&self, profile: &LanguageProfile, program: &RunningProgram) -> Outcome {
        let runtime = Arc::clone(&self.runtime);
        let id = program.container.id().to_string();
        let exit = async move { runtime.wait(&id).await };
        let deadline = tokio::time::Instant::from_std(program.started + profile.timeout);

        match observe(&program.output, exit, deadline, self.config.prompt_grace).await {
            Observed::Exited(Ok(code)) => {
                program.output.wait_closed(self.config.drain_timeout).await;
                program.container.mark_exited().await;
                Outcome::Exited(code)
            }
            Observed::Exited(Err(e)) => Outcome::Failed(format!("Lost track of the container: {e}")),
            Observed::Deadline => {
                warn!(container = %program.container.id(), timeout = ?profile.timeout, "Execution timed out");
                Outcome::TimedOut(profile.timeout)
            }
            Observed::Waiting => Outcome::WaitingForInput,
        }
    }

    /// Sample memory, snapshot output and tear the program down.
    async fn finish(
        &self,
        profile: &LanguageProfile,
        program: RunningProgram,
        outcome: &Outcome,
    ) -> ExecutionResult {
        let memory = sample_memory(self.runtime.as_ref(), program.container.id()).await;
        let state = program.output.snapshot();
        let elapsed = program.started.elapsed();
        program.shutdown(self.runtime.as_ref()).await;

        let result = build_result(profile.language, &state, outcome, memory, elapsed, None);
        info!(
            status = ?result.status,
            exit_code = ?result.exit_code,
            elapsed_ms = result.execution_time_ms,
            "Execution finished"
        );
        result
    }

    /// Synchronous API: return once the program exits, times out, or blocks on input.
    async fn run_to_completion(&self, profile: &LanguageProfile, program: RunningProgram) -> ExecutionResult {
        let outcome = self.observe_program(profile, &program).await;
        self.finish(profile, program, &outcome).await
    }

    /// Session API: a program blocked on input stays alive in the registry.
    async fn run_session(&self, profile: &LanguageProfile, program: RunningProgram) -> ExecutionResult {
        let outcome = self.observe_program(profile, &program).await;
        if !matches!(outcome, Outcome::WaitingForInput) {
            return self.finish(profile, program, &outcome).await;
        }

        let execution_id = program.workspace.session_id().to_string();
        let state = program.output.snapshot();
        let result = build_result(
            profile.language,
            &state,
            &outcome,
            None,
            program.started.elapsed(),
            Some(execution_id.clone()),
        );

        let session = ExecutionSession::new(
            execution_id.clone(),
            program,
            Arc::clone(&self.runtime),
            self.config.clone(),
        );
        self.sessions.register(session).await;
        info!(execution = %execution_id, prompt = ?result.waiting_prompt, "Execution waiting for input");
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::health::ProbeConfig;
    use crate::runtime::fake::{FakeRuntime, Program, Step};
    use crate::session::SessionConfig;

    struct Harness {
        engine: ContainerEngine,
        runtime: Arc<FakeRuntime>,
        root: tempfile::TempDir,
    }

    fn harness(program: Program, timeout: Option<Duration>, fallback: bool) -> Harness {
        let runtime = FakeRuntime::with_program(program);
        let languages = Arc::new(LanguageRegistry::new(timeout));
        let root = tempfile::tempdir().unwrap();
        let probe = Arc::new(HealthProbe::new(
            runtime.clone(),
            Arc::clone(&languages),
            fallback,
            ProbeConfig::default(),
        ));
        let engine = ContainerEngine::new(
            runtime.clone(),
            languages,
            WorkspaceManager::new(root.path()),
            probe,
            fallback.then(FallbackEngine::default),
            ExecutionRegistry::new(SessionConfig::default()),
            EngineConfig {
                input_line_delay: Duration::from_millis(5),
                prompt_grace: Duration::from_millis(100),
                drain_timeout: Duration::from_millis(200),
            },
        );
        Harness {
            engine,
            runtime,
            root,
        }
    }

    fn request(language: &str, code: &str, stdin: Option<&str>) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            language: language.to_string(),
            stdin: stdin.map(ToString::to_string),
            interactive: false,
        }
    }

    fn workspace_count(h: &Harness) -> usize {
        std::fs::read_dir(h.root.path()).map_or(0, Iterator::count)
    }

    #[tokio::test]
    async fn hello_world_runs_in_container() {
        let h = harness(Program::hello(), None, true);
        for lang in ["javascript", "python", "cpp", "rust"] {
            let result = h.engine.run(&request(lang, "hello", None)).await.unwrap();
            assert_eq!(result.exit_code, Some(0), "{lang}");
            assert_eq!(result.stdout, "Hello, World!");
            assert_eq!(result.execution_method, ExecutionMethod::Docker);
            assert_eq!(result.status, ExecutionStatus::Completed);
            assert!(!result.is_waiting_for_input);
            assert!(result.memory_usage_kb.is_some());
        }
        assert_eq!(workspace_count(&h), 0);
        assert_eq!(h.runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn unsupported_language_has_no_side_effects() {
        let h = harness(Program::hello(), None, true);
        let err = h.engine.run(&request("cobol", "x", None)).await.unwrap_err();
        assert!(matches!(err, ExecError::UnsupportedLanguage(_)));
        assert_eq!(workspace_count(&h), 0);
        assert!(h.runtime.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn java_without_main_fails_before_container() {
        let h = harness(Program::hello(), None, true);
        let err = h
            .engine
            .run(&request("java", "class Solution {}", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::CompileTargetMismatch { .. }));
        assert!(h.runtime.created.lock().unwrap().is_empty());
        assert_eq!(workspace_count(&h), 0);
    }

    #[tokio::test]
    async fn container_start_failure_cleans_workspace() {
        let h = harness(Program::hello(), None, true);
        h.runtime.fail_create.store(true, Ordering::SeqCst);
        let err = h.engine.run(&request("python", "x", None)).await.unwrap_err();
        assert!(matches!(err, ExecError::ContainerStart { .. }));
        assert_eq!(workspace_count(&h), 0);
    }

    #[tokio::test]
    async fn stdin_is_delivered_line_by_line() {
        let program = Program::new(vec![
            Step::Print("a? ".into()),
            Step::ReadLine(|l| format!("got {l}\n")),
            Step::Print("b? ".into()),
            Step::ReadLine(|l| format!("got {l}\n")),
            Step::Exit(0),
        ]);
        let h = harness(program, None, true);
        let result = h
            .engine
            .run(&request("python", "x", Some(" 3 \n4")))
            .await
            .unwrap();
        assert!(!result.is_waiting_for_input);
        assert_eq!(result.stdout, "a? got 3\nb? got 4");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn prompt_without_stdin_reports_waiting() {
        let program = Program::new(vec![
            Step::Print("What is your name? ".into()),
            Step::ReadLine(|l| format!("Hi {l}\n")),
            Step::Exit(0),
        ]);
        let h = harness(program, None, true);
        let result = h.engine.run(&request("python", "x", None)).await.unwrap();
        assert!(result.is_waiting_for_input);
        assert_eq!(result.waiting_prompt.as_deref(), Some("What is your name?"));
        assert_eq!(result.status, ExecutionStatus::WaitingForInput);
        assert!(result.exit_code.is_none());
        assert_eq!(h.runtime.live_containers(), 0);
        assert_eq!(workspace_count(&h), 0);
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let program = Program::new(vec![Step::Print("working\n".into()), Step::Hang]);
        let h = harness(program, Some(Duration::from_millis(300)), true);
        let started = Instant::now();
        let result = h.engine.run(&request("javascript", "for(;;){}", None)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300 + 700));
        assert!(result.timed_out);
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.exit_code.is_none());
        assert!(result.stderr.contains("timed out"));
        assert_eq!(h.runtime.live_containers(), 0);
        assert_eq!(workspace_count(&h), 0);
    }

    #[tokio::test]
    async fn compile_failure_is_reported() {
        let program = Program::new(vec![
            Step::Print("main.cpp:1:1: error: expected ';'\n".into()),
            Step::Exit(COMPILE_FAILED_EXIT),
        ]);
        let h = harness(program, None, true);
        let result = h.engine.run(&request("cpp", "int main(", None)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::CompileError);
        assert_eq!(result.exit_code, Some(COMPILE_FAILED_EXIT));
        assert!(result.stderr.contains("error: expected"));
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn stats_failure_does_not_fail_execution() {
        let h = harness(Program::hello(), None, true);
        h.runtime.fail_stats.store(true, Ordering::SeqCst);
        let result = h.engine.run(&request("python", "x", None)).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.memory_usage_kb.is_none());
    }

    #[tokio::test]
    async fn unavailable_runtime_uses_fallback() {
        let h = harness(Program::hello(), None, true);
        h.runtime.unavailable.store(true, Ordering::SeqCst);

        let result = h
            .engine
            .run(&request("javascript", "console.log(6 * 7)", None))
            .await
            .unwrap();
        assert_eq!(result.execution_method, ExecutionMethod::Fallback);
        assert_eq!(result.stdout, "42");

        let result = h.engine.run(&request("cpp", "int main(){}", None)).await.unwrap();
        assert_eq!(result.execution_method, ExecutionMethod::Fallback);
        assert_eq!(result.status, ExecutionStatus::Unavailable);
        assert!(h.runtime.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_runtime_without_fallback_errors() {
        let h = harness(Program::hello(), None, false);
        h.runtime.unavailable.store(true, Ordering::SeqCst);
        let err = h.engine.run(&request("python", "x", None)).await.unwrap_err();
        assert!(matches!(err, ExecError::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn interactive_session_accepts_input() {
        let program = Program::new(vec![
            Step::Print("Enter a number: ".into()),
            Step::ReadLine(|l| format!("double is {}\n", l.trim().parse::<i64>().unwrap_or(0) * 2)),
            Step::Exit(0),
        ]);
        let h = harness(program, None, true);
        let mut req = request("python", "x", None);
        req.interactive = true;

        let first = h.engine.run(&req).await.unwrap();
        assert!(first.is_waiting_for_input);
        let id = first.execution_id.clone().unwrap();
        assert_eq!(h.engine.sessions().len().await, 1);
        assert_eq!(workspace_count(&h), 1);

        let second = h.engine.sessions().send_input(&id, "21").await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Completed);
        assert!(second.stdout.ends_with("double is 42"));
        assert_eq!(second.exit_code, Some(0));

        // stopping a finished execution returns its final result
        let again = h.engine.sessions().stop(&id).await.unwrap();
        assert_eq!(again, second);
        assert_eq!(workspace_count(&h), 0);
        assert_eq!(h.runtime.live_containers(), 0);
    }
}
