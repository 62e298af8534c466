//! Fallback execution engine.
//!
//! Used when the container runtime is unreachable or cannot run a language.
//! Isolation is much weaker than the container path: JavaScript runs in an
//! embedded interpreter with loop and recursion limits, Python runs as a
//! plain host subprocess. Every result is tagged
//! [`ExecutionMethod::Fallback`] so callers can tell.
//!
//! With a worker executable configured, JavaScript is evaluated in a child
//! process (`<exe> --js-worker`) that is killed when the time limit expires.
//! Without one it runs on a blocking thread and is interrupted between
//! interpreter steps; callbacks invoked natively by builtins (`forEach`,
//! getters) cannot be interrupted that way.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use boa_engine::{Context, Script, Source};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::backend::{ExecutionMethod, ExecutionResult, ExecutionStatus};
use crate::detector::detect;
use crate::language::Language;
use crate::workspace::normalize_stdin;

/// Globals installed before user code runs. `prompt()` consumes the
/// supplied stdin lines and flags the run as waiting once they run out.
const JS_PRELUDE: &str = r"
var __sandbox = { out: [], err: [], stdin: [], waiting: false, prompt: null };
function __fmt(args) {
  return args.map(function (a) {
    if (typeof a === 'object' && a !== null) {
      try { return JSON.stringify(a); } catch (e) { return String(a); }
    }
    return String(a);
  }).join(' ');
}
var console = {
  log: function (...a) { __sandbox.out.push(__fmt(a)); },
  info: function (...a) { __sandbox.out.push(__fmt(a)); },
  warn: function (...a) { __sandbox.err.push(__fmt(a)); },
  error: function (...a) { __sandbox.err.push(__fmt(a)); },
};
function prompt(message) {
  if (message !== undefined) { __sandbox.out.push(String(message)); }
  if (__sandbox.stdin.length === 0) {
    __sandbox.waiting = true;
    __sandbox.prompt = message === undefined ? null : String(message);
    throw new Error('input required');
  }
  return __sandbox.stdin.shift();
}
";

const JS_COLLECT: &str =
    "JSON.stringify({ out: __sandbox.out, err: __sandbox.err, waiting: __sandbox.waiting, prompt: __sandbox.prompt })";

const PYTHON_EOF_MARKER: &str = "EOFError";

/// Command-line flag that turns the daemon binary into a JavaScript worker.
pub const JS_WORKER_FLAG: &str = "--js-worker";

/// Interpreter steps between yields to the executor.
const JS_STEP_BUDGET: u32 = 10_000;

/// One JavaScript evaluation, as handed to a worker process on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsJob {
    pub code: String,
    pub stdin: Vec<String>,
    pub loop_limit: u64,
    pub recursion_limit: usize,
}

#[derive(Debug, Deserialize)]
struct JsCapture {
    out: Vec<String>,
    err: Vec<String>,
    waiting: bool,
    prompt: Option<String>,
}

/// Degraded execution path for the scripting languages.
#[derive(Debug, Clone)]
pub struct FallbackEngine {
    python_bin: String,
    timeout: Duration,
    js_loop_limit: u64,
    js_recursion_limit: usize,
    js_worker: Option<PathBuf>,
}

impl Default for FallbackEngine {
    fn default() -> Self {
        Self::new("python3", Duration::from_secs(10))
    }
}

impl FallbackEngine {
    pub fn new(python_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            python_bin: python_bin.into(),
            timeout,
            js_loop_limit: 10_000_000,
            js_recursion_limit: 512,
            js_worker: None,
        }
    }

    /// Evaluate JavaScript in a child process running `exe --js-worker`.
    #[must_use]
    pub fn with_js_worker(mut self, exe: impl Into<PathBuf>) -> Self {
        self.js_worker = Some(exe.into());
        self
    }

    /// Languages with a fallback path.
    pub const fn supports(language: Language) -> bool {
        matches!(language, Language::Javascript | Language::Python)
    }

    /// Run `code`. Never fails: problems are reported in the result.
    #[instrument(skip(self, code, stdin))]
    pub async fn run(&self, language: Language, code: &str, stdin: Option<&str>) -> ExecutionResult {
        let started = Instant::now();
        let lines: Vec<String> = stdin
            .and_then(normalize_stdin)
            .map(|s| s.lines().map(ToString::to_string).collect())
            .unwrap_or_default();

        let mut result = match language {
            Language::Javascript => self.run_javascript(code, lines).await,
            Language::Python => self.run_python(code, lines).await,
            other => unavailable(other),
        };
        result.execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(status = ?result.status, "Fallback execution finished");
        result
    }

    async fn run_javascript(&self, code: &str, stdin: Vec<String>) -> ExecutionResult {
        let job = JsJob {
            code: code.to_string(),
            stdin,
            loop_limit: self.js_loop_limit,
            recursion_limit: self.js_recursion_limit,
        };
        match &self.js_worker {
            Some(exe) => self.run_js_in_worker(exe, &job).await,
            None => self.run_js_in_process(job).await,
        }
    }

    async fn run_js_in_worker(&self, exe: &Path, job: &JsJob) -> ExecutionResult {
        let input = match serde_json::to_vec(job) {
            Ok(input) => input,
            Err(e) => {
                return failed(Language::Javascript, String::new(), format!("Evaluation failed: {e}"), None)
            }
        };
        let mut command = Command::new(exe);
        command.arg(JS_WORKER_FLAG);

        match run_child(command, input, self.timeout).await {
            Ok(ChildRun::TimedOut) => timed_out(Language::Javascript, self.timeout),
            Ok(ChildRun::Finished { stdout, stderr, code }) => {
                match serde_json::from_slice::<ExecutionResult>(&stdout) {
                    Ok(result) if code == Some(0) => result,
                    _ => {
                        warn!(worker = %exe.display(), ?code, "JavaScript worker failed");
                        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                        failed(Language::Javascript, String::new(), format!("Evaluation failed: {stderr}"), None)
                    }
                }
            }
            Err(e) => {
                warn!(worker = %exe.display(), error = %e, "JavaScript worker did not start");
                failed(Language::Javascript, String::new(), format!("Evaluation failed: {e}"), None)
            }
        }
    }

    async fn run_js_in_process(&self, job: JsJob) -> ExecutionResult {
        let limit = self.timeout;
        // the interpreter is !Send; it gets a thread and a single-threaded runtime
        let task = tokio::task::spawn_blocking(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            Ok::<_, io::Error>(
                runtime.block_on(async { tokio::time::timeout(limit, eval_javascript(&job)).await.ok() }),
            )
        });

        match task.await {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) => timed_out(Language::Javascript, limit),
            Ok(Err(e)) => {
                warn!(error = %e, "JavaScript runtime setup failed");
                failed(Language::Javascript, String::new(), format!("Evaluation failed: {e}"), None)
            }
            Err(e) => {
                warn!(error = %e, "JavaScript evaluation task failed");
                failed(Language::Javascript, String::new(), format!("Evaluation failed: {e}"), None)
            }
        }
    }

    async fn run_python(&self, code: &str, stdin: Vec<String>) -> ExecutionResult {
        match self.spawn_python(code, &stdin).await {
            Ok(result) => result,
            Err(e) => {
                warn!(python = %self.python_bin, error = %e, "Python fallback failed");
                failed(
                    Language::Python,
                    String::new(),
                    format!("Failed to run {}: {e}", self.python_bin),
                    None,
                )
            }
        }
    }

    async fn spawn_python(&self, code: &str, stdin: &[String]) -> io::Result<ExecutionResult> {
        let mut script = tempfile::Builder::new()
            .prefix("code-sandbox-")
            .suffix(".py")
            .tempfile()?;
        io::Write::write_all(&mut script, code.as_bytes())?;

        let mut payload = stdin.join("\n");
        if !payload.is_empty() {
            payload.push('\n');
        }
        let mut command = Command::new(&self.python_bin);
        command.arg("-u").arg(script.path());

        let (out, err, code) = match run_child(command, payload.into_bytes(), self.timeout).await? {
            ChildRun::Finished { stdout, stderr, code } => (stdout, stderr, code),
            ChildRun::TimedOut => return Ok(timed_out(Language::Python, self.timeout)),
        };

        let stdout = String::from_utf8_lossy(&out).trim().to_string();
        let stderr = String::from_utf8_lossy(&err).trim().to_string();
        let code = code.map(i64::from);

        if code != Some(0) && stderr.contains(PYTHON_EOF_MARKER) {
            let detection = detect(&String::from_utf8_lossy(&out), Language::Python);
            return Ok(waiting(Language::Python, stdout, detection.prompt));
        }
        Ok(base(Language::Python, stdout, stderr, code, ExecutionStatus::Completed))
    }
}

/// Entry point of `--js-worker`: read a [`JsJob`] from stdin, evaluate it
/// and write the [`ExecutionResult`] to stdout. The parent enforces the
/// time limit by killing the process.
pub async fn run_js_worker() -> anyhow::Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("Failed to read job")?;
    let job: JsJob = serde_json::from_slice(&input).context("Invalid job")?;

    let result = eval_javascript(&job).await;

    let output = serde_json::to_vec(&result).context("Failed to encode result")?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output).await.context("Failed to write result")?;
    stdout.flush().await.context("Failed to write result")?;
    Ok(())
}

enum ChildRun {
    Finished {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        code: Option<i32>,
    },
    TimedOut,
}

/// Run `command` with `input` on stdin. Feeding stdin, draining both output
/// pipes and reaping the child all happen under `limit`; the child is killed
/// when it runs out.
async fn run_child(mut command: Command, input: Vec<u8>, limit: Duration) -> io::Result<ChildRun> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin_pipe = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let mut stdout_pipe = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let mut stderr_pipe = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let writer = tokio::spawn(async move {
        // a program that exits without reading closes the pipe early
        let _ = stdin_pipe.write_all(&input).await;
    });

    let run = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (r1, r2) = tokio::join!(
            stdout_pipe.read_to_end(&mut out),
            stderr_pipe.read_to_end(&mut err),
        );
        r1?;
        r2?;
        let status = child.wait().await?;
        Ok::<_, io::Error>((out, err, status))
    };
    let outcome = tokio::time::timeout(limit, run).await;
    writer.abort();

    match outcome {
        Ok(finished) => {
            let (stdout, stderr, status) = finished?;
            Ok(ChildRun::Finished {
                stdout,
                stderr,
                code: status.code(),
            })
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill timed-out child");
            }
            Ok(ChildRun::TimedOut)
        }
    }
}

fn missing_pipe(name: &str) -> io::Error {
    io::Error::other(format!("child {name} not captured"))
}

/// Evaluate `job`, yielding to the executor every [`JS_STEP_BUDGET`] steps
/// so a surrounding timeout can drop the evaluation.
#[allow(clippy::future_not_send)]
async fn eval_javascript(job: &JsJob) -> ExecutionResult {
    let mut context = Context::default();
    context.runtime_limits_mut().set_loop_iteration_limit(job.loop_limit);
    context.runtime_limits_mut().set_recursion_limit(job.recursion_limit);

    if let Err(e) = context.eval(Source::from_bytes(JS_PRELUDE)) {
        return failed(Language::Javascript, String::new(), format!("Sandbox setup failed: {e}"), None);
    }
    let stdin_json = serde_json::to_string(&job.stdin).unwrap_or_else(|_| "[]".to_string());
    let seed = format!("__sandbox.stdin = {stdin_json};");
    if let Err(e) = context.eval(Source::from_bytes(&seed)) {
        return failed(Language::Javascript, String::new(), format!("Sandbox setup failed: {e}"), None);
    }

    let outcome = match Script::parse(Source::from_bytes(&job.code), None, &mut context) {
        Ok(script) => script.evaluate_async_with_budget(&mut context, JS_STEP_BUDGET).await,
        Err(e) => Err(e),
    };

    let capture = context
        .eval(Source::from_bytes(JS_COLLECT))
        .ok()
        .and_then(|v| v.as_string().map(boa_engine::JsString::to_std_string_escaped))
        .and_then(|json| serde_json::from_str::<JsCapture>(&json).ok());
    let Some(capture) = capture else {
        return failed(Language::Javascript, String::new(), "Output capture failed".to_string(), None);
    };

    let mut stdout = capture.out.join("\n");
    let mut stderr = capture.err.join("\n");
    if capture.waiting {
        return waiting(Language::Javascript, stdout, capture.prompt);
    }
    match outcome {
        Ok(value) => {
            // completion value of the last statement, as a console would echo it
            if !value.is_undefined() {
                if !stdout.is_empty() {
                    stdout.push('\n');
                }
                stdout.push_str(&value.display().to_string());
            }
            base(Language::Javascript, stdout, stderr, Some(0), ExecutionStatus::Completed)
        }
        Err(e) => {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&e.to_string());
            base(Language::Javascript, stdout, stderr, Some(1), ExecutionStatus::Completed)
        }
    }
}

fn base(
    language: Language,
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    status: ExecutionStatus,
) -> ExecutionResult {
    ExecutionResult {
        stdout,
        stderr,
        exit_code,
        execution_method: ExecutionMethod::Fallback,
        status,
        is_waiting_for_input: status == ExecutionStatus::WaitingForInput,
        waiting_prompt: None,
        memory_usage_kb: None,
        language: language.id().to_string(),
        timed_out: status == ExecutionStatus::TimedOut,
        execution_id: None,
        execution_time_ms: 0,
    }
}

fn waiting(language: Language, stdout: String, prompt: Option<String>) -> ExecutionResult {
    let mut result = base(language, stdout, String::new(), None, ExecutionStatus::WaitingForInput);
    result.waiting_prompt = prompt.map(|p| p.trim().to_string());
    result
}

fn failed(language: Language, stdout: String, stderr: String, exit_code: Option<i64>) -> ExecutionResult {
    base(language, stdout, stderr, exit_code, ExecutionStatus::RuntimeError)
}

fn timed_out(language: Language, limit: Duration) -> ExecutionResult {
    base(
        language,
        String::new(),
        format!("Execution timed out after {} ms", limit.as_millis()),
        None,
        ExecutionStatus::TimedOut,
    )
}

fn unavailable(language: Language) -> ExecutionResult {
    base(
        language,
        String::new(),
        format!(
            "{} requires the container runtime, which is currently unavailable",
            language.display_name()
        ),
        None,
        ExecutionStatus::Unavailable,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn javascript_console_output() {
        let engine = FallbackEngine::default();
        let result = engine
            .run(
                Language::Javascript,
                "console.log('Hello, World!'); console.log({a: 1}, 2); console.error('warn');",
                None,
            )
            .await;
        assert_eq!(result.execution_method, ExecutionMethod::Fallback);
        assert_eq!(result.stdout, "Hello, World!\n{\"a\":1} 2");
        assert_eq!(result.stderr, "warn");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.memory_usage_kb.is_none());
    }

    #[tokio::test]
    async fn javascript_prompt_reads_stdin() {
        let engine = FallbackEngine::default();
        let code = "const a = Number(prompt('a?')); const b = Number(prompt('b?')); console.log(a + b);";
        let result = engine.run(Language::Javascript, code, Some(" 2 \n3")).await;
        assert!(!result.is_waiting_for_input);
        assert!(result.stdout.ends_with('5'));
    }

    #[tokio::test]
    async fn javascript_prompt_without_input_waits() {
        let engine = FallbackEngine::default();
        let result = engine
            .run(Language::Javascript, "const n = prompt('Enter n:'); console.log(n);", None)
            .await;
        assert!(result.is_waiting_for_input);
        assert_eq!(result.status, ExecutionStatus::WaitingForInput);
        assert_eq!(result.waiting_prompt.as_deref(), Some("Enter n:"));
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn javascript_errors_go_to_stderr() {
        let engine = FallbackEngine::default();
        let result = engine
            .run(Language::Javascript, "console.log(1); throw new Error('boom');", None)
            .await;
        assert_eq!(result.stdout, "1");
        assert!(result.stderr.contains("boom"));
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn javascript_infinite_loop_is_bounded() {
        let mut engine = FallbackEngine::default();
        engine.js_loop_limit = 10_000;
        let result = engine.run(Language::Javascript, "while (true) {}", None).await;
        assert_eq!(result.exit_code, Some(1));
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn javascript_completion_value_is_printed() {
        let engine = FallbackEngine::default();
        let result = engine.run(Language::Javascript, "6*7", None).await;
        assert_eq!(result.stdout, "42");
        assert_eq!(result.exit_code, Some(0));

        let result = engine.run(Language::Javascript, "console.log('a'); 1 + 1", None).await;
        assert_eq!(result.stdout, "a\n2");

        let result = engine.run(Language::Javascript, "let x = 1;", None).await;
        assert_eq!(result.stdout, "");
    }

    #[tokio::test]
    async fn javascript_nested_loops_stop_at_timeout() {
        let engine = FallbackEngine::new("python3", Duration::from_millis(300));
        let started = Instant::now();
        let result = engine
            .run(Language::Javascript, "for (;;) { for (let i = 0; i < 9e6; i++) {} }", None)
            .await;
        assert!(result.timed_out);
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.exit_code.is_none());
        // the evaluating thread has been joined by the time run returns
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn compiled_languages_are_unavailable() {
        let engine = FallbackEngine::default();
        for language in [Language::Java, Language::Cpp, Language::Csharp, Language::Rust] {
            let result = engine.run(language, "int main() {}", None).await;
            assert_eq!(result.execution_method, ExecutionMethod::Fallback);
            assert_eq!(result.status, ExecutionStatus::Unavailable);
            assert!(result.stderr.contains("requires the container runtime"));
            assert!(result.exit_code.is_none());
        }
    }

    #[tokio::test]
    async fn missing_python_is_reported() {
        let engine = FallbackEngine::new("/nonexistent/python3", Duration::from_secs(1));
        let result = engine.run(Language::Python, "print(1)", None).await;
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.stderr.contains("/nonexistent/python3"));
    }

    #[tokio::test]
    async fn python_subprocess() {
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            return;
        }
        let engine = FallbackEngine::default();
        let result = engine
            .run(Language::Python, "name = input('Name: ')\nprint('Hi', name)", Some("Ada"))
            .await;
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "Name: Hi Ada");

        let result = engine.run(Language::Python, "x = input('Age: ')", None).await;
        assert!(result.is_waiting_for_input);
        assert_eq!(result.waiting_prompt.as_deref(), Some("Age:"));
    }

    #[tokio::test]
    async fn python_timeout() {
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            return;
        }
        let engine = FallbackEngine::new("python3", Duration::from_millis(300));
        let result = engine.run(Language::Python, "while True:\n    pass", None).await;
        assert!(result.timed_out);
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn python_stdin_larger_than_pipe_buffer() {
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            return;
        }
        let engine = FallbackEngine::new("python3", Duration::from_millis(500));
        let stdin = "x\n".repeat(200_000);
        let started = Instant::now();
        let result = engine
            .run(Language::Python, "import time\ntime.sleep(30)", Some(&stdin))
            .await;
        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));

        let engine = FallbackEngine::new("python3", Duration::from_secs(10));
        let code = "import sys\nprint(len(sys.stdin.read().split()))";
        let result = engine.run(Language::Python, code, Some(&stdin)).await;
        assert_eq!(result.stdout, "200000");
    }
}
