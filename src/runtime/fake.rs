//! Scripted in-memory runtime for tests.
//!
//! Each created container runs a [`Program`]: a list of steps that print,
//! sleep, read a line from stdin or exit. Lifecycle calls are recorded so
//! tests can assert on teardown behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    ContainerIo, ContainerRuntime, ContainerSpec, OutputChunk, RuntimeError, RuntimeInfo,
};

/// Exit code reported for a stopped container.
pub const STOPPED_EXIT: i64 = 137;

#[derive(Clone)]
pub enum Step {
    Print(String),
    PrintErr(String),
    Sleep(Duration),
    /// Read one line and print `respond(line)`.
    ReadLine(fn(&str) -> String),
    Exit(i64),
    /// Never exit on its own.
    Hang,
}

#[derive(Clone, Default)]
pub struct Program {
    pub steps: Vec<Step>,
}

impl Program {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn hello() -> Self {
        Self::new(vec![Step::Print("Hello, World!\n".into()), Step::Exit(0)])
    }
}

struct Sim {
    spec: ContainerSpec,
    exit: watch::Sender<Option<i64>>,
    output_rx: Option<mpsc::UnboundedReceiver<Result<OutputChunk, RuntimeError>>>,
    output_tx: Option<mpsc::UnboundedSender<Result<OutputChunk, RuntimeError>>>,
    stdin: Option<DuplexStream>,
    task: Option<JoinHandle<()>>,
    running: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, Sim>>,
    program: Mutex<Program>,
    next_id: AtomicUsize,
    pub unavailable: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_stats: AtomicBool,
    pub fail_image: AtomicBool,
    /// Per-image pull delay.
    pub slow_images: Mutex<HashMap<String, Duration>>,
    pub image_pulls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub created: Mutex<Vec<ContainerSpec>>,
}

impl FakeRuntime {
    pub fn with_program(program: Program) -> Arc<Self> {
        let runtime = Self::default();
        *runtime.program.lock().unwrap() = program;
        Arc::new(runtime)
    }

    pub fn set_program(&self, program: Program) {
        *self.program.lock().unwrap() = program;
    }

    pub fn live_containers(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RuntimeError::Unavailable("daemon down".into()))
        } else {
            Ok(())
        }
    }
}

async fn run_program(
    program: Program,
    stdin: DuplexStream,
    out: mpsc::UnboundedSender<Result<OutputChunk, RuntimeError>>,
    exit: watch::Sender<Option<i64>>,
) {
    let mut lines = BufReader::new(stdin).lines();
    let mut code = 0;
    for step in program.steps {
        match step {
            Step::Print(text) => {
                let _ = out.send(Ok(OutputChunk::Stdout(text.into_bytes())));
            }
            Step::PrintErr(text) => {
                let _ = out.send(Ok(OutputChunk::Stderr(text.into_bytes())));
            }
            Step::Sleep(d) => tokio::time::sleep(d).await,
            Step::ReadLine(respond) => match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = out.send(Ok(OutputChunk::Stdout(respond(&line).into_bytes())));
                }
                _ => {
                    code = 1;
                    break;
                }
            },
            Step::Exit(c) => {
                code = c;
                break;
            }
            Step::Hang => std::future::pending::<()>().await,
        }
    }
    drop(out);
    exit.send_replace(Some(code));
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn info(&self) -> Result<RuntimeInfo, RuntimeError> {
        self.check_available()?;
        Ok(RuntimeInfo {
            version: "fake-1.0".into(),
            api_version: "1.47".into(),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.image_pulls.fetch_add(1, Ordering::SeqCst);
        let delay = self.slow_images.lock().unwrap().get(image).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_image.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api(format!("pull failed: {image}")));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check_available()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("no such image".into()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit, _) = watch::channel(None);
        self.created.lock().unwrap().push(spec.clone());
        self.containers.lock().unwrap().insert(
            id.clone(),
            Sim {
                spec: spec.clone(),
                exit,
                output_rx: Some(output_rx),
                output_tx: Some(output_tx),
                stdin: None,
                task: None,
                running: false,
            },
        );
        Ok(id)
    }

    async fn attach(&self, id: &str) -> Result<ContainerIo, RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let sim = containers.get_mut(id).ok_or(RuntimeError::NotFound)?;
        let rx = sim
            .output_rx
            .take()
            .ok_or_else(|| RuntimeError::Conflict("already attached".into()))?;
        let (input, program_side) = tokio::io::duplex(4096);
        sim.stdin = Some(program_side);

        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(ContainerIo {
            output: Box::pin(output),
            input: Box::pin(input),
        })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let program = self.program.lock().unwrap().clone();
        let mut containers = self.containers.lock().unwrap();
        let sim = containers.get_mut(id).ok_or(RuntimeError::NotFound)?;
        let stdin = sim
            .stdin
            .take()
            .unwrap_or_else(|| tokio::io::duplex(16).1);
        let out = sim
            .output_tx
            .take()
            .ok_or_else(|| RuntimeError::Conflict("already started".into()))?;
        let exit = sim.exit.clone();
        sim.running = true;
        sim.task = Some(tokio::spawn(run_program(program, stdin, out, exit)));
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut rx = {
            let containers = self.containers.lock().unwrap();
            containers
                .get(id)
                .ok_or(RuntimeError::NotFound)?
                .exit
                .subscribe()
        };
        let code = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::NotFound)?;
        Ok(code.unwrap_or_default())
    }

    async fn memory_usage(&self, id: &str) -> Result<Option<u64>, RuntimeError> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("stats unavailable".into()));
        }
        let containers = self.containers.lock().unwrap();
        let sim = containers.get(id).ok_or(RuntimeError::NotFound)?;
        Ok(Some(u64::try_from(sim.spec.memory_bytes / 8).unwrap_or(0)))
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let sim = containers.get(id).ok_or(RuntimeError::NotFound)?;
        Ok(sim.running && sim.exit.borrow().is_none())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock().unwrap();
        let sim = containers.get_mut(id).ok_or(RuntimeError::NotFound)?;
        if sim.exit.borrow().is_some() {
            return Err(RuntimeError::NotModified);
        }
        if let Some(task) = sim.task.take() {
            task.abort();
        }
        sim.running = false;
        sim.exit.send_replace(Some(STOPPED_EXIT));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock().unwrap();
        let mut sim = containers.remove(id).ok_or(RuntimeError::NotFound)?;
        if let Some(task) = sim.task.take() {
            task.abort();
        }
        sim.exit.send_replace(Some(STOPPED_EXIT));
        Ok(())
    }
}
