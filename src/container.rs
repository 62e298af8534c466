//! Container lifecycle tracking.
//!
//! A [`ContainerHandle`] moves through `Created -> Running -> Stopping ->
//! Stopped -> Removed`. [`ContainerHandle::teardown`] transitions from any
//! state to `Removed` and is idempotent: concurrent callers serialize on the
//! state lock and later ones observe `Removed` and return immediately.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::runtime::{ContainerRuntime, RuntimeError};

/// Lifecycle state of a container owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Stopping,
    Stopped,
    Removed,
}

/// A container created for one execution.
#[derive(Debug)]
pub struct ContainerHandle {
    id: String,
    started_at: Instant,
    state: Mutex<ContainerState>,
}

impl ContainerHandle {
    pub fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            started_at: Instant::now(),
            state: Mutex::new(ContainerState::Created),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    pub async fn state(&self) -> ContainerState {
        *self.state.lock().await
    }

    pub async fn mark_running(&self) {
        let mut state = self.state.lock().await;
        if *state == ContainerState::Created {
            *state = ContainerState::Running;
        }
    }

    /// The program exited on its own.
    pub async fn mark_exited(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, ContainerState::Created | ContainerState::Running) {
            *state = ContainerState::Stopped;
        }
    }

    /// Stop (if still running) and force-remove the container.
    ///
    /// Never fails: a container that is already stopped or gone is the
    /// desired end state, and anything else is logged.
    pub async fn teardown(&self, runtime: &dyn ContainerRuntime) {
        let mut state = self.state.lock().await;
        if *state == ContainerState::Removed {
            debug!(container = %self.id, "Teardown skipped, already removed");
            return;
        }

        if matches!(*state, ContainerState::Created | ContainerState::Running) {
            *state = ContainerState::Stopping;
            match runtime.is_running(&self.id).await {
                Ok(true) => match runtime.stop(&self.id).await {
                    Ok(()) => debug!(container = %self.id, "Stopped container"),
                    Err(e) if e.is_gone() => {
                        debug!(container = %self.id, "Container exited before stop");
                    }
                    Err(e) => warn!(container = %self.id, error = %e, "Failed to stop container"),
                },
                Ok(false) => debug!(container = %self.id, "Container not running"),
                Err(RuntimeError::NotFound) => {
                    debug!(container = %self.id, "Container already removed");
                    *state = ContainerState::Removed;
                    return;
                }
                Err(e) => warn!(container = %self.id, error = %e, "Failed to inspect container"),
            }
            *state = ContainerState::Stopped;
        }

        match runtime.remove(&self.id).await {
            Ok(()) => debug!(container = %self.id, "Removed container"),
            Err(RuntimeError::NotFound) => {
                debug!(container = %self.id, "Container already removed");
            }
            Err(e) => warn!(container = %self.id, error = %e, "Failed to remove container"),
        }
        *state = ContainerState::Removed;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::language::LanguageRegistry;
    use crate::runtime::fake::{FakeRuntime, Program, Step};
    use crate::runtime::ContainerSpec;

    async fn started(runtime: &FakeRuntime, program: Program) -> Arc<ContainerHandle> {
        runtime.set_program(program);
        let registry = LanguageRegistry::default();
        let spec = ContainerSpec::for_execution(
            registry.profile("python").unwrap(),
            std::path::Path::new("/tmp/x"),
            "t".into(),
        );
        let id = runtime.create(&spec).await.unwrap();
        runtime.start(&id).await.unwrap();
        let handle = ContainerHandle::new(id);
        handle.mark_running().await;
        handle
    }

    #[tokio::test]
    async fn teardown_running_container() {
        let runtime = FakeRuntime::with_program(Program::default());
        let handle = started(&runtime, Program::new(vec![Step::Hang])).await;

        handle.teardown(runtime.as_ref()).await;

        assert_eq!(handle.state().await, ContainerState::Removed);
        assert_eq!(runtime.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn exited_container_is_not_stopped() {
        let runtime = FakeRuntime::with_program(Program::default());
        let handle = started(&runtime, Program::hello()).await;
        runtime.wait(handle.id()).await.unwrap();

        handle.teardown(runtime.as_ref()).await;

        assert_eq!(runtime.stop_calls.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_teardowns_are_idempotent() {
        let runtime = FakeRuntime::with_program(Program::default());
        let handle = started(&runtime, Program::new(vec![Step::Hang])).await;

        tokio::join!(
            handle.teardown(runtime.as_ref()),
            handle.teardown(runtime.as_ref())
        );
        handle.teardown(runtime.as_ref()).await;

        assert_eq!(runtime.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn externally_removed_container_is_tolerated() {
        let runtime = FakeRuntime::with_program(Program::default());
        let handle = started(&runtime, Program::new(vec![Step::Hang])).await;
        runtime.remove(handle.id()).await.unwrap();

        handle.teardown(runtime.as_ref()).await;

        assert_eq!(handle.state().await, ContainerState::Removed);
        assert_eq!(runtime.stop_calls.load(Ordering::SeqCst), 0);
    }
}
