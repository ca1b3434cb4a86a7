//! A scripted [`ContainerRuntime`] for tests. No containers involved:
//! exec calls pop canned responses (default: empty output, exit 0) and
//! every call is recorded for assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, SandboxError};

#[derive(Default)]
pub struct MockRuntime {
    exists: AtomicBool,
    creates: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    removes: AtomicUsize,
    specs: Mutex<Vec<ContainerSpec>>,
    execs: Mutex<Vec<String>>,
    responses: Mutex<VecDeque<Result<ExecOutput, SandboxError>>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a successful exec response.
    pub fn push_output(&self, output: &str, exit_code: i64) {
        self.responses.lock().push_back(Ok(ExecOutput {
            output: output.to_string(),
            exit_code,
        }));
    }

    /// Queue a failing exec response.
    pub fn push_err(&self, err: SandboxError) {
        self.responses.lock().push_back(Err(err));
    }

    /// Shell command strings passed to exec, in call order.
    pub fn exec_commands(&self) -> Vec<String> {
        self.execs.lock().clone()
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().push(spec.clone());
        self.exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _name: &str) -> Result<(), SandboxError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _name: &str) -> Result<(), SandboxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, _name: &str) -> Result<(), SandboxError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.exists.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, _name: &str) -> Result<bool, SandboxError> {
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn exec(
        &self,
        _name: &str,
        command: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        // Record the shell command (last argv element under `sh -c`).
        if let Some(cmd) = command.last() {
            self.execs.lock().push(cmd.clone());
        }
        self.responses.lock().pop_front().unwrap_or(Ok(ExecOutput {
            output: String::new(),
            exit_code: 0,
        }))
    }
}
