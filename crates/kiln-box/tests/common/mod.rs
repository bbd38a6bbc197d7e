#![allow(dead_code)]

use async_trait::async_trait;
use axum::{routing::get, Json, Router};
use kiln_box::prepare::{RUNNER_FILE, SERVICE_FILE, USER_CODE_FILE};
use kiln_box::{ContainerLogs, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput};
use kiln_core::{
    KilnConfig, KilnError, Result, StructuredResult, TaskRegistration, TaskRegistry, RESULT_FILE,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a one-shot container does when waited on.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Writes a successful `result.json` with this output.
    Succeed(String),
    /// Writes a failed `result.json` with this error.
    Fail(String),
    /// No result file; the structured line only appears in stdout.
    StdoutOnly(StructuredResult),
    /// Never exits on its own.
    Hang,
    /// Exits with this code without reporting anything.
    Exit(i64),
}

/// What a service container does once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceBehavior {
    /// Serves the docs endpoint on its published port.
    Serve,
    /// Keeps running but never answers.
    Silent,
    /// Accepts connections on its port and never responds to them.
    Stall,
    /// Exits right away with this code.
    Crash(i64),
}

/// What the one-shot script sees: the user code and the runner wrapping it.
pub struct Invocation {
    pub code: String,
    pub runner: String,
}

impl Invocation {
    pub fn has_prelude(&self, module: &str) -> bool {
        self.runner.contains(&format!("[\"{}\",", module))
    }
}

type Script = Box<dyn Fn(&Invocation) -> Behavior + Send + Sync>;

struct Container {
    spec: ContainerSpec,
    state: ContainerState,
    logs: ContainerLogs,
    server: Option<JoinHandle<()>>,
}

impl Container {
    fn halt(&mut self, exit_code: i64) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
        if !matches!(self.state, ContainerState::Exited(_)) {
            self.state = ContainerState::Exited(exit_code);
        }
    }
}

#[derive(Default)]
struct Ledger {
    next_id: usize,
    containers: HashMap<String, Container>,
    created: Vec<ContainerSpec>,
    removed: Vec<String>,
    images: HashMap<String, PathBuf>,
    removed_images: Vec<String>,
}

/// In-memory container runtime. One-shot containers follow the script;
/// service containers follow the service behavior.
pub struct FakeRuntime {
    available: AtomicBool,
    fail_build: AtomicBool,
    script: Script,
    service: Mutex<ServiceBehavior>,
    ledger: Mutex<Ledger>,
}

impl FakeRuntime {
    pub fn new(script: impl Fn(&Invocation) -> Behavior + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            fail_build: AtomicBool::new(false),
            script: Box::new(script),
            service: Mutex::new(ServiceBehavior::Serve),
            ledger: Mutex::new(Ledger::default()),
        })
    }

    pub fn serving(behavior: ServiceBehavior) -> Arc<Self> {
        let runtime = Self::new(|_| Behavior::Exit(0));
        runtime.set_service(behavior);
        runtime
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_fail_build(&self, fail: bool) {
        self.fail_build.store(fail, Ordering::SeqCst);
    }

    pub fn set_service(&self, behavior: ServiceBehavior) {
        *self.service.lock().unwrap() = behavior;
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.ledger.lock().unwrap().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.ledger.lock().unwrap().removed.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.ledger.lock().unwrap().removed_images.clone()
    }

    /// Containers created and not yet removed.
    pub fn live(&self) -> usize {
        self.ledger.lock().unwrap().containers.len()
    }

    fn spec_of(&self, id: &str) -> Result<ContainerSpec> {
        self.ledger
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.spec.clone())
            .ok_or_else(|| KilnError::Unknown(format!("No such container: {}", id)))
    }

    fn finish(&self, id: &str, state: ContainerState, logs: ContainerLogs) {
        if let Some(container) = self.ledger.lock().unwrap().containers.get_mut(id) {
            container.state = state;
            container.logs = logs;
        }
    }
}

fn mount_dir(spec: &ContainerSpec) -> PathBuf {
    spec.mounts
        .first()
        .map(|m| m.source.clone())
        .unwrap_or_default()
}

fn payload(result: &StructuredResult) -> String {
    serde_json::to_string(result).unwrap()
}

fn structured(success: bool, output: &str, error: &str) -> StructuredResult {
    StructuredResult {
        success,
        output: output.to_string(),
        error: error.to_string(),
        error_output: String::new(),
        execution_time: 0.01,
    }
}

/// The `METADATA = {...}` line of a rendered service scaffold.
fn service_metadata(context: &Path) -> serde_json::Value {
    let source = std::fs::read_to_string(context.join(SERVICE_FILE)).unwrap_or_default();
    source
        .lines()
        .find_map(|line| line.strip_prefix("METADATA = "))
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn available(&self) -> (bool, String) {
        if self.available.load(Ordering::SeqCst) {
            (true, "fake runtime".to_string())
        } else {
            (false, "Cannot connect to the Docker daemon".to_string())
        }
    }

    async fn build(&self, context_dir: &Path, tag: &str) -> Result<String> {
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(KilnError::BuildFailed {
                message: "pip install failed".to_string(),
                log: "Step 4/6 : RUN pip install\nERROR: No matching distribution".to_string(),
            });
        }
        self.ledger
            .lock()
            .unwrap()
            .images
            .insert(tag.to_string(), context_dir.to_path_buf());
        Ok(format!("Successfully tagged {}", tag))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.next_id += 1;
        let id = format!("fake-{}", ledger.next_id);
        ledger.created.push(spec.clone());
        ledger.containers.insert(
            id.clone(),
            Container {
                spec: spec.clone(),
                state: ContainerState::Created,
                logs: ContainerLogs::default(),
                server: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        let spec = self.spec_of(container_id)?;
        let Some(port) = spec.published_port else {
            self.finish(container_id, ContainerState::Running, ContainerLogs::default());
            return Ok(());
        };

        let behavior = *self.service.lock().unwrap();
        let context = self.ledger.lock().unwrap().images.get(&spec.image).cloned();
        let metadata = context.as_deref().map(service_metadata).unwrap_or_default();
        let name = metadata["name"].as_str().unwrap_or("service").to_string();

        let mut ledger = self.ledger.lock().unwrap();
        let Some(container) = ledger.containers.get_mut(container_id) else {
            return Err(KilnError::Unknown(format!("No such container: {}", container_id)));
        };
        match behavior {
            ServiceBehavior::Serve => {
                let mut docs = metadata.clone();
                docs["endpoints"] = serde_json::json!([{
                    "path": "/add",
                    "method": "POST",
                    "description": "Adds two numbers",
                    "parameters": [
                        {"name": "a", "type": "int", "required": true},
                        {"name": "b", "type": "int", "required": true}
                    ]
                }]);
                let router = Router::new().route(
                    "/api/docs",
                    get(move || {
                        let docs = docs.clone();
                        async move { Json(docs) }
                    }),
                );
                container.server = Some(tokio::spawn(async move {
                    if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                        let _ = axum::serve(listener, router).await;
                    }
                }));
                container.state = ContainerState::Running;
                container.logs.stdout = format!("{} listening on port {}\n", name, port);
            }
            ServiceBehavior::Silent => {
                container.state = ContainerState::Running;
            }
            ServiceBehavior::Stall => {
                container.server = Some(tokio::spawn(async move {
                    let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await else {
                        return;
                    };
                    let mut held = Vec::new();
                    while let Ok((socket, _)) = listener.accept().await {
                        held.push(socket);
                    }
                }));
                container.state = ContainerState::Running;
            }
            ServiceBehavior::Crash(code) => {
                container.state = ContainerState::Exited(code);
                container.logs.stderr =
                    "Traceback (most recent call last):\nSyntaxError: invalid syntax\n".to_string();
            }
        }
        Ok(())
    }

    async fn wait(&self, container_id: &str, timeout: Duration) -> Result<i64> {
        let spec = self.spec_of(container_id)?;
        let dir = mount_dir(&spec);
        let invocation = Invocation {
            code: std::fs::read_to_string(dir.join(USER_CODE_FILE)).unwrap_or_default(),
            runner: std::fs::read_to_string(dir.join(RUNNER_FILE)).unwrap_or_default(),
        };

        let (exit_code, logs) = match (self.script)(&invocation) {
            Behavior::Succeed(output) => {
                let result = structured(true, &output, "");
                std::fs::write(dir.join(RESULT_FILE), payload(&result)).unwrap();
                (0, ContainerLogs {
                    stdout: format!("\n{}\n", payload(&result)),
                    stderr: String::new(),
                })
            }
            Behavior::Fail(error) => {
                let result = structured(false, "", &error);
                std::fs::write(dir.join(RESULT_FILE), payload(&result)).unwrap();
                (1, ContainerLogs {
                    stdout: format!("\n{}\n", payload(&result)),
                    stderr: String::new(),
                })
            }
            Behavior::StdoutOnly(result) => (
                if result.success { 0 } else { 1 },
                ContainerLogs {
                    stdout: format!("warming up\n\n{}\n", payload(&result)),
                    stderr: String::new(),
                },
            ),
            Behavior::Hang => {
                tokio::time::sleep(timeout).await;
                return Err(KilnError::Timeout(timeout.as_millis() as u64));
            }
            Behavior::Exit(code) => (code, ContainerLogs {
                stdout: "partial output\n".to_string(),
                stderr: "Killed\n".to_string(),
            }),
        };

        self.finish(container_id, ContainerState::Exited(exit_code), logs);
        Ok(exit_code)
    }

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs> {
        self.ledger
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.logs.clone())
            .ok_or_else(|| KilnError::Unknown(format!("No such container: {}", container_id)))
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<()> {
        if let Some(container) = self.ledger.lock().unwrap().containers.get_mut(container_id) {
            if container.state == ContainerState::Running {
                container.logs.stdout.push_str("shutting down\n");
            }
            container.halt(0);
        }
        Ok(())
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        if let Some(container) = self.ledger.lock().unwrap().containers.get_mut(container_id) {
            container.halt(137);
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<()> {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(mut container) = ledger.containers.remove(container_id) {
            container.halt(137);
            ledger.removed.push(container_id.to_string());
        }
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.images.remove(tag);
        ledger.removed_images.push(tag.to_string());
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }

    async fn exec_into(&self, container_id: &str, _cmd: &[String]) -> Result<ExecOutput> {
        let serving = self
            .ledger
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .is_some_and(|c| c.server.is_some() && c.state == ContainerState::Running);
        Ok(ExecOutput {
            exit_code: if serving { 0 } else { 1 },
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Registry that forwards every event to a channel.
pub struct RecordingRegistry {
    tx: mpsc::UnboundedSender<TaskRegistration>,
}

impl RecordingRegistry {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskRegistration>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl TaskRegistry for RecordingRegistry {
    async fn register(&self, task: &TaskRegistration) -> Result<()> {
        let _ = self.tx.send(task.clone());
        Ok(())
    }
}

/// Registry whose every registration fails.
#[derive(Default)]
pub struct FailingRegistry {
    attempts: AtomicUsize,
}

impl FailingRegistry {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRegistry for FailingRegistry {
    async fn register(&self, _task: &TaskRegistration) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(KilnError::Registry("connection refused".to_string()))
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Defaults pointed at `base_dir`, with a quick readiness loop.
pub fn config(base_dir: &Path) -> KilnConfig {
    let mut config = KilnConfig::defaults().unwrap();
    config.sandbox.base_dir = base_dir.to_path_buf();
    config.service.readiness_attempts = 10;
    config.service.readiness_backoff_ms = 50;
    config.service.stop_grace_seconds = 0;
    config
}

/// Entries left under the sandbox base directory.
pub fn leftovers(base_dir: &Path) -> usize {
    std::fs::read_dir(base_dir).map(|dir| dir.count()).unwrap_or(0)
}
