use crate::events;
use crate::guard::SandboxGuard;
use crate::prepare::{remove_sandbox_dir, CodePreparer, PrepareMode, PreparedCode};
use crate::runtime::{ContainerLogs, ContainerRuntime, ContainerSpec, Mount};
use kiln_core::{
    ErrorKind, ExecutionResult, KilnError, NetworkMode, Result, SandboxConfig, SandboxSpec,
    StructuredResult, TaskRegistration, TaskRegistry, CONTAINER_WORKDIR, RESULT_FILE,
};
use kiln_deps::ImportSpec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Retries granted per run for a `NameError` on a known module.
pub const MAX_IMPORT_REPAIRS: usize = 1;

/// Exit status of a process killed by SIGKILL, which is how the kernel
/// enforces the container memory limit.
const OOM_EXIT_CODE: i64 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Created,
    Prepared,
    Started,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Cleaned,
}

impl ExecutionState {
    pub fn can_advance(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Created, Prepared) | (Prepared, Started) => true,
            (Created | Prepared | Started, Failed) => true,
            (Started, Completed | TimedOut | Cancelled) => true,
            (Cleaned, _) => false,
            (_, Cleaned) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    sandbox_id: Uuid,
    state: ExecutionState,
}

impl Lifecycle {
    fn new(sandbox_id: Uuid) -> Self {
        Self {
            sandbox_id,
            state: ExecutionState::Created,
        }
    }

    fn advance(&mut self, next: ExecutionState) {
        if !self.state.can_advance(next) {
            warn!(sandbox_id = %self.sandbox_id, from = ?self.state, to = ?next, "unexpected sandbox transition");
        }
        debug!(sandbox_id = %self.sandbox_id, from = ?self.state, to = ?next, "sandbox state");
        self.state = next;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the configured wall-clock limit.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A sandbox whose directory is written but whose container does not exist yet.
///
/// Dropping it without [`ExecutionSandbox::execute`] removes the directory.
#[derive(Debug)]
pub struct PreparedRun {
    spec: SandboxSpec,
    prepared: PreparedCode,
    lifecycle: Lifecycle,
    guard: SandboxGuard,
}

impl PreparedRun {
    pub fn sandbox_id(&self) -> Uuid {
        self.spec.id
    }

    pub fn spec(&self) -> &SandboxSpec {
        &self.spec
    }

    pub fn prepared(&self) -> &PreparedCode {
        &self.prepared
    }

    pub fn state(&self) -> ExecutionState {
        self.lifecycle.state
    }
}

/// Runs a snippet once in a fresh, network-less container and reports what
/// happened. Every run gets its own directory and container and both are
/// gone when the result is returned.
#[derive(Clone)]
pub struct ExecutionSandbox {
    runtime: Arc<dyn ContainerRuntime>,
    preparer: CodePreparer,
    config: SandboxConfig,
    registry: Arc<dyn TaskRegistry>,
}

impl ExecutionSandbox {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: SandboxConfig,
        registry: Arc<dyn TaskRegistry>,
    ) -> Self {
        Self {
            runtime,
            preparer: CodePreparer::from_config(&config),
            config,
            registry,
        }
    }

    pub async fn run(&self, code: &str) -> ExecutionResult {
        self.run_with(code, RunOptions::default()).await
    }

    /// Prepares, executes and cleans up. A `NameError` on a known module is
    /// retried in a fresh sandbox with the import added, at most
    /// [`MAX_IMPORT_REPAIRS`] times.
    #[instrument(skip(self, code, options))]
    pub async fn run_with(&self, code: &str, options: RunOptions) -> ExecutionResult {
        let (available, message) = self.runtime.available().await;
        if !available {
            let err = KilnError::RuntimeUnavailable(message);
            warn!(error = %err, "refusing to run");
            return ExecutionResult::from_error(Uuid::new_v4(), &err);
        }

        let mut source = code.to_string();
        let mut prelude: Vec<ImportSpec> = Vec::new();
        let mut repaired: Vec<String> = Vec::new();
        let mut repairs = 0;

        loop {
            let spec = self.sandbox_spec();
            let sandbox_id = spec.id;
            let mut result = match self.prepare_in(spec, &source, &prelude).await {
                Ok(run) => {
                    for name in &run.prepared.fix.added_imports {
                        note_repair(&mut repaired, name);
                    }
                    self.execute(run, &options).await
                }
                Err(err) => {
                    error!(%sandbox_id, error = %err, "sandbox preparation failed");
                    ExecutionResult::from_error(sandbox_id, &err)
                }
            };

            let retry = if result.success
                || result.error_kind != ErrorKind::ExecutionFailure
                || repairs >= MAX_IMPORT_REPAIRS
            {
                None
            } else {
                self.missing_import(&result)
            };

            let Some(missing) = retry else {
                result.repaired_imports = repaired;
                return result;
            };

            repairs += 1;
            let err = KilnError::ImportMissing(missing.binding.clone());
            info!(sandbox_id = %result.sandbox_id, error = %err, "retrying with the import added");
            match self.preparer.resolver().repair(&source, &missing.binding) {
                Some(fix) => source = fix.fixed_code,
                None => prelude.push(missing.clone()),
            }
            note_repair(&mut repaired, &missing.binding);
        }
    }

    /// Writes the sandbox directory without touching the runtime.
    pub async fn prepare(&self, code: &str) -> Result<PreparedRun> {
        self.prepare_in(self.sandbox_spec(), code, &[]).await
    }

    /// Runs a prepared sandbox to completion. The container and the sandbox
    /// directory are removed on every path out of here, including this
    /// future being dropped mid-run.
    #[instrument(skip(self, run, options), fields(sandbox_id = %run.spec.id))]
    pub async fn execute(&self, mut run: PreparedRun, options: &RunOptions) -> ExecutionResult {
        let sandbox_id = run.spec.id;
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(run.spec.timeout_seconds));
        let started = Instant::now();

        let container = self.container_spec(&run);
        let result = match self.runtime.create(&container).await {
            Ok(container_id) => {
                debug!(%container_id, "container created");
                run.guard.track_container(&container_id);
                let result = self
                    .drive(&mut run, &container_id, timeout, options.cancel.as_ref(), started)
                    .await;

                if let Err(err) = self.runtime.remove(&container_id, true).await {
                    let err = KilnError::Cleanup(format!("container {}: {}", container_id, err));
                    warn!(%container_id, error = %err, "container removal failed");
                }
                run.guard.forget_container();
                if result.success {
                    self.register(&run, &container_id, &result);
                }
                result
            }
            Err(err) => {
                error!(error = %err, "container create failed");
                run.lifecycle.advance(ExecutionState::Failed);
                ExecutionResult::from_error(sandbox_id, &err)
            }
        };

        remove_sandbox_dir(&run.spec.work_dir).await;
        run.guard.disarm();
        run.lifecycle.advance(ExecutionState::Cleaned);
        info!(success = result.success, kind = ?result.error_kind, "execution finished");
        result
    }

    async fn drive(
        &self,
        run: &mut PreparedRun,
        container_id: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
        started: Instant,
    ) -> ExecutionResult {
        let sandbox_id = run.spec.id;
        if let Err(err) = self.runtime.start(container_id).await {
            error!(error = %err, "container start failed");
            run.lifecycle.advance(ExecutionState::Failed);
            return ExecutionResult::from_error(sandbox_id, &err);
        }
        run.lifecycle.advance(ExecutionState::Started);

        let waited = match cancel {
            Some(token) => tokio::select! {
                waited = self.runtime.wait(container_id, timeout) => Some(waited),
                _ = token.cancelled() => None,
            },
            None => Some(self.runtime.wait(container_id, timeout).await),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match waited {
            None => {
                info!("execution cancelled");
                self.force_stop(container_id).await;
                run.lifecycle.advance(ExecutionState::Cancelled);
                ExecutionResult::cancelled(sandbox_id, elapsed_ms)
            }
            Some(Err(KilnError::Timeout(_))) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(timeout_ms, "execution timed out");
                self.force_stop(container_id).await;
                run.lifecycle.advance(ExecutionState::TimedOut);
                ExecutionResult::timed_out(sandbox_id, timeout_ms, elapsed_ms)
            }
            Some(Err(err)) => {
                error!(error = %err, "waiting on container failed");
                self.force_stop(container_id).await;
                run.lifecycle.advance(ExecutionState::Failed);
                ExecutionResult::from_error(sandbox_id, &err)
            }
            Some(Ok(exit_code)) => {
                let result = self.collect(run, container_id, exit_code).await;
                run.lifecycle.advance(if result.success {
                    ExecutionState::Completed
                } else {
                    ExecutionState::Failed
                });
                result
            }
        }
    }

    /// `result.json` wins over the stdout tail; a run that produced neither
    /// is reported with whatever the container printed.
    async fn collect(&self, run: &PreparedRun, container_id: &str, exit_code: i64) -> ExecutionResult {
        let sandbox_id = run.spec.id;
        let from_file = tokio::fs::read_to_string(run.spec.work_dir.join(RESULT_FILE))
            .await
            .ok()
            .and_then(|text| StructuredResult::parse(&text));

        let logs = match self.runtime.logs(container_id).await {
            Ok(logs) => logs,
            Err(err) => {
                warn!(error = %err, "could not read container logs");
                ContainerLogs::default()
            }
        };

        let structured = from_file.or_else(|| StructuredResult::from_stdout_tail(&logs.stdout));
        match structured {
            Some(structured) => ExecutionResult::from_structured(sandbox_id, structured, Some(exit_code)),
            None => {
                let message = if exit_code == OOM_EXIT_CODE {
                    format!(
                        "Process was killed (exit code {}), most likely by the {} MB memory limit",
                        exit_code, run.spec.memory_limit_mb
                    )
                } else {
                    format!("Process exited with code {} without reporting a result", exit_code)
                };
                let err = KilnError::ExecutionFailure(message);
                warn!(exit_code, error = %err, "no structured result");
                ExecutionResult {
                    stdout: logs.stdout,
                    stderr: logs.stderr,
                    exit_code: Some(exit_code),
                    ..ExecutionResult::failure(sandbox_id, ErrorKind::ExecutionFailure, err.to_string())
                }
            }
        }
    }

    async fn force_stop(&self, container_id: &str) {
        if let Err(err) = self.runtime.stop(container_id, Duration::ZERO).await {
            warn!(%container_id, error = %err, "stop failed");
        }
        if let Err(err) = self.runtime.kill(container_id).await {
            warn!(%container_id, error = %err, "kill failed");
        }
    }

    async fn prepare_in(
        &self,
        mut spec: SandboxSpec,
        code: &str,
        prelude: &[ImportSpec],
    ) -> Result<PreparedRun> {
        let mut lifecycle = Lifecycle::new(spec.id);
        let mut guard = SandboxGuard::new(self.runtime.clone(), spec.work_dir.clone());
        let mode = PrepareMode::Script {
            prelude: prelude.to_vec(),
        };

        let prepared = match self.preparer.prepare(code, &mode, &spec.work_dir).await {
            Ok(prepared) => prepared,
            Err(err) => {
                remove_sandbox_dir(&spec.work_dir).await;
                guard.disarm();
                return Err(err);
            }
        };

        // Bind mounts need an absolute host path.
        if let Ok(canonical) = tokio::fs::canonicalize(&spec.work_dir).await {
            spec.work_dir = canonical;
        }
        lifecycle.advance(ExecutionState::Prepared);

        Ok(PreparedRun {
            spec,
            prepared,
            lifecycle,
            guard,
        })
    }

    fn sandbox_spec(&self) -> SandboxSpec {
        SandboxSpec::from_config(&self.config, NetworkMode::None)
    }

    fn container_spec(&self, run: &PreparedRun) -> ContainerSpec {
        ContainerSpec {
            name: format!("kiln-run-{}", run.spec.id.simple()),
            image: run.spec.base_image.clone(),
            command: vec![self.config.interpreter.clone(), run.prepared.entry_path()],
            memory_limit_mb: run.spec.memory_limit_mb,
            cpu_limit: run.spec.cpu_limit,
            network: run.spec.network_mode,
            mounts: vec![Mount::read_write(&run.spec.work_dir, CONTAINER_WORKDIR)],
            published_port: None,
            workdir: Some(CONTAINER_WORKDIR.to_string()),
            labels: vec![
                ("kiln.sandbox".to_string(), run.spec.id.to_string()),
                ("kiln.kind".to_string(), "execution".to_string()),
            ],
        }
    }

    fn missing_import(&self, result: &ExecutionResult) -> Option<ImportSpec> {
        let resolver = self.preparer.resolver();
        let name = resolver.missing_name(&result.error)?;
        resolver.modules().resolve(&name)
    }

    fn register(&self, run: &PreparedRun, container_id: &str, result: &ExecutionResult) {
        events::emit(
            self.registry.clone(),
            TaskRegistration {
                task_id: run.spec.id.to_string(),
                container_id: container_id.to_string(),
                code: run.prepared.code().to_string(),
                output: result.stdout.clone(),
                is_service: false,
                service_url: None,
                service_name: None,
            },
        );
    }
}

fn note_repair(repaired: &mut Vec<String>, name: &str) {
    if !repaired.iter().any(|seen| seen == name) {
        repaired.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use ExecutionState::*;
        assert!(Created.can_advance(Prepared));
        assert!(Prepared.can_advance(Started));
        assert!(Started.can_advance(TimedOut));
        assert!(Started.can_advance(Cancelled));
        assert!(Failed.can_advance(Cleaned));
        assert!(Prepared.can_advance(Failed));

        assert!(!Created.can_advance(Started));
        assert!(!Completed.can_advance(Started));
        assert!(!Cleaned.can_advance(Cleaned));
        assert!(!Prepared.can_advance(Completed));
    }

    #[test]
    fn repairs_are_recorded_once() {
        let mut repaired = Vec::new();
        note_repair(&mut repaired, "json");
        note_repair(&mut repaired, "math");
        note_repair(&mut repaired, "json");
        assert_eq!(repaired, vec!["json".to_string(), "math".to_string()]);
    }
}
