use crate::runtime::{ContainerLogs, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, Platform};
use async_trait::async_trait;
use kiln_core::{KilnError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument};

const CANDIDATES: &[&str] = &["docker", "podman"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Info,
    Build,
    Create,
    Start,
    Wait,
    Logs,
    Stop,
    Kill,
    Remove,
    RemoveImage,
    Inspect,
    Exec,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Info => "info",
            Operation::Build => "build",
            Operation::Create => "create",
            Operation::Start => "start",
            Operation::Wait => "wait",
            Operation::Logs => "logs",
            Operation::Stop => "stop",
            Operation::Kill => "kill",
            Operation::Remove => "rm",
            Operation::RemoveImage => "rmi",
            Operation::Inspect => "inspect",
            Operation::Exec => "exec",
        };
        f.write_str(name)
    }
}

fn daemon_unreachable(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    [
        "cannot connect to the docker daemon",
        "is the docker daemon running",
        "error during connect",
        "permission denied while trying to connect",
        "cannot connect to podman",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// The object the command targeted does not exist (docker or podman wording).
pub fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    [
        "no such container",
        "no such image",
        "no such object",
        "no container with name or id",
        "image not known",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

fn not_running(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("is not running")
}

/// Maps a failed CLI invocation onto the error taxonomy.
pub fn classify_failure(op: Operation, stderr: &str) -> KilnError {
    let message = stderr.trim();
    if daemon_unreachable(message) {
        return KilnError::RuntimeUnavailable(message.to_string());
    }
    match op {
        Operation::Build => KilnError::BuildFailed {
            message: message
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("image build failed")
                .to_string(),
            log: stderr.to_string(),
        },
        Operation::Create | Operation::Start => {
            KilnError::StartFailed(format!("{} failed: {}", op, message))
        }
        Operation::Info => KilnError::RuntimeUnavailable(message.to_string()),
        _ => KilnError::Unknown(format!("{} failed: {}", op, message)),
    }
}

/// Parses `docker inspect --format '{{.State.Status}} {{.State.ExitCode}}'`.
pub fn parse_state(line: &str) -> ContainerState {
    let mut parts = line.split_whitespace();
    let status = parts.next().unwrap_or_default();
    let code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
    match status {
        "created" | "configured" => ContainerState::Created,
        "running" | "restarting" | "paused" | "stopping" => ContainerState::Running,
        "exited" | "dead" | "removing" | "stopped" => ContainerState::Exited(code),
        _ => ContainerState::Missing,
    }
}

struct CliOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Drives the `docker` (or `podman`) binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    platform: Platform,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            platform: Platform::current(),
        }
    }

    /// Resolves the runtime binary: `preferred` first, then docker, then podman.
    pub fn detect(preferred: Option<&str>) -> Result<Self> {
        let names: Vec<&str> = preferred.into_iter().chain(CANDIDATES.iter().copied()).collect();
        for name in &names {
            if let Ok(path) = which::which(name) {
                debug!(binary = %path.display(), "container runtime resolved");
                return Ok(Self::new(path));
            }
        }
        Err(KilnError::RuntimeUnavailable(format!(
            "no container runtime found on PATH (tried {})",
            names.join(", ")
        )))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn exec(&self, args: Vec<String>) -> Result<CliOutput> {
        debug!(binary = %self.binary.display(), ?args, "runtime command");
        let output = self.command(&args).output().await.map_err(|e| {
            KilnError::RuntimeUnavailable(format!("failed to run {}: {}", self.binary.display(), e))
        })?;
        Ok(CliOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn checked(&self, op: Operation, args: Vec<String>) -> Result<CliOutput> {
        let output = self.exec(args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(classify_failure(op, &output.stderr))
        }
    }

    /// Like [`checked`](Self::checked), but a missing target is success.
    async fn idempotent(&self, op: Operation, args: Vec<String>) -> Result<()> {
        let output = self.exec(args).await?;
        if output.success || is_missing(&output.stderr) {
            return Ok(());
        }
        if matches!(op, Operation::Stop | Operation::Kill) && not_running(&output.stderr) {
            return Ok(());
        }
        Err(classify_failure(op, &output.stderr))
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn available(&self) -> (bool, String) {
        match self.exec(args(["info", "--format", "{{.ServerVersion}}"])).await {
            Ok(out) if out.success => {
                let name = self
                    .binary
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "runtime".to_string());
                (true, format!("{} {}", name, out.stdout.trim()))
            }
            Ok(out) => (false, out.stderr.trim().to_string()),
            Err(err) => (false, err.to_string()),
        }
    }

    #[instrument(skip(self, context_dir), fields(context = %context_dir.display()))]
    async fn build(&self, context_dir: &Path, tag: &str) -> Result<String> {
        info!("Building image {}", tag);
        let output = self
            .exec(vec![
                "build".to_string(),
                "--tag".to_string(),
                tag.to_string(),
                context_dir.to_string_lossy().to_string(),
            ])
            .await?;

        let log = format!("{}{}", output.stdout, output.stderr);
        if output.success {
            Ok(log)
        } else {
            match classify_failure(Operation::Build, &output.stderr) {
                KilnError::BuildFailed { message, .. } => Err(KilnError::BuildFailed { message, log }),
                other => Err(other),
            }
        }
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self
            .checked(Operation::Create, spec.to_create_args(self.platform))
            .await?;
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(KilnError::StartFailed("runtime returned no container id".to_string()));
        }
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.checked(Operation::Start, args(["start", container_id]))
            .await
            .map(|_| ())
    }

    async fn wait(&self, container_id: &str, timeout: Duration) -> Result<i64> {
        // kill_on_drop reaps the `wait` client when the timeout wins
        let waiting = self.exec(args(["wait", container_id]));
        let output = tokio::time::timeout(timeout, waiting)
            .await
            .map_err(|_| KilnError::Timeout(timeout.as_millis() as u64))??;
        if !output.success {
            return Err(classify_failure(Operation::Wait, &output.stderr));
        }
        output
            .stdout
            .trim()
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .ok_or_else(|| KilnError::Unknown(format!("unexpected wait output: {}", output.stdout.trim())))
    }

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs> {
        let output = self.checked(Operation::Logs, args(["logs", container_id])).await?;
        Ok(ContainerLogs {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        self.idempotent(Operation::Stop, args(["stop", "--time", secs.as_str(), container_id]))
            .await
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        self.idempotent(Operation::Kill, args(["kill", container_id])).await
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let cmd = if force {
            args(["rm", "--force", container_id])
        } else {
            args(["rm", container_id])
        };
        self.idempotent(Operation::Remove, cmd).await
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.idempotent(Operation::RemoveImage, args(["rmi", "--force", tag]))
            .await
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState> {
        let output = self
            .exec(args([
                "inspect",
                "--format",
                "{{.State.Status}} {{.State.ExitCode}}",
                container_id,
            ]))
            .await?;
        if output.success {
            Ok(parse_state(output.stdout.trim()))
        } else if is_missing(&output.stderr) {
            Ok(ContainerState::Missing)
        } else {
            Err(classify_failure(Operation::Inspect, &output.stderr))
        }
    }

    async fn exec_into(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut full = args(["exec", container_id]);
        full.extend(cmd.iter().cloned());
        let output = self.exec(full).await?;

        let runtime_error = output.stderr.starts_with("Error response from daemon")
            || output.stderr.starts_with("Error: ");
        if !output.success && runtime_error {
            return Err(classify_failure(Operation::Exec, &output.stderr));
        }
        Ok(ExecOutput {
            exit_code: output.code.map(i64::from).unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_errors_mean_runtime_unavailable() {
        let err = classify_failure(
            Operation::Create,
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert!(matches!(err, KilnError::RuntimeUnavailable(_)));
    }

    #[test]
    fn build_failures_keep_last_line_and_log() {
        let stderr = "Step 3/5 : RUN pip install nope\nERROR: No matching distribution found for nope\n\n";
        match classify_failure(Operation::Build, stderr) {
            KilnError::BuildFailed { message, log } => {
                assert_eq!(message, "ERROR: No matching distribution found for nope");
                assert_eq!(log, stderr);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn create_and_start_failures_are_start_failed() {
        assert!(matches!(
            classify_failure(Operation::Start, "Error response from daemon: driver failed"),
            KilnError::StartFailed(_)
        ));
        assert!(matches!(
            classify_failure(Operation::Logs, "Error response from daemon: boom"),
            KilnError::Unknown(_)
        ));
    }

    #[test]
    fn missing_objects_are_recognized_for_both_runtimes() {
        assert!(is_missing("Error: No such container: abc"));
        assert!(is_missing("Error response from daemon: No such image: kiln-svc-x"));
        assert!(is_missing("Error: no container with name or ID \"abc\" found"));
        assert!(!is_missing("Error response from daemon: conflict"));
    }

    #[test]
    fn parses_inspect_states() {
        assert_eq!(parse_state("running 0"), ContainerState::Running);
        assert_eq!(parse_state("created 0"), ContainerState::Created);
        assert_eq!(parse_state("exited 137"), ContainerState::Exited(137));
        assert_eq!(parse_state(""), ContainerState::Missing);
    }

    #[test]
    fn detect_reports_what_it_tried() {
        let Err(KilnError::RuntimeUnavailable(message)) = DockerCli::detect(Some("kiln-no-such-runtime-binary"))
        else {
            // a docker or podman binary is installed on this host
            return;
        };
        assert!(message.contains("kiln-no-such-runtime-binary"));
        assert!(message.contains("podman"));
    }
}
