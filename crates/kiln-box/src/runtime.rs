use async_trait::async_trait;
use kiln_core::{NetworkMode, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host-side conventions the runtime CLI expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Renders a host path the way the runtime expects it in a bind mount.
///
/// Windows drive paths become `/c/Users/...`, which both Docker Desktop and
/// Podman machine accept.
pub fn format_mount_source(path: &Path, platform: Platform) -> String {
    let raw = path.to_string_lossy();
    match platform {
        Platform::Unix => raw.into_owned(),
        Platform::Windows => {
            let trimmed = raw.strip_prefix(r"\\?\").unwrap_or(&raw);
            let bytes = trimmed.as_bytes();
            if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
                let drive = (bytes[0] as char).to_ascii_lowercase();
                format!("/{}{}", drive, trimmed[2..].replace('\\', "/"))
            } else {
                trimmed.replace('\\', "/")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_write(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn to_arg(&self, platform: Platform) -> String {
        let ro = if self.read_only { ",readonly" } else { "" };
        format!(
            "--mount=type=bind,source={},target={}{}",
            format_mount_source(&self.source, platform),
            self.target,
            ro
        )
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Empty means the image's own `CMD`.
    pub command: Vec<String>,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub network: NetworkMode,
    pub mounts: Vec<Mount>,
    /// Published as `127.0.0.1:<port>:<port>`.
    pub published_port: Option<u16>,
    pub workdir: Option<String>,
    pub labels: Vec<(String, String)>,
}

impl ContainerSpec {
    /// Arguments for `<runtime> create ...`.
    pub fn to_create_args(&self, platform: Platform) -> Vec<String> {
        let network = match self.network {
            NetworkMode::None => "none",
            NetworkMode::Bridged => "bridge",
        };

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            self.name.clone(),
            format!("--memory={}m", self.memory_limit_mb),
            // swap pinned to the memory ceiling
            format!("--memory-swap={}m", self.memory_limit_mb),
            format!("--cpus={}", self.cpu_limit),
            format!("--network={}", network),
        ];

        for mount in &self.mounts {
            args.push(mount.to_arg(platform));
        }
        if let Some(port) = self.published_port {
            args.push("--publish".to_string());
            args.push(format!("127.0.0.1:{}:{}", port, port));
        }
        if let Some(workdir) = &self.workdir {
            args.push("--workdir".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

impl ContainerLogs {
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i64),
    Missing,
}

/// Platform-normalized container runtime. Every failure comes back already
/// classified as a [`kiln_core::KilnError`] taxonomy variant.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the daemon answers, with a human-readable reason.
    async fn available(&self) -> (bool, String);

    /// Builds `context_dir` into `tag`, returning the build log.
    async fn build(&self, context_dir: &Path, tag: &str) -> Result<String>;

    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;

    /// Exit code, or `KilnError::Timeout` once `timeout` elapses.
    async fn wait(&self, container_id: &str, timeout: Duration) -> Result<i64>;

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs>;

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;

    async fn kill(&self, container_id: &str) -> Result<()>;

    /// Removing a container that is already gone succeeds.
    async fn remove(&self, container_id: &str, force: bool) -> Result<()>;

    /// Removing an image that is already gone succeeds.
    async fn remove_image(&self, tag: &str) -> Result<()>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState>;

    async fn exec_into(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput>;
}
