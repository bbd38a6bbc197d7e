use crate::config::SandboxConfig;
use crate::error::KilnError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

/// In-container mount point of the sandbox directory.
pub const CONTAINER_WORKDIR: &str = "/workspace";
pub const RESULT_FILE: &str = "result.json";
/// Self-description endpoint every generated service exposes.
pub const DOCS_PATH: &str = "/api/docs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    None,
    Bridged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub id: Uuid,
    pub base_image: String,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub network_mode: NetworkMode,
    pub timeout_seconds: u64,
    pub work_dir: PathBuf,
}

impl SandboxSpec {
    pub fn from_config(config: &SandboxConfig, network_mode: NetworkMode) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            base_image: config.base_image.clone(),
            memory_limit_mb: config.memory_limit_mb,
            cpu_limit: config.cpu_limit,
            network_mode,
            timeout_seconds: config.timeout_seconds,
            work_dir: config.base_dir.join(id.to_string()),
        }
    }

    /// First eight hex digits of the id, used in container and image names.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    None,
    RuntimeUnavailable,
    BuildFailed,
    StartFailed,
    ExecutionTimeout,
    ImportMissing,
    ExecutionFailure,
    CleanupFailure,
    Cancelled,
    Unknown,
}

impl From<&KilnError> for ErrorKind {
    fn from(err: &KilnError) -> Self {
        match err {
            KilnError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            KilnError::BuildFailed { .. } => ErrorKind::BuildFailed,
            KilnError::StartFailed(_) | KilnError::PortExhausted(_) => ErrorKind::StartFailed,
            KilnError::Timeout(_) => ErrorKind::ExecutionTimeout,
            KilnError::ImportMissing(_) => ErrorKind::ImportMissing,
            KilnError::ExecutionFailure(_) => ErrorKind::ExecutionFailure,
            KilnError::Cleanup(_) => ErrorKind::CleanupFailure,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Wire contract written by the in-container runner, both as the last stdout
/// line and as `result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub error_output: String,
    pub execution_time: f64,
}

impl StructuredResult {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text.trim()).ok()
    }

    /// Parses the last non-blank line of captured stdout.
    pub fn from_stdout_tail(stdout: &str) -> Option<Self> {
        stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(Self::parse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub sandbox_id: Uuid,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub error: String,
    pub execution_time_ms: f64,
    pub timed_out: bool,
    pub error_kind: ErrorKind,
    pub exit_code: Option<i64>,
    pub repaired_imports: Vec<String>,
}

impl ExecutionResult {
    pub fn from_structured(sandbox_id: Uuid, result: StructuredResult, exit_code: Option<i64>) -> Self {
        let error_kind = if result.success {
            ErrorKind::None
        } else {
            ErrorKind::ExecutionFailure
        };
        Self {
            sandbox_id,
            success: result.success,
            stdout: result.output,
            stderr: result.error_output,
            error: result.error,
            execution_time_ms: result.execution_time * 1000.0,
            timed_out: false,
            error_kind,
            exit_code,
            repaired_imports: Vec::new(),
        }
    }

    pub fn failure(sandbox_id: Uuid, error_kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            sandbox_id,
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            error: error.into(),
            execution_time_ms: 0.0,
            timed_out: false,
            error_kind,
            exit_code: None,
            repaired_imports: Vec::new(),
        }
    }

    pub fn from_error(sandbox_id: Uuid, err: &KilnError) -> Self {
        Self::failure(sandbox_id, ErrorKind::from(err), err.to_string())
    }

    pub fn timed_out(sandbox_id: Uuid, timeout_ms: u64, elapsed_ms: f64) -> Self {
        Self {
            timed_out: true,
            execution_time_ms: elapsed_ms,
            ..Self::failure(
                sandbox_id,
                ErrorKind::ExecutionTimeout,
                format!("Execution timed out after {} ms", timeout_ms),
            )
        }
    }

    pub fn cancelled(sandbox_id: Uuid, elapsed_ms: f64) -> Self {
        Self {
            execution_time_ms: elapsed_ms,
            ..Self::failure(sandbox_id, ErrorKind::Cancelled, "Execution cancelled")
        }
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Sandbox: {}", self.sandbox_id)?;
        writeln!(f, "Success: {}", self.success)?;
        if self.error_kind != ErrorKind::None {
            writeln!(f, "Error Kind: {:?}", self.error_kind)?;
        }
        if let Some(code) = self.exit_code {
            writeln!(f, "Exit Code: {}", code)?;
        }
        if self.timed_out {
            writeln!(f, "Timed Out: true")?;
        }
        if !self.repaired_imports.is_empty() {
            writeln!(f, "Repaired Imports: {}", self.repaired_imports.join(", "))?;
        }

        let (val, unit) = if self.execution_time_ms > 1_000.0 {
            (self.execution_time_ms / 1_000.0, "s")
        } else {
            (self.execution_time_ms, "ms")
        };
        writeln!(f, "Execution Time: {:.2} {}", val, unit)?;

        if !self.stdout.is_empty() {
            writeln!(f, "--- stdout ---\n{}", self.stdout.trim_end())?;
        }
        if !self.error.is_empty() {
            writeln!(f, "--- error ---\n{}", self.error.trim_end())?;
        }
        if !self.stderr.is_empty() {
            writeln!(f, "--- stderr ---\n{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
}

impl Default for ServiceMetadata {
    fn default() -> Self {
        Self {
            name: "Generated Service".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(flatten)]
    pub sandbox: SandboxSpec,
    pub port: u16,
    pub name: String,
    pub description: String,
    pub version: String,
}

impl ServiceSpec {
    pub fn new(sandbox: SandboxSpec, port: u16, metadata: ServiceMetadata) -> Self {
        Self {
            sandbox,
            port,
            name: metadata.name,
            description: metadata.description,
            version: metadata.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Building,
    BuildFailed,
    Starting,
    Running,
    StartFailed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub sandbox_id: Uuid,
    pub container_id: Option<String>,
    pub image_tag: String,
    pub port: u16,
    pub base_url: String,
    pub status: ServiceStatus,
    pub build_log: Option<String>,
    pub error: Option<String>,
}

impl ServiceHandle {
    pub fn is_live(&self) -> bool {
        matches!(self.status, ServiceStatus::Starting | ServiceStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub sandbox_id: Uuid,
    pub name: String,
    pub description: String,
    pub version: String,
    pub port: u16,
    pub base_url: String,
    pub image_tag: String,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDoc {
    pub path: String,
    pub method: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDocs {
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointDoc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyFixResult {
    pub original_code: String,
    pub fixed_code: String,
    pub added_imports: BTreeSet<String>,
}

impl DependencyFixResult {
    pub fn unchanged(code: &str) -> Self {
        Self {
            original_code: code.to_string(),
            fixed_code: code.to_string(),
            added_imports: BTreeSet::new(),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.added_imports.is_empty()
    }
}

/// Event handed to the external task registry after a successful run or build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRegistration {
    pub task_id: String,
    pub container_id: String,
    pub code: String,
    pub output: String,
    pub is_service: bool,
    pub service_url: Option<String>,
    pub service_name: Option<String>,
}
