use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct KilnConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub service: ServiceConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Every sandbox gets `{base_dir}/{id}/`.
    pub base_dir: PathBuf,
    pub base_image: String,
    pub memory_limit_mb: u64,
    /// Fractional CPU cores (`--cpus`).
    pub cpu_limit: f64,
    pub timeout_seconds: u64,
    /// Preferred runtime binary; `docker` then `podman` are tried when unset.
    pub runtime_binary: Option<String>,
    pub interpreter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// When both bounds are set, ports are drawn from this range instead of the OS.
    pub port_range_start: Option<u16>,
    pub port_range_end: Option<u16>,
    pub readiness_attempts: u32,
    pub readiness_backoff_ms: u64,
    pub stop_grace_seconds: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcConfig {
    pub interval_secs: u64,
    pub max_age_secs: u64,
}

impl KilnConfig {
    pub fn new() -> Result<Self, config::ConfigError> {
        Self::builder()?
            // Merge kiln.toml if exists
            .add_source(config::File::with_name("kiln").required(false))
            // Merge environment variables (KILN_SANDBOX__MEMORY_LIMIT_MB, ...)
            .add_source(
                config::Environment::with_prefix("KILN")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Defaults only, without reading files or the environment.
    pub fn defaults() -> Result<Self, config::ConfigError> {
        Self::builder()?.build()?.try_deserialize()
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        let base_dir = std::env::temp_dir().join("kiln-sandboxes");

        config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("server.log_level", "INFO")?
            .set_default("sandbox.base_dir", base_dir.to_string_lossy().to_string())?
            .set_default("sandbox.base_image", "python:3.11-slim")?
            .set_default("sandbox.memory_limit_mb", 512)?
            .set_default("sandbox.cpu_limit", 1.0)?
            .set_default("sandbox.timeout_seconds", 30)?
            .set_default("sandbox.interpreter", "python")?
            .set_default("service.readiness_attempts", 30)?
            .set_default("service.readiness_backoff_ms", 1000)?
            .set_default("service.stop_grace_seconds", 5)?
            .set_default("gc.interval_secs", 300)?
            .set_default("gc.max_age_secs", 3600)
    }
}

impl ServiceConfig {
    pub fn port_range(&self) -> Option<std::ops::RangeInclusive<u16>> {
        match (self.port_range_start, self.port_range_end) {
            (Some(start), Some(end)) if start <= end => Some(start..=end),
            _ => None,
        }
    }
}
