use thiserror::Error;

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Image build failed: {message}")]
    BuildFailed { message: String, log: String },

    #[error("Container start failed: {0}")]
    StartFailed(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Missing import: {0}")]
    ImportMissing(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("No free port available: {0}")]
    PortExhausted(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Task registry error: {0}")]
    Registry(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, KilnError>;
