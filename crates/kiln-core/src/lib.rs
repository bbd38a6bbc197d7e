pub mod config;
pub mod error;
pub mod models;
pub mod registry;

pub use config::{GcConfig, KilnConfig, RegistryConfig, SandboxConfig, ServerConfig, ServiceConfig};
pub use error::{KilnError, Result};
pub use models::*;
pub use registry::{NoopRegistry, TaskRegistry};
