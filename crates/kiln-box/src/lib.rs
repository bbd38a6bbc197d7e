pub mod docker;
pub mod engine;
pub mod events;
pub mod execution;
mod guard;
pub mod ports;
pub mod prepare;
pub mod runtime;
pub mod service;
pub mod template;

pub use docker::DockerCli;
pub use engine::Engine;
pub use execution::{ExecutionSandbox, ExecutionState, PreparedRun, RunOptions, MAX_IMPORT_REPAIRS};
pub use ports::{PortAllocator, PortLease, PortTable};
pub use prepare::{CodePreparer, PrepareMode, PreparedCode};
pub use runtime::{ContainerLogs, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, Mount};
pub use service::ServiceSandbox;
