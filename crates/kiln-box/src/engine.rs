use crate::docker::DockerCli;
use crate::execution::ExecutionSandbox;
use crate::ports::{PortAllocator, PortTable};
use crate::runtime::ContainerRuntime;
use crate::service::ServiceSandbox;
use kiln_core::{KilnConfig, Result, TaskRegistry};
use std::sync::Arc;

/// Shared state every sandbox draws from: one runtime client, one port table
/// and one registry per process.
#[derive(Clone)]
pub struct Engine {
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    registry: Arc<dyn TaskRegistry>,
    config: KilnConfig,
}

impl Engine {
    pub fn new(
        config: KilnConfig,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn TaskRegistry>,
    ) -> Self {
        let ports = PortAllocator::new(PortTable::default(), config.service.port_range());
        Self {
            runtime,
            ports,
            registry,
            config,
        }
    }

    /// Uses the Docker-compatible CLI found on `PATH`.
    pub fn detect(config: KilnConfig, registry: Arc<dyn TaskRegistry>) -> Result<Self> {
        let cli = DockerCli::detect(config.sandbox.runtime_binary.as_deref())?;
        Ok(Self::new(config, Arc::new(cli), registry))
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn execution(&self) -> ExecutionSandbox {
        ExecutionSandbox::new(
            self.runtime.clone(),
            self.config.sandbox.clone(),
            self.registry.clone(),
        )
    }

    pub async fn service(&self) -> Result<ServiceSandbox> {
        ServiceSandbox::create(
            self.runtime.clone(),
            self.ports.clone(),
            self.registry.clone(),
            &self.config.sandbox,
            &self.config.service,
        )
        .await
    }
}
