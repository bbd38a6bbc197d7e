use crate::events;
use crate::guard::SandboxGuard;
use crate::ports::{PortAllocator, PortLease};
use crate::prepare::{remove_sandbox_dir, CodePreparer, PrepareMode};
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState};
use kiln_core::{
    ApiDocs, KilnError, NetworkMode, Result, SandboxConfig, SandboxSpec, ServiceConfig,
    ServiceHandle, ServiceInfo, ServiceMetadata, ServiceStatus, TaskRegistration, TaskRegistry,
    DOCS_PATH,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

enum Readiness {
    Ready,
    /// Attempts ran out while the container was still up.
    Pending,
    Exited(i64),
    Cancelled,
}

/// A long-lived HTTP service built from user code into its own image.
///
/// The sandbox owns one host port from the shared [`PortAllocator`] between
/// a successful acquire and [`stop`](Self::stop). `stop` and
/// [`cleanup`](Self::cleanup) may be called any number of times. A sandbox
/// dropped without `cleanup` removes its container, image and directory in
/// the background.
pub struct ServiceSandbox {
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    preparer: CodePreparer,
    registry: Arc<dyn TaskRegistry>,
    spec: SandboxSpec,
    settings: ServiceConfig,
    http: reqwest::Client,
    metadata: ServiceMetadata,
    port: Option<PortLease>,
    handle: Option<ServiceHandle>,
    final_logs: Option<String>,
    cleaned: bool,
}

impl ServiceSandbox {
    pub async fn create(
        runtime: Arc<dyn ContainerRuntime>,
        ports: PortAllocator,
        registry: Arc<dyn TaskRegistry>,
        sandbox: &SandboxConfig,
        settings: &ServiceConfig,
    ) -> Result<Self> {
        let spec = SandboxSpec::from_config(sandbox, NetworkMode::Bridged);
        tokio::fs::create_dir_all(&spec.work_dir).await?;

        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| KilnError::Unknown(format!("HTTP client: {}", e)))?;

        debug!(sandbox_id = %spec.id, dir = %spec.work_dir.display(), "service sandbox created");
        Ok(Self {
            runtime,
            ports,
            preparer: CodePreparer::from_config(sandbox),
            registry,
            spec,
            settings: settings.clone(),
            http,
            metadata: ServiceMetadata::default(),
            port: None,
            handle: None,
            final_logs: None,
            cleaned: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.spec.id
    }

    pub fn spec(&self) -> &SandboxSpec {
        &self.spec
    }

    pub fn handle(&self) -> Option<&ServiceHandle> {
        self.handle.as_ref()
    }

    pub fn status(&self) -> Option<ServiceStatus> {
        self.handle.as_ref().map(|h| h.status)
    }

    pub async fn build_and_run(&mut self, code: &str, metadata: ServiceMetadata) -> ServiceHandle {
        self.build_and_run_with(code, metadata, None).await
    }

    /// Builds the image, starts it on a fresh port and waits until the docs
    /// endpoint answers. Failures are reported through the returned handle.
    #[instrument(skip(self, code, metadata, cancel), fields(sandbox_id = %self.spec.id))]
    pub async fn build_and_run_with(
        &mut self,
        code: &str,
        metadata: ServiceMetadata,
        cancel: Option<&CancellationToken>,
    ) -> ServiceHandle {
        if let Some(handle) = self.handle.as_ref().filter(|h| h.is_live()) {
            warn!("service is already running");
            return handle.clone();
        }
        if self.cleaned {
            return self.record(ServiceHandle {
                error: Some("sandbox was already cleaned up".to_string()),
                ..self.new_handle(ServiceStatus::StartFailed, 0, String::new())
            });
        }
        self.metadata = metadata;

        let (available, message) = self.runtime.available().await;
        if !available {
            let err = KilnError::RuntimeUnavailable(message);
            warn!(error = %err, "refusing to build");
            return self.record(ServiceHandle {
                error: Some(err.to_string()),
                ..self.new_handle(ServiceStatus::BuildFailed, 0, String::new())
            });
        }

        let port = match self.ports.lease().await {
            Ok(lease) => {
                let port = lease.port();
                self.port = Some(lease);
                port
            }
            Err(err) => {
                error!(error = %err, "no port for service");
                return self.record(ServiceHandle {
                    error: Some(err.to_string()),
                    ..self.new_handle(ServiceStatus::StartFailed, 0, String::new())
                });
            }
        };

        let image_tag = image_tag(code, &self.spec);
        let mut handle = self.new_handle(ServiceStatus::Building, port, image_tag.clone());
        self.handle = Some(handle.clone());

        let mode = PrepareMode::Service {
            port,
            metadata: self.metadata.clone(),
        };
        if let Err(err) = self.preparer.prepare(code, &mode, &self.spec.work_dir).await {
            error!(error = %err, "writing build context failed");
            self.release_port();
            handle.status = ServiceStatus::BuildFailed;
            handle.error = Some(err.to_string());
            return self.record(handle);
        }

        info!(%image_tag, port, "building service image");
        match self.runtime.build(&self.spec.work_dir, &image_tag).await {
            Ok(log) => handle.build_log = Some(log),
            Err(err) => {
                warn!(error = %err, "image build failed");
                self.release_port();
                if let KilnError::BuildFailed { log, .. } = &err {
                    handle.build_log = Some(log.clone());
                }
                handle.status = ServiceStatus::BuildFailed;
                handle.error = Some(err.to_string());
                return self.record(handle);
            }
        }

        let container = self.container_spec(&image_tag, port);
        let container_id = match self.runtime.create(&container).await {
            Ok(id) => {
                handle.container_id = Some(id.clone());
                self.handle = Some(handle.clone());
                id
            }
            Err(err) => {
                error!(error = %err, "container create failed");
                self.discard(None, &image_tag).await;
                self.release_port();
                handle.status = ServiceStatus::StartFailed;
                handle.error = Some(err.to_string());
                return self.record(handle);
            }
        };
        if let Err(err) = self.runtime.start(&container_id).await {
            error!(error = %err, "container start failed");
            self.discard(Some(&container_id), &image_tag).await;
            self.release_port();
            handle.container_id = None;
            handle.status = ServiceStatus::StartFailed;
            handle.error = Some(err.to_string());
            return self.record(handle);
        }

        handle.status = ServiceStatus::Starting;
        self.handle = Some(handle.clone());

        match self.await_ready(&handle.base_url, &container_id, cancel).await {
            Readiness::Ready => {
                info!(base_url = %handle.base_url, "service is running");
                handle.status = ServiceStatus::Running;
            }
            Readiness::Pending => {
                warn!("service did not answer in time, leaving it starting");
            }
            Readiness::Exited(exit_code) => {
                let logs = match self.runtime.logs(&container_id).await {
                    Ok(logs) => logs.combined(),
                    Err(_) => String::new(),
                };
                warn!(exit_code, "service exited before becoming ready");
                self.final_logs = Some(logs.clone());
                self.discard(Some(&container_id), &image_tag).await;
                self.release_port();
                handle.container_id = None;
                handle.status = ServiceStatus::StartFailed;
                handle.error = Some(format!(
                    "Service exited with code {} before becoming ready:\n{}",
                    exit_code, logs
                ));
                return self.record(handle);
            }
            Readiness::Cancelled => {
                info!("cancelled while waiting for the service");
                self.stop().await;
                let mut stopped = self.handle.clone().unwrap_or(handle);
                stopped.error = Some("Cancelled while waiting for the service to start".to_string());
                return self.record(stopped);
            }
        }

        self.register(&handle, &container_id, code);
        self.record(handle)
    }

    async fn await_ready(
        &self,
        base_url: &str,
        container_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Readiness {
        let url = format!("{}{}", base_url, DOCS_PATH);
        let attempts = self.settings.readiness_attempts.max(1);
        let backoff = Duration::from_millis(self.settings.readiness_backoff_ms);

        for attempt in 1..=attempts {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Readiness::Cancelled;
            }
            let answered = match cancel {
                Some(token) => tokio::select! {
                    answered = self.probe(&url) => answered,
                    _ = token.cancelled() => return Readiness::Cancelled,
                },
                None => self.probe(&url).await,
            };
            if answered {
                debug!(attempt, "readiness probe answered");
                return Readiness::Ready;
            }
            match self.runtime.inspect(container_id).await {
                Ok(ContainerState::Exited(code)) => return Readiness::Exited(code),
                Ok(ContainerState::Missing) => return Readiness::Exited(-1),
                Ok(_) => {}
                Err(err) => debug!(error = %err, "inspect failed during readiness"),
            }
            debug!(attempt, attempts, "service not ready yet");

            if attempt < attempts {
                let pause = tokio::time::sleep(backoff);
                match cancel {
                    Some(token) => tokio::select! {
                        _ = pause => {}
                        _ = token.cancelled() => return Readiness::Cancelled,
                    },
                    None => pause.await,
                }
            }
        }
        Readiness::Pending
    }

    async fn probe(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Container logs, or the logs captured when the service stopped.
    pub async fn get_logs(&self) -> Result<String> {
        let container_id = self
            .handle
            .as_ref()
            .and_then(|h| h.container_id.as_deref());
        match container_id {
            Some(id) => Ok(self.runtime.logs(id).await?.combined()),
            None => Ok(self.final_logs.clone().unwrap_or_default()),
        }
    }

    pub async fn get_api_docs(&self) -> Result<ApiDocs> {
        let handle = self
            .handle
            .as_ref()
            .filter(|h| h.is_live())
            .ok_or_else(|| KilnError::StartFailed("service is not running".to_string()))?;

        let url = format!("{}{}", handle.base_url, DOCS_PATH);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| KilnError::Unknown(format!("GET {}: {}", url, e)))?;
        response
            .json::<ApiDocs>()
            .await
            .map_err(|e| KilnError::Unknown(format!("GET {}: {}", url, e)))
    }

    pub fn get_info(&self) -> Option<ServiceInfo> {
        let handle = self.handle.as_ref()?;
        Some(ServiceInfo {
            sandbox_id: self.spec.id,
            name: self.metadata.name.clone(),
            description: self.metadata.description.clone(),
            version: self.metadata.version.clone(),
            port: handle.port,
            base_url: handle.base_url.clone(),
            image_tag: handle.image_tag.clone(),
            status: handle.status,
        })
    }

    /// Probes the docs endpoint from inside the container.
    pub async fn is_healthy(&self) -> bool {
        let Some(handle) = self.handle.as_ref().filter(|h| h.is_live()) else {
            return false;
        };
        let Some(container_id) = handle.container_id.as_deref() else {
            return false;
        };

        let script = format!(
            "import urllib.request; urllib.request.urlopen('http://127.0.0.1:{}{}', timeout=2)",
            handle.port, DOCS_PATH
        );
        let cmd = vec![self.preparer.interpreter().to_string(), "-c".to_string(), script];
        match self.runtime.exec_into(container_id, &cmd).await {
            Ok(output) => output.exit_code == 0,
            Err(err) => {
                debug!(error = %err, "health probe failed");
                false
            }
        }
    }

    /// Stops and removes the container and its image and gives the port back.
    /// Each step is attempted even when an earlier one failed.
    #[instrument(skip(self), fields(sandbox_id = %self.spec.id))]
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            self.release_port();
            return;
        };
        if handle.status == ServiceStatus::Stopped {
            self.handle = Some(handle);
            return;
        }

        if let Some(container_id) = handle.container_id.take() {
            let grace = Duration::from_secs(self.settings.stop_grace_seconds);
            if let Err(err) = self.runtime.stop(&container_id, grace).await {
                warn!(%container_id, error = %err, "stop failed");
            }
            // After the stop, so shutdown output is kept.
            match self.runtime.logs(&container_id).await {
                Ok(logs) => self.final_logs = Some(logs.combined()),
                Err(err) => warn!(error = %err, "could not capture logs before removal"),
            }
            if let Err(err) = self.runtime.remove(&container_id, true).await {
                warn!(%container_id, error = %err, "container removal failed");
            }
        }
        if !handle.image_tag.is_empty() {
            if let Err(err) = self.runtime.remove_image(&handle.image_tag).await {
                warn!(image = %handle.image_tag, error = %err, "image removal failed");
            }
        }
        self.release_port();

        handle.status = ServiceStatus::Stopped;
        info!("service stopped");
        self.handle = Some(handle);
    }

    /// [`stop`](Self::stop) plus removal of the sandbox directory.
    pub async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.stop().await;
        remove_sandbox_dir(&self.spec.work_dir).await;
        self.cleaned = true;
        debug!(sandbox_id = %self.spec.id, "service sandbox cleaned up");
    }

    async fn discard(&self, container_id: Option<&str>, image_tag: &str) {
        if let Some(id) = container_id {
            if let Err(err) = self.runtime.remove(id, true).await {
                warn!(container_id = %id, error = %err, "container removal failed");
            }
        }
        if let Err(err) = self.runtime.remove_image(image_tag).await {
            warn!(image = %image_tag, error = %err, "image removal failed");
        }
    }

    fn release_port(&mut self) {
        self.port = None;
    }

    fn new_handle(&self, status: ServiceStatus, port: u16, image_tag: String) -> ServiceHandle {
        ServiceHandle {
            sandbox_id: self.spec.id,
            container_id: None,
            image_tag,
            port,
            base_url: format!("http://127.0.0.1:{}", port),
            status,
            build_log: None,
            error: None,
        }
    }

    fn record(&mut self, handle: ServiceHandle) -> ServiceHandle {
        self.handle = Some(handle.clone());
        handle
    }

    fn container_spec(&self, image_tag: &str, port: u16) -> ContainerSpec {
        ContainerSpec {
            name: format!("kiln-svc-{}", self.spec.id.simple()),
            image: image_tag.to_string(),
            command: Vec::new(),
            memory_limit_mb: self.spec.memory_limit_mb,
            cpu_limit: self.spec.cpu_limit,
            network: self.spec.network_mode,
            mounts: Vec::new(),
            published_port: Some(port),
            workdir: None,
            labels: vec![
                ("kiln.sandbox".to_string(), self.spec.id.to_string()),
                ("kiln.kind".to_string(), "service".to_string()),
            ],
        }
    }

    fn register(&self, handle: &ServiceHandle, container_id: &str, code: &str) {
        events::emit(
            self.registry.clone(),
            TaskRegistration {
                task_id: self.spec.id.to_string(),
                container_id: container_id.to_string(),
                code: code.to_string(),
                output: format!("{} listening at {}", self.metadata.name, handle.base_url),
                is_service: true,
                service_url: Some(handle.base_url.clone()),
                service_name: Some(self.metadata.name.clone()),
            },
        );
    }
}

impl Drop for ServiceSandbox {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        let mut guard = SandboxGuard::new(self.runtime.clone(), self.spec.work_dir.clone());
        if let Some(handle) = self.handle.as_mut() {
            if matches!(
                handle.status,
                ServiceStatus::Building | ServiceStatus::Starting | ServiceStatus::Running
            ) {
                if let Some(container_id) = handle.container_id.take() {
                    guard.track_container(&container_id);
                }
                if !handle.image_tag.is_empty() {
                    guard.track_image(&handle.image_tag);
                }
            }
        }
        // `guard` tears down on drop; the port lease goes with `self.port`.
    }
}

/// `kiln-svc-<code digest>-<sandbox>`; the digest keeps identical code
/// recognizable across sandboxes, the sandbox suffix keeps tags unique.
pub fn image_tag(code: &str, spec: &SandboxSpec) -> String {
    let digest = hex::encode(Sha256::digest(code.as_bytes()));
    format!("kiln-svc-{}-{}", &digest[..12], spec.short_id())
}
