use crate::prepare::remove_sandbox_dir;
use crate::runtime::ContainerRuntime;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tears down whatever a sandbox still holds if it is dropped before its own
/// cleanup ran, e.g. when the request future driving it is abandoned.
///
/// The normal path removes things itself and then calls [`disarm`](Self::disarm).
pub(crate) struct SandboxGuard {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: Option<String>,
    image_tag: Option<String>,
    work_dir: Option<PathBuf>,
}

impl SandboxGuard {
    pub(crate) fn new(runtime: Arc<dyn ContainerRuntime>, work_dir: PathBuf) -> Self {
        Self {
            runtime,
            container_id: None,
            image_tag: None,
            work_dir: Some(work_dir),
        }
    }

    pub(crate) fn track_container(&mut self, container_id: &str) {
        self.container_id = Some(container_id.to_string());
    }

    pub(crate) fn forget_container(&mut self) {
        self.container_id = None;
    }

    pub(crate) fn track_image(&mut self, tag: &str) {
        self.image_tag = Some(tag.to_string());
    }

    pub(crate) fn disarm(&mut self) {
        self.container_id = None;
        self.image_tag = None;
        self.work_dir = None;
    }

    fn is_armed(&self) -> bool {
        self.container_id.is_some() || self.image_tag.is_some() || self.work_dir.is_some()
    }
}

impl fmt::Debug for SandboxGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxGuard")
            .field("container_id", &self.container_id)
            .field("image_tag", &self.image_tag)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if !self.is_armed() {
            return;
        }
        let container_id = self.container_id.take();
        let image_tag = self.image_tag.take();
        let work_dir = self.work_dir.take();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(?container_id, ?work_dir, "sandbox abandoned outside a runtime, left in place");
            return;
        };
        if container_id.is_some() {
            warn!(?container_id, "sandbox dropped before cleanup, removing it");
        }

        let runtime = self.runtime.clone();
        handle.spawn(async move {
            if let Some(id) = container_id {
                if let Err(err) = runtime.remove(&id, true).await {
                    warn!(container_id = %id, error = %err, "container removal failed");
                }
            }
            if let Some(tag) = image_tag {
                if let Err(err) = runtime.remove_image(&tag).await {
                    warn!(image = %tag, error = %err, "image removal failed");
                }
            }
            if let Some(dir) = work_dir {
                remove_sandbox_dir(&dir).await;
            }
            debug!("abandoned sandbox torn down");
        });
    }
}
