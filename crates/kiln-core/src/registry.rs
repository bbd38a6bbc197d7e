use async_trait::async_trait;

use crate::error::Result;
use crate::models::TaskRegistration;

/// Sink for task bookkeeping. The engine delivers to it fire-and-forget, so
/// an implementation's errors are logged by the caller and go no further.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    async fn register(&self, task: &TaskRegistration) -> Result<()>;
}

/// Registry that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

#[async_trait]
impl TaskRegistry for NoopRegistry {
    async fn register(&self, task: &TaskRegistration) -> Result<()> {
        tracing::trace!(task_id = %task.task_id, "registry disabled, dropping task");
        Ok(())
    }
}
