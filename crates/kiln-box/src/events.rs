use kiln_core::{TaskRegistration, TaskRegistry};
use std::sync::Arc;
use tracing::{debug, warn};

/// Hands `task` to the registry on a background task. Delivery failures are
/// logged and never reach the caller.
pub fn emit(registry: Arc<dyn TaskRegistry>, task: TaskRegistration) {
    tokio::spawn(async move {
        match registry.register(&task).await {
            Ok(()) => debug!(task_id = %task.task_id, is_service = task.is_service, "task registered"),
            Err(err) => warn!(task_id = %task.task_id, error = %err, "task registration failed"),
        }
    });
}
