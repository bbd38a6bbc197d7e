use async_trait::async_trait;
use kiln_core::{Result, TaskRegistration, TaskRegistry};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registrations kept before the oldest are evicted.
pub const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Debug, Default)]
struct Entries {
    next_seq: u64,
    by_seq: BTreeMap<u64, TaskRegistration>,
    seq_of: HashMap<String, u64>,
}

/// Keeps the most recent registrations in process, oldest first.
/// Re-registering a task id replaces the earlier entry and makes it the newest.
#[derive(Debug, Clone)]
pub struct MemoryTaskRegistry {
    entries: Arc<RwLock<Entries>>,
    capacity: usize,
}

impl Default for MemoryTaskRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryTaskRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRegistration> {
        let entries = self.entries.read().await;
        let seq = entries.seq_of.get(task_id)?;
        entries.by_seq.get(seq).cloned()
    }

    pub async fn list(&self) -> Vec<TaskRegistration> {
        self.entries.read().await.by_seq.values().cloned().collect()
    }
}

#[async_trait]
impl TaskRegistry for MemoryTaskRegistry {
    async fn register(&self, task: &TaskRegistration) -> Result<()> {
        let mut entries = self.entries.write().await;
        let seq = entries.next_seq;
        entries.next_seq += 1;

        if let Some(previous) = entries.seq_of.insert(task.task_id.clone(), seq) {
            entries.by_seq.remove(&previous);
        }
        entries.by_seq.insert(seq, task.clone());

        while entries.by_seq.len() > self.capacity {
            let Some((_, evicted)) = entries.by_seq.pop_first() else {
                break;
            };
            entries.seq_of.remove(&evicted.task_id);
            tracing::debug!(task_id = %evicted.task_id, "evicted oldest task");
        }
        tracing::debug!(task_id = %task.task_id, total = entries.by_seq.len(), "task stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, output: &str) -> TaskRegistration {
        TaskRegistration {
            task_id: id.to_string(),
            container_id: format!("c-{}", id),
            code: "print(1)".to_string(),
            output: output.to_string(),
            is_service: false,
            service_url: None,
            service_name: None,
        }
    }

    #[tokio::test]
    async fn stores_and_replaces_by_task_id() {
        let registry = MemoryTaskRegistry::default();
        registry.register(&task("a", "1\n")).await.unwrap();
        registry.register(&task("b", "2\n")).await.unwrap();
        registry.register(&task("a", "3\n")).await.unwrap();

        let ids: Vec<_> = registry.list().await.into_iter().map(|t| t.task_id).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(registry.get("a").await.unwrap().output, "3\n");
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let registry = MemoryTaskRegistry::default();
        let other = registry.clone();
        other.register(&task("a", "")).await.unwrap();
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn oldest_tasks_are_evicted_past_capacity() {
        let registry = MemoryTaskRegistry::with_capacity(2);
        registry.register(&task("a", "")).await.unwrap();
        registry.register(&task("b", "")).await.unwrap();
        registry.register(&task("a", "again")).await.unwrap();
        registry.register(&task("c", "")).await.unwrap();

        let ids: Vec<_> = registry.list().await.into_iter().map(|t| t.task_id).collect();
        assert_eq!(ids, ["a", "c"]);
        assert!(registry.get("b").await.is_none());
        assert_eq!(registry.get("a").await.unwrap().output, "again");
    }
}
