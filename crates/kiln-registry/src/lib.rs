pub mod memory;
pub mod redis_store;

pub use memory::MemoryTaskRegistry;
pub use redis_store::RedisTaskRegistry;

use async_trait::async_trait;
use kiln_core::{KilnError, TaskRegistration, TaskRegistry};

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<RegistryError> for KilnError {
    fn from(err: RegistryError) -> Self {
        KilnError::Registry(err.to_string())
    }
}

/// The registry a process runs with: Redis when a URL is configured,
/// otherwise an in-process list.
#[derive(Clone)]
pub enum TaskStore {
    Redis(RedisTaskRegistry),
    Memory(MemoryTaskRegistry),
}

impl TaskStore {
    pub fn from_url(redis_url: Option<&str>) -> Result<Self, RegistryError> {
        match redis_url {
            Some(url) => Ok(Self::Redis(RedisTaskRegistry::new(url)?)),
            None => Ok(Self::Memory(MemoryTaskRegistry::default())),
        }
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRegistration>, RegistryError> {
        match self {
            Self::Redis(store) => store.get(task_id).await,
            Self::Memory(store) => Ok(store.get(task_id).await),
        }
    }

    pub async fn list(&self) -> Result<Vec<TaskRegistration>, RegistryError> {
        match self {
            Self::Redis(store) => store.list().await,
            Self::Memory(store) => Ok(store.list().await),
        }
    }
}

#[async_trait]
impl TaskRegistry for TaskStore {
    async fn register(&self, task: &TaskRegistration) -> kiln_core::Result<()> {
        match self {
            Self::Redis(store) => store.register(task).await,
            Self::Memory(store) => store.register(task).await,
        }
    }
}
