use crate::RegistryError;
use async_trait::async_trait;
use kiln_core::{TaskRegistration, TaskRegistry};
use redis::AsyncCommands;
use std::collections::HashMap;

pub const TASKS_KEY: &str = "kiln:tasks";
pub const EVENTS_CHANNEL: &str = "kiln:task-events";

/// Stores registrations in the `kiln:tasks` hash and announces each one on
/// `kiln:task-events`.
#[derive(Clone)]
pub struct RedisTaskRegistry {
    client: redis::Client,
}

impl RedisTaskRegistry {
    pub fn new(redis_url: &str) -> Result<Self, RegistryError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub async fn store(&self, task: &TaskRegistration) -> Result<(), RegistryError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(task)?;
        let _: () = conn.hset(TASKS_KEY, &task.task_id, &json).await?;
        let _: () = conn.publish(EVENTS_CHANNEL, json).await?;
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRegistration>, RegistryError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json: Option<String> = conn.hget(TASKS_KEY, task_id).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every stored task, ordered by task id.
    pub async fn list(&self) -> Result<Vec<TaskRegistration>, RegistryError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let map: HashMap<String, String> = conn.hgetall(TASKS_KEY).await?;

        let mut tasks: Vec<TaskRegistration> = map
            .values()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }
}

#[async_trait]
impl TaskRegistry for RedisTaskRegistry {
    async fn register(&self, task: &TaskRegistration) -> kiln_core::Result<()> {
        self.store(task).await.map_err(Into::into)
    }
}
