use crate::api::routes::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use kiln_box::RunOptions;
use kiln_core::{
    ApiDocs, ExecutionResult, ServiceHandle, ServiceInfo, ServiceMetadata, TaskRegistration,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceRequest {
    pub code: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
}

impl ServiceRequest {
    fn metadata(&self) -> ServiceMetadata {
        let defaults = ServiceMetadata::default();
        ServiceMetadata {
            name: self.name.clone().unwrap_or(defaults.name),
            description: self.description.clone().unwrap_or(defaults.description),
            version: self.version.clone().unwrap_or(defaults.version),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub runtime_available: bool,
    pub runtime: String,
    pub services: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    let (available, message) = state.engine.runtime().available().await;
    Json(Health {
        status: if available { "ok" } else { "degraded" },
        runtime_available: available,
        runtime: message,
        services: state.services.read().await.len(),
    })
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> Json<ExecutionResult> {
    let options = RunOptions {
        timeout: payload.timeout_seconds.map(Duration::from_secs),
        cancel: None,
    };
    let result = state.engine.execution().run_with(&payload.code, options).await;
    if !result.success {
        tracing::debug!(sandbox_id = %result.sandbox_id, kind = ?result.error_kind, "execution failed");
    }
    Json(result)
}

/// Builds and starts a service. Services that do not come up are cleaned
/// up right away and answered with 422 and their handle.
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ServiceRequest>,
) -> Result<(StatusCode, Json<ServiceHandle>), ApiError> {
    let mut sandbox = state.engine.service().await.map_err(|e| {
        tracing::error!("Failed to create service sandbox: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let handle = sandbox.build_and_run(&payload.code, payload.metadata()).await;
    if !handle.is_live() {
        tracing::warn!(sandbox_id = %handle.sandbox_id, status = ?handle.status, "service did not start");
        sandbox.cleanup().await;
        return Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(handle)));
    }

    state
        .services
        .write()
        .await
        .insert(handle.sandbox_id, Arc::new(Mutex::new(sandbox)));
    Ok((StatusCode::CREATED, Json(handle)))
}

pub async fn list_services(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceInfo>> {
    let sandboxes: Vec<_> = state.services.read().await.values().cloned().collect();
    let mut infos = Vec::with_capacity(sandboxes.len());
    for sandbox in sandboxes {
        if let Some(info) = sandbox.lock().await.get_info() {
            infos.push(info);
        }
    }
    Json(infos)
}

pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServiceInfo>, ApiError> {
    let sandbox = find(&state, id).await?;
    let info = sandbox.lock().await.get_info();
    info.map(Json).ok_or_else(|| not_found(id))
}

pub async fn service_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<String, ApiError> {
    let sandbox = find(&state, id).await?;
    let logs = sandbox.lock().await.get_logs().await;
    logs.map_err(|e| {
        tracing::error!("Failed to read logs for {}: {}", id, e);
        (StatusCode::BAD_GATEWAY, e.to_string())
    })
}

pub async fn service_docs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiDocs>, ApiError> {
    let sandbox = find(&state, id).await?;
    let docs = sandbox.lock().await.get_api_docs().await;
    docs.map(Json).map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let sandbox = state
        .services
        .write()
        .await
        .remove(&id)
        .ok_or_else(|| not_found(id))?;
    sandbox.lock().await.cleanup().await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskRegistration>>, ApiError> {
    state.tasks.list().await.map(Json).map_err(|e| {
        tracing::error!("Failed to list tasks: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Registry error: {}", e))
    })
}

async fn find(
    state: &AppState,
    id: Uuid,
) -> Result<Arc<Mutex<kiln_box::ServiceSandbox>>, ApiError> {
    state.service(id).await.ok_or_else(|| not_found(id))
}

fn not_found(id: Uuid) -> ApiError {
    (StatusCode::NOT_FOUND, format!("No service {}", id))
}
