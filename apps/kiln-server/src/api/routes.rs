use crate::api::handlers;
use axum::{
    Router,
    routing::{get, post},
};
use kiln_box::{Engine, ServiceSandbox};
use kiln_registry::TaskStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

pub struct AppState {
    pub engine: Engine,
    pub tasks: TaskStore,
    pub services: RwLock<HashMap<Uuid, Arc<Mutex<ServiceSandbox>>>>,
}

impl AppState {
    pub fn new(engine: Engine, tasks: TaskStore) -> Self {
        Self {
            engine,
            tasks,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub async fn service(&self, id: Uuid) -> Option<Arc<Mutex<ServiceSandbox>>> {
        self.services.read().await.get(&id).cloned()
    }

    /// Ids of services whose sandbox directories must survive GC.
    pub async fn live_ids(&self) -> Vec<Uuid> {
        self.services.read().await.keys().copied().collect()
    }

    /// Stops every service this process started.
    pub async fn shutdown(&self) {
        let services: Vec<_> = self.services.write().await.drain().collect();
        tracing::info!("Stopping {} services", services.len());
        for (_, sandbox) in services {
            sandbox.lock().await.cleanup().await;
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/execute", post(handlers::execute))
        .route(
            "/api/v1/services",
            post(handlers::create_service).get(handlers::list_services),
        )
        .route(
            "/api/v1/services/:id",
            get(handlers::get_service).delete(handlers::delete_service),
        )
        .route("/api/v1/services/:id/logs", get(handlers::service_logs))
        .route("/api/v1/services/:id/docs", get(handlers::service_docs))
        .route("/api/v1/tasks", get(handlers::list_tasks))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
