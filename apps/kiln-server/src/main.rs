mod api;
mod gc;

use api::routes::AppState;
use kiln_box::Engine;
use kiln_core::KilnConfig;
use kiln_registry::TaskStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "kiln_server=debug,kiln_box=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Kiln Server...");

    let config = KilnConfig::new()?;
    tracing::info!("Config loaded");

    let tasks = TaskStore::from_url(config.registry.redis_url.as_deref())?;
    match &tasks {
        TaskStore::Redis(_) => tracing::info!("Task registry: redis"),
        TaskStore::Memory(_) => tracing::info!("Task registry: in-memory"),
    }

    tokio::fs::create_dir_all(&config.sandbox.base_dir).await?;
    tracing::info!("Sandbox base dir: {:?}", config.sandbox.base_dir);

    let engine = Engine::detect(config.clone(), Arc::new(tasks.clone()))?;
    let (available, message) = engine.runtime().available().await;
    if available {
        tracing::info!("Container runtime ready: {}", message);
    } else {
        tracing::warn!("Container runtime unavailable: {}", message);
    }

    let state = Arc::new(AppState::new(engine, tasks));

    // Spawn Garbage Collector
    let gc_state = state.clone();
    tokio::spawn(async move {
        gc::start_gc(gc_state).await;
    });

    let app = api::routes::app(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
