use crate::api::routes::AppState;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{error, info};

/// Periodically removes sandbox directories left behind by crashed or
/// abandoned runs. Directories of live services are kept.
pub async fn start_gc(state: Arc<AppState>) {
    let gc = state.engine.config().gc.clone();
    let base_dir = state.engine.config().sandbox.base_dir.clone();
    let max_age = Duration::from_secs(gc.max_age_secs);
    info!(
        "Garbage Collector started. Max age: {}s, Interval: {}s",
        gc.max_age_secs, gc.interval_secs
    );

    loop {
        tokio::time::sleep(Duration::from_secs(gc.interval_secs)).await;
        let live: HashSet<String> = state
            .live_ids()
            .await
            .into_iter()
            .map(|id| id.to_string())
            .collect();

        match run_gc_pass(&base_dir, max_age, &live).await {
            Ok(0) => {}
            Ok(removed) => info!("GC: removed {} stale sandboxes", removed),
            Err(e) => error!("GC Pass failed: {}", e),
        }
    }
}

pub async fn run_gc_pass(
    base_dir: &Path,
    max_age: Duration,
    live: &HashSet<String>,
) -> std::io::Result<usize> {
    if !base_dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = fs::read_dir(base_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if live.contains(&name) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match fs::remove_dir_all(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => error!("Failed to remove sandbox {:?}: {}", entry.path(), e),
        }
    }
    Ok(removed)
}
