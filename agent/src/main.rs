//! Roam Agent - runs sync cycles on a timer until interrupted.

use roam_agent::{Config, FileLocalStore, HttpRemoteStore};
use roam_sync::{JsonFileStorage, SyncContext, SyncTrigger};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roam_agent=info,roam_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        remote = %config.remote_url,
        device = %config.device_id,
        data_dir = %config.data_dir.display(),
        "Starting Roam Agent"
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let local = Arc::new(FileLocalStore::open(config.local_store_path())?);
    let remote = Arc::new(HttpRemoteStore::new(
        config.remote_url.clone(),
        config.device_id.clone(),
        config.timeout,
    )?);
    let context = SyncContext::builder(remote, local)
        .config(config.sync_config())
        .storage(Arc::new(JsonFileStorage::new(config.queue_path())))
        .build()?;

    run_cycle(&context, SyncTrigger::AppForeground).await;

    let mut interval = tokio::time::interval(config.sync_interval);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => run_cycle(&context, SyncTrigger::Timer).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                context.cancel_sync();
                break;
            }
        }
    }

    let stats = context.sync_statistics()?;
    tracing::info!(
        pending = stats.pending_count,
        open_conflicts = stats.open_conflicts,
        last_sync = ?stats.last_sync_timestamp,
        "Final sync state"
    );
    Ok(())
}

/// Failed cycles are logged and retried on the next tick.
async fn run_cycle(context: &SyncContext, trigger: SyncTrigger) {
    match context.trigger_sync_cycle(trigger).await {
        Ok(result) => tracing::info!(
            succeeded = result.succeeded,
            conflicted = result.conflicted,
            failed = result.failed,
            downloaded = result.downloaded,
            duration_ms = result.duration.as_millis() as u64,
            "Sync cycle finished"
        ),
        Err(e) => tracing::warn!(error = %e, "Sync cycle failed"),
    }
}
