//! Job monitor
//! Follows the job event stream and logs connection changes and cache invalidations

use job_sync::*;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("job_monitor=debug,job_sync=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SyncConfig::from_env()?;
    info!(ws_url = %config.ws_url, api = %config.api_base_url, "starting job monitor");

    let cache = Arc::new(MemoryCache::new());
    let mut invalidations = cache.subscribe();

    let client = SyncClient::from_config(&config, cache.clone(), Arc::new(TracingSink))?;
    let mut state_rx = client.subscribe_connection();
    client.connect(config.credentials());
    info!(session = %client.session_id(), "session started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                match &state.last_error {
                    Some(error) => warn!(status = ?state.status, attempt = state.attempt, %error, "connection state"),
                    None => info!(status = ?state.status, attempt = state.attempt, "connection state"),
                }
            }
            key = invalidations.recv() => match key {
                Ok(key) => match key.job_id().and_then(|id| cache.read_job(id)) {
                    Some(job) => info!(
                        %key,
                        status = %job.status,
                        progress = job.progress,
                        "job updated"
                    ),
                    None => info!(%key, "invalidated"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "invalidation log lagging behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}
