//! Local store cleanup job

use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::LocalStore;

const CLEANUP_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Acked chunks are kept this long before deletion
const ACKED_CHUNK_TTL_MINUTES: i64 = 15;

/// Terminal commands are kept this long before deletion
const FINISHED_COMMAND_TTL_HOURS: i64 = 24;

/// Hourly cleanup of delivered chunks and finished commands
pub async fn run_cleanup_job(store: LocalStore, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CLEANUP_PERIOD) => {}
            _ = shutdown.changed() => break,
        }

        match store.cleanup_acked_chunks(ACKED_CHUNK_TTL_MINUTES).await {
            Ok(deleted) if deleted > 0 => info!(deleted, "removed delivered chunks"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "chunk cleanup failed"),
        }

        match store
            .cleanup_finished_commands(FINISHED_COMMAND_TTL_HOURS)
            .await
        {
            Ok(deleted) if deleted > 0 => info!(deleted, "removed finished commands"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "command cleanup failed"),
        }
    }
}
