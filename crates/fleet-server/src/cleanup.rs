//! Log retention job

use std::time::Duration;
use tracing::{info, warn};

use fleet_db::Repository;

const CLEANUP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Nightly deletion of log chunks older than the retention window.
/// Runs until the process exits.
pub async fn run_retention_job(repo: Repository, retention_days: i64) {
    loop {
        tokio::time::sleep(CLEANUP_PERIOD).await;
        match repo.cleanup_old_logs(retention_days).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(deleted, retention_days, "purged expired log chunks");
                }
            }
            Err(e) => warn!(error = %e, "log retention cleanup failed"),
        }
    }
}
