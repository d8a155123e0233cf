//! Background retry drain for pending chunks
//!
//! Everything the immediate push path fails to deliver lands here: a loop
//! that scans the local buffer for pending chunks and pushes them in
//! batches with exponential backoff. When the owning command has already
//! finished locally, the batch is final-marked so the server can close the
//! stream for readers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::backoff::backoff_delay;
use crate::client::{ApiClient, ChunkPayload};
use crate::error::{AgentError, Result};
use crate::store::LocalStore;
use fleet_core::CommandStatus;

/// Scan period of the drain loop
const DRAIN_INTERVAL: Duration = Duration::from_secs(2);

/// Push attempts per command per drain cycle
const MAX_ATTEMPTS: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Retry drain service
pub struct RetryDrain {
    store: LocalStore,
    client: Arc<ApiClient>,
}

impl RetryDrain {
    pub fn new(store: LocalStore, client: Arc<ApiClient>) -> Self {
        Self { store, client }
    }

    /// Run until shutdown
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.drain_once().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One scan over every command with pending chunks
    pub async fn drain_once(&self) {
        let command_ids = match self.store.commands_with_pending_chunks().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to scan pending chunks");
                return;
            }
        };

        for command_id in command_ids {
            let is_final = match self.store.get_command(&command_id).await {
                Ok(Some(cmd)) => cmd
                    .status
                    .parse::<CommandStatus>()
                    .map(|s| s.is_terminal())
                    .unwrap_or(false),
                _ => false,
            };

            if let Err(e) =
                upload_pending_chunks(&self.store, &self.client, &command_id, is_final).await
            {
                warn!(command_id = %command_id, error = %e, "chunk drain failed");
            }
        }
    }
}

/// Push every pending chunk of one command, retrying with backoff.
///
/// Acked chunks are marked locally; chunks the server did not ack get
/// their retry counter bumped, so a restart can tell delivered from
/// stuck. With `is_final` the whole batch is final-marked.
pub async fn upload_pending_chunks(
    store: &LocalStore,
    client: &ApiClient,
    command_id: &str,
    is_final: bool,
) -> Result<()> {
    let chunks = store.pending_chunks(command_id).await?;
    if chunks.is_empty() {
        return Ok(());
    }

    let all_indexes: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    let payloads: Vec<ChunkPayload> = chunks
        .into_iter()
        .map(|c| ChunkPayload {
            chunk_index: c.chunk_index,
            stream: c.stream,
            data: c.data,
            is_final,
        })
        .collect();

    let mut last_err = AgentError::generic("no attempts made");
    for attempt in 0..MAX_ATTEMPTS {
        match client.push_logs(command_id, &payloads).await {
            Ok(acked) => {
                store.mark_chunks_acked(command_id, &acked).await?;

                let missed: Vec<i64> = all_indexes
                    .iter()
                    .copied()
                    .filter(|idx| !acked.contains(idx))
                    .collect();
                if !missed.is_empty() {
                    store.increment_chunk_retries(command_id, &missed).await?;
                }
                return Ok(());
            }
            Err(e) => {
                last_err = e;
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff_delay(attempt, BACKOFF_BASE, BACKOFF_MAX)).await;
                }
            }
        }
    }

    store.increment_chunk_retries(command_id, &all_indexes).await?;
    Err(last_err)
}
