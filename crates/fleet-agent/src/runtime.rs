//! Poll/dispatch loop and the worker pool
//!
//! A single ticker drives two actions: one bounded long-poll against the
//! control service, and a drain of the local queue into a bounded channel
//! consumed by the worker pool. The dispatcher never blocks on a full
//! channel; the command stays queued locally and is retried next tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::client::{ApiClient, ChunkPayload};
use crate::config::Config;
use crate::drain;
use crate::error::Result;
use crate::executor::{run_shell_command, Chunker, ExecutionOutcome};
use crate::store::{LocalCommand, LocalStore};
use fleet_core::{CommandStatus, CommandType, RunCommand};

/// How long each long-poll asks the server to wait
const POLL_WAIT_SECS: u64 = 5;

/// Ticker period of the runtime loop
const TICK_PERIOD: Duration = Duration::from_secs(5);

/// Runtime loop: polling, dispatch, and execution
#[derive(Clone)]
pub struct RuntimeService {
    store: LocalStore,
    client: Arc<ApiClient>,
    chunk_size: usize,
    chunk_interval: Duration,
    default_timeout: Duration,
    worker_count: usize,
    channel_size: usize,
}

impl RuntimeService {
    pub fn new(store: LocalStore, client: Arc<ApiClient>, config: &Config) -> Self {
        Self {
            store,
            client,
            chunk_size: config.chunk_size,
            chunk_interval: Duration::from_secs(config.chunk_interval_sec.max(1)),
            default_timeout: Duration::from_secs(config.default_timeout_sec.max(1)),
            worker_count: config.worker_count,
            channel_size: config.channel_size,
        }
    }

    /// Run until shutdown. Spawns the worker pool, then drives the
    /// poll/dispatch ticker. On shutdown the dispatcher stops and the
    /// workers drain what is already in the channel before exiting.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel::<LocalCommand>(self.channel_size);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let runtime = self.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let cmd = { rx.lock().await.recv().await };
                    match cmd {
                        Some(cmd) => runtime.execute_local_command(cmd).await,
                        None => break,
                    }
                }
                info!(worker_id, "worker drained and stopped");
            }));
        }

        // Work through anything left over from a previous run before the
        // first poll.
        self.dispatch_queued(&tx).await;

        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_remote_once().await;
                    self.dispatch_queued(&tx).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// One long-poll against the control service; accepted commands are
    /// persisted to the local queue (idempotently) before anything runs.
    pub async fn poll_remote_once(&self) {
        let commands = match self.client.poll_commands(POLL_WAIT_SECS).await {
            Ok(commands) => commands,
            Err(e) => {
                warn!(error = %e, "command poll failed");
                return;
            }
        };

        for cmd in commands {
            let payload = cmd.payload.to_string();
            if let Err(e) = self
                .store
                .save_command(&cmd.command_id, &cmd.command_type, &payload)
                .await
            {
                warn!(command_id = %cmd.command_id, error = %e, "failed to save command");
            }
        }
    }

    /// Move queued local commands into the worker channel. A full channel
    /// puts the command back to `queued`; it is retried next tick.
    pub async fn dispatch_queued(&self, tx: &mpsc::Sender<LocalCommand>) {
        loop {
            let cmd = match self.store.next_queued().await {
                Ok(Some(cmd)) => cmd,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "failed to read local queue");
                    return;
                }
            };

            // Claim before handing off so the next iteration does not
            // observe the same row.
            if let Err(e) = self
                .store
                .update_command_status(&cmd.command_id, CommandStatus::Running.as_str(), None, None)
                .await
            {
                warn!(command_id = %cmd.command_id, error = %e, "failed to claim command");
                return;
            }

            if let Err(send_err) = tx.try_send(cmd) {
                let cmd = match send_err {
                    mpsc::error::TrySendError::Full(cmd) => cmd,
                    mpsc::error::TrySendError::Closed(cmd) => cmd,
                };
                if let Err(e) = self
                    .store
                    .update_command_status(
                        &cmd.command_id,
                        CommandStatus::Queued.as_str(),
                        None,
                        None,
                    )
                    .await
                {
                    warn!(command_id = %cmd.command_id, error = %e, "failed to requeue command");
                }
                return;
            }
        }
    }

    /// Worker body: execute one accepted command end to end
    pub async fn execute_local_command(&self, cmd: LocalCommand) {
        info!(command_id = %cmd.command_id, command_type = %cmd.command_type, "executing");

        let _ = self
            .store
            .update_command_status(&cmd.command_id, CommandStatus::Running.as_str(), None, None)
            .await;

        let outcome = match cmd.command_type.parse::<CommandType>() {
            Ok(CommandType::RunCommand) => self.run_command(&cmd).await,
            Ok(CommandType::UpdateAgent) | Ok(CommandType::UpdatePackage) => {
                // Acknowledged without shelling out; the concrete rollout
                // mechanics live outside the executor.
                Ok(ExecutionOutcome {
                    status: CommandStatus::Success,
                    exit_code: 0,
                    error_msg: None,
                })
            }
            Err(_) => Ok(ExecutionOutcome {
                status: CommandStatus::Failed,
                exit_code: -1,
                error_msg: Some(format!("unknown command type: {}", cmd.command_type)),
            }),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome {
                status: CommandStatus::Failed,
                exit_code: -1,
                error_msg: Some(e.to_string()),
            },
        };

        self.finalize_command(&cmd.command_id, &outcome).await;
    }

    async fn run_command(&self, cmd: &LocalCommand) -> Result<ExecutionOutcome> {
        let payload: RunCommand = serde_json::from_str(&cmd.payload)?;
        let deadline = payload
            .timeout_sec
            .filter(|t| *t > 0)
            .map(|t| Duration::from_secs(t as u64))
            .unwrap_or(self.default_timeout);

        let (chunker, mut rx) = Chunker::new(self.chunk_size, self.chunk_interval, 100);

        // Persist each emitted chunk, then try to push it right away; the
        // retry drain picks up whatever the immediate push misses.
        let consumer = {
            let store = self.store.clone();
            let client = self.client.clone();
            let command_id = cmd.command_id.to_string();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    let stream = chunk.stream.as_str();
                    if let Err(e) = store
                        .save_chunk(&command_id, chunk.chunk_index, stream, &chunk.data)
                        .await
                    {
                        warn!(command_id = %command_id, error = %e, "failed to buffer chunk");
                        continue;
                    }

                    let payload = ChunkPayload {
                        chunk_index: chunk.chunk_index,
                        stream: stream.to_string(),
                        data: chunk.data,
                        is_final: chunk.is_final,
                    };
                    match client.push_logs(&command_id, &[payload]).await {
                        Ok(acked) => {
                            if let Err(e) = store.mark_chunks_acked(&command_id, &acked).await {
                                warn!(command_id = %command_id, error = %e, "failed to ack chunks");
                            }
                        }
                        Err(e) => {
                            warn!(command_id = %command_id, error = %e, "immediate push failed");
                        }
                    }
                }
            })
        };

        let outcome = run_shell_command(&payload.cmd, deadline, chunker).await;
        let _ = consumer.await;
        outcome
    }

    async fn finalize_command(&self, command_id: &str, outcome: &ExecutionOutcome) {
        // Everything still pending for this command goes out final-marked
        // before the terminal status is reported.
        if let Err(e) =
            drain::upload_pending_chunks(&self.store, &self.client, command_id, true).await
        {
            warn!(command_id = %command_id, error = %e, "post-run chunk upload failed");
        }

        if let Err(e) = self
            .store
            .update_command_status(
                command_id,
                outcome.status.as_str(),
                Some(outcome.exit_code),
                outcome.error_msg.as_deref(),
            )
            .await
        {
            warn!(command_id = %command_id, error = %e, "failed to store terminal status");
        }

        if let Err(e) = self
            .client
            .update_status(
                command_id,
                outcome.status.as_str(),
                Some(outcome.exit_code),
                outcome.error_msg.as_deref(),
            )
            .await
        {
            warn!(command_id = %command_id, error = %e, "failed to report status");
        }

        info!(
            command_id = %command_id,
            status = %outcome.status,
            exit_code = outcome.exit_code,
            "command finished"
        );
    }
}
