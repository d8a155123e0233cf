//! Streaming output chunker
//!
//! Two concurrent readers drain a child's stdout and stderr into
//! per-stream buffers. A buffer is flushed into the outgoing channel when
//! it reaches the size threshold or when the flush interval elapses,
//! whichever comes first. Chunk indexes are a single monotonic counter
//! shared across both streams, so `(command, stream, chunk_index)` is
//! collision-free and totally ordered per stream.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use fleet_core::StreamKind;

/// A flushed slice of child output
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_index: i64,
    pub stream: StreamKind,
    pub data: String,
    pub is_final: bool,
}

struct ChunkerState {
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    next_index: i64,
    last_flush: Instant,
}

/// Per-command output chunker
#[derive(Clone)]
pub struct Chunker {
    chunk_size: usize,
    interval: Duration,
    tx: mpsc::Sender<Chunk>,
    state: Arc<Mutex<ChunkerState>>,
}

/// Handles for the reader and ticker tasks a chunker spawns
pub struct ChunkerTasks {
    readers: Vec<JoinHandle<()>>,
    ticker: JoinHandle<()>,
}

impl ChunkerTasks {
    /// Wait for both readers to hit EOF, then stop the ticker
    pub async fn finish(self) {
        for reader in self.readers {
            let _ = reader.await;
        }
        self.ticker.abort();
        let _ = self.ticker.await;
    }
}

impl Chunker {
    /// Create a chunker and the channel its chunks are emitted on
    pub fn new(
        chunk_size: usize,
        interval: Duration,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Chunk>) {
        let (tx, rx) = mpsc::channel(capacity);
        let chunker = Self {
            chunk_size: chunk_size.max(1),
            interval,
            tx,
            state: Arc::new(Mutex::new(ChunkerState {
                stdout_buf: Vec::new(),
                stderr_buf: Vec::new(),
                next_index: 0,
                last_flush: Instant::now(),
            })),
        };
        (chunker, rx)
    }

    /// Spawn the two stream readers and the interval-flush ticker
    pub fn start<O, E>(&self, stdout: O, stderr: E) -> ChunkerTasks
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let readers = vec![
            tokio::spawn(self.clone().read_stream(stdout, StreamKind::Stdout)),
            tokio::spawn(self.clone().read_stream(stderr, StreamKind::Stderr)),
        ];

        let ticker_chunker = self.clone();
        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ticker_chunker.interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ticker_chunker.flush_elapsed().await;
            }
        });

        ChunkerTasks { readers, ticker }
    }

    async fn read_stream<R>(self, reader: R, stream: StreamKind)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => self.append(stream, &line).await,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "output reader failed");
                    break;
                }
            }
        }
    }

    async fn append(&self, stream: StreamKind, data: &[u8]) {
        let mut state = self.state.lock().await;
        match stream {
            StreamKind::Stdout => state.stdout_buf.extend_from_slice(data),
            StreamKind::Stderr => state.stderr_buf.extend_from_slice(data),
        }

        let over_size = match stream {
            StreamKind::Stdout => state.stdout_buf.len() >= self.chunk_size,
            StreamKind::Stderr => state.stderr_buf.len() >= self.chunk_size,
        };
        if over_size {
            self.flush_stream(&mut state, stream, false).await;
        }
    }

    async fn flush_elapsed(&self) {
        let mut state = self.state.lock().await;
        if state.last_flush.elapsed() < self.interval {
            return;
        }
        self.flush_stream(&mut state, StreamKind::Stdout, false).await;
        self.flush_stream(&mut state, StreamKind::Stderr, false).await;
        state.last_flush = Instant::now();
    }

    async fn flush_stream(&self, state: &mut ChunkerState, stream: StreamKind, is_final: bool) {
        let buffer = match stream {
            StreamKind::Stdout => std::mem::take(&mut state.stdout_buf),
            StreamKind::Stderr => std::mem::take(&mut state.stderr_buf),
        };
        if buffer.is_empty() {
            return;
        }

        let chunk = Chunk {
            chunk_index: state.next_index,
            stream,
            data: String::from_utf8_lossy(&buffer).into_owned(),
            is_final,
        };
        state.next_index += 1;

        if self.tx.send(chunk).await.is_err() {
            warn!(stream = %stream, "chunk receiver dropped, output discarded");
        }
    }

    /// Emit any residual buffers as final chunks and close the channel.
    ///
    /// Call only after the readers finished and the ticker stopped;
    /// a final chunk promises that no further chunks will follow.
    pub async fn final_flush(self) {
        let mut state = self.state.lock().await;
        self.flush_stream(&mut state, StreamKind::Stdout, true).await;
        self.flush_stream(&mut state, StreamKind::Stderr, true).await;
        // Dropping self drops the last sender and closes the channel.
    }
}
