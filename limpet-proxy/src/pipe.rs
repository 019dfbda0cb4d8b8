//! [`PersistentPipe`] — per-client bridge between a client stream and the
//! currently assigned backend stream.
//!
//! # Tasks
//!
//! `stream()` spawns two long-lived tasks:
//!
//! - **Forward** (client → backend): owns the backend *write* half and the
//!   staging buffer. While the backend slot is vacant, client bytes are
//!   staged up to the configured limit; exceeding it is fatal.
//! - **Backward** (backend → client): owns the backend *read* half. A read
//!   failure (including end-of-stream — a closed backend is a failed
//!   backend) is reported once on the event channel, then the task parks
//!   until a substitution installs a fresh half.
//!
//! # Substitution
//!
//! The manager is the only initiator. [`PersistentPipe::swap_backend`]
//! splits the replacement stream and delivers one half to each task over its
//! own channel. The forward task flushes all staged bytes into the new
//! backend as a single write before any later client bytes, so
//! client → backend ordering holds across any number of substitutions. The
//! client side is never touched.
//!
//! # Event flow
//!
//! ```text
//!  forward ──┐
//!            ├──► events ──► manager ── mark_error / get_conn ──► swap_backend
//! backward ──┘                                                      │   │
//!      ▲                                            write half ─────┘   │
//!      └──────────────────────────────────────────── read half ─────────┘
//! ```
//!
//! Exactly one backend-failure event is emitted per substitution cycle, and
//! one terminal event (client closed, client failed, or staging overflow)
//! ends the pipe. Each task owns its own state exclusively; the tasks share
//! nothing but the event channel.

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ---

use limpet_domain::{ByteStreamPtr, LimpetError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Read buffer size for both copy directions.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Event channel depth. Two producers with at most one in-flight failure
/// event each plus one terminal event fit comfortably.
const EVENT_CHANNEL_CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// PipeEvent
// ---------------------------------------------------------------------------

/// Events surfaced by a pipe's copy loops, consumed by the manager.
#[derive(Debug)]
pub enum PipeEvent {
    // ---
    /// The backward loop observed a backend read failure. The backend slot
    /// is vacant until a substitution installs a fresh stream.
    BackendFailed { cause: String },

    /// Staging the next client bytes would exceed the buffer limit. Terminal.
    BufferOverflow,

    /// The client closed its connection cleanly. Terminal.
    ClientClosed,

    /// The client side failed mid-stream. Terminal.
    ClientFailed { cause: String },
}

// ---------------------------------------------------------------------------
// StagingBuffer
// ---------------------------------------------------------------------------

/// Bounded FIFO byte buffer absorbing client → backend writes while the
/// backend slot is vacant. Owned exclusively by the forward task.
struct StagingBuffer {
    // ---
    buf: Vec<u8>,
    limit: usize,
}

// ---

impl StagingBuffer {
    // ---

    fn new(limit: usize) -> Self {
        // ---
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    // ---

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn limit(&self) -> usize {
        self.limit
    }

    // ---

    /// Append `bytes` if the result stays within the limit.
    fn try_stage(&mut self, bytes: &[u8]) -> bool {
        // ---
        if self.buf.len() + bytes.len() > self.limit {
            return false;
        }
        self.buf.extend_from_slice(bytes);
        true
    }

    // ---

    /// Drain the buffer, returning everything staged so far in FIFO order.
    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

// ---------------------------------------------------------------------------
// ForwardTask  (client → backend)
// ---------------------------------------------------------------------------

struct ForwardTask {
    // ---
    pipe_id: Uuid,
    client: ReadHalf<ByteStreamPtr>,

    /// Backend write half. `None` while the slot is vacant.
    backend: Option<WriteHalf<ByteStreamPtr>>,

    /// Fresh write halves delivered here on substitution.
    swap_rx: mpsc::Receiver<WriteHalf<ByteStreamPtr>>,

    staging: StagingBuffer,
    events: mpsc::Sender<PipeEvent>,
}

// ---

impl ForwardTask {
    // ---

    async fn run(mut self) {
        // ---
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        loop {
            tokio::select! {
                fresh = self.swap_rx.recv() => {
                    let Some(half) = fresh else { return };
                    tracing::debug!(pipe = %self.pipe_id, "forward: fresh backend write half installed");
                    self.backend = Some(half);
                    if !self.flush_staged().await {
                        return;
                    }
                }
                read = self.client.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!(pipe = %self.pipe_id, "forward: client closed");
                        let _ = self.events.send(PipeEvent::ClientClosed).await;
                        return;
                    }
                    Ok(n) => {
                        if !self.forward(&buf[..n]).await {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(pipe = %self.pipe_id, "forward: client read failed: {e}");
                        let _ = self
                            .events
                            .send(PipeEvent::ClientFailed { cause: e.to_string() })
                            .await;
                        return;
                    }
                },
            }
        }
    }

    // ---

    /// Handle bytes fresh off the client. Returns `false` when the pipe must
    /// terminate (staging overflow, already reported).
    async fn forward(&mut self, bytes: &[u8]) -> bool {
        // ---
        if self.backend.is_none() {
            return self.stage(bytes).await;
        }
        if self.staging.is_empty() {
            return self.write_or_stage(bytes).await;
        }

        // Staged bytes go first, in the same write as the new bytes.
        let mut chunk = self.staging.take();
        chunk.extend_from_slice(bytes);
        self.write_or_stage(&chunk).await
    }

    // ---

    /// Push any staged bytes into a just-installed backend as one write.
    async fn flush_staged(&mut self) -> bool {
        // ---
        if self.staging.is_empty() {
            return true;
        }
        let chunk = self.staging.take();
        tracing::info!(
            pipe = %self.pipe_id,
            bytes = chunk.len(),
            "forward: flushing staged bytes into substituted backend",
        );
        self.write_or_stage(&chunk).await
    }

    // ---

    /// Write to the live backend; on write failure vacate the slot and stage
    /// the bytes for the next backend instead. The forward loop never exits
    /// on a backend error. Returns `false` on staging overflow.
    async fn write_or_stage(&mut self, bytes: &[u8]) -> bool {
        // ---
        let Some(backend) = self.backend.as_mut() else {
            return self.stage(bytes).await;
        };

        let write = async {
            backend.write_all(bytes).await?;
            backend.flush().await
        };
        match write.await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    pipe = %self.pipe_id,
                    bytes = bytes.len(),
                    "forward: backend write failed ({e}), staging",
                );
                self.backend = None;
                self.stage(bytes).await
            }
        }
    }

    // ---

    /// Append to the staging buffer; on overflow report the fatal event and
    /// return `false`.
    async fn stage(&mut self, bytes: &[u8]) -> bool {
        // ---
        if self.staging.try_stage(bytes) {
            tracing::debug!(
                pipe = %self.pipe_id,
                staged = self.staging.len(),
                "forward: staged bytes while backend absent",
            );
            return true;
        }
        tracing::error!(
            pipe = %self.pipe_id,
            limit = self.staging.limit(),
            "forward: staging buffer limit exceeded",
        );
        let _ = self.events.send(PipeEvent::BufferOverflow).await;
        false
    }
}

// ---------------------------------------------------------------------------
// BackwardTask  (backend → client)
// ---------------------------------------------------------------------------

struct BackwardTask {
    // ---
    pipe_id: Uuid,

    /// Backend read half. `None` while the slot is vacant.
    backend: Option<ReadHalf<ByteStreamPtr>>,

    /// Fresh read halves delivered here on substitution.
    swap_rx: mpsc::Receiver<ReadHalf<ByteStreamPtr>>,

    client: WriteHalf<ByteStreamPtr>,
    events: mpsc::Sender<PipeEvent>,
}

// ---

impl BackwardTask {
    // ---

    async fn run(mut self) {
        // ---
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        loop {
            let Some(backend) = self.backend.as_mut() else {
                match self.swap_rx.recv().await {
                    Some(half) => {
                        tracing::debug!(pipe = %self.pipe_id, "backward: fresh backend read half installed");
                        self.backend = Some(half);
                        continue;
                    }
                    None => return,
                }
            };

            match backend.read(&mut buf).await {
                Ok(0) => {
                    self.on_backend_failure("backend closed the connection".to_string())
                        .await;
                }
                Ok(n) => {
                    let write = async {
                        self.client.write_all(&buf[..n]).await?;
                        self.client.flush().await
                    };
                    if let Err(e) = write.await {
                        tracing::warn!(pipe = %self.pipe_id, "backward: client write failed: {e}");
                        let _ = self
                            .events
                            .send(PipeEvent::ClientFailed { cause: e.to_string() })
                            .await;
                        return;
                    }
                }
                Err(e) => self.on_backend_failure(e.to_string()).await,
            }
        }
    }

    // ---

    /// Vacate the backend slot and report the failure once. The next loop
    /// iteration parks on the swap channel until substitution.
    async fn on_backend_failure(&mut self, cause: String) {
        // ---
        tracing::warn!(
            pipe = %self.pipe_id,
            "backward: backend read failed ({cause}), awaiting substitution",
        );
        self.backend = None;
        let _ = self.events.send(PipeEvent::BackendFailed { cause }).await;
    }
}

// ---------------------------------------------------------------------------
// PersistentPipe
// ---------------------------------------------------------------------------

/// Bridges one client stream and the currently assigned backend stream,
/// surviving backend replacement without touching the client side.
///
/// Constructed per client session; the manager consumes the paired event
/// receiver, performs substitutions via [`PersistentPipe::swap_backend`],
/// and drops the pipe to tear both copy tasks down.
pub struct PersistentPipe {
    // ---
    id: Uuid,
    client_id: Uuid,

    /// Streams held until `stream()` splits them into the copy tasks.
    client: Option<ByteStreamPtr>,
    backend: Option<ByteStreamPtr>,

    buffer_byte_limit: usize,

    /// Producer side of the event channel, handed to the tasks at start so
    /// the channel closes when the last task exits.
    event_tx: Option<mpsc::Sender<PipeEvent>>,

    /// Substitution channels, populated by `stream()`.
    swap_write_tx: Option<mpsc::Sender<WriteHalf<ByteStreamPtr>>>,
    swap_read_tx: Option<mpsc::Sender<ReadHalf<ByteStreamPtr>>>,

    stream_on: bool,
    tasks: Vec<JoinHandle<()>>,
}

// ---

impl PersistentPipe {
    // ---

    /// Create a pipe and the event receiver its copy tasks will report on.
    pub fn new(
        client_id: Uuid,
        client: ByteStreamPtr,
        backend: ByteStreamPtr,
        buffer_byte_limit: usize,
    ) -> (Self, mpsc::Receiver<PipeEvent>) {
        // ---
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let pipe = Self {
            id: Uuid::new_v4(),
            client_id,
            client: Some(client),
            backend: Some(backend),
            buffer_byte_limit,
            event_tx: Some(event_tx),
            swap_write_tx: None,
            swap_read_tx: None,
            stream_on: false,
            tasks: Vec::new(),
        };

        (pipe, event_rx)
    }

    // ---

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    // ---

    /// Start the forward and backward copy tasks.
    ///
    /// Returns immediately; the tasks run until a terminal event. A second
    /// call while streaming fails without side effects.
    pub fn stream(&mut self) -> Result<()> {
        // ---
        if self.stream_on {
            return Err(LimpetError::AlreadyStreaming);
        }
        let Some(event_tx) = self.event_tx.take() else {
            return Err(LimpetError::AlreadyStreaming);
        };

        let (client, backend) = match (self.client.take(), self.backend.take()) {
            (Some(client), Some(backend)) => (client, backend),
            (client, backend) => {
                self.client = client;
                self.backend = backend;
                self.event_tx = Some(event_tx);
                return Err(LimpetError::MissingStream);
            }
        };

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);
        let (swap_write_tx, swap_write_rx) = mpsc::channel(1);
        let (swap_read_tx, swap_read_rx) = mpsc::channel(1);

        let forward = ForwardTask {
            pipe_id: self.id,
            client: client_read,
            backend: Some(backend_write),
            swap_rx: swap_write_rx,
            staging: StagingBuffer::new(self.buffer_byte_limit),
            events: event_tx.clone(),
        };
        let backward = BackwardTask {
            pipe_id: self.id,
            backend: Some(backend_read),
            swap_rx: swap_read_rx,
            client: client_write,
            events: event_tx,
        };

        self.tasks.push(tokio::spawn(forward.run()));
        self.tasks.push(tokio::spawn(backward.run()));
        self.swap_write_tx = Some(swap_write_tx);
        self.swap_read_tx = Some(swap_read_tx);
        self.stream_on = true;

        tracing::debug!(pipe = %self.id, client = %self.client_id, "pipe streaming");
        Ok(())
    }

    // ---

    /// Substitute the backend under the running copy tasks.
    ///
    /// The write half lands first so staged bytes flush before the backward
    /// loop resumes reading. If the tasks have already terminated the swap
    /// is ignored — the terminal event is queued for the manager.
    pub async fn swap_backend(&mut self, backend: ByteStreamPtr) {
        // ---
        if !self.stream_on {
            self.backend = Some(backend);
            return;
        }
        let (Some(swap_write_tx), Some(swap_read_tx)) =
            (self.swap_write_tx.as_ref(), self.swap_read_tx.as_ref())
        else {
            return;
        };

        let (backend_read, backend_write) = tokio::io::split(backend);
        let mut delivered = swap_write_tx.send(backend_write).await.is_ok();
        if delivered {
            delivered = swap_read_tx.send(backend_read).await.is_ok();
        }
        if !delivered {
            tracing::debug!(pipe = %self.id, "swap ignored: pipe already terminated");
        }
    }
}

// ---

impl Drop for PersistentPipe {
    // ---
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
