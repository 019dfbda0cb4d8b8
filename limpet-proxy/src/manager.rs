//! [`PipeManager`] — owns the client → pipe registry and drives backend
//! substitution.
//!
//! # Session flow
//!
//! [`PipeManager::create_pipe`] is one blocking call per client session: it
//! reserves the client id, acquires a backend from the pool, starts a
//! [`PersistentPipe`], then sits in the pipe's event loop until a terminal
//! event. A reported backend failure triggers one substitution step —
//! quarantine the dead entry, acquire a replacement (consulting the
//! installed backoff strategy between failed attempts), swap it under the
//! running copy loops — and nothing else touches that pipe in between.
//!
//! On return the client id is freed and the last backend entry goes back to
//! the pool; its connection died with the pipe, so the entry is released
//! undialed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::sync::Mutex;
use uuid::Uuid;

// ---

use limpet_domain::{BackendDialerPtr, ByteStreamPtr, LimpetError, Result};

// ---

use super::{BackendEntry, BackendPool, PersistentPipe, PipeEvent, ProxyConfig};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Delay between substitution-path pool acquisitions when no backoff
/// strategy is installed.
const DEFAULT_SUBSTITUTION_RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// BackOffStrategyFn
// ---------------------------------------------------------------------------

/// Caller-supplied backoff policy for the substitution path.
///
/// Invoked with the number of failed acquisition attempts so far (starting
/// at zero); returns how long to wait before the next attempt. Only
/// consulted when the pool is configured with an acquire cap — an uncapped
/// pool blocks inside `get_conn` instead.
pub type BackOffStrategyFn = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

// ---------------------------------------------------------------------------
// PipeManager
// ---------------------------------------------------------------------------

/// Per-client pipe registry plus the glue between pipes and the pool.
pub struct PipeManager {
    // ---
    backend_pool: Arc<BackendPool>,

    /// Active client ids mapped to their pipe id. One pipe per client.
    client_pipes: Mutex<HashMap<Uuid, Uuid>>,

    /// Staging buffer ceiling handed to every pipe.
    interrupt_memory_limit: usize,

    back_off: Mutex<Option<BackOffStrategyFn>>,
}

// ---

impl PipeManager {
    // ---

    /// Create a manager around an existing pool.
    pub fn new(backend_pool: Arc<BackendPool>, interrupt_memory_limit_per_conn_in_bytes: usize) -> Self {
        // ---
        Self {
            backend_pool,
            client_pipes: Mutex::new(HashMap::new()),
            interrupt_memory_limit: interrupt_memory_limit_per_conn_in_bytes,
            back_off: Mutex::new(None),
        }
    }

    // ---

    /// Create a manager with its own pool built from `config`.
    pub fn from_config(config: &ProxyConfig, dialer: BackendDialerPtr) -> Self {
        // ---
        let pool = Arc::new(BackendPool::from_config(config, dialer));
        Self::new(pool, config.interrupt_memory_limit_per_conn_in_bytes)
    }

    // ---

    /// Register a backend URL with the pool.
    ///
    /// The URL's format is not validated here — an undialable URL only adds
    /// delay to fresh connection fetches until the pool evicts it.
    pub async fn add_connection_to_pool(&self, url: &str) -> Result<()> {
        self.backend_pool.add_to_pool(url).await
    }

    // ---

    /// Install a backoff policy consulted between unsuccessful pool
    /// acquisitions on the substitution path.
    pub async fn set_back_off_strategy_fn(&self, back_off: BackOffStrategyFn) {
        *self.back_off.lock().await = Some(back_off);
    }

    // ---

    /// Number of currently active pipes.
    pub async fn active_pipe_count(&self) -> usize {
        self.client_pipes.lock().await.len()
    }

    /// Whether `client_id` currently has an active pipe.
    pub async fn has_active_pipe(&self, client_id: Uuid) -> bool {
        self.client_pipes.lock().await.contains_key(&client_id)
    }

    // ---

    /// Bridge `client` to a pooled backend until the client side ends.
    ///
    /// Blocks for the lifetime of the session. Returns `Ok(())` when the
    /// client closed cleanly; otherwise the pipe's terminal error. A second
    /// call for an active client id fails immediately without consuming a
    /// backend.
    pub async fn create_pipe(&self, client_id: Uuid, client: ByteStreamPtr) -> Result<()> {
        // ---
        {
            let mut pipes = self.client_pipes.lock().await;
            if pipes.contains_key(&client_id) {
                return Err(LimpetError::DuplicateClient(client_id));
            }
            // Reserved now, stamped with the real pipe id once it exists.
            pipes.insert(client_id, Uuid::nil());
        }

        let result = self.run_pipe(client_id, client).await;
        self.client_pipes.lock().await.remove(&client_id);

        match &result {
            Ok(()) => tracing::info!(%client_id, "pipe ended: client closed"),
            Err(e) => tracing::warn!(%client_id, "pipe ended with error: {e}"),
        }
        result
    }

    // ---

    async fn run_pipe(&self, client_id: Uuid, client: ByteStreamPtr) -> Result<()> {
        // ---
        let mut entry = self.backend_pool.get_conn().await?;
        tracing::info!(%client_id, backend = %entry.url(), "backend assigned");

        let backend_stream = entry.take_stream().ok_or(LimpetError::MissingStream)?;
        let (mut pipe, mut events) = PersistentPipe::new(
            client_id,
            client,
            backend_stream,
            self.interrupt_memory_limit,
        );
        self.client_pipes.lock().await.insert(client_id, pipe.id());

        if let Err(e) = pipe.stream() {
            self.backend_pool.release(entry).await;
            return Err(e);
        }

        let result = loop {
            let Some(event) = events.recv().await else {
                // Copy tasks exited without a terminal event; only possible
                // when the pipe is torn down externally.
                break Ok(());
            };

            match event {
                PipeEvent::BackendFailed { cause } => {
                    tracing::warn!(
                        %client_id,
                        backend = %entry.url(),
                        "backend failed ({cause}), substituting from pool",
                    );
                    self.backend_pool.mark_error(entry).await;

                    let mut fresh = self.acquire_for_substitution().await;
                    tracing::info!(%client_id, backend = %fresh.url(), "substituted backend");

                    let stream = match fresh.take_stream() {
                        Some(stream) => stream,
                        None => {
                            entry = fresh;
                            break Err(LimpetError::MissingStream);
                        }
                    };
                    pipe.swap_backend(stream).await;
                    entry = fresh;
                }
                PipeEvent::BufferOverflow => {
                    break Err(LimpetError::BufferOverflow {
                        limit: self.interrupt_memory_limit,
                    });
                }
                PipeEvent::ClientClosed => break Ok(()),
                PipeEvent::ClientFailed { cause } => break Err(LimpetError::Client(cause)),
            }
        };

        // The entry's connection died with the pipe; hand the slot back.
        self.backend_pool.release(entry).await;
        result
    }

    // ---

    /// Acquire a replacement backend for a substitution, retrying forever.
    ///
    /// `get_conn` only fails when the pool has an acquire cap; between
    /// failures the installed backoff strategy (or a fixed one-second wait)
    /// paces the retries.
    async fn acquire_for_substitution(&self) -> BackendEntry {
        // ---
        let mut attempt: u64 = 0;
        loop {
            match self.backend_pool.get_conn().await {
                Ok(entry) => return entry,
                Err(e) => {
                    tracing::warn!(attempt, "unable to get a replacement backend: {e}");
                    let delay = self
                        .back_off
                        .lock()
                        .await
                        .as_ref()
                        .map(|f| f(attempt))
                        .unwrap_or(DEFAULT_SUBSTITUTION_RETRY_DELAY);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
