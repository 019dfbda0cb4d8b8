//! [`BackendPool`] — registry and lifecycle of backend endpoints.
//!
//! A backend URL moves through four locations, owned by exactly one at a
//! time:
//!
//! ```text
//! add_to_pool      idle-filler        get_conn          mark_error
//!     │                │                 │                  │
//!     ▼                ▼                 ▼                  ▼
//! [available] ────► [idle] ──────► [in-use] ─────────► [errored]
//!                     ▲                                     │
//!                     └──── errored-refresher ──────────────┘
//!                           (or permanent drop at the error threshold)
//! ```
//!
//! Entries in *idle* may or may not hold a live connection; `get_conn` dials
//! lazily on hand-out and the refresher clears a recycled entry's connection
//! so the next hand-out redials. Dial failures never surface to callers —
//! the failing entry is quarantined and the hand-out loop retries.
//!
//! The two maintenance tasks are spawned at construction and scoped to the
//! pool: [`BackendPool::shutdown`] (or drop) aborts them so tests and
//! embedders can reclaim resources.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

// ---

use limpet_domain::{BackendDialerPtr, ByteStreamPtr, LimpetError, Result};

// ---

use super::ProxyConfig;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Cadence of the idle-filler and errored-refresher when they have nothing
/// to do (or the idle queue is over its bound).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(2);

/// Exponent cap for the hand-out backoff: waits grow 1 s, 2 s, 4 s … up to
/// `2^MAX_BACKOFF_EXPONENT` seconds and stay there.
const MAX_BACKOFF_EXPONENT: u32 = 5;

// ---------------------------------------------------------------------------
// BackendEntry
// ---------------------------------------------------------------------------

/// One registered backend endpoint.
///
/// Handed out exclusively by [`BackendPool::get_conn`]; the holder takes the
/// live stream for its pipe and keeps the entry as the receipt it gives back
/// through [`BackendPool::mark_error`] or [`BackendPool::release`]. Because
/// the entry moves by value, a backend can never be reported errored twice
/// for the same hand-out.
pub struct BackendEntry {
    // ---
    url: String,

    /// Live connection. `None` while idle-but-undialed, or after the
    /// refresher clears a recycled entry to force a redial.
    stream: Option<ByteStreamPtr>,

    /// Cumulative error count. Monotonic; never reset by recycling.
    error_count: u64,

    last_error_at: Option<Instant>,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("url", &self.url)
            .field("has_stream", &self.stream.is_some())
            .field("error_count", &self.error_count)
            .field("last_error_at", &self.last_error_at)
            .finish()
    }
}

// ---

impl BackendEntry {
    // ---

    fn undialed(url: String) -> Self {
        // ---
        Self {
            url,
            stream: None,
            error_count: 0,
            last_error_at: None,
        }
    }

    // ---

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn last_error_at(&self) -> Option<Instant> {
        self.last_error_at
    }

    // ---

    /// Take the live stream for use in a pipe. `get_conn` guarantees this is
    /// `Some` on a freshly handed-out entry.
    pub fn take_stream(&mut self) -> Option<ByteStreamPtr> {
        self.stream.take()
    }
}

// ---------------------------------------------------------------------------
// PoolShared
// ---------------------------------------------------------------------------

struct PoolShared {
    // ---
    /// Newly registered URLs, not yet promoted to the idle queue.
    available: Mutex<VecDeque<String>>,

    /// Every URL ever registered, for duplicate rejection.
    registered: Mutex<HashSet<String>>,

    /// Entries ready for hand-out, strictly FIFO.
    idle: Mutex<VecDeque<BackendEntry>>,

    /// URLs currently handed out, each to exactly one holder.
    in_use: Mutex<HashSet<String>>,

    /// Entries quarantined after an error, awaiting recycling or drop.
    errored: Mutex<VecDeque<BackendEntry>>,

    /// Net count of filler promotions minus hand-outs. The filler throttles
    /// on this; recycling does not re-increment it.
    idle_count: AtomicI64,

    dialer: BackendDialerPtr,
    max_idle_connections: i64,
    max_allowed_error_count: u64,
    max_acquire_wait: Option<Duration>,
}

// ---

impl PoolShared {
    // ---

    async fn mark_error(&self, mut entry: BackendEntry) {
        // ---
        self.in_use.lock().await.remove(&entry.url);
        entry.last_error_at = Some(Instant::now());
        entry.error_count += 1;
        tracing::debug!(
            url = %entry.url,
            error_count = entry.error_count,
            "backend quarantined after error",
        );
        self.errored.lock().await.push_back(entry);
    }
}

// ---------------------------------------------------------------------------
// BackendPool
// ---------------------------------------------------------------------------

/// Tracks registered backend URLs and hands out at most one exclusive
/// connection per URL at a time.
pub struct BackendPool {
    // ---
    shared: Arc<PoolShared>,

    /// Maintenance task handles, aborted on shutdown/drop.
    tasks: Vec<JoinHandle<()>>,
}

// ---

impl BackendPool {
    // ---

    /// Create a pool with explicit bounds and spawn its maintenance tasks.
    pub fn new(
        max_idle_connections: i64,
        max_allowed_error_count: u64,
        dialer: BackendDialerPtr,
    ) -> Self {
        // ---
        let config = ProxyConfig {
            max_idle_connections,
            max_allowed_error_count,
            ..Default::default()
        };
        Self::from_config(&config, dialer)
    }

    // ---

    /// Create a pool from a [`ProxyConfig`] and spawn its maintenance tasks.
    pub fn from_config(config: &ProxyConfig, dialer: BackendDialerPtr) -> Self {
        // ---
        let shared = Arc::new(PoolShared {
            available: Mutex::new(VecDeque::new()),
            registered: Mutex::new(HashSet::new()),
            idle: Mutex::new(VecDeque::new()),
            in_use: Mutex::new(HashSet::new()),
            errored: Mutex::new(VecDeque::new()),
            idle_count: AtomicI64::new(0),
            dialer,
            max_idle_connections: config.max_idle_connections,
            max_allowed_error_count: config.max_allowed_error_count,
            max_acquire_wait: config.max_acquire_wait,
        });

        let tasks = vec![
            tokio::spawn(run_idle_filler(Arc::clone(&shared))),
            tokio::spawn(run_errored_refresher(Arc::clone(&shared))),
        ];

        Self { shared, tasks }
    }

    // ---

    /// Register a backend URL with the pool.
    ///
    /// The URL's validity is not checked here; an undialable URL costs a
    /// quarantine round-trip on every hand-out attempt until it is evicted.
    pub async fn add_to_pool(&self, url: &str) -> Result<()> {
        // ---
        let mut registered = self.shared.registered.lock().await;
        if !registered.insert(url.to_string()) {
            return Err(LimpetError::AlreadyRegistered(url.to_string()));
        }
        self.shared
            .available
            .lock()
            .await
            .push_back(url.to_string());
        tracing::debug!(%url, "backend registered with pool");
        Ok(())
    }

    // ---

    /// Obtain an exclusive backend connection.
    ///
    /// Blocks until an idle entry can be dialed (or already holds a live
    /// connection). The returned entry always carries a live stream. On an
    /// empty idle queue the call backs off exponentially; with
    /// `max_acquire_wait` configured the accumulated wait is capped and
    /// [`LimpetError::NoBackendAvailable`] is returned instead of blocking
    /// forever.
    ///
    /// The entry is marked in-use the moment this returns — defer calling
    /// until the connection is actually needed.
    pub async fn get_conn(&self) -> Result<BackendEntry> {
        // ---
        let shared = &self.shared;
        let mut attempt: u32 = 0;
        let mut waited = Duration::ZERO;

        loop {
            let entry = shared.idle.lock().await.pop_front();
            let Some(mut entry) = entry else {
                tracing::debug!("no idle backend available, backing off");
                if let Some(cap) = shared.max_acquire_wait {
                    if waited >= cap {
                        return Err(LimpetError::NoBackendAvailable(cap));
                    }
                }
                waited += back_off_wait(&mut attempt).await;
                continue;
            };

            if entry.stream.is_none() {
                match shared.dialer.dial(&entry.url).await {
                    Ok(stream) => entry.stream = Some(stream),
                    Err(e) => {
                        tracing::error!(url = %entry.url, "dial of idle backend failed: {e}");
                        shared.mark_error(entry).await;
                        continue;
                    }
                }
            }

            shared.idle_count.fetch_sub(1, Ordering::AcqRel);
            shared.in_use.lock().await.insert(entry.url.clone());
            tracing::debug!(url = %entry.url, "backend handed out");
            return Ok(entry);
        }
    }

    // ---

    /// Report that the entry's connection has failed.
    ///
    /// Removes the URL from the in-use set, stamps the error, and quarantines
    /// the entry for the refresher to recycle or drop.
    pub async fn mark_error(&self, entry: BackendEntry) {
        self.shared.mark_error(entry).await;
    }

    // ---

    /// Return a handed-out entry whose connection is no longer usable but
    /// did not fail — typically because its pipe ended with the client.
    ///
    /// The entry goes straight back to the idle queue undialed, without
    /// touching its error history, so the URL rejoins the fleet immediately.
    pub async fn release(&self, mut entry: BackendEntry) {
        // ---
        entry.stream = None;
        self.shared.in_use.lock().await.remove(&entry.url);
        self.shared.idle_count.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(url = %entry.url, "backend released back to idle");
        self.shared.idle.lock().await.push_back(entry);
    }

    // ---

    /// Abort the maintenance tasks. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        // ---
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---

impl Drop for BackendPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Maintenance tasks
// ---------------------------------------------------------------------------

/// Promote registered URLs into the idle queue as undialed entries, pausing
/// while the idle count sits above the configured bound.
async fn run_idle_filler(shared: Arc<PoolShared>) {
    // ---
    loop {
        if shared.idle_count.load(Ordering::Acquire) > shared.max_idle_connections {
            sleep(MAINTENANCE_INTERVAL).await;
            continue;
        }

        let url = shared.available.lock().await.pop_front();
        let Some(url) = url else {
            sleep(MAINTENANCE_INTERVAL).await;
            continue;
        };

        shared.idle_count.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(%url, "registered url promoted to idle queue");
        shared
            .idle
            .lock()
            .await
            .push_back(BackendEntry::undialed(url));
    }
}

// ---

/// Drain the quarantine queue: recycle entries still under the error
/// threshold (cleared so the next hand-out redials), drop the rest for good.
async fn run_errored_refresher(shared: Arc<PoolShared>) {
    // ---
    loop {
        let entry = shared.errored.lock().await.pop_front();
        let Some(mut entry) = entry else {
            sleep(MAINTENANCE_INTERVAL).await;
            continue;
        };

        if entry.error_count < shared.max_allowed_error_count {
            entry.stream = None;
            tracing::debug!(
                url = %entry.url,
                error_count = entry.error_count,
                "errored backend recycled to idle queue",
            );
            shared.idle.lock().await.push_back(entry);
        } else {
            tracing::warn!(
                url = %entry.url,
                error_count = entry.error_count,
                "de-registering backend: reached max error count",
            );
        }
    }
}

// ---

/// Sleep `2^min(attempt, MAX_BACKOFF_EXPONENT)` seconds, bump the attempt
/// counter, and report the time slept.
async fn back_off_wait(attempt: &mut u32) -> Duration {
    // ---
    let exponent = (*attempt).min(MAX_BACKOFF_EXPONENT);
    let delay = Duration::from_secs(1u64 << exponent);
    sleep(delay).await;
    *attempt += 1;
    delay
}

// ---------------------------------------------------------------------------
// Test introspection
// ---------------------------------------------------------------------------

#[cfg(test)]
impl BackendPool {
    // ---

    async fn available_len(&self) -> usize {
        self.shared.available.lock().await.len()
    }

    async fn idle_len(&self) -> usize {
        self.shared.idle.lock().await.len()
    }

    async fn errored_len(&self) -> usize {
        self.shared.errored.lock().await.len()
    }

    async fn in_use_contains(&self, url: &str) -> bool {
        self.shared.in_use.lock().await.contains(url)
    }

    fn idle_count(&self) -> i64 {
        self.shared.idle_count.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use limpet_link_sim::SimBackendHub;
    use tokio::time::timeout;

    use super::{BackendPool, ProxyConfig};
    use limpet_domain::LimpetError;

    // ---

    /// A URL registers exactly once; the second attempt is rejected.
    #[tokio::test]
    async fn url_registers_exactly_once() {
        // ---
        let hub = SimBackendHub::new();
        let pool = BackendPool::new(5, 100, hub.dialer());

        pool.add_to_pool("ws://localhost:8081")
            .await
            .expect("first registration failed");
        let err = pool
            .add_to_pool("ws://localhost:8081")
            .await
            .expect_err("duplicate registration should fail");
        assert!(matches!(err, LimpetError::AlreadyRegistered(_)));
    }

    // ---

    /// Registering a URL then asking for a connection yields that URL,
    /// dialed and recorded in the in-use set.
    #[tokio::test(start_paused = true)]
    async fn get_conn_hands_out_registered_backend() {
        // ---
        let hub = SimBackendHub::new();
        let pool = BackendPool::new(5, 1, hub.dialer());
        let url = "ws://localhost:8081";

        pool.add_to_pool(url).await.expect("registration failed");
        assert!(!pool.in_use_contains(url).await);

        let mut entry = pool.get_conn().await.expect("get_conn failed");
        assert_eq!(entry.url(), url);
        assert!(entry.take_stream().is_some(), "hand-out must carry a live stream");
        assert!(pool.in_use_contains(url).await);
        assert_eq!(hub.dial_count(url).await, 1);
    }

    // ---

    /// Hand-out follows registration order, strictly FIFO.
    #[tokio::test(start_paused = true)]
    async fn hand_out_is_fifo() {
        // ---
        let hub = SimBackendHub::new();
        let pool = BackendPool::new(5, 100, hub.dialer());
        pool.add_to_pool("ws://b1").await.expect("add failed");
        pool.add_to_pool("ws://b2").await.expect("add failed");

        let first = pool.get_conn().await.expect("get_conn failed");
        let second = pool.get_conn().await.expect("get_conn failed");
        assert_eq!(first.url(), "ws://b1");
        assert_eq!(second.url(), "ws://b2");
    }

    // ---

    /// mark_error stamps the entry and the refresher recycles it: the next
    /// hand-out redials the same URL.
    #[tokio::test(start_paused = true)]
    async fn errored_backend_is_recycled_and_redialed() {
        // ---
        let hub = SimBackendHub::new();
        let pool = BackendPool::new(5, 100, hub.dialer());
        let url = "ws://localhost:8082";
        pool.add_to_pool(url).await.expect("registration failed");

        let entry = pool.get_conn().await.expect("get_conn failed");
        pool.mark_error(entry).await;
        assert!(!pool.in_use_contains(url).await);

        let entry = pool.get_conn().await.expect("get_conn after recycle failed");
        assert_eq!(entry.url(), url);
        assert_eq!(entry.error_count(), 1);
        assert!(entry.last_error_at().is_some());
        assert_eq!(hub.dial_count(url).await, 2, "recycled entry must redial");
    }

    // ---

    /// Reaching the error threshold evicts the URL from the fleet for good:
    /// it sits in no queue and further get_conn calls never return it.
    #[tokio::test(start_paused = true)]
    async fn backend_at_error_threshold_is_evicted() {
        // ---
        let hub = SimBackendHub::new();
        let pool = BackendPool::new(5, 2, hub.dialer());
        let url = "ws://bx";
        pool.add_to_pool(url).await.expect("registration failed");

        let entry = pool.get_conn().await.expect("get_conn failed");
        pool.mark_error(entry).await;
        let entry = pool.get_conn().await.expect("get_conn failed");
        pool.mark_error(entry).await;

        let starved = timeout(Duration::from_secs(4), pool.get_conn()).await;
        assert!(starved.is_err(), "evicted fleet must leave get_conn blocked");

        assert_eq!(pool.available_len().await, 0);
        assert_eq!(pool.idle_len().await, 0);
        assert_eq!(pool.errored_len().await, 0);
        assert!(!pool.in_use_contains(url).await);
        // Hand-out decrements the idle count; recycling does not re-increment.
        assert_eq!(pool.idle_count(), -1);
    }

    // ---

    /// Dial failures stay internal: the bad URL is quarantined and the next
    /// registered backend is handed out instead.
    #[tokio::test(start_paused = true)]
    async fn dial_failure_quarantines_and_retries() {
        // ---
        let hub = SimBackendHub::new();
        let pool = BackendPool::new(5, 100, hub.dialer());
        hub.set_unreachable("ws://down", true).await;
        pool.add_to_pool("ws://down").await.expect("add failed");
        pool.add_to_pool("ws://up").await.expect("add failed");

        let entry = pool.get_conn().await.expect("get_conn failed");
        assert_eq!(entry.url(), "ws://up");
        assert_eq!(pool.errored_len().await, 1);
    }

    // ---

    /// With max_acquire_wait configured, an empty pool reports
    /// NoBackendAvailable instead of blocking forever.
    #[tokio::test(start_paused = true)]
    async fn empty_pool_respects_acquire_cap() {
        // ---
        let hub = SimBackendHub::new();
        let config = ProxyConfig {
            max_acquire_wait: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let pool = BackendPool::from_config(&config, hub.dialer());

        let err = pool.get_conn().await.expect_err("must not block forever");
        assert!(matches!(err, LimpetError::NoBackendAvailable(_)));
    }

    // ---

    /// A released entry rejoins the idle queue with its history intact and
    /// is redialed on the next hand-out.
    #[tokio::test(start_paused = true)]
    async fn released_backend_rejoins_idle_queue() {
        // ---
        let hub = SimBackendHub::new();
        let pool = BackendPool::new(5, 100, hub.dialer());
        let url = "ws://localhost:8083";
        pool.add_to_pool(url).await.expect("registration failed");

        let entry = pool.get_conn().await.expect("get_conn failed");
        pool.release(entry).await;
        assert!(!pool.in_use_contains(url).await);
        assert_eq!(pool.idle_len().await, 1);

        let entry = pool.get_conn().await.expect("get_conn after release failed");
        assert_eq!(entry.url(), url);
        assert_eq!(entry.error_count(), 0);
        assert_eq!(hub.dial_count(url).await, 2);
    }
}
