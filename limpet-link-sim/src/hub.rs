use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

// ---

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

// ---

use limpet_domain::{BackendDialer, BackendDialerPtr, ByteStreamPtr, LimpetError, Result};

// ---

use super::SimStream;

// ---------------------------------------------------------------------------
// SimBackendHub
// ---------------------------------------------------------------------------

/// Scriptable backend fleet for tests.
///
/// The hub's [`SimDialer`] satisfies pool dials: every successful dial
/// creates a fresh [`SimStream`] pair, hands the near end to the pool, and
/// parks the far end here until the test picks it up with
/// [`SimBackendHub::accept`]. URLs marked unreachable refuse dials, which
/// exercises the pool's quarantine path.
#[derive(Clone)]
pub struct SimBackendHub {
    // ---
    inner: Arc<HubInner>,
}

// ---

struct HubInner {
    // ---
    /// Far ends of dialed connections, keyed by URL, awaiting test pickup.
    accepted: Mutex<HashMap<String, VecDeque<SimBackend>>>,

    /// URLs whose dials currently fail.
    unreachable: Mutex<HashSet<String>>,

    /// Successful dials per URL.
    dial_counts: Mutex<HashMap<String, u64>>,
}

// ---

impl SimBackendHub {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            inner: Arc::new(HubInner {
                accepted: Mutex::new(HashMap::new()),
                unreachable: Mutex::new(HashSet::new()),
                dial_counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ---

    /// A dialer backed by this hub, for handing to a pool.
    pub fn dialer(&self) -> BackendDialerPtr {
        Arc::new(SimDialer { hub: self.clone() })
    }

    // ---

    /// Block until a dial lands on `url`, then return the backend end.
    ///
    /// Polls rather than parking on a notifier so pickup order stays FIFO
    /// per URL regardless of how many accepts are outstanding.
    pub async fn accept(&self, url: &str) -> SimBackend {
        // ---
        loop {
            if let Some(backend) = self.try_accept(url).await {
                return backend;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // ---

    /// Non-blocking variant of [`SimBackendHub::accept`].
    pub async fn try_accept(&self, url: &str) -> Option<SimBackend> {
        // ---
        self.inner
            .accepted
            .lock()
            .await
            .get_mut(url)
            .and_then(VecDeque::pop_front)
    }

    // ---

    /// Make dials of `url` fail (or succeed again) from now on.
    pub async fn set_unreachable(&self, url: &str, unreachable: bool) {
        // ---
        let mut set = self.inner.unreachable.lock().await;
        if unreachable {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    // ---

    /// Number of successful dials of `url` so far.
    pub async fn dial_count(&self, url: &str) -> u64 {
        // ---
        self.inner
            .dial_counts
            .lock()
            .await
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

// ---

impl Default for SimBackendHub {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SimDialer
// ---------------------------------------------------------------------------

/// [`BackendDialer`] implementation backed by a [`SimBackendHub`].
pub struct SimDialer {
    // ---
    hub: SimBackendHub,
}

// ---

#[async_trait]
impl BackendDialer for SimDialer {
    // ---
    async fn dial(&self, url: &str) -> Result<ByteStreamPtr> {
        // ---
        if self.hub.inner.unreachable.lock().await.contains(url) {
            return Err(LimpetError::Dial(format!("{url}: connection refused")));
        }

        let (near, far) = SimStream::pair();

        let mut counts = self.hub.inner.dial_counts.lock().await;
        *counts.entry(url.to_string()).or_insert(0) += 1;
        drop(counts);

        self.hub
            .inner
            .accepted
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .push_back(SimBackend {
                url: url.to_string(),
                stream: far,
            });

        tracing::debug!(%url, "sim dial accepted");
        Ok(Box::new(near))
    }
}

// ---------------------------------------------------------------------------
// SimBackend
// ---------------------------------------------------------------------------

/// The backend-side end of one dialed connection.
///
/// A test drives this directly: read what the proxy forwarded, write the
/// backend's responses, kill the connection, or close it cleanly.
pub struct SimBackend {
    // ---
    url: String,
    stream: SimStream,
}

// ---

impl SimBackend {
    // ---

    pub fn url(&self) -> &str {
        &self.url
    }

    // ---

    /// Write backend→client bytes.
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        // ---
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    // ---

    /// Receive the next forwarded chunk, one proxy write per chunk.
    ///
    /// `Ok(None)` on clean end-of-stream.
    pub async fn recv_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.stream.recv_chunk().await
    }

    // ---

    /// Read exactly `n` forwarded bytes, ignoring chunk boundaries.
    pub async fn recv_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        // ---
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    // ---

    /// Crash the backend: the proxy side observes a connection reset.
    pub fn kill(self) {
        // ---
        tracing::debug!(url = %self.url, "sim backend killed");
        self.stream.kill();
    }

    // ---

    /// Close the backend cleanly: the proxy side observes end-of-stream.
    pub async fn close(mut self) -> io::Result<()> {
        // ---
        self.stream.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::SimBackendHub;
    use limpet_domain::BackendDialer as _;

    // ---

    /// A dial parks the far end in the hub and bridges bytes both ways.
    #[tokio::test]
    async fn dial_and_accept_bridge_bytes() {
        // ---
        let hub = SimBackendHub::new();
        let dialer = hub.dialer();

        let mut near = dialer.dial("ws://b1").await.expect("dial failed");
        let mut backend = hub.accept("ws://b1").await;
        assert_eq!(backend.url(), "ws://b1");
        assert_eq!(hub.dial_count("ws://b1").await, 1);

        near.write_all(b"ping").await.expect("write failed");
        let chunk = backend.recv_chunk().await.expect("recv failed");
        assert_eq!(chunk.as_deref(), Some(&b"ping"[..]));

        backend.send(b"pong").await.expect("send failed");
        let mut buf = [0u8; 8];
        let n = near.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"pong");
    }

    // ---

    /// Unreachable URLs refuse dials until marked reachable again.
    #[tokio::test]
    async fn unreachable_urls_refuse_dials() {
        // ---
        let hub = SimBackendHub::new();
        let dialer = hub.dialer();

        hub.set_unreachable("ws://down", true).await;
        assert!(dialer.dial("ws://down").await.is_err());
        assert_eq!(hub.dial_count("ws://down").await, 0);

        hub.set_unreachable("ws://down", false).await;
        assert!(dialer.dial("ws://down").await.is_ok());
    }
}
