use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::Result;

// ---------------------------------------------------------------------------
// ByteStream
// ---------------------------------------------------------------------------

/// A bidirectional, frame-oblivious byte stream.
///
/// The bridging core is byte-opaque: it never parses WebSocket frames, it
/// only moves bytes between two of these. Anything that reads and writes
/// bytes qualifies — a WebSocket adapter, a raw TCP socket, or an in-process
/// channel pair from `limpet-link-sim`.
///
/// Implemented blanket-style so transport crates never have to name this
/// trait; satisfying the tokio I/O bounds is enough.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

// ---

/// Convenience type alias for a heap-allocated [`ByteStream`].
pub type ByteStreamPtr = Box<dyn ByteStream>;

/// Convenience type alias for a shared [`BackendDialer`].
pub type BackendDialerPtr = Arc<dyn BackendDialer>;

// ---------------------------------------------------------------------------
// BackendDialer
// ---------------------------------------------------------------------------

/// Factory trait for establishing backend connections from a URL.
///
/// The pool treats URLs as opaque strings; the dialer decides what they
/// mean. Dial failures are never surfaced to pipe consumers — the pool
/// quarantines the failing entry and retries another.
///
/// Implementations: `limpet_websocket::WsDialer`,
/// `limpet_link_sim::SimDialer`.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    // ---
    /// Connect to `url` and return a live byte stream, or a dial error.
    async fn dial(&self, url: &str) -> Result<ByteStreamPtr>;
}
