//! [`ProxyServer`] — the WebSocket front door.
//!
//! Accepts client upgrades, extracts a client id from the request path, and
//! blocks one task per connection inside
//! [`limpet_proxy::PipeManager::create_pipe`] until the session ends. The
//! bridging core never sees WebSocket framing; each accepted connection is
//! wrapped in a [`WsByteStream`] first.

use std::sync::Arc;

// ---

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use uuid::Uuid;

// ---

use limpet_domain::{ByteStreamPtr, LimpetError, Result};
use limpet_proxy::{PipeManager, ProxyConfig};

// ---

use super::{WsByteStream, WsDialer};

// ---------------------------------------------------------------------------
// ClientIdExtractFn
// ---------------------------------------------------------------------------

/// Produces the 128-bit client identifier from an accepted request's path.
///
/// The default, [`default_client_id_extractor`], parses the path component
/// (leading slash stripped) as the id's canonical textual form. Install a
/// custom one via [`ServerConfig::client_id_extractor`] to source the id
/// from somewhere else.
pub type ClientIdExtractFn = Arc<dyn Fn(&str) -> Result<Uuid> + Send + Sync>;

// ---

/// Parse the request path (minus its leading `/`) as a UUID.
pub fn default_client_id_extractor(path: &str) -> Result<Uuid> {
    // ---
    let raw = path.trim_start_matches('/');
    Uuid::parse_str(raw)
        .map_err(|e| LimpetError::Client(format!("invalid client id in path {path:?}: {e}")))
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Configuration for the proxy front door.
#[derive(Clone)]
pub struct ServerConfig {
    // ---
    /// Pool and pipe knobs, passed through to the bridging core.
    pub proxy: ProxyConfig,

    /// Client id extraction override. `None` uses
    /// [`default_client_id_extractor`].
    pub client_id_extractor: Option<ClientIdExtractFn>,
}

// ---

impl Default for ServerConfig {
    // ---
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            client_id_extractor: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProxyServer
// ---------------------------------------------------------------------------

/// Accept loop plus per-connection glue around a [`PipeManager`].
///
/// ```rust,no_run
/// use limpet_websocket::{ProxyServer, ServerConfig};
///
/// # async fn demo() -> limpet_domain::Result<()> {
/// let server = std::sync::Arc::new(ProxyServer::new(ServerConfig::default()));
/// server.manager().add_connection_to_pool("ws://10.0.0.7:9001").await?;
///
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
/// server.run(listener).await
/// # }
/// ```
pub struct ProxyServer {
    // ---
    manager: Arc<PipeManager>,
    extractor: ClientIdExtractFn,
}

// ---

impl ProxyServer {
    // ---

    /// Build a server with its own manager and pool dialing real WebSocket
    /// backends.
    pub fn new(config: ServerConfig) -> Self {
        // ---
        let manager = Arc::new(PipeManager::from_config(&config.proxy, Arc::new(WsDialer)));
        Self::with_manager(manager, config.client_id_extractor)
    }

    // ---

    /// Build a server around an existing manager — embedders that share a
    /// pool, or tests that dial simulated backends.
    pub fn with_manager(manager: Arc<PipeManager>, extractor: Option<ClientIdExtractFn>) -> Self {
        // ---
        Self {
            manager,
            extractor: extractor.unwrap_or_else(|| Arc::new(default_client_id_extractor)),
        }
    }

    // ---

    /// The underlying pipe manager, for registering backends.
    pub fn manager(&self) -> Arc<PipeManager> {
        Arc::clone(&self.manager)
    }

    // ---

    /// Accept client connections forever, one spawned session per client.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        // ---
        loop {
            let (tcp, addr) = listener.accept().await?;
            tracing::debug!(%addr, "client connected");

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(tcp).await {
                    tracing::warn!(%addr, "client session ended with error: {e}");
                }
            });
        }
    }

    // ---

    /// Upgrade one client connection and run its pipe to completion.
    async fn handle_connection(&self, tcp: TcpStream) -> Result<()> {
        // ---
        let mut path = None;
        let ws = accept_hdr_async(tcp, |req: &Request, resp: Response| {
            path = Some(req.uri().path().to_string());
            Ok(resp)
        })
        .await
        .map_err(|e| LimpetError::Client(format!("websocket upgrade failed: {e}")))?;

        let path = path.unwrap_or_default();
        let client_id = (self.extractor)(&path)?;
        tracing::info!(%client_id, "starting persistent pipe");

        let stream: ByteStreamPtr = Box::new(WsByteStream::new(ws));
        self.manager.create_pipe(client_id, stream).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;

    use futures_util::{SinkExt, StreamExt};
    use limpet_link_sim::SimBackendHub;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::Message;
    use uuid::Uuid;

    use super::{default_client_id_extractor, ProxyServer};
    use limpet_proxy::{PipeManager, ProxyConfig};

    // ---

    /// The default extractor parses the path as a UUID and rejects garbage.
    #[test]
    fn path_extraction_parses_uuids() {
        // ---
        let id = default_client_id_extractor("/098d8a97-3615-4eb8-b803-c57c01c7536c")
            .expect("valid uuid path");
        assert_eq!(
            id,
            Uuid::parse_str("098d8a97-3615-4eb8-b803-c57c01c7536c").expect("literal uuid")
        );

        assert!(default_client_id_extractor("/not-a-uuid").is_err());
        assert!(default_client_id_extractor("/").is_err());
    }

    // ---

    /// Full front-door path: a real WebSocket client upgrades against the
    /// accept loop and its frames bridge to a simulated backend and back.
    #[tokio::test]
    async fn accepts_and_bridges_a_websocket_client() {
        // ---
        let hub = SimBackendHub::new();
        let manager = Arc::new(PipeManager::from_config(
            &ProxyConfig::default(),
            hub.dialer(),
        ));
        manager
            .add_connection_to_pool("ws://b1")
            .await
            .expect("registration failed");

        let server = Arc::new(ProxyServer::with_manager(Arc::clone(&manager), None));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");
        tokio::spawn(Arc::clone(&server).run(listener));

        let client_id = Uuid::new_v4();
        let (mut client, _) = connect_async(format!("ws://{addr}/{client_id}"))
            .await
            .expect("connect failed");

        let mut b1 = hub.accept("ws://b1").await;

        client
            .send(Message::binary(b"hello".to_vec()))
            .await
            .expect("send failed");
        let chunk = b1.recv_chunk().await.expect("backend recv failed");
        assert_eq!(chunk.as_deref(), Some(&b"hello"[..]));

        b1.send(b"world").await.expect("backend send failed");
        let reply = loop {
            match client.next().await.expect("client stream ended") {
                Ok(Message::Binary(data)) => break data,
                Ok(_) => continue,
                Err(e) => panic!("client read failed: {e}"),
            }
        };
        assert_eq!(&reply[..], b"world");

        client.close(None).await.expect("close failed");
    }

    // ---

    /// A connection with a non-UUID path is refused without a pipe.
    #[tokio::test]
    async fn garbage_path_never_reaches_the_manager() {
        // ---
        let hub = SimBackendHub::new();
        let manager = Arc::new(PipeManager::from_config(
            &ProxyConfig::default(),
            hub.dialer(),
        ));
        manager
            .add_connection_to_pool("ws://b1")
            .await
            .expect("registration failed");

        let server = Arc::new(ProxyServer::with_manager(Arc::clone(&manager), None));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");
        tokio::spawn(Arc::clone(&server).run(listener));

        // The upgrade itself succeeds; the session dies on id extraction.
        let (mut client, _) = connect_async(format!("ws://{addr}/not-a-uuid"))
            .await
            .expect("connect failed");
        // Server side drops the connection; the client sees the stream end.
        while let Some(msg) = client.next().await {
            if msg.is_err() {
                break;
            }
        }
        assert_eq!(manager.active_pipe_count().await, 0);
        assert_eq!(hub.dial_count("ws://b1").await, 0);
    }
}
