//! [`WsDialer`] — backend dial contract over tokio-tungstenite.

use async_trait::async_trait;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;

// ---

use limpet_domain::{BackendDialer, ByteStreamPtr, LimpetError, Result};

// ---

use super::WsByteStream;

// ---------------------------------------------------------------------------
// WsDialer
// ---------------------------------------------------------------------------

/// Dials backend WebSocket URLs for the pool.
///
/// The `Origin` header is derived from the URL's host, mirroring what a
/// browser-facing backend expects from a same-host client. Dial failures
/// surface as [`LimpetError::Dial`] and stay internal to the pool's retry
/// loop.
pub struct WsDialer;

// ---

#[async_trait]
impl BackendDialer for WsDialer {
    // ---
    async fn dial(&self, url: &str) -> Result<ByteStreamPtr> {
        // ---
        let mut request = url
            .into_client_request()
            .map_err(|e| LimpetError::Dial(format!("{url}: {e}")))?;

        if let Some(origin) = derive_origin(request.uri()) {
            let value = HeaderValue::from_str(&origin)
                .map_err(|e| LimpetError::Dial(format!("{url}: bad origin: {e}")))?;
            request.headers_mut().insert(ORIGIN, value);
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| LimpetError::Dial(format!("{url}: {e}")))?;

        tracing::debug!(%url, "backend dialed");
        Ok(Box::new(WsByteStream::new(ws)))
    }
}

// ---

/// `ws://host[:port]/…` → `http://host[:port]`, `wss` → `https`.
fn derive_origin(uri: &tokio_tungstenite::tungstenite::http::Uri) -> Option<String> {
    // ---
    let host = uri.host()?;
    let scheme = match uri.scheme_str() {
        Some("wss") => "https",
        _ => "http",
    };
    Some(match uri.port_u16() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    use super::{derive_origin, WsDialer};
    use crate::WsByteStream;
    use limpet_domain::BackendDialer;

    // ---

    /// derive_origin maps ws/wss URLs onto http/https origins.
    #[test]
    fn origin_follows_the_url_host() {
        // ---
        let uri: tokio_tungstenite::tungstenite::http::Uri =
            "ws://backend.example:9001/session".parse().expect("uri");
        assert_eq!(
            derive_origin(&uri).as_deref(),
            Some("http://backend.example:9001")
        );

        let uri: tokio_tungstenite::tungstenite::http::Uri =
            "wss://backend.example/session".parse().expect("uri");
        assert_eq!(derive_origin(&uri).as_deref(), Some("https://backend.example"));
    }

    // ---

    /// A dial completes the upgrade, carries the derived Origin header, and
    /// produces a working byte stream.
    #[tokio::test]
    async fn dial_upgrades_and_sets_origin() {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");

        let seen_origin = Arc::new(Mutex::new(None::<String>));
        let recorded = Arc::clone(&seen_origin);

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept failed");
            let ws = accept_hdr_async(tcp, move |req: &Request, resp: Response| {
                *recorded.lock().expect("lock poisoned") = req
                    .headers()
                    .get("origin")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                Ok(resp)
            })
            .await
            .expect("upgrade failed");
            WsByteStream::new(ws)
        });

        let mut stream = WsDialer
            .dial(&format!("ws://{addr}"))
            .await
            .expect("dial failed");
        let mut backend = server.await.expect("server task panicked");

        assert_eq!(
            seen_origin.lock().expect("lock poisoned").as_deref(),
            Some(format!("http://{addr}").as_str())
        );

        stream.write_all(b"ping").await.expect("write failed");
        stream.flush().await.expect("flush failed");
        let mut buf = [0u8; 8];
        let n = backend.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"ping");
    }

    // ---

    /// A refused connection surfaces as a dial error.
    #[tokio::test]
    async fn refused_connection_is_a_dial_error() {
        // ---
        // Bind-then-drop to obtain a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");
        drop(listener);

        let result = WsDialer.dial(&format!("ws://{addr}")).await;
        match result {
            Err(err) => assert!(matches!(err, limpet_domain::LimpetError::Dial(_))),
            Ok(_) => panic!("dial of a dead port must fail"),
        }
    }
}
