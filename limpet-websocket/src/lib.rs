//! WebSocket transport for the limpet proxy, built on tokio-tungstenite.
//!
//! The bridging core is byte-opaque; this crate is where WebSocket framing
//! begins and ends:
//!
//! - [`WsByteStream`] adapts a `WebSocketStream` to the plain byte-stream
//!   contract the core consumes (writes become binary frames, frame
//!   payloads concatenate into the read side).
//! - [`WsDialer`] dials backend URLs for the pool, setting the `Origin`
//!   header derived from each URL's host.
//! - [`ProxyServer`] is the front door: it accepts client WebSocket
//!   upgrades, extracts the client id from the request path, and hands the
//!   connection to the pipe manager.

mod dialer;
mod server;
mod stream;

// --- dialer
pub use dialer::WsDialer;

// --- server
pub use server::{default_client_id_extractor, ClientIdExtractFn, ProxyServer, ServerConfig};

// --- stream
pub use stream::WsByteStream;
