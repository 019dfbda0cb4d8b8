//! In-process mock transport for limpet unit and scenario testing.
//!
//! [`SimStream`] implements the domain byte-stream contract over tokio
//! channels instead of real sockets, so pipe and pool behavior can be tested
//! without a network. [`SimBackendHub`] plays the part of a backend fleet:
//! tests register URLs, its [`SimDialer`] satisfies pool dials, and the test
//! drives each accepted backend end directly — reading what the proxy
//! forwarded, writing responses, or killing the connection to simulate a
//! backend crash.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use limpet_link_sim::{SimBackendHub, SimStream};
//!
//! # async fn demo() {
//! let hub = SimBackendHub::new();
//! let dialer = hub.dialer();
//! let (client, client_remote) = SimStream::pair();
//! // hand `client_remote` to the proxy, keep `client` as the test's end
//! let backend = hub.accept("ws://b1").await;
//! # }
//! ```

mod hub;
mod stream;

// --- public API
pub use hub::{SimBackend, SimBackendHub, SimDialer};
pub use stream::SimStream;
