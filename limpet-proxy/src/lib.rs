//! The limpet bridging core: backend pool, persistent pipes, pipe manager.
//!
//! A long-lived client byte stream is bridged to a backend drawn from a
//! pool. When the backend fails, the manager quarantines it, acquires a
//! replacement, and swaps it under the running copy loops while
//! client → backend bytes are staged in memory — the client never observes
//! the interruption, provided a replacement arrives before the staging
//! buffer fills.
//!
//! This crate is transport-agnostic: it consumes
//! [`limpet_domain::ByteStreamPtr`] streams and a
//! [`limpet_domain::BackendDialer`]. The WebSocket front door lives in
//! `limpet-websocket`; `limpet-link-sim` provides in-process streams for
//! tests.
//!
//! # Structure
//!
//! - [`backend_pool`] — [`BackendPool`], [`BackendEntry`]
//! - [`pipe`]         — [`PersistentPipe`], [`PipeEvent`]
//! - [`manager`]      — [`PipeManager`], [`BackOffStrategyFn`]
//! - [`config`]       — [`ProxyConfig`] and defaults

mod backend_pool;
mod config;
mod manager;
mod pipe;

// --- backend_pool
pub use backend_pool::{BackendEntry, BackendPool};

// --- config
pub use config::{
    // ---
    ProxyConfig,
    DEFAULT_INTERRUPT_MEMORY_LIMIT_PER_CONN_IN_BYTES,
    DEFAULT_MAX_ALLOWED_ERROR_COUNT,
    DEFAULT_MAX_IDLE_CONNECTIONS,
};

// --- manager
pub use manager::{BackOffStrategyFn, PipeManager};

// --- pipe
pub use pipe::{PersistentPipe, PipeEvent};
