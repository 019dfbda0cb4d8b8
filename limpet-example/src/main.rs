//! Limpet proxy daemon.
//!
//! Accepts client WebSocket connections and bridges each to a pooled
//! backend, substituting a fresh backend transparently when one fails.
//!
//! Usage:
//!   limpet-proxyd --listen 0.0.0.0:8080 \
//!       --backend ws://10.0.0.7:9001 --backend ws://10.0.0.8:9001
//!
//! Clients connect to `ws://<listen-addr>/<client-uuid>`; the path segment
//! is the client identifier.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

// ---

use limpet_proxy::{ProxyConfig, DEFAULT_INTERRUPT_MEMORY_LIMIT_PER_CONN_IN_BYTES};
use limpet_websocket::{ProxyServer, ServerConfig};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "limpet-proxyd", about = "Interruption-transparent WebSocket proxy")]
struct Config {
    // ---
    /// TCP address to accept client WebSocket connections on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Backend WebSocket URL. Repeat for each backend in the fleet.
    #[arg(long = "backend", required = true)]
    backends: Vec<String>,

    /// Upper bound on the pool's idle queue.
    #[arg(long, default_value_t = limpet_proxy::DEFAULT_MAX_IDLE_CONNECTIONS)]
    max_idle_connections: i64,

    /// Errors per backend before it is dropped from the fleet for good.
    #[arg(long, default_value_t = limpet_proxy::DEFAULT_MAX_ALLOWED_ERROR_COUNT)]
    max_allowed_error_count: u64,

    /// Per-client ceiling for bytes buffered in memory while that client's
    /// backend is being replaced. Sessions exceeding it are dropped.
    #[arg(long, default_value_t = DEFAULT_INTERRUPT_MEMORY_LIMIT_PER_CONN_IN_BYTES)]
    interrupt_memory_limit_bytes: usize,

    /// Cap, in seconds, on how long one backend acquisition may wait.
    /// 0 (the default) waits indefinitely.
    #[arg(long, default_value_t = 0)]
    max_acquire_wait_secs: u64,
}

// ---

impl Config {
    // ---

    fn proxy_config(&self) -> ProxyConfig {
        // ---
        ProxyConfig {
            max_idle_connections: self.max_idle_connections,
            max_allowed_error_count: self.max_allowed_error_count,
            interrupt_memory_limit_per_conn_in_bytes: self.interrupt_memory_limit_bytes,
            max_acquire_wait: match self.max_acquire_wait_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---

    let cfg = Config::parse();

    let no_color = std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    let proxy_config = cfg.proxy_config();
    proxy_config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backends = cfg.backends.len(),
        "limpet-proxyd starting",
    );

    let server = Arc::new(ProxyServer::new(ServerConfig {
        proxy: proxy_config,
        client_id_extractor: None,
    }));

    let manager = server.manager();
    for url in &cfg.backends {
        manager.add_connection_to_pool(url).await?;
        info!(%url, "backend registered");
    }

    let listener = TcpListener::bind(cfg.listen).await?;
    info!(listen = %cfg.listen, "accepting client connections");

    tokio::select! {
        result = Arc::clone(&server).run(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
