//! Minimal WebSocket echo backend for demoing the proxy.
//!
//! Start a few of these, register them with `limpet-proxyd --backend …`,
//! then kill one mid-session and watch the client keep echoing.
//!
//! Usage:
//!   echo-backend --listen 127.0.0.1:9001

use std::net::SocketAddr;

// ---

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "echo-backend", about = "WebSocket echo server for limpet demos")]
struct Config {
    // ---
    /// TCP address to listen on.
    #[arg(long, default_value = "127.0.0.1:9001")]
    listen: SocketAddr,
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---

    let cfg = Config::parse();

    tracing_subscriber::fmt().with_target(false).init();

    let listener = TcpListener::bind(cfg.listen).await?;
    info!(listen = %cfg.listen, "echo backend listening");

    loop {
        let (tcp, addr) = listener.accept().await?;
        info!(%addr, "proxy connected");
        tokio::spawn(async move {
            if let Err(e) = echo(tcp).await {
                warn!(%addr, "echo session ended: {e}");
            }
        });
    }
}

// ---

/// Echo every data frame back until the peer closes.
async fn echo(tcp: TcpStream) -> anyhow::Result<()> {
    // ---
    let mut ws = accept_async(tcp).await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            msg @ (Message::Binary(_) | Message::Text(_)) => ws.send(msg).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
