//! [`WsByteStream`] — a WebSocket connection presented as a plain byte
//! stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

// ---

use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;

// ---------------------------------------------------------------------------
// WsByteStream
// ---------------------------------------------------------------------------

/// Adapter implementing the tokio byte-stream traits over a
/// [`WebSocketStream`].
///
/// The proxy core forwards bytes without interpreting them, so frame
/// boundaries carry no meaning here: each write becomes one binary frame,
/// and binary or text payloads read out as a contiguous byte sequence with
/// leftovers retained between reads. A `Close` frame (or the underlying
/// stream ending) reads as end-of-stream. Ping/pong is handled inside
/// tungstenite and skipped.
pub struct WsByteStream<S> {
    // ---
    inner: WebSocketStream<S>,

    /// Leftover bytes from a partially consumed frame payload.
    read_buf: Vec<u8>,

    /// Peer closed; subsequent reads return end-of-stream.
    read_closed: bool,
}

// ---

impl<S> WsByteStream<S> {
    // ---

    pub fn new(inner: WebSocketStream<S>) -> Self {
        // ---
        Self {
            inner,
            read_buf: Vec::new(),
            read_closed: false,
        }
    }

    // ---

    /// Consume the adapter and return the underlying WebSocket stream.
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.inner
    }
}

// ---

/// Map a tungstenite error onto io, preserving the kind where one exists.
fn ws_err(e: WsError) -> io::Error {
    // ---
    match e {
        WsError::Io(io) => io,
        other => io::Error::new(io::ErrorKind::BrokenPipe, other.to_string()),
    }
}

// ---

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // ---
        if !self.read_buf.is_empty() {
            let n = buf.remaining().min(self.read_buf.len());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.drain(..n);
            return Poll::Ready(Ok(()));
        }

        if self.read_closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            let payload = match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => data,
                Poll::Ready(Some(Ok(Message::Text(text)))) => {
                    text.as_str().as_bytes().to_vec().into()
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                // Ping/pong replies are queued inside tungstenite.
                Poll::Ready(Some(Ok(Message::Ping(_))))
                | Poll::Ready(Some(Ok(Message::Pong(_))))
                | Poll::Ready(Some(Ok(Message::Frame(_)))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_err(e))),
                Poll::Pending => return Poll::Pending,
            };

            if payload.is_empty() {
                continue;
            }

            let n = buf.remaining().min(payload.len());
            buf.put_slice(&payload[..n]);
            if n < payload.len() {
                self.read_buf.extend_from_slice(&payload[n..]);
            }
            return Poll::Ready(Ok(()));
        }
    }
}

// ---

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        // ---
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_err(e))),
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.inner).start_send(Message::binary(data.to_vec())) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(e) => Poll::Ready(Err(ws_err(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, connect_async};

    use super::WsByteStream;

    // ---

    /// Bytes written on one side come out the other, through real WebSocket
    /// framing, in both directions.
    #[tokio::test]
    async fn bridges_bytes_over_websocket() {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept failed");
            let ws = accept_async(tcp).await.expect("upgrade failed");
            WsByteStream::new(ws)
        });

        let (ws, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("connect failed");
        let mut client = WsByteStream::new(ws);
        let mut backend = server.await.expect("server task panicked");

        client.write_all(b"hello").await.expect("write failed");
        client.flush().await.expect("flush failed");
        let mut buf = [0u8; 16];
        let n = backend.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"hello");

        backend.write_all(b"world").await.expect("write failed");
        backend.flush().await.expect("flush failed");
        let n = client.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"world");
    }

    // ---

    /// A payload larger than the caller's buffer is retained across reads.
    #[tokio::test]
    async fn retains_partial_payload_between_reads() {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept failed");
            let ws = accept_async(tcp).await.expect("upgrade failed");
            WsByteStream::new(ws)
        });

        let (ws, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("connect failed");
        let mut client = WsByteStream::new(ws);
        let mut backend = server.await.expect("server task panicked");

        client.write_all(b"abcdef").await.expect("write failed");
        client.flush().await.expect("flush failed");

        let mut buf = [0u8; 4];
        let n = backend.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"abcd");
        let n = backend.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"ef");
    }

    // ---

    /// A clean close on one side reads as end-of-stream on the other.
    #[tokio::test]
    async fn close_reads_as_eof() {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept failed");
            let ws = accept_async(tcp).await.expect("upgrade failed");
            WsByteStream::new(ws)
        });

        let (ws, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("connect failed");
        let mut client = WsByteStream::new(ws);
        let mut backend = server.await.expect("server task panicked");

        client.shutdown().await.expect("shutdown failed");

        let mut buf = [0u8; 4];
        let n = backend.read(&mut buf).await.expect("read failed");
        assert_eq!(n, 0, "peer close must read as EOF");
    }
}
