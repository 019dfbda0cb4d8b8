use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

// ---

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Wire unit between the two ends of a [`SimStream`] pair.
///
/// `Fin` models a clean shutdown (the peer reads end-of-stream); `Reset`
/// models an abrupt connection loss (the peer's reads fail). Dropping one
/// end without sending either also reads as end-of-stream, matching a
/// socket whose remote closed.
#[derive(Debug)]
pub(crate) enum Frame {
    // ---
    Data(Vec<u8>),
    Fin,
    Reset,
}

// ---------------------------------------------------------------------------
// SimStream
// ---------------------------------------------------------------------------

/// One end of an in-process mock byte stream backed by mpsc channels.
///
/// Created in connected pairs by [`SimStream::pair`]. The write side sends
/// [`Frame::Data`] chunks; the read side receives them. Write boundaries are
/// preserved as chunk boundaries, which lets tests assert that a staged
/// flush arrived as a single write.
pub struct SimStream {
    // ---
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,

    /// Leftover bytes from a partially consumed chunk.
    read_buf: Vec<u8>,

    /// Peer sent `Fin` or hung up; subsequent reads return EOF.
    read_closed: bool,

    /// Peer sent `Reset`; subsequent reads fail.
    reset: bool,

    /// We sent `Fin`; subsequent writes fail.
    shutdown_sent: bool,
}

// ---

impl SimStream {
    // ---

    /// Create a connected pair of streams.
    pub fn pair() -> (Self, Self) {
        // ---
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    // ---

    fn new(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        // ---
        Self {
            tx,
            rx,
            read_buf: Vec::new(),
            read_closed: false,
            reset: false,
            shutdown_sent: false,
        }
    }

    // ---

    /// Tear the connection down abruptly.
    ///
    /// The peer's next read fails with `ConnectionReset` and its writes fail
    /// with `BrokenPipe` once this end is dropped. Models a process crash,
    /// as opposed to the clean FIN of `poll_shutdown`.
    pub fn kill(self) {
        // ---
        let _ = self.tx.send(Frame::Reset);
        // rx dropped here — peer writes start failing immediately.
    }

    // ---

    /// Receive the next raw chunk exactly as the peer wrote it.
    ///
    /// `Ok(None)` on clean end-of-stream. Unlike `AsyncReadExt::read`, this
    /// never splits or merges writes, so a test can assert how many write
    /// calls the peer issued.
    pub async fn recv_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        // ---
        if !self.read_buf.is_empty() {
            return Ok(Some(std::mem::take(&mut self.read_buf)));
        }
        if self.reset {
            return Err(reset_err());
        }
        if self.read_closed {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Frame::Data(chunk)) => Ok(Some(chunk)),
            Some(Frame::Fin) | None => {
                self.read_closed = true;
                Ok(None)
            }
            Some(Frame::Reset) => {
                self.reset = true;
                Err(reset_err())
            }
        }
    }
}

// ---

fn reset_err() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "simulated connection reset")
}

fn broken_pipe_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "sim stream peer is gone")
}

// ---

impl AsyncRead for SimStream {
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

        if self.reset {
            return Poll::Ready(Err(reset_err()));
        }
        if self.read_closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Frame::Data(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let n = buf.remaining().min(chunk.len());
                    buf.put_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.read_buf.extend_from_slice(&chunk[n..]);
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Frame::Fin)) | Poll::Ready(None) => {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Frame::Reset)) => {
                    self.reset = true;
                    return Poll::Ready(Err(reset_err()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ---

impl AsyncWrite for SimStream {
    // ---
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        // ---
        if self.shutdown_sent || self.reset {
            return Poll::Ready(Err(broken_pipe_err()));
        }
        match self.tx.send(Frame::Data(data.to_vec())) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(_) => Poll::Ready(Err(broken_pipe_err())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // ---
        if !self.shutdown_sent {
            self.shutdown_sent = true;
            let _ = self.tx.send(Frame::Fin);
        }
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::SimStream;

    // ---

    /// Bytes written on one end arrive in order on the other.
    #[tokio::test]
    async fn pair_round_trip() {
        // ---
        let (mut a, mut b) = SimStream::pair();

        a.write_all(b"hello").await.expect("write failed");
        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"hello");

        b.write_all(b"world").await.expect("write failed");
        let n = a.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"world");
    }

    // ---

    /// A chunk larger than the read buffer is retained across reads.
    #[tokio::test]
    async fn partial_chunk_consumption() {
        // ---
        let (mut a, mut b) = SimStream::pair();
        a.write_all(b"abcdefgh").await.expect("write failed");

        let mut buf = [0u8; 3];
        let n = b.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"abc");
        let n = b.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"def");
        let n = b.read(&mut buf).await.expect("read failed");
        assert_eq!(&buf[..n], b"gh");
    }

    // ---

    /// Shutdown delivers a clean end-of-stream to the peer.
    #[tokio::test]
    async fn shutdown_reads_as_eof() {
        // ---
        let (mut a, mut b) = SimStream::pair();
        a.shutdown().await.expect("shutdown failed");

        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).await.expect("read failed");
        assert_eq!(n, 0, "peer should observe EOF after shutdown");
    }

    // ---

    /// Kill fails the peer's reads and writes instead of reading as EOF.
    #[tokio::test]
    async fn kill_resets_the_peer() {
        // ---
        let (a, mut b) = SimStream::pair();
        a.kill();

        let mut buf = [0u8; 8];
        let err = b.read(&mut buf).await.expect_err("read should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        let err = b.write_all(b"x").await.expect_err("write should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    // ---

    /// recv_chunk preserves the peer's write boundaries.
    #[tokio::test]
    async fn recv_chunk_preserves_write_boundaries() {
        // ---
        let (mut a, mut b) = SimStream::pair();
        a.write_all(b"first").await.expect("write failed");
        a.write_all(b"second").await.expect("write failed");

        let chunk = b.recv_chunk().await.expect("recv failed");
        assert_eq!(chunk.as_deref(), Some(&b"first"[..]));
        let chunk = b.recv_chunk().await.expect("recv failed");
        assert_eq!(chunk.as_deref(), Some(&b"second"[..]));
    }
}
