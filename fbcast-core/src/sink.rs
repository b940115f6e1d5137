//! The write side of a client connection.
//!
//! [`FrameSink`] is the seam between the transmission worker and the
//! socket, so the worker can be driven by in-memory sinks in tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::StreamError;

/// Destination for fully encoded WebSocket frames.
#[async_trait]
pub trait FrameSink: Send {
    /// Write `bytes` completely, or fail.
    ///
    /// A failure after some bytes were written must be reported as
    /// [`StreamError::SendTimeout`] with `written > 0` or as an I/O error,
    /// so the caller knows the stream is no longer frame-aligned.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), StreamError>;

    /// Best-effort shutdown of the underlying transport.
    async fn shutdown(&mut self) {}
}

// ── SocketSink ───────────────────────────────────────────────────

/// [`FrameSink`] over any async writer, with a per-send deadline.
pub struct SocketSink<W> {
    writer: W,
    timeout: Duration,
}

impl<W> SocketSink<W> {
    pub fn new(writer: W, timeout: Duration) -> Self {
        Self { writer, timeout }
    }
}

#[async_trait]
impl<W> FrameSink for SocketSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        let deadline = Instant::now() + self.timeout;
        let total = bytes.len();
        let mut written = 0;

        while written < total {
            match tokio::time::timeout_at(deadline, self.writer.write(&bytes[written..])).await {
                Err(_) => return Err(StreamError::SendTimeout { written, total }),
                Ok(Ok(0)) => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        match tokio::time::timeout_at(deadline, self.writer.flush()).await {
            Err(_) => Err(StreamError::SendTimeout { written, total }),
            Ok(result) => result.map_err(StreamError::from),
        }
    }

    async fn shutdown(&mut self) {
        let _ = tokio::time::timeout(self.timeout, self.writer.shutdown()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn writes_everything() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut sink = SocketSink::new(client, Duration::from_secs(1));
        sink.send(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn stalled_reader_times_out_mid_write() {
        let (client, _server) = tokio::io::duplex(16);
        let mut sink = SocketSink::new(client, Duration::from_millis(20));
        let err = sink.send(&[0u8; 64]).await.unwrap_err();
        match err {
            StreamError::SendTimeout { written, total } => {
                assert_eq!(written, 16);
                assert_eq!(total, 64);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            StreamError::SendTimeout {
                written: 16,
                total: 64
            }
            .is_disconnect()
        );
    }

    #[tokio::test]
    async fn closed_peer_is_a_disconnect() {
        let (client, server) = tokio::io::duplex(16);
        drop(server);
        let mut sink = SocketSink::new(client, Duration::from_secs(1));
        let err = sink.send(b"x").await.unwrap_err();
        assert!(err.is_disconnect(), "{err}");
    }
}
