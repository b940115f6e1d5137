//! Domain-specific error types for the streaming core.
//!
//! All fallible operations return `Result<T, StreamError>`.
//! Invalid input never panics. [`StreamError::is_disconnect`] tells the
//! transmission worker whether a failure means "this peer is gone".

use std::io;
use std::time::Duration;

use thiserror::Error;

/// The canonical error type for the streaming core.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A WebSocket frame or message violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The HTTP Upgrade exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// A frame or message exceeds the configured limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// permessage-deflate compression or inflation failed.
    #[error("deflate error: {0}")]
    Deflate(String),

    /// A compressed frame body could not be decoded.
    #[error("corrupt {encoding} body: {reason}")]
    CorruptBody {
        encoding: &'static str,
        reason: &'static str,
    },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// A write did not complete before the send timeout.
    #[error("send timed out after {written} of {total} bytes")]
    SendTimeout { written: usize, total: usize },

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Resource Errors ──────────────────────────────────────────
    /// Neither memory tier could satisfy an allocation.
    #[error("out of memory: {what} ({requested} bytes)")]
    ResourceExhausted {
        what: &'static str,
        requested: usize,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Whether this error means the peer is gone and the client should
    /// be evicted rather than merely skipped.
    ///
    /// A send that timed out after writing part of a frame sequence
    /// also counts: the peer's stream is no longer frame-aligned.
    pub fn is_disconnect(&self) -> bool {
        match self {
            StreamError::Connection(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::WriteZero
            ),
            StreamError::SendTimeout { written, .. } => *written > 0,
            StreamError::ChannelClosed => true,
            _ => false,
        }
    }
}

// ── HandshakeError ───────────────────────────────────────────────

/// Typed failure of the HTTP Upgrade request.
///
/// Each variant maps to the HTTP status the server answers with before
/// closing the socket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The request line is not `GET <path> HTTP/1.1`.
    #[error("malformed request line")]
    BadRequestLine,

    /// A header line has no `:` separator or is not UTF-8.
    #[error("malformed header line")]
    MalformedHeader,

    /// A required header is absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// `Upgrade` / `Connection` do not ask for a WebSocket upgrade.
    #[error("not a websocket upgrade request")]
    NotUpgrade,

    /// `Sec-WebSocket-Key` is not 16 bytes of base64.
    #[error("invalid Sec-WebSocket-Key")]
    BadKey,

    /// `Sec-WebSocket-Version` is not 13.
    #[error("unsupported websocket version: {0}")]
    UnsupportedVersion(String),

    /// The request targets a path other than the stream endpoint.
    #[error("unknown path: {0}")]
    WrongPath(String),

    /// The header block exceeded the size limit.
    #[error("request headers too large")]
    HeadersTooLarge,

    /// The peer closed the socket before the header block ended.
    #[error("connection closed during handshake")]
    Incomplete,

    /// The client registry is full.
    #[error("server full")]
    ServerFull,
}

impl HandshakeError {
    /// HTTP status line sent back for this failure.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            HandshakeError::WrongPath(_) => (404, "Not Found"),
            HandshakeError::UnsupportedVersion(_) => (426, "Upgrade Required"),
            HandshakeError::HeadersTooLarge => (431, "Request Header Fields Too Large"),
            HandshakeError::ServerFull => (503, "Service Unavailable"),
            _ => (400, "Bad Request"),
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(s)
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StreamError::ChannelClosed
    }
}

impl From<flate2::CompressError> for StreamError {
    fn from(e: flate2::CompressError) -> Self {
        StreamError::Deflate(e.to_string())
    }
}

impl From<flate2::DecompressError> for StreamError {
    fn from(e: flate2::DecompressError) -> Self {
        StreamError::Deflate(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = StreamError::Protocol("unmasked client frame");
        assert!(e.to_string().contains("unmasked"));

        let e = StreamError::PayloadTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn from_string() {
        let e: StreamError = "something broke".into();
        assert!(matches!(e, StreamError::Other(_)));
    }

    #[test]
    fn peer_gone_kinds_are_disconnects() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::NotConnected,
        ] {
            let e: StreamError = io::Error::new(kind, "gone").into();
            assert!(e.is_disconnect(), "{kind:?}");
        }
    }

    #[test]
    fn other_io_kinds_are_not_disconnects() {
        let e: StreamError = io::Error::new(io::ErrorKind::Other, "hiccup").into();
        assert!(!e.is_disconnect());
        assert!(!StreamError::Protocol("x").is_disconnect());
    }

    #[test]
    fn partial_send_timeout_is_disconnect() {
        let clean = StreamError::SendTimeout {
            written: 0,
            total: 10,
        };
        let torn = StreamError::SendTimeout {
            written: 4,
            total: 10,
        };
        assert!(!clean.is_disconnect());
        assert!(torn.is_disconnect());
    }

    #[test]
    fn handshake_status_codes() {
        assert_eq!(HandshakeError::NotUpgrade.status().0, 400);
        assert_eq!(HandshakeError::WrongPath("/x".into()).status().0, 404);
        assert_eq!(
            HandshakeError::UnsupportedVersion("8".into()).status().0,
            426
        );
        assert_eq!(HandshakeError::ServerFull.status().0, 503);
    }
}
