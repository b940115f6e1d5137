//! HTTP/1.1 Upgrade handshake (RFC 6455 §4).
//!
//! ```text
//!   client                                   server
//!     │  GET /ws HTTP/1.1                       │
//!     │  Upgrade: websocket                     │
//!     │  Connection: Upgrade                    │
//!     │  Sec-WebSocket-Key: <16 bytes, b64>     │
//!     │  Sec-WebSocket-Version: 13              │
//!     │ ──────────────────────────────────────▶ │  validate, negotiate deflate
//!     │                                         │
//!     │  HTTP/1.1 101 Switching Protocols       │
//!     │  Sec-WebSocket-Accept: b64(sha1(key+GUID))
//!     │ ◀────────────────────────────────────── │
//! ```
//!
//! A rejected request gets an HTTP error status (see
//! [`HandshakeError::status`]) and the socket is dropped.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{HandshakeError, StreamError};
use crate::ws::deflate::{self, DeflateParams, ExtensionOffer};

/// Fixed GUID appended to the client key.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default limit on the request head.
pub const MAX_REQUEST_LEN: usize = 8192;

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

// ── Request parsing ──────────────────────────────────────────────

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request target without the query string.
    pub path: String,
    pub key: String,
    pub extensions: Vec<ExtensionOffer>,
    pub user_agent: Option<String>,
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Parse and validate a request head (everything before the blank line).
pub fn parse_request(head: &str) -> Result<HandshakeRequest, HandshakeError> {
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(HandshakeError::BadRequestLine)?;
    let mut parts = request_line.split(' ');
    let (Some("GET"), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::BadRequestLine);
    };
    if !version.starts_with("HTTP/1.") || version == "HTTP/1.0" {
        return Err(HandshakeError::BadRequestLine);
    }
    let path = target.split('?').next().unwrap_or(target).to_string();

    let mut upgrade = None;
    let mut connection = None;
    let mut key = None;
    let mut ws_version = None;
    let mut user_agent = None;
    let mut extensions = Vec::new();

    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or(HandshakeError::MalformedHeader)?;
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade = Some(value),
            "connection" => connection = Some(value),
            "sec-websocket-key" => key = Some(value),
            "sec-websocket-version" => ws_version = Some(value),
            "sec-websocket-extensions" => extensions.extend(deflate::parse_offers(value)),
            "user-agent" => user_agent = Some(value.to_string()),
            _ => {}
        }
    }

    let upgrade = upgrade.ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    let connection = connection.ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !has_token(upgrade, "websocket") || !has_token(connection, "upgrade") {
        return Err(HandshakeError::NotUpgrade);
    }

    let key = key.ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err(HandshakeError::BadKey),
    }

    let ws_version = ws_version.ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if ws_version != "13" {
        return Err(HandshakeError::UnsupportedVersion(ws_version.to_string()));
    }

    Ok(HandshakeRequest {
        path,
        key: key.to_string(),
        extensions,
        user_agent,
    })
}

// ── Responses ────────────────────────────────────────────────────

pub fn accept_response(client_key: &str, deflate: Option<&DeflateParams>) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_key(client_key)
    );
    if let Some(params) = deflate {
        response.push_str("Sec-WebSocket-Extensions: ");
        response.push_str(&params.response_header());
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response
}

pub fn reject_response(err: &HandshakeError) -> String {
    let (code, reason) = err.status();
    let mut response =
        format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n");
    if matches!(err, HandshakeError::UnsupportedVersion(_)) {
        response.push_str("Sec-WebSocket-Version: 13\r\n");
    }
    response.push_str("\r\n");
    response
}

// ── Async driver ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Only this path is upgraded.
    pub path: String,
    /// Offer permessage-deflate when the client asks for it.
    pub deflate: bool,
    pub timeout: Duration,
    pub max_request_len: usize,
    /// `false` answers every valid request with 503.
    pub accepting: bool,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            path: "/ws".into(),
            deflate: true,
            timeout: Duration::from_secs(5),
            max_request_len: MAX_REQUEST_LEN,
            accepting: true,
        }
    }
}

/// Result of a completed upgrade.
#[derive(Debug)]
pub struct Handshake {
    pub request: HandshakeRequest,
    pub deflate: Option<DeflateParams>,
    /// Bytes received after the request head (early frames).
    pub leftover: BytesMut,
}

/// Run the server side of the handshake on `stream`.
pub async fn accept<S>(stream: &mut S, opts: &HandshakeOptions) -> Result<Handshake, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(opts.timeout, accept_inner(stream, opts)).await {
        Ok(result) => result,
        Err(_) => Err(StreamError::Timeout(opts.timeout)),
    }
}

async fn accept_inner<S>(stream: &mut S, opts: &HandshakeOptions) -> Result<Handshake, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let head_len = loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            if end > opts.max_request_len {
                return reject(stream, HandshakeError::HeadersTooLarge).await;
            }
            break end + 4;
        }
        if buf.len() > opts.max_request_len {
            return reject(stream, HandshakeError::HeadersTooLarge).await;
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::Incomplete.into());
        }
    };

    let head = buf.split_to(head_len);
    let validated = std::str::from_utf8(&head)
        .map_err(|_| HandshakeError::MalformedHeader)
        .and_then(parse_request)
        .and_then(|request| {
            if request.path != opts.path {
                Err(HandshakeError::WrongPath(request.path))
            } else if !opts.accepting {
                Err(HandshakeError::ServerFull)
            } else {
                Ok(request)
            }
        });
    let request = match validated {
        Ok(request) => request,
        Err(e) => return reject(stream, e).await,
    };

    let deflate = if opts.deflate {
        deflate::negotiate(&request.extensions)
    } else {
        None
    };
    stream
        .write_all(accept_response(&request.key, deflate.as_ref()).as_bytes())
        .await?;
    stream.flush().await?;
    debug!(
        "upgraded {} (deflate: {})",
        request.path,
        deflate.is_some()
    );

    Ok(Handshake {
        request,
        deflate,
        leftover: buf,
    })
}

async fn reject<S>(stream: &mut S, err: HandshakeError) -> Result<Handshake, StreamError>
where
    S: AsyncWrite + Unpin,
{
    debug!("rejecting handshake: {err}");
    // Best effort: the peer may already be gone.
    let _ = stream.write_all(reject_response(&err).as_bytes()).await;
    let _ = stream.flush().await;
    Err(err.into())
}
