//! permessage-deflate (RFC 7692).
//!
//! Negotiation always answers with `server_no_context_takeover`, so the
//! outbound [`Deflater`] resets its stream before every message. The
//! inbound [`Inflater`] keeps its window across messages unless the
//! client promised `client_no_context_takeover`.
//!
//! ```text
//!   outbound: payload ─▶ raw deflate + sync flush ─▶ strip 00 00 FF FF ─▶ RSV1 frame
//!   inbound:  RSV1 message ─▶ append 00 00 FF FF ─▶ raw inflate (bounded) ─▶ payload
//! ```

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::debug;

use crate::error::StreamError;

pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Empty stored block that ends every sync-flushed message.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// The only LZ77 window the server supports.
const WINDOW_BITS: u8 = 15;

// ── Negotiation ──────────────────────────────────────────────────

/// One entry of a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

/// Split a `Sec-WebSocket-Extensions` value into offers.
pub fn parse_offers(header: &str) -> Vec<ExtensionOffer> {
    header
        .split(',')
        .filter_map(|offer| {
            let mut parts = offer.split(';').map(str::trim);
            let name = parts.next().filter(|n| !n.is_empty())?.to_ascii_lowercase();
            let params = parts
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((k, v)) => (
                        k.trim().to_ascii_lowercase(),
                        Some(v.trim().trim_matches('"').to_string()),
                    ),
                    None => (p.to_ascii_lowercase(), None),
                })
                .collect();
            Some(ExtensionOffer { name, params })
        })
        .collect()
}

/// Agreed permessage-deflate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    /// The client resets its compressor after each message.
    pub client_no_context_takeover: bool,
}

impl DeflateParams {
    /// Value of the `Sec-WebSocket-Extensions` response header.
    pub fn response_header(&self) -> String {
        let mut value = format!("{EXTENSION_NAME}; server_no_context_takeover");
        if self.client_no_context_takeover {
            value.push_str("; client_no_context_takeover");
        }
        value
    }
}

/// Accept the first acceptable permessage-deflate offer, if any.
pub fn negotiate(offers: &[ExtensionOffer]) -> Option<DeflateParams> {
    offers
        .iter()
        .filter(|o| o.name == EXTENSION_NAME)
        .find_map(accept_offer)
}

fn accept_offer(offer: &ExtensionOffer) -> Option<DeflateParams> {
    let mut params = DeflateParams {
        client_no_context_takeover: false,
    };
    let mut seen: Vec<&str> = Vec::with_capacity(offer.params.len());

    for (name, value) in &offer.params {
        if seen.contains(&name.as_str()) {
            debug!("declining deflate offer with duplicate {name}");
            return None;
        }
        seen.push(name);

        match (name.as_str(), value.as_deref()) {
            ("server_no_context_takeover", None) => {}
            ("client_no_context_takeover", None) => params.client_no_context_takeover = true,
            ("server_max_window_bits", Some(bits)) => {
                if bits.parse::<u8>().ok() != Some(WINDOW_BITS) {
                    debug!("declining deflate offer with server_max_window_bits={bits}");
                    return None;
                }
            }
            // The client may use any window; inflating with 15 bits covers all.
            ("client_max_window_bits", _) => {}
            _ => {
                debug!("declining deflate offer with unknown parameter {name}");
                return None;
            }
        }
    }
    Some(params)
}

// ── Deflater ─────────────────────────────────────────────────────

/// Outbound compressor for one connection.
pub struct Deflater {
    stream: Compress,
}

impl Deflater {
    pub fn new(level: u32) -> Self {
        Self {
            stream: Compress::new(Compression::new(level.min(9)), false),
        }
    }

    /// Compress one whole message into `out` (cleared first).
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StreamError> {
        self.stream.reset();
        out.clear();
        out.reserve(input.len() / 2 + 64);

        let start_in = self.stream.total_in();
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(256));
            }
            let consumed = (self.stream.total_in() - start_in) as usize;
            self.stream
                .compress_vec(&input[consumed..], out, FlushCompress::Sync)?;
            let consumed = (self.stream.total_in() - start_in) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&TRAILER) {
            out.truncate(out.len() - TRAILER.len());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Deflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deflater").finish_non_exhaustive()
    }
}

// ── Inflater ─────────────────────────────────────────────────────

/// Inbound decompressor for one connection.
pub struct Inflater {
    stream: Decompress,
    reset_each_message: bool,
    max_size: usize,
    input: Vec<u8>,
}

impl Inflater {
    pub fn new(params: DeflateParams, max_size: usize) -> Self {
        Self {
            stream: Decompress::new(false),
            reset_each_message: params.client_no_context_takeover,
            max_size,
            input: Vec::new(),
        }
    }

    /// Inflate one whole message into `out` (cleared first).
    pub fn decompress(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<(), StreamError> {
        if self.reset_each_message {
            self.stream.reset(false);
        }
        self.input.clear();
        self.input.extend_from_slice(payload);
        self.input.extend_from_slice(&TRAILER);

        out.clear();
        let start_in = self.stream.total_in();
        loop {
            if out.capacity() - out.len() < 1024 {
                out.reserve(out.capacity().clamp(4096, self.max_size.max(4096)));
            }
            let consumed = (self.stream.total_in() - start_in) as usize;
            let produced = out.len();
            let status =
                self.stream
                    .decompress_vec(&self.input[consumed..], out, FlushDecompress::Sync)?;

            if out.len() > self.max_size {
                return Err(StreamError::PayloadTooLarge {
                    size: out.len(),
                    max: self.max_size,
                });
            }

            let now_consumed = (self.stream.total_in() - start_in) as usize;
            let done = now_consumed == self.input.len() && out.len() < out.capacity();
            if done || status == Status::StreamEnd {
                return Ok(());
            }
            if now_consumed == consumed && out.len() == produced {
                return Err(StreamError::Deflate("inflate made no progress".into()));
            }
        }
    }
}

impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("reset_each_message", &self.reset_each_message)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}
