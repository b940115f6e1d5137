//! LZ77-style matcher with a bounded sliding window.
//!
//! Output is a byte stream of literals and match tokens:
//!
//! | Bytes                          | Meaning                          |
//! |--------------------------------|----------------------------------|
//! | `b` (`b != MARKER`)            | literal `b`                      |
//! | `MARKER, 0`                    | literal `MARKER`                 |
//! | `MARKER, len, offset_hi, lo`   | copy `len` bytes from `offset` back |
//!
//! Candidate positions are found through a hash chain over 4-byte
//! prefixes, bounded by `max_chain` candidates per position.

use crate::error::StreamError;

/// Match-token introducer.
pub const MARKER: u8 = 0xFB;

pub const DEFAULT_WINDOW: usize = 4096;
pub const MAX_WINDOW: usize = u16::MAX as usize;
pub const DEFAULT_MIN_MATCH: usize = 6;
pub const MAX_MATCH: usize = u8::MAX as usize;

const HASH_BITS: u32 = 13;
const HASH_LEN: usize = 4;
const NONE: u32 = u32::MAX;

const ENCODING: &str = "lz77";

/// Matcher parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzParams {
    /// How far back a match may start.
    pub window: usize,
    /// Shortest match worth a token.
    pub min_match: usize,
    /// Chain candidates checked per position.
    pub max_chain: usize,
}

impl Default for LzParams {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            min_match: DEFAULT_MIN_MATCH,
            max_chain: 32,
        }
    }
}

impl LzParams {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.window == 0 || self.window > MAX_WINDOW {
            return Err(StreamError::InvalidConfig("lz window must be 1..=65535"));
        }
        if self.min_match < HASH_LEN || self.min_match > MAX_MATCH {
            return Err(StreamError::InvalidConfig("lz min_match must be 4..=255"));
        }
        if self.max_chain == 0 {
            return Err(StreamError::InvalidConfig("lz max_chain must be non-zero"));
        }
        Ok(())
    }
}

/// Reusable matcher. Keeps its hash tables between calls.
#[derive(Debug)]
pub struct LzMatcher {
    params: LzParams,
    head: Vec<u32>,
    prev: Vec<u32>,
}

impl LzMatcher {
    pub fn new(params: LzParams) -> Self {
        Self {
            params,
            head: vec![NONE; 1 << HASH_BITS],
            prev: Vec::new(),
        }
    }

    /// Append the compressed form of `input` to `out`.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.head.fill(NONE);
        self.prev.clear();
        self.prev.resize(input.len(), NONE);

        let mut pos = 0;
        while pos < input.len() {
            let (len, dist) = self.longest_match(input, pos);
            if len >= self.params.min_match {
                let offset = (dist as u16).to_be_bytes();
                out.extend_from_slice(&[MARKER, len as u8, offset[0], offset[1]]);
                for p in pos..pos + len {
                    self.insert(input, p);
                }
                pos += len;
            } else {
                let byte = input[pos];
                out.push(byte);
                if byte == MARKER {
                    out.push(0);
                }
                self.insert(input, pos);
                pos += 1;
            }
        }
    }

    fn longest_match(&self, input: &[u8], pos: usize) -> (usize, usize) {
        if pos + self.params.min_match > input.len() {
            return (0, 0);
        }
        let limit = MAX_MATCH.min(input.len() - pos);
        let mut best = (0, 0);
        let mut candidate = self.head[hash(&input[pos..])];
        let mut checked = 0;

        while candidate != NONE && checked < self.params.max_chain {
            let start = candidate as usize;
            let dist = pos - start;
            if dist > self.params.window {
                break;
            }
            let len = input[start..]
                .iter()
                .zip(&input[pos..pos + limit])
                .take_while(|(a, b)| a == b)
                .count();
            if len > best.0 {
                best = (len, dist);
                if len == limit {
                    break;
                }
            }
            candidate = self.prev[start];
            checked += 1;
        }
        best
    }

    fn insert(&mut self, input: &[u8], pos: usize) {
        if pos + HASH_LEN > input.len() {
            return;
        }
        let h = hash(&input[pos..]);
        self.prev[pos] = self.head[h];
        self.head[h] = pos as u32;
    }
}

fn hash(bytes: &[u8]) -> usize {
    let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (v.wrapping_mul(2_654_435_761) >> (32 - HASH_BITS)) as usize
}

/// Append the expansion of an LZ stream to `out`.
pub fn decompress(input: &[u8], out: &mut Vec<u8>) -> Result<(), StreamError> {
    let base = out.len();
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if byte != MARKER {
            out.push(byte);
            i += 1;
            continue;
        }
        match input.get(i + 1) {
            None => return Err(corrupt("truncated token")),
            Some(0) => {
                out.push(MARKER);
                i += 2;
            }
            Some(&len) => {
                let (Some(&hi), Some(&lo)) = (input.get(i + 2), input.get(i + 3)) else {
                    return Err(corrupt("truncated match"));
                };
                let dist = u16::from_be_bytes([hi, lo]) as usize;
                if dist == 0 || dist > out.len() - base {
                    return Err(corrupt("match offset out of range"));
                }
                let start = out.len() - dist;
                // Overlapping copies repeat the tail, so copy byte by byte.
                for k in 0..len as usize {
                    let b = out[start + k];
                    out.push(b);
                }
                i += 4;
            }
        }
    }
    Ok(())
}

fn corrupt(reason: &'static str) -> StreamError {
    StreamError::CorruptBody {
        encoding: ENCODING,
        reason,
    }
}
