//! Byte-level delta against the previously transmitted frame.
//!
//! Frames are compared one 8-byte word at a time; only words that differ
//! are scanned byte by byte. Each changed byte becomes a 4-byte record:
//!
//! ```text
//!  ┌──────────────────────┬───────┐
//!  │ position (u24, BE)   │ value │
//!  └──────────────────────┴───────┘
//! ```
//!
//! An unchanged frame produces an empty record stream.

use crate::error::StreamError;

/// Bytes per delta record.
pub const RECORD_LEN: usize = 4;

/// Largest frame a 24-bit position can address.
pub const MAX_FRAME_LEN: usize = 1 << 24;

const WORD: usize = 8;

const ENCODING: &str = "delta";

/// Append records for every byte of `current` that differs from `previous`.
///
/// Returns the number of changed bytes.
pub fn encode(previous: &[u8], current: &[u8], out: &mut Vec<u8>) -> Result<usize, StreamError> {
    if previous.len() != current.len() {
        return Err(StreamError::Protocol("delta reference has a different size"));
    }
    if current.len() > MAX_FRAME_LEN {
        return Err(StreamError::PayloadTooLarge {
            size: current.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut changed = 0;
    let words = current.chunks(WORD).zip(previous.chunks(WORD));
    for (word_idx, (cur, prev)) in words.enumerate() {
        if cur == prev {
            continue;
        }
        let base = word_idx * WORD;
        for (offset, (&c, &p)) in cur.iter().zip(prev).enumerate() {
            if c != p {
                push_record(out, base + offset, c);
                changed += 1;
            }
        }
    }
    Ok(changed)
}

fn push_record(out: &mut Vec<u8>, position: usize, value: u8) {
    let pos = (position as u32).to_be_bytes();
    out.extend_from_slice(&[pos[1], pos[2], pos[3], value]);
}

/// Rebuild a frame from `previous` and a record stream.
pub fn apply(previous: &[u8], records: &[u8], out: &mut Vec<u8>) -> Result<(), StreamError> {
    if records.len() % RECORD_LEN != 0 {
        return Err(StreamError::CorruptBody {
            encoding: ENCODING,
            reason: "truncated record",
        });
    }
    out.clear();
    out.extend_from_slice(previous);

    for record in records.chunks_exact(RECORD_LEN) {
        let position = u32::from_be_bytes([0, record[0], record[1], record[2]]) as usize;
        let Some(byte) = out.get_mut(position) else {
            return Err(StreamError::CorruptBody {
                encoding: ENCODING,
                reason: "position out of range",
            });
        };
        *byte = record[3];
    }
    Ok(())
}
