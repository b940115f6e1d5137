//! Run-length encoding with a zero-byte marker.
//!
//! A run of `min_run` or more identical bytes, and any run of `0x00`,
//! becomes the token `[0x00, count, value]` (`1 <= count <= 255`).
//! Everything else is copied through literally, so a literal `0x00`
//! never appears in the output.

use crate::error::StreamError;

/// Token introducer. Never emitted as a literal.
pub const RUN_MARKER: u8 = 0x00;

/// Default shortest run worth a token.
pub const DEFAULT_MIN_RUN: usize = 3;

const MAX_RUN: usize = u8::MAX as usize;

const ENCODING: &str = "rle";

/// Append the RLE form of `input` to `out`.
pub fn encode(input: &[u8], min_run: usize, out: &mut Vec<u8>) {
    let mut i = 0;
    while i < input.len() {
        let value = input[i];
        let run = input[i..]
            .iter()
            .take(MAX_RUN)
            .take_while(|&&b| b == value)
            .count();

        if run >= min_run || value == RUN_MARKER {
            out.extend_from_slice(&[RUN_MARKER, run as u8, value]);
        } else {
            out.extend(std::iter::repeat_n(value, run));
        }
        i += run;
    }
}

/// Append the expansion of an RLE stream to `out`.
pub fn decode(input: &[u8], out: &mut Vec<u8>) -> Result<(), StreamError> {
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if byte != RUN_MARKER {
            out.push(byte);
            i += 1;
            continue;
        }
        let (Some(&count), Some(&value)) = (input.get(i + 1), input.get(i + 2)) else {
            return Err(StreamError::CorruptBody {
                encoding: ENCODING,
                reason: "truncated run token",
            });
        };
        if count == 0 {
            return Err(StreamError::CorruptBody {
                encoding: ENCODING,
                reason: "zero-length run",
            });
        }
        out.extend(std::iter::repeat_n(value, count as usize));
        i += 3;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(input: &[u8]) -> Vec<u8> {
        let mut enc = Vec::new();
        encode(input, DEFAULT_MIN_RUN, &mut enc);
        let mut dec = Vec::new();
        decode(&enc, &mut dec).unwrap();
        dec
    }

    #[test]
    fn long_run_becomes_token() {
        let mut out = Vec::new();
        encode(&[5; 10], 3, &mut out);
        assert_eq!(out, vec![0, 10, 5]);
    }

    #[test]
    fn short_runs_stay_literal() {
        let mut out = Vec::new();
        encode(&[1, 2, 2, 3], 3, &mut out);
        assert_eq!(out, vec![1, 2, 2, 3]);
    }

    #[test]
    fn single_zero_is_escaped() {
        let mut out = Vec::new();
        encode(&[7, 0, 7], 3, &mut out);
        assert_eq!(out, vec![7, 0, 1, 0, 7]);
    }

    #[test]
    fn runs_longer_than_255_split() {
        let mut out = Vec::new();
        encode(&[9; 600], 3, &mut out);
        assert_eq!(out, vec![0, 255, 9, 0, 255, 9, 0, 90, 9]);
    }

    #[test]
    fn mixed_content_roundtrips() {
        let mut input = vec![0u8; 300];
        input.extend_from_slice(&[1, 2, 3, 0, 0, 4]);
        input.extend(std::iter::repeat_n(200, 70));
        assert_eq!(roundtrip(&input), input);
    }

    #[test]
    fn truncated_token_is_an_error() {
        assert!(decode(&[1, 0, 5], &mut Vec::new()).is_err());
        assert!(decode(&[0, 0, 5], &mut Vec::new()).is_err());
    }
}
