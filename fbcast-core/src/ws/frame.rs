//! WebSocket frame header encoding/decoding and fragmentation (RFC 6455 §5).
//!
//! ## Wire format
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| payload len |  extended payload length      |
//! |I|S|S|S|  (4)  |A|     (7)     |  (16 if len == 126,           |
//! |N|V|V|V|       |S|             |   64 if len == 127, BE)       |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |  masking key (4, only if MASK set)  |  payload ...            |
//! +-------------------------------------+-------------------------+
//! ```

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};

use crate::error::StreamError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Longest possible header: 2 + 8 (length) + 4 (mask).
pub const MAX_HEADER_LEN: usize = 14;

bitflags! {
    /// The high nibble of the first header byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        const FIN  = 0x80;
        const RSV1 = 0x40;
        const RSV2 = 0x20;
        const RSV3 = 0x10;
    }
}

// ── OpCode ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl TryFrom<u8> for OpCode {
    type Error = StreamError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(StreamError::Protocol("reserved opcode")),
        }
    }
}

// ── CloseCode ────────────────────────────────────────────────────

/// Status codes carried in close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    TooBig,
    TryAgainLater,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::TooBig => 1009,
            CloseCode::TryAgainLater => 1013,
            CloseCode::Other(code) => code,
        }
    }

    /// The code to close with after a read-side error.
    pub fn for_error(err: &StreamError) -> Self {
        match err {
            StreamError::PayloadTooLarge { .. } => CloseCode::TooBig,
            _ => CloseCode::ProtocolError,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1009 => CloseCode::TooBig,
            1013 => CloseCode::TryAgainLater,
            other => CloseCode::Other(other),
        }
    }
}

// ── FrameHeader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn new(flags: FrameFlags, opcode: OpCode, payload_len: usize) -> Self {
        Self {
            flags,
            opcode,
            mask: None,
            payload_len: payload_len as u64,
        }
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(FrameFlags::FIN)
    }

    /// Bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let len_bytes = match self.payload_len {
            0..=125 => 0,
            126..=0xFFFF => 2,
            _ => 8,
        };
        2 + len_bytes + if self.mask.is_some() { 4 } else { 0 }
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.flags.bits() | self.opcode as u8);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        match self.payload_len {
            len @ 0..=125 => dst.put_u8(mask_bit | len as u8),
            len @ 126..=0xFFFF => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len);
            }
        }
        if let Some(key) = self.mask {
            dst.put_slice(&key);
        }
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the header
    /// and its length in bytes.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, StreamError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let flags = FrameFlags::from_bits_truncate(buf[0] & 0xF0);
        let opcode = OpCode::try_from(buf[0] & 0x0F)?;
        let masked = buf[1] & 0x80 != 0;

        let (payload_len, mut idx) = match buf[1] & 0x7F {
            126 => {
                let Some(b) = buf.get(2..4) else {
                    return Ok(None);
                };
                (u16::from_be_bytes([b[0], b[1]]) as u64, 4)
            }
            127 => {
                let Some(b) = buf.get(2..10) else {
                    return Ok(None);
                };
                let mut be = [0u8; 8];
                be.copy_from_slice(b);
                let len = u64::from_be_bytes(be);
                if len >> 63 != 0 {
                    return Err(StreamError::Protocol("payload length has the high bit set"));
                }
                (len, 10)
            }
            len => (len as u64, 2),
        };

        let mask = if masked {
            let Some(k) = buf.get(idx..idx + 4) else {
                return Ok(None);
            };
            idx += 4;
            Some([k[0], k[1], k[2], k[3]])
        } else {
            None
        };

        Ok(Some((
            Self {
                flags,
                opcode,
                mask,
                payload_len,
            },
            idx,
        )))
    }
}

/// XOR `data` with the 4-byte masking key. Applying it twice restores
/// the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

// ── WsFrame ──────────────────────────────────────────────────────

/// One decoded frame with its (unmasked) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub header: FrameHeader,
    pub payload: BytesMut,
}

impl WsFrame {
    pub fn new(flags: FrameFlags, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader::new(flags, opcode, payload.len()),
            payload,
        }
    }

    pub fn binary(payload: &[u8]) -> Self {
        Self::new(FrameFlags::FIN, OpCode::Binary, BytesMut::from(payload))
    }

    pub fn text(payload: &str) -> Self {
        Self::new(FrameFlags::FIN, OpCode::Text, BytesMut::from(payload.as_bytes()))
    }

    pub fn ping(payload: &[u8]) -> Self {
        Self::new(FrameFlags::FIN, OpCode::Ping, BytesMut::from(payload))
    }

    pub fn pong(payload: &[u8]) -> Self {
        Self::new(FrameFlags::FIN, OpCode::Pong, BytesMut::from(payload))
    }

    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code.as_u16());
        payload.put_slice(reason.as_bytes());
        Self::new(FrameFlags::FIN, OpCode::Close, payload)
    }

    /// Set the masking key used when this frame is encoded.
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.header.mask = Some(key);
        self
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    pub fn is_final(&self) -> bool {
        self.header.is_final()
    }

    pub fn is_compressed(&self) -> bool {
        self.header.flags.contains(FrameFlags::RSV1)
    }

    /// Append the wire form of this frame to `dst`, masking the payload
    /// when a key is set.
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        let mut header = self.header;
        header.payload_len = self.payload.len() as u64;
        header.encode(dst);
        match header.mask {
            Some(key) => {
                for (i, &b) in self.payload.iter().enumerate() {
                    dst.put_u8(b ^ key[i & 3]);
                }
            }
            None => dst.put_slice(&self.payload),
        }
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self.payload.get(..2) {
            Some(b) if self.opcode() == OpCode::Close => {
                Some(CloseCode::from(u16::from_be_bytes([b[0], b[1]])))
            }
            _ => None,
        }
    }

    /// Validate a received close payload and return its status code.
    ///
    /// The payload is empty, or a two-byte code followed by a UTF-8 reason.
    pub fn close_status(&self) -> Result<Option<CloseCode>, StreamError> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(StreamError::Protocol("close payload of one byte")),
            _ if std::str::from_utf8(&self.payload[2..]).is_err() => {
                Err(StreamError::Protocol("close reason is not valid UTF-8"))
            }
            _ => Ok(self.close_code()),
        }
    }
}

// ── Encoding helpers ─────────────────────────────────────────────

/// Encode one unmasked server frame into `dst`.
pub fn encode_frame<B: BufMut>(flags: FrameFlags, opcode: OpCode, payload: &[u8], dst: &mut B) {
    FrameHeader::new(flags, opcode, payload.len()).encode(dst);
    dst.put_slice(payload);
}

/// Encode a whole message into `dst`, fragmenting at `chunk_size`.
///
/// The first fragment carries `opcode` (and RSV1 when `compressed`),
/// later fragments are continuations, and only the last has FIN set.
/// Returns the number of frames written.
pub fn encode_message<B: BufMut>(
    opcode: OpCode,
    payload: &[u8],
    chunk_size: usize,
    compressed: bool,
    dst: &mut B,
) -> usize {
    let rsv1 = if compressed {
        FrameFlags::RSV1
    } else {
        FrameFlags::empty()
    };
    if chunk_size == 0 || payload.len() <= chunk_size {
        encode_frame(FrameFlags::FIN | rsv1, opcode, payload, dst);
        return 1;
    }

    let count = payload.len().div_ceil(chunk_size);
    for (i, chunk) in payload.chunks(chunk_size).enumerate() {
        let mut flags = FrameFlags::empty();
        if i == 0 {
            flags |= rsv1;
        }
        if i + 1 == count {
            flags |= FrameFlags::FIN;
        }
        let op = if i == 0 { opcode } else { OpCode::Continuation };
        encode_frame(flags, op, chunk, dst);
    }
    count
}

/// Upper bound on the wire size of [`encode_message`]'s output.
pub fn encoded_message_len(payload_len: usize, chunk_size: usize) -> usize {
    let frames = if chunk_size == 0 {
        1
    } else {
        payload_len.div_ceil(chunk_size).max(1)
    };
    payload_len + frames * MAX_HEADER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_roundtrip(len: u64, mask: Option<[u8; 4]>) {
        let header = FrameHeader {
            flags: FrameFlags::FIN,
            opcode: OpCode::Binary,
            mask,
            payload_len: len,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), header.encoded_len());
        let (parsed, used) = FrameHeader::parse(&buf).unwrap().unwrap();
        assert_eq!(parsed, header);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn length_encodings() {
        header_roundtrip(0, None);
        header_roundtrip(125, None);
        header_roundtrip(126, None);
        header_roundtrip(65_535, Some([1, 2, 3, 4]));
        header_roundtrip(65_536, None);
        header_roundtrip(76_801, Some([9, 9, 9, 9]));
    }

    #[test]
    fn sixteen_bit_length_layout() {
        let mut buf = BytesMut::new();
        FrameHeader::new(FrameFlags::FIN, OpCode::Binary, 300).encode(&mut buf);
        assert_eq!(&buf[..], &[0x82, 126, 0x01, 0x2C]);
    }

    #[test]
    fn partial_header_needs_more() {
        assert!(FrameHeader::parse(&[0x82]).unwrap().is_none());
        assert!(FrameHeader::parse(&[0x82, 126, 0x01]).unwrap().is_none());
        assert!(FrameHeader::parse(&[0x82, 0x85, 1, 2]).unwrap().is_none());
    }

    #[test]
    fn reserved_opcode_rejected() {
        assert!(FrameHeader::parse(&[0x83, 0x00]).is_err());
        assert!(FrameHeader::parse(&[0x8B, 0x00]).is_err());
    }

    #[test]
    fn mask_is_an_involution() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, key);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        apply_mask(&mut data, key);
        assert_eq!(data, b"Hello");
    }

    #[test]
    fn small_message_is_single_frame() {
        let mut buf = BytesMut::new();
        assert_eq!(encode_message(OpCode::Binary, &[1, 2, 3], 16, false, &mut buf), 1);
        assert_eq!(&buf[..], &[0x82, 3, 1, 2, 3]);
    }

    #[test]
    fn fragments_flag_layout() {
        let payload = vec![0xAB; 25];
        let mut buf = BytesMut::new();
        assert_eq!(encode_message(OpCode::Binary, &payload, 10, true, &mut buf), 3);
        // first: RSV1 | Binary, no FIN
        assert_eq!(buf[0], 0x42);
        // second: Continuation, no FIN
        assert_eq!(buf[12], 0x00);
        // third: FIN | Continuation
        assert_eq!(buf[24], 0x80);
        assert_eq!(buf[25], 5);
        assert!(buf.len() <= encoded_message_len(25, 10));
    }

    #[test]
    fn close_frame_carries_code() {
        let frame = WsFrame::close(CloseCode::GoingAway, "bye");
        assert_eq!(frame.close_code(), Some(CloseCode::GoingAway));
        assert_eq!(&frame.payload[..2], &[0x03, 0xE9]);
    }

    #[test]
    fn close_status_rejects_malformed_payloads() {
        let close = |payload: &[u8]| {
            WsFrame::new(FrameFlags::FIN, OpCode::Close, BytesMut::from(payload))
        };
        assert_eq!(close(&[]).close_status().unwrap(), None);
        assert_eq!(
            WsFrame::close(CloseCode::Normal, "done").close_status().unwrap(),
            Some(CloseCode::Normal)
        );
        assert!(close(&[0x03]).close_status().is_err());
        assert!(close(&[0x03, 0xE8, 0xFF, 0xFE]).close_status().is_err());
    }
}
