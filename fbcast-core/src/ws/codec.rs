//! `tokio_util` codec for WebSocket frames.
//!
//! The decoder validates each header before waiting for its payload:
//!
//! | Check                                    | Error                 |
//! |------------------------------------------|-----------------------|
//! | RSV2 / RSV3 set                          | protocol              |
//! | RSV1 without negotiated deflate          | protocol              |
//! | RSV1 on a control or continuation frame  | protocol              |
//! | control frame fragmented or > 125 bytes  | protocol              |
//! | server role and frame unmasked           | protocol              |
//! | client role and frame masked             | protocol              |
//! | continuation outside a message           | protocol              |
//! | new data frame inside a message          | protocol              |
//! | payload above `max_payload`              | payload too large     |
//!
//! Reassembly of fragments is left to the reader.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::StreamError;
use crate::ws::frame::{
    FrameFlags, FrameHeader, MAX_CONTROL_PAYLOAD, OpCode, WsFrame, apply_mask,
};

/// Which end of the connection this codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Expects masked input, writes unmasked frames.
    Server,
    /// Expects unmasked input, masks every outgoing frame.
    Client,
}

#[derive(Debug)]
pub struct WsCodec {
    role: Role,
    max_payload: usize,
    deflate: bool,
    in_message: bool,
    mask_seed: u32,
}

impl WsCodec {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            role,
            max_payload,
            deflate: false,
            in_message: false,
            mask_seed: 0x9E37_79B9,
        }
    }

    pub fn server(max_payload: usize) -> Self {
        Self::new(Role::Server, max_payload)
    }

    pub fn client(max_payload: usize) -> Self {
        Self::new(Role::Client, max_payload)
    }

    /// Accept RSV1 on first fragments (permessage-deflate negotiated).
    pub fn with_deflate(mut self, negotiated: bool) -> Self {
        self.deflate = negotiated;
        self
    }

    fn validate(&mut self, header: &FrameHeader) -> Result<(), StreamError> {
        let flags = header.flags;
        if flags.intersects(FrameFlags::RSV2 | FrameFlags::RSV3) {
            return Err(StreamError::Protocol("reserved bits set"));
        }

        let opcode = header.opcode;
        if flags.contains(FrameFlags::RSV1)
            && (!self.deflate || opcode.is_control() || opcode == OpCode::Continuation)
        {
            return Err(StreamError::Protocol("unexpected RSV1"));
        }

        if opcode.is_control() {
            if !header.is_final() {
                return Err(StreamError::Protocol("fragmented control frame"));
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(StreamError::Protocol("control frame payload too long"));
            }
        }

        match (self.role, header.mask.is_some()) {
            (Role::Server, false) => return Err(StreamError::Protocol("client frame not masked")),
            (Role::Client, true) => return Err(StreamError::Protocol("server frame masked")),
            _ => {}
        }

        if header.payload_len > self.max_payload as u64 {
            return Err(StreamError::PayloadTooLarge {
                size: usize::try_from(header.payload_len).unwrap_or(usize::MAX),
                max: self.max_payload,
            });
        }

        match opcode {
            OpCode::Continuation if !self.in_message => {
                Err(StreamError::Protocol("continuation without a message"))
            }
            OpCode::Text | OpCode::Binary if self.in_message => {
                Err(StreamError::Protocol("new message before the previous one ended"))
            }
            _ => Ok(()),
        }
    }

    /// Next masking key for client-role output (xorshift).
    fn next_mask(&mut self) -> [u8; 4] {
        let mut x = self.mask_seed;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.mask_seed = x;
        x.to_be_bytes()
    }
}

impl Decoder for WsCodec {
    type Item = WsFrame;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>, StreamError> {
        let Some((header, header_len)) = FrameHeader::parse(src)? else {
            return Ok(None);
        };
        self.validate(&header)?;

        // Bounded by `max_payload` above.
        let total = header_len + header.payload_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(total).split_off(header_len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        if !header.opcode.is_control() {
            self.in_message = !header.is_final();
        }

        Ok(Some(WsFrame { header, payload }))
    }
}

impl Encoder<WsFrame> for WsCodec {
    type Error = StreamError;

    fn encode(&mut self, mut frame: WsFrame, dst: &mut BytesMut) -> Result<(), StreamError> {
        frame.header.mask = match self.role {
            Role::Server => None,
            Role::Client => Some(frame.header.mask.unwrap_or_else(|| self.next_mask())),
        };
        dst.reserve(frame.header.encoded_len() + frame.payload.len());
        frame.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::frame::{CloseCode, encode_message};

    fn client_frame_bytes(frame: WsFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        WsCodec::client(1 << 20)
            .encode(frame.masked([1, 2, 3, 4]), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn server_decodes_masked_client_frame() {
        let mut buf = client_frame_bytes(WsFrame::binary(b"input"));
        let frame = WsCodec::server(1024).decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Binary);
        assert_eq!(&frame.payload[..], b"input");
        assert!(buf.is_empty());
    }

    #[test]
    fn server_rejects_unmasked_frame() {
        let mut buf = BytesMut::new();
        WsCodec::server(1024)
            .encode(WsFrame::binary(b"x"), &mut buf)
            .unwrap();
        assert!(WsCodec::server(1024).decode(&mut buf).is_err());
    }

    #[test]
    fn client_rejects_masked_frame() {
        let mut buf = client_frame_bytes(WsFrame::binary(b"x"));
        assert!(WsCodec::client(1024).decode(&mut buf).is_err());
    }

    #[test]
    fn waits_for_full_payload() {
        let full = client_frame_bytes(WsFrame::binary(&[7; 300]));
        let mut codec = WsCodec::server(1024);
        let mut partial = BytesMut::from(&full[..100]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[100..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn oversized_payload_rejected_before_buffering() {
        let mut buf = client_frame_bytes(WsFrame::binary(&[0; 2000]));
        buf.truncate(20);
        let err = WsCodec::server(1000).decode(&mut buf).unwrap_err();
        assert!(matches!(err, StreamError::PayloadTooLarge { .. }));
    }

    #[test]
    fn rsv_bits_rejected() {
        let mut buf = client_frame_bytes(WsFrame::new(
            FrameFlags::FIN | FrameFlags::RSV2,
            OpCode::Binary,
            BytesMut::from(&b"x"[..]),
        ));
        assert!(WsCodec::server(1024).decode(&mut buf).is_err());

        let compressed = WsFrame::new(
            FrameFlags::FIN | FrameFlags::RSV1,
            OpCode::Binary,
            BytesMut::from(&b"x"[..]),
        );
        let mut buf = client_frame_bytes(compressed.clone());
        assert!(WsCodec::server(1024).decode(&mut buf).is_err());
        let mut buf = client_frame_bytes(compressed);
        assert!(
            WsCodec::server(1024)
                .with_deflate(true)
                .decode(&mut buf)
                .is_ok()
        );
    }

    #[test]
    fn control_frame_rules() {
        let mut buf = client_frame_bytes(WsFrame::ping(&[0; 126]));
        assert!(WsCodec::server(1024).decode(&mut buf).is_err());

        let fragmented_ping = WsFrame::new(FrameFlags::empty(), OpCode::Ping, BytesMut::new());
        let mut buf = client_frame_bytes(fragmented_ping);
        assert!(WsCodec::server(1024).decode(&mut buf).is_err());
    }

    #[test]
    fn control_frame_between_fragments_is_allowed() {
        let mut codec = WsCodec::server(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&client_frame_bytes(WsFrame::new(
            FrameFlags::empty(),
            OpCode::Binary,
            BytesMut::from(&b"ab"[..]),
        )));
        buf.extend_from_slice(&client_frame_bytes(WsFrame::ping(b"p")));
        buf.extend_from_slice(&client_frame_bytes(WsFrame::new(
            FrameFlags::FIN,
            OpCode::Continuation,
            BytesMut::from(&b"cd"[..]),
        )));

        let ops: Vec<OpCode> = std::iter::from_fn(|| codec.decode(&mut buf).unwrap())
            .map(|f| f.opcode())
            .collect();
        assert_eq!(ops, vec![OpCode::Binary, OpCode::Ping, OpCode::Continuation]);
    }

    #[test]
    fn stray_continuation_rejected() {
        let mut buf = client_frame_bytes(WsFrame::new(
            FrameFlags::FIN,
            OpCode::Continuation,
            BytesMut::new(),
        ));
        assert!(WsCodec::server(1024).decode(&mut buf).is_err());
    }

    #[test]
    fn client_decodes_fragmented_server_message() {
        let payload: Vec<u8> = (0..5 * 64 + 37).map(|i| i as u8).collect();
        let mut wire = BytesMut::new();
        encode_message(OpCode::Binary, &payload, 64, false, &mut wire);

        let mut codec = WsCodec::client(1 << 16);
        let mut reassembled = Vec::new();
        let mut fins = Vec::new();
        while let Some(frame) = codec.decode(&mut wire).unwrap() {
            fins.push(frame.is_final());
            reassembled.extend_from_slice(&frame.payload);
        }
        assert_eq!(reassembled, payload);
        assert_eq!(fins.len(), 6);
        assert_eq!(fins.iter().filter(|&&f| f).count(), 1);
        assert_eq!(fins.last(), Some(&true));
    }

    #[test]
    fn close_frame_roundtrip() {
        let mut buf = client_frame_bytes(WsFrame::close(CloseCode::Normal, ""));
        let frame = WsCodec::server(1024).decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
    }
}
