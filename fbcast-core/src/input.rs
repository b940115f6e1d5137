//! Viewer → producer input relay.
//!
//! Reader tasks reassemble inbound data frames with a [`MessageAssembler`]
//! and hand whole messages to an [`InputSink`]. What the producer does with
//! them is its own business; [`InputEvent::decode`] parses the compact
//! binary input messages browsers send:
//!
//! | Type | Layout                              | Event                     |
//! |------|-------------------------------------|---------------------------|
//! | 0x01 | `[type][key]`                       | key down                  |
//! | 0x02 | `[type][key]`                       | key up                    |
//! | 0x03 | `[type][dx i8][dy i8][pad]`         | relative mouse move       |
//! | 0x04 | `[type][mask]`                      | mouse button state        |
//! | 0x05 | `[type][buttons][x i8][y i8]`       | joystick                  |
//!
//! Trailing bytes are ignored. Key codes are passed through unmapped.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::StreamError;
use crate::registry::ClientId;
use crate::ws::{OpCode, WsFrame};

// ── InboundMessage ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// One complete (and, if needed, inflated) message from a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub kind: MessageKind,
    pub payload: Bytes,
}

/// Receiver of viewer input.
///
/// `deliver` is called from reader tasks and must not block.
pub trait InputSink: Send + Sync {
    fn deliver(&self, client: ClientId, msg: InboundMessage);
}

/// [`InputSink`] that forwards into a bounded channel, dropping on
/// overflow.
#[derive(Debug, Clone)]
pub struct ChannelInputSink {
    tx: mpsc::Sender<(ClientId, InboundMessage)>,
}

impl ChannelInputSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<(ClientId, InboundMessage)>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl InputSink for ChannelInputSink {
    fn deliver(&self, client: ClientId, msg: InboundMessage) {
        if self.tx.try_send((client, msg)).is_err() {
            warn!("{client}: input queue full, dropping message");
        }
    }
}

/// Ignores all input.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardInput;

impl InputSink for DiscardInput {
    fn deliver(&self, _client: ClientId, _msg: InboundMessage) {}
}

// ── MessageAssembler ─────────────────────────────────────────────

/// A reassembled message before inflation.
#[derive(Debug)]
pub struct AssembledMessage {
    pub kind: MessageKind,
    /// RSV1 was set on the first fragment.
    pub compressed: bool,
    pub payload: BytesMut,
}

/// Joins data fragments into whole messages.
///
/// Frame-level sequencing (no stray continuations, no interleaved
/// messages) is already enforced by the codec.
#[derive(Debug)]
pub struct MessageAssembler {
    max_size: usize,
    current: Option<(MessageKind, bool)>,
    buf: BytesMut,
}

impl MessageAssembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current: None,
            buf: BytesMut::new(),
        }
    }

    /// Feed one data frame. Returns the message once its final fragment
    /// arrives.
    pub fn push(&mut self, frame: WsFrame) -> Result<Option<AssembledMessage>, StreamError> {
        let is_final = frame.is_final();
        let (kind, compressed) = match frame.opcode() {
            OpCode::Text => (MessageKind::Text, frame.is_compressed()),
            OpCode::Binary => (MessageKind::Binary, frame.is_compressed()),
            OpCode::Continuation => self
                .current
                .ok_or(StreamError::Protocol("continuation without a message"))?,
            _ => return Err(StreamError::Protocol("control frame fed to assembler")),
        };

        let size = self.buf.len() + frame.payload.len();
        if size > self.max_size {
            self.current = None;
            self.buf.clear();
            return Err(StreamError::PayloadTooLarge {
                size,
                max: self.max_size,
            });
        }

        if is_final && self.buf.is_empty() {
            // Unfragmented: hand over the frame's buffer as is.
            self.current = None;
            return Ok(Some(AssembledMessage {
                kind,
                compressed,
                payload: frame.payload,
            }));
        }

        self.buf.extend_from_slice(&frame.payload);
        if !is_final {
            self.current = Some((kind, compressed));
            return Ok(None);
        }

        self.current = None;
        Ok(Some(AssembledMessage {
            kind,
            compressed,
            payload: self.buf.split(),
        }))
    }

    pub fn in_message(&self) -> bool {
        self.current.is_some()
    }
}

// ── InputEvent ───────────────────────────────────────────────────

/// A decoded binary input message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    KeyDown { code: u8 },
    KeyUp { code: u8 },
    MouseMove { dx: i8, dy: i8 },
    MouseButton { mask: u8 },
    Joystick { buttons: u8, x: i8, y: i8 },
}

impl InputEvent {
    pub fn decode(data: &[u8]) -> Result<Self, StreamError> {
        let (&ty, rest) = data
            .split_first()
            .ok_or(StreamError::Protocol("empty input message"))?;

        let need = match ty {
            0x01 | 0x02 | 0x04 => 1,
            0x03 | 0x05 => 3,
            _ => {
                return Err(StreamError::UnknownVariant {
                    type_name: "InputEvent",
                    value: u64::from(ty),
                });
            }
        };
        if rest.len() < need {
            return Err(StreamError::Protocol("truncated input message"));
        }

        Ok(match ty {
            0x01 => InputEvent::KeyDown { code: rest[0] },
            0x02 => InputEvent::KeyUp { code: rest[0] },
            0x03 => InputEvent::MouseMove {
                dx: rest[0] as i8,
                dy: rest[1] as i8,
            },
            0x04 => InputEvent::MouseButton { mask: rest[0] },
            _ => InputEvent::Joystick {
                buttons: rest[0],
                x: rest[1] as i8,
                y: rest[2] as i8,
            },
        })
    }
}
