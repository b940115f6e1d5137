//! Hand-rolled WebSocket protocol engine (RFC 6455 + RFC 7692).
//!
//! - [`handshake`]: HTTP Upgrade parsing, accept key, rejection statuses.
//! - [`frame`]: header layout, masking, close codes, fragmentation.
//! - [`codec`]: `tokio_util` `Decoder`/`Encoder` in server or client role.
//! - [`deflate`]: permessage-deflate negotiation and per-direction streams.
//! - [`state`]: the connection lifecycle state machine.

pub mod codec;
pub mod deflate;
pub mod frame;
pub mod handshake;
pub mod state;

pub use codec::{Role, WsCodec};
pub use deflate::{DeflateParams, Deflater, Inflater};
pub use frame::{CloseCode, FrameFlags, FrameHeader, OpCode, WsFrame, encode_message};
pub use handshake::{Handshake, HandshakeOptions, accept_key};
pub use state::ConnectionState;
