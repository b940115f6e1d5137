//! WebSocket connection lifecycle.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::error::StreamError;

// ── ConnectionState ──────────────────────────────────────────────

/// Lifecycle of one viewer connection.
///
/// ```text
///  Connecting ──► Open ──► Closing ──► Closed
///       │           │                    ▲
///       └───────────┴────────────────────┘
///      (bad handshake / socket error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// TCP accepted, upgrade not yet complete.
    #[default]
    Connecting,

    /// Upgrade complete; frames flow.
    Open { since: Instant },

    /// A close frame was sent or received; waiting for the other side.
    Closing {
        since: Instant,
        /// We sent the first close frame.
        initiated_locally: bool,
    },

    /// Terminal.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open { .. } => write!(f, "Open"),
            Self::Closing { .. } => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether a close handshake has been pending longer than `timeout`.
    pub fn close_expired(&self, timeout: Duration) -> bool {
        matches!(self, Self::Closing { since, .. } if since.elapsed() >= timeout)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Connecting`.
    pub fn open(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Connecting => {
                *self = Self::Open {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(StreamError::Protocol("cannot open: not in Connecting state")),
        }
    }

    /// Valid from: `Open`.
    pub fn begin_close(&mut self, initiated_locally: bool) -> Result<(), StreamError> {
        match self {
            Self::Open { .. } => {
                *self = Self::Closing {
                    since: Instant::now(),
                    initiated_locally,
                };
                Ok(())
            }
            _ => Err(StreamError::Protocol("cannot close: not in Open state")),
        }
    }

    /// Valid from: `Closing`, and `Connecting` for a failed handshake.
    pub fn finish_close(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Closing { .. } | Self::Connecting => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(StreamError::Protocol(
                "cannot finish close: no close in progress",
            )),
        }
    }

    /// Drop straight to `Closed`, e.g. after a socket error.
    pub fn force_close(&mut self) {
        *self = Self::Closed;
    }
}
