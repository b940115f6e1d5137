//! # fbcast-server: framebuffer streaming host
//!
//! Loads a TOML configuration, builds the `fbcast-core` pipeline and
//! serves it to browser viewers over WebSocket.
//!
//! ## Modules
//!
//! - **config**: sectioned TOML settings, clamped into a `StreamConfig`.
//! - **service**: pipeline wiring, startup and orderly shutdown.
//! - **pattern**: animated test pattern standing in for a renderer.

pub mod config;
pub mod pattern;
pub mod service;
