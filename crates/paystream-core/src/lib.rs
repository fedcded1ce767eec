//! # paystream core
//!
//! A multiplexed payment-and-data protocol carried inside conditional
//! payment packets.
//!
//! This crate provides:
//! - Encrypted payload and frame codec
//! - Streams carrying ordered bytes and money in both directions
//! - Amount-based congestion control and replay protection
//! - The connection engine (outbound scheduling, inbound validation)
//! - A server router and a client entry point
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Server / create_connection                  │
//! │   (routes packets by connection id, authenticates first use)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Connection                              │
//! │   (sequence numbers, congestion, handshake, close)              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Streams                                 │
//! │   (flow-controlled bytes and money per stream id)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Frames                                  │
//! │   (encrypted payload of every Prepare, Fulfill and Reject)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod client;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod frame;
pub mod replay;
pub mod server;
pub mod stream;

pub use client::create_connection;
pub use config::{ClientConfig, CongestionConfig, ConnectionConfig, RetryConfig, ServerConfig, TagPolicy};
pub use congestion::CongestionController;
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use error::{ConfigError, ConnectionError, FrameError, Result, StreamError};
pub use frame::{CloseCode, Frame, FrameType, PacketType, StreamPacket};
pub use replay::ReplayWindow;
pub use server::{AddressAndSecret, Server};
pub use stream::DataAndMoneyStream;

/// Stream receive window both sides assume before any `StreamMaxData`
pub const INITIAL_STREAM_WINDOW: u64 = 16 * 1024;

/// Connection receive window both sides assume before any `ConnectionMaxData`
pub const INITIAL_CONNECTION_WINDOW: u64 = 64 * 1024;

/// Highest stream id a peer may open before any `ConnectionMaxStreamId`
pub const INITIAL_MAX_STREAM_ID: u64 = 20;

/// Upper bound on the encoded payload of one outbound packet
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;
