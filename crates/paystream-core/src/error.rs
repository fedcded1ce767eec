//! Error types for the paystream core protocol.
//!
//! Errors are split by the layer that raises them:
//!
//! - [`FrameError`]: malformed or unsupported encrypted payloads
//! - [`StreamError`]: failures surfaced to a single stream's reader or writer
//! - [`ConnectionError`]: failures of a whole connection or of setup calls
//! - [`ConfigError`]: invalid configuration, detected eagerly
//!
//! None of these ever travel over the wire with detail. Rejections caused by
//! authentication, routing or sequence failures are opaque.

use crate::frame::CloseCode;
use paystream_transport::{ErrorCode, Reject, TransportError};
use std::borrow::Cow;
use thiserror::Error;

/// Frame-level decode errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Input too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Payload version byte is not understood
    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(u8),

    /// Packet type byte is not prepare, fulfill or reject
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// Mandatory frame type this implementation does not understand
    #[error("unsupported frame type: 0x{0:02X}")]
    UnsupportedFrame(u8),

    /// A frame's contents do not match its type
    #[error("malformed frame 0x{frame_type:02X}: {reason}")]
    Malformed {
        /// Frame type byte
        frame_type: u8,
        /// What was wrong
        reason: &'static str,
    },

    /// Unknown close code
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u8),

    /// Bytes left after the declared frames
    #[error("{0} trailing bytes after frames")]
    TrailingBytes(usize),
}

impl FrameError {
    /// True if the sender is authentic but speaks something we must not
    /// ignore. These terminate the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedFrame(_))
    }
}

/// Errors surfaced to a stream's reader or writer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The direction was already closed locally
    #[error("stream is closed")]
    Closed,

    /// Connection was configured to refuse outgoing money
    #[error("connection is receive-only")]
    ReceiveOnly,

    /// Requested send max is below what was already sent
    #[error("send max {requested} is below total sent {sent}")]
    SendMaxBelowSent {
        /// Requested total
        requested: u64,
        /// Already sent
        sent: u64,
    },

    /// Money direction closed while the peer's receive max held money back
    #[error("peer's receive max left {unsent} unsent")]
    ReceiveMaxReached {
        /// Requested but never sent
        unsent: u64,
    },

    /// Retries were exhausted for a pending send
    #[error("delivery failed after {attempts} attempts")]
    DeliveryFailed {
        /// Attempts made
        attempts: u32,
    },

    /// A packet carrying this stream's data or money was rejected for good
    #[error("rejected: {code} {message}")]
    Rejected {
        /// Reject code
        code: ErrorCode,
        /// Reject message
        message: String,
    },

    /// Peer closed the stream with an error
    #[error("stream closed by peer: {code:?} {message}")]
    RemoteClosed {
        /// Close code
        code: CloseCode,
        /// Close message
        message: String,
    },

    /// The owning connection closed
    #[error("connection closed")]
    ConnectionClosed,
}

/// Connection-level errors
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    // ============ Setup Errors ============
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Transport operation failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(#[from] paystream_crypto::CryptoError),

    // ============ Protocol Errors ============
    /// Payload decode failed
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Peer violated the protocol
    #[error("protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// Handshake was rejected
    #[error("handshake rejected: {code} {message}")]
    HandshakeRejected {
        /// Reject code
        code: ErrorCode,
        /// Reject message
        message: String,
    },

    // ============ Lifecycle Errors ============
    /// Connection is closed
    #[error("connection closed")]
    Closed,

    /// Peer closed the connection with an error
    #[error("connection closed by peer: {code:?} {message}")]
    RemoteClosed {
        /// Close code
        code: CloseCode,
        /// Close message
        message: String,
    },

    /// Peer does not allow more streams yet
    #[error("stream id {requested} exceeds peer limit {max}")]
    StreamIdBlocked {
        /// Id that would have been used
        requested: u64,
        /// Current peer limit
        max: u64,
    },

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Server is shutting down
    #[error("server is closed")]
    ServerClosed,
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_transient(),
            Self::Timeout(_) | Self::StreamIdBlocked { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the connection cannot continue after this error
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Frame(e) => e.is_fatal(),
            Self::Protocol(_) | Self::Closed | Self::RemoteClosed { .. } => true,
            _ => false,
        }
    }

    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Timeout(msg.into())
    }
}

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field has an unusable value
    #[error("{field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was refused
        reason: Cow<'static, str>,
    },

    /// Connection tag outside the allowed character set or length
    #[error("invalid connection tag {0:?}: only A-Z a-z 0-9 _ - allowed")]
    InvalidTag(String),
}

impl ConfigError {
    /// Create an invalid-field error
    pub fn invalid(field: &'static str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for connection operations
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// The single reject used for every authentication, routing and sequence
/// failure. Only `triggered_by` varies, and it is always the local address.
#[must_use]
pub fn opaque_reject(triggered_by: &str) -> Reject {
    Reject::new(ErrorCode::F02_UNREACHABLE, triggered_by)
}
