//! Conditional-payment packet records and their byte codec.
//!
//! Three records travel over a plugin:
//!
//! - [`Prepare`]: a request carrying an amount, an expiry, a condition, a
//!   destination and opaque data.
//! - [`Fulfill`]: the successful response, carrying the fulfillment.
//! - [`Reject`]: the failed response, carrying an error code.
//!
//! ## Wire Format
//!
//! ```text
//! type (u8: 12 prepare, 13 fulfill, 14 reject) || body
//!
//! prepare: amount u64 | expires_at_ms u64 | condition [32] | destination var | data var
//! fulfill: fulfillment [32] | data var
//! reject:  code [3] | triggered_by var | message var | data var
//! ```
//!
//! Integers are big-endian; `var` fields are a u32 length followed by bytes.

use paystream_crypto::{CONDITION_SIZE, FULFILLMENT_SIZE};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Packet type byte for [`Prepare`].
pub const TYPE_PREPARE: u8 = 12;
/// Packet type byte for [`Fulfill`].
pub const TYPE_FULFILL: u8 = 13;
/// Packet type byte for [`Reject`].
pub const TYPE_REJECT: u8 = 14;

/// Largest `var` field accepted when decoding.
pub const MAX_FIELD_LEN: usize = 1 << 20;

/// Packet codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Input ended before the record was complete
    #[error("packet truncated: needed {needed} more bytes")]
    Truncated {
        /// Bytes missing
        needed: usize,
    },

    /// Unknown packet type byte
    #[error("unknown packet type: {0}")]
    UnknownType(u8),

    /// Bytes left after the record
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    /// A length-prefixed field exceeds [`MAX_FIELD_LEN`]
    #[error("field too long: {0} bytes")]
    FieldTooLong(usize),

    /// Text field is not valid UTF-8
    #[error("invalid UTF-8 in text field")]
    InvalidUtf8,

    /// A different record type was expected
    #[error("expected packet type {expected}, got {actual}")]
    UnexpectedType {
        /// Expected type byte
        expected: u8,
        /// Actual type byte
        actual: u8,
    },
}

/// Three-character reject code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode([u8; 3]);

/// Broad class of a reject code, taken from its first letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// `F`: retrying the same packet will not help
    Final,
    /// `T`: the condition may clear, retry later
    Temporary,
    /// `R`: relative to the packet's timing, e.g. it expired
    Relative,
    /// Anything else
    Unknown,
}

impl ErrorCode {
    /// F00 Bad Request
    pub const F00_BAD_REQUEST: Self = Self(*b"F00");
    /// F02 Unreachable
    pub const F02_UNREACHABLE: Self = Self(*b"F02");
    /// F05 Wrong Condition
    pub const F05_WRONG_CONDITION: Self = Self(*b"F05");
    /// F06 Unexpected Payment
    pub const F06_UNEXPECTED_PAYMENT: Self = Self(*b"F06");
    /// F08 Amount Too Large
    pub const F08_AMOUNT_TOO_LARGE: Self = Self(*b"F08");
    /// F99 Application Error
    pub const F99_APPLICATION_ERROR: Self = Self(*b"F99");
    /// T00 Internal Error
    pub const T00_INTERNAL_ERROR: Self = Self(*b"T00");
    /// T04 Insufficient Liquidity
    pub const T04_INSUFFICIENT_LIQUIDITY: Self = Self(*b"T04");
    /// R00 Transfer Timed Out
    pub const R00_TRANSFER_TIMED_OUT: Self = Self(*b"R00");

    /// Create from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }

    /// Class of this code.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self.0[0] {
            b'F' => ErrorClass::Final,
            b'T' => ErrorClass::Temporary,
            b'R' => ErrorClass::Relative,
            _ => ErrorClass::Unknown,
        }
    }

    /// True for codes worth retrying with the same content.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self.class(), ErrorClass::Temporary)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{}", char::from(b))?;
        }
        Ok(())
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({self})")
    }
}

/// Conditional-payment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    /// Amount in the sender's asset units
    pub amount: u64,
    /// Deadline after which the request can no longer be fulfilled
    pub expires_at: SystemTime,
    /// Hash the fulfillment must match
    pub execution_condition: [u8; CONDITION_SIZE],
    /// Destination address
    pub destination: String,
    /// Opaque payload
    pub data: Vec<u8>,
}

impl Prepare {
    /// True if the expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= SystemTime::now()
    }
}

/// Successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfill {
    /// Preimage of the request's condition
    pub fulfillment: [u8; FULFILLMENT_SIZE],
    /// Opaque payload
    pub data: Vec<u8>,
}

/// Failed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// Reject code
    pub code: ErrorCode,
    /// Address of the node that produced the reject
    pub triggered_by: String,
    /// Human-readable message
    pub message: String,
    /// Opaque payload
    pub data: Vec<u8>,
}

impl Reject {
    /// Build a reject with an empty message and no data.
    #[must_use]
    pub fn new(code: ErrorCode, triggered_by: impl Into<String>) -> Self {
        Self {
            code,
            triggered_by: triggered_by.into(),
            message: String::new(),
            data: Vec::new(),
        }
    }

    /// `F08` details, if present and well-formed.
    #[must_use]
    pub fn amount_too_large(&self) -> Option<AmountTooLarge> {
        if self.code != ErrorCode::F08_AMOUNT_TOO_LARGE {
            return None;
        }
        AmountTooLarge::decode(&self.data)
    }
}

/// Data carried by an `F08 Amount Too Large` reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountTooLarge {
    /// Amount the rejecting hop saw
    pub received_amount: u64,
    /// Largest amount it would have accepted
    pub maximum_amount: u64,
}

impl AmountTooLarge {
    /// Encode to the 16-byte reject data layout.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.received_amount.to_be_bytes());
        out.extend_from_slice(&self.maximum_amount.to_be_bytes());
        out
    }

    /// Decode from reject data.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let received: [u8; 8] = data.get(..8)?.try_into().ok()?;
        let maximum: [u8; 8] = data.get(8..16)?.try_into().ok()?;
        Some(Self {
            received_amount: u64::from_be_bytes(received),
            maximum_amount: u64::from_be_bytes(maximum),
        })
    }
}

/// Any record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Request
    Prepare(Prepare),
    /// Success response
    Fulfill(Fulfill),
    /// Failure response
    Reject(Reject),
}

impl Packet {
    /// Type byte of this record.
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::Prepare(_) => TYPE_PREPARE,
            Self::Fulfill(_) => TYPE_FULFILL,
            Self::Reject(_) => TYPE_REJECT,
        }
    }

    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u8(self.type_byte());
        match self {
            Self::Prepare(p) => {
                w.u64(p.amount);
                w.u64(to_millis(p.expires_at));
                w.raw(&p.execution_condition);
                w.var(p.destination.as_bytes());
                w.var(&p.data);
            }
            Self::Fulfill(f) => {
                w.raw(&f.fulfillment);
                w.var(&f.data);
            }
            Self::Reject(r) => {
                w.raw(r.code.as_bytes());
                w.var(r.triggered_by.as_bytes());
                w.var(r.message.as_bytes());
                w.var(&r.data);
            }
        }
        w.0
    }

    /// Parse bytes produced by [`Packet::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] for truncated, oversized, or trailing input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        let packet = match r.u8()? {
            TYPE_PREPARE => Self::Prepare(Prepare {
                amount: r.u64()?,
                expires_at: from_millis(r.u64()?),
                execution_condition: r.array()?,
                destination: r.string()?,
                data: r.var()?.to_vec(),
            }),
            TYPE_FULFILL => Self::Fulfill(Fulfill {
                fulfillment: r.array()?,
                data: r.var()?.to_vec(),
            }),
            TYPE_REJECT => Self::Reject(Reject {
                code: ErrorCode(r.array()?),
                triggered_by: r.string()?,
                message: r.string()?,
                data: r.var()?.to_vec(),
            }),
            other => return Err(PacketError::UnknownType(other)),
        };
        r.finish()?;
        Ok(packet)
    }
}

impl Prepare {
    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        Packet::Prepare(self.clone()).to_bytes()
    }

    /// Parse a serialized Prepare.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::UnexpectedType`] if the bytes hold another record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        match Packet::from_bytes(bytes)? {
            Packet::Prepare(p) => Ok(p),
            other => Err(PacketError::UnexpectedType {
                expected: TYPE_PREPARE,
                actual: other.type_byte(),
            }),
        }
    }
}

impl From<Prepare> for Packet {
    fn from(p: Prepare) -> Self {
        Self::Prepare(p)
    }
}

impl From<Fulfill> for Packet {
    fn from(f: Fulfill) -> Self {
        Self::Fulfill(f)
    }
}

impl From<Reject> for Packet {
    fn from(r: Reject) -> Self {
        Self::Reject(r)
    }
}

fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH
        .checked_add(Duration::from_millis(ms))
        .unwrap_or(UNIX_EPOCH)
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn var(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.0.extend_from_slice(bytes);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.buf.len() < n {
            return Err(PacketError::Truncated {
                needed: n - self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u64(&mut self) -> Result<u64, PacketError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn var(&mut self) -> Result<&'a [u8], PacketError> {
        let len = u32::from_be_bytes(self.array()?) as usize;
        if len > MAX_FIELD_LEN {
            return Err(PacketError::FieldTooLong(len));
        }
        self.take(len)
    }

    fn string(&mut self) -> Result<String, PacketError> {
        let bytes = self.var()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::InvalidUtf8)
    }

    fn finish(self) -> Result<(), PacketError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(PacketError::TrailingBytes(self.buf.len()))
        }
    }
}
