//! Frame encoding and decoding for the paystream wire protocol.
//!
//! Every conditional-payment packet exchanged by a connection carries one
//! encrypted [`StreamPacket`]: a short header followed by a list of
//! self-delimited frames. All multi-byte fields are big-endian.
//!
//! ```text
//! version u8 | packet_type u8 | sequence u64 | prepare_amount u64 | frame_count u16 | frames
//! frame:     type u8 | length u32 | contents
//! ```
//!
//! Frame types `0x80..=0xFF` are an extension range: unknown types there are
//! skipped. Any other unknown type is [`FrameError::UnsupportedFrame`].

use crate::error::FrameError;
use paystream_crypto::{CryptoError, PacketCipher};
use paystream_transport::packet::{TYPE_FULFILL, TYPE_PREPARE, TYPE_REJECT};

/// Payload format version
pub const PAYLOAD_VERSION: u8 = 1;

/// Fixed payload header size in bytes
pub const PACKET_HEADER_SIZE: usize = 20;

/// Per-frame header size (type + length)
pub const FRAME_HEADER_SIZE: usize = 5;

/// First frame type of the ignorable extension range
pub const EXTENSION_RANGE_START: u8 = 0x80;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Connection closed, with reason
    ConnectionClose = 0x01,
    /// Sender's own address
    ConnectionNewAddress = 0x02,
    /// Connection-level receive window
    ConnectionMaxData = 0x03,
    /// Sender is blocked on the connection window
    ConnectionDataBlocked = 0x04,
    /// Highest stream id the sender accepts from its peer
    ConnectionMaxStreamId = 0x05,
    /// Sender wants to open more streams
    ConnectionStreamIdBlocked = 0x06,
    /// Sender's asset code and scale
    ConnectionAssetDetails = 0x07,
    /// Stream aborted in both directions
    StreamClose = 0x10,
    /// Money for a stream
    StreamMoney = 0x11,
    /// Stream money receive limit
    StreamMaxMoney = 0x12,
    /// Sender is blocked on the stream money limit
    StreamMoneyBlocked = 0x13,
    /// Stream bytes
    StreamData = 0x14,
    /// Stream receive window
    StreamMaxData = 0x15,
    /// Sender is blocked on the stream window
    StreamDataBlocked = 0x16,
    /// No more money will be sent on the stream
    StreamMoneyClose = 0x17,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::ConnectionClose),
            0x02 => Ok(Self::ConnectionNewAddress),
            0x03 => Ok(Self::ConnectionMaxData),
            0x04 => Ok(Self::ConnectionDataBlocked),
            0x05 => Ok(Self::ConnectionMaxStreamId),
            0x06 => Ok(Self::ConnectionStreamIdBlocked),
            0x07 => Ok(Self::ConnectionAssetDetails),
            0x10 => Ok(Self::StreamClose),
            0x11 => Ok(Self::StreamMoney),
            0x12 => Ok(Self::StreamMaxMoney),
            0x13 => Ok(Self::StreamMoneyBlocked),
            0x14 => Ok(Self::StreamData),
            0x15 => Ok(Self::StreamMaxData),
            0x16 => Ok(Self::StreamDataBlocked),
            0x17 => Ok(Self::StreamMoneyClose),
            _ => Err(FrameError::UnsupportedFrame(value)),
        }
    }
}

/// Close reason carried by `ConnectionClose` and `StreamClose`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseCode {
    /// Normal close
    NoError = 0x01,
    /// Local failure
    InternalError = 0x02,
    /// Too busy to serve
    EndpointBusy = 0x03,
    /// Flow-control limit exceeded
    FlowControlError = 0x04,
    /// Stream id outside the allowed range
    StreamIdError = 0x05,
    /// Frame inconsistent with stream state
    StreamStateError = 0x06,
    /// Malformed frame
    FrameFormatError = 0x07,
    /// Any other protocol violation
    ProtocolViolation = 0x08,
    /// Application-level error
    ApplicationError = 0x09,
}

impl TryFrom<u8> for CloseCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::NoError),
            0x02 => Ok(Self::InternalError),
            0x03 => Ok(Self::EndpointBusy),
            0x04 => Ok(Self::FlowControlError),
            0x05 => Ok(Self::StreamIdError),
            0x06 => Ok(Self::StreamStateError),
            0x07 => Ok(Self::FrameFormatError),
            0x08 => Ok(Self::ProtocolViolation),
            0x09 => Ok(Self::ApplicationError),
            _ => Err(FrameError::InvalidCloseCode(value)),
        }
    }
}

/// Which transport record a payload rides in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Request
    Prepare,
    /// Success response
    Fulfill,
    /// Failure response
    Reject,
}

impl PacketType {
    /// Wire byte, shared with the transport record type
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Prepare => TYPE_PREPARE,
            Self::Fulfill => TYPE_FULFILL,
            Self::Reject => TYPE_REJECT,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            TYPE_PREPARE => Ok(Self::Prepare),
            TYPE_FULFILL => Ok(Self::Fulfill),
            TYPE_REJECT => Ok(Self::Reject),
            _ => Err(FrameError::InvalidPacketType(value)),
        }
    }
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Connection closed
    ConnectionClose {
        /// Reason
        code: CloseCode,
        /// Detail
        message: String,
    },
    /// Sender's address
    ConnectionNewAddress {
        /// Address packets to the sender should be sent to
        source_account: String,
    },
    /// Connection receive window
    ConnectionMaxData {
        /// Highest total byte offset accepted across all streams
        max_offset: u64,
    },
    /// Sender blocked on connection window
    ConnectionDataBlocked {
        /// Window the sender is blocked at
        max_offset: u64,
    },
    /// Stream id limit
    ConnectionMaxStreamId {
        /// Highest stream id the peer may open
        max_stream_id: u64,
    },
    /// Sender blocked on stream id limit
    ConnectionStreamIdBlocked {
        /// Limit the sender is blocked at
        max_stream_id: u64,
    },
    /// Sender's asset
    ConnectionAssetDetails {
        /// Asset code
        asset_code: String,
        /// Asset scale
        asset_scale: u8,
    },
    /// Stream aborted
    StreamClose {
        /// Stream
        stream_id: u64,
        /// Reason
        code: CloseCode,
        /// Detail
        message: String,
    },
    /// Money for a stream
    StreamMoney {
        /// Stream
        stream_id: u64,
        /// Relative share of the packet amount
        shares: u64,
    },
    /// Stream money limit
    StreamMaxMoney {
        /// Stream
        stream_id: u64,
        /// Total the receiver is willing to receive
        receive_max: u64,
        /// Total received so far
        total_received: u64,
    },
    /// Sender blocked on stream money limit
    StreamMoneyBlocked {
        /// Stream
        stream_id: u64,
        /// Total the sender wants to send
        send_max: u64,
        /// Total sent so far
        total_sent: u64,
    },
    /// Stream bytes
    StreamData {
        /// Stream
        stream_id: u64,
        /// Offset of the first byte
        offset: u64,
        /// Last data on this stream
        fin: bool,
        /// Bytes
        data: Vec<u8>,
    },
    /// Stream receive window
    StreamMaxData {
        /// Stream
        stream_id: u64,
        /// Highest byte offset accepted
        max_offset: u64,
    },
    /// Sender blocked on stream window
    StreamDataBlocked {
        /// Stream
        stream_id: u64,
        /// Window the sender is blocked at
        max_offset: u64,
    },
    /// No more money on this stream
    StreamMoneyClose {
        /// Stream
        stream_id: u64,
    },
}

impl Frame {
    /// Frame type of this frame
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::ConnectionClose { .. } => FrameType::ConnectionClose,
            Self::ConnectionNewAddress { .. } => FrameType::ConnectionNewAddress,
            Self::ConnectionMaxData { .. } => FrameType::ConnectionMaxData,
            Self::ConnectionDataBlocked { .. } => FrameType::ConnectionDataBlocked,
            Self::ConnectionMaxStreamId { .. } => FrameType::ConnectionMaxStreamId,
            Self::ConnectionStreamIdBlocked { .. } => FrameType::ConnectionStreamIdBlocked,
            Self::ConnectionAssetDetails { .. } => FrameType::ConnectionAssetDetails,
            Self::StreamClose { .. } => FrameType::StreamClose,
            Self::StreamMoney { .. } => FrameType::StreamMoney,
            Self::StreamMaxMoney { .. } => FrameType::StreamMaxMoney,
            Self::StreamMoneyBlocked { .. } => FrameType::StreamMoneyBlocked,
            Self::StreamData { .. } => FrameType::StreamData,
            Self::StreamMaxData { .. } => FrameType::StreamMaxData,
            Self::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
            Self::StreamMoneyClose { .. } => FrameType::StreamMoneyClose,
        }
    }

    /// Stream this frame addresses, if any
    #[must_use]
    pub fn stream_id(&self) -> Option<u64> {
        match self {
            Self::StreamClose { stream_id, .. }
            | Self::StreamMoney { stream_id, .. }
            | Self::StreamMaxMoney { stream_id, .. }
            | Self::StreamMoneyBlocked { stream_id, .. }
            | Self::StreamData { stream_id, .. }
            | Self::StreamMaxData { stream_id, .. }
            | Self::StreamDataBlocked { stream_id, .. }
            | Self::StreamMoneyClose { stream_id } => Some(*stream_id),
            _ => None,
        }
    }

    /// Encoded size including the frame header
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Self::ConnectionClose { message, .. } => 1 + 4 + message.len(),
            Self::ConnectionNewAddress { source_account } => 4 + source_account.len(),
            Self::ConnectionMaxData { .. }
            | Self::ConnectionDataBlocked { .. }
            | Self::ConnectionMaxStreamId { .. }
            | Self::ConnectionStreamIdBlocked { .. }
            | Self::StreamMoneyClose { .. } => 8,
            Self::ConnectionAssetDetails { asset_code, .. } => 4 + asset_code.len() + 1,
            Self::StreamClose { message, .. } => 8 + 1 + 4 + message.len(),
            Self::StreamMoney { .. } | Self::StreamMaxData { .. } | Self::StreamDataBlocked { .. } => {
                16
            }
            Self::StreamMaxMoney { .. } | Self::StreamMoneyBlocked { .. } => 24,
            Self::StreamData { data, .. } => 8 + 8 + 1 + 4 + data.len(),
        };
        FRAME_HEADER_SIZE + body
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.frame_type() as u8);
        let len_pos = out.len();
        out.extend_from_slice(&[0u8; 4]);
        let start = out.len();

        match self {
            Self::ConnectionClose { code, message } => {
                out.push(*code as u8);
                put_var(out, message.as_bytes());
            }
            Self::ConnectionNewAddress { source_account } => put_var(out, source_account.as_bytes()),
            Self::ConnectionMaxData { max_offset } | Self::ConnectionDataBlocked { max_offset } => {
                put_u64(out, *max_offset);
            }
            Self::ConnectionMaxStreamId { max_stream_id }
            | Self::ConnectionStreamIdBlocked { max_stream_id } => put_u64(out, *max_stream_id),
            Self::ConnectionAssetDetails {
                asset_code,
                asset_scale,
            } => {
                put_var(out, asset_code.as_bytes());
                out.push(*asset_scale);
            }
            Self::StreamClose {
                stream_id,
                code,
                message,
            } => {
                put_u64(out, *stream_id);
                out.push(*code as u8);
                put_var(out, message.as_bytes());
            }
            Self::StreamMoney { stream_id, shares } => {
                put_u64(out, *stream_id);
                put_u64(out, *shares);
            }
            Self::StreamMaxMoney {
                stream_id,
                receive_max,
                total_received,
            } => {
                put_u64(out, *stream_id);
                put_u64(out, *receive_max);
                put_u64(out, *total_received);
            }
            Self::StreamMoneyBlocked {
                stream_id,
                send_max,
                total_sent,
            } => {
                put_u64(out, *stream_id);
                put_u64(out, *send_max);
                put_u64(out, *total_sent);
            }
            Self::StreamData {
                stream_id,
                offset,
                fin,
                data,
            } => {
                put_u64(out, *stream_id);
                put_u64(out, *offset);
                out.push(u8::from(*fin));
                put_var(out, data);
            }
            Self::StreamMaxData {
                stream_id,
                max_offset,
            }
            | Self::StreamDataBlocked {
                stream_id,
                max_offset,
            } => {
                put_u64(out, *stream_id);
                put_u64(out, *max_offset);
            }
            Self::StreamMoneyClose { stream_id } => put_u64(out, *stream_id),
        }

        #[allow(clippy::cast_possible_truncation)]
        let len = (out.len() - start) as u32;
        out[len_pos..start].copy_from_slice(&len.to_be_bytes());
    }

    fn decode_body(frame_type: FrameType, body: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(frame_type as u8, body);
        let frame = match frame_type {
            FrameType::ConnectionClose => Self::ConnectionClose {
                code: CloseCode::try_from(r.u8()?)?,
                message: r.string()?,
            },
            FrameType::ConnectionNewAddress => Self::ConnectionNewAddress {
                source_account: r.string()?,
            },
            FrameType::ConnectionMaxData => Self::ConnectionMaxData {
                max_offset: r.u64()?,
            },
            FrameType::ConnectionDataBlocked => Self::ConnectionDataBlocked {
                max_offset: r.u64()?,
            },
            FrameType::ConnectionMaxStreamId => Self::ConnectionMaxStreamId {
                max_stream_id: r.u64()?,
            },
            FrameType::ConnectionStreamIdBlocked => Self::ConnectionStreamIdBlocked {
                max_stream_id: r.u64()?,
            },
            FrameType::ConnectionAssetDetails => Self::ConnectionAssetDetails {
                asset_code: r.string()?,
                asset_scale: r.u8()?,
            },
            FrameType::StreamClose => Self::StreamClose {
                stream_id: r.u64()?,
                code: CloseCode::try_from(r.u8()?)?,
                message: r.string()?,
            },
            FrameType::StreamMoney => Self::StreamMoney {
                stream_id: r.u64()?,
                shares: r.u64()?,
            },
            FrameType::StreamMaxMoney => Self::StreamMaxMoney {
                stream_id: r.u64()?,
                receive_max: r.u64()?,
                total_received: r.u64()?,
            },
            FrameType::StreamMoneyBlocked => Self::StreamMoneyBlocked {
                stream_id: r.u64()?,
                send_max: r.u64()?,
                total_sent: r.u64()?,
            },
            FrameType::StreamData => Self::StreamData {
                stream_id: r.u64()?,
                offset: r.u64()?,
                fin: match r.u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(r.malformed("fin flag must be 0 or 1")),
                },
                data: r.var()?.to_vec(),
            },
            FrameType::StreamMaxData => Self::StreamMaxData {
                stream_id: r.u64()?,
                max_offset: r.u64()?,
            },
            FrameType::StreamDataBlocked => Self::StreamDataBlocked {
                stream_id: r.u64()?,
                max_offset: r.u64()?,
            },
            FrameType::StreamMoneyClose => Self::StreamMoneyClose {
                stream_id: r.u64()?,
            },
        };
        if !r.buf.is_empty() {
            return Err(r.malformed("trailing bytes in frame"));
        }
        Ok(frame)
    }
}

/// Decrypted protocol payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    /// Transport record this payload rides in
    pub packet_type: PacketType,
    /// Sender's sequence number (responses echo the request's)
    pub sequence: u64,
    /// Amount sent (requests) or received (responses)
    pub prepare_amount: u64,
    /// Frames, applied independently
    pub frames: Vec<Frame>,
}

impl StreamPacket {
    /// Create a packet
    #[must_use]
    pub fn new(packet_type: PacketType, sequence: u64, prepare_amount: u64, frames: Vec<Frame>) -> Self {
        Self {
            packet_type,
            sequence,
            prepare_amount,
            frames,
        }
    }

    /// Encoded size
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.frames.iter().map(Frame::encoded_len).sum::<usize>()
    }

    /// Serialize to plaintext bytes.
    ///
    /// At most `u16::MAX` frames are written.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(PAYLOAD_VERSION);
        out.push(self.packet_type.as_u8());
        put_u64(&mut out, self.sequence);
        put_u64(&mut out, self.prepare_amount);

        let count = u16::try_from(self.frames.len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&count.to_be_bytes());
        for frame in &self.frames[..usize::from(count)] {
            frame.encode_into(&mut out);
        }
        out
    }

    /// Parse plaintext bytes.
    ///
    /// Unknown frames in the extension range are skipped.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on malformed input or an unsupported
    /// mandatory frame type.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: PACKET_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data[0] != PAYLOAD_VERSION {
            return Err(FrameError::UnsupportedVersion(data[0]));
        }
        let packet_type = PacketType::try_from(data[1])?;
        let sequence = read_u64(&data[2..10]);
        let prepare_amount = read_u64(&data[10..18]);
        let count = u16::from_be_bytes([data[18], data[19]]);

        let mut rest = &data[PACKET_HEADER_SIZE..];
        let mut frames = Vec::with_capacity(usize::from(count).min(64));
        for _ in 0..count {
            if rest.len() < FRAME_HEADER_SIZE {
                return Err(FrameError::TooShort {
                    expected: FRAME_HEADER_SIZE,
                    actual: rest.len(),
                });
            }
            let type_byte = rest[0];
            let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
            let body = rest
                .get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len)
                .ok_or(FrameError::TooShort {
                    expected: FRAME_HEADER_SIZE + len,
                    actual: rest.len(),
                })?;
            rest = &rest[FRAME_HEADER_SIZE + len..];

            match FrameType::try_from(type_byte) {
                Ok(frame_type) => frames.push(Frame::decode_body(frame_type, body)?),
                Err(_) if type_byte >= EXTENSION_RANGE_START => {
                    tracing::trace!(frame_type = type_byte, len, "Skipping extension frame");
                }
                Err(e) => return Err(e),
            }
        }
        if !rest.is_empty() {
            return Err(FrameError::TrailingBytes(rest.len()));
        }

        Ok(Self {
            packet_type,
            sequence,
            prepare_amount,
            frames,
        })
    }

    /// Encode and encrypt.
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if encryption fails.
    pub fn seal(&self, cipher: &PacketCipher) -> Result<Vec<u8>, CryptoError> {
        cipher.encrypt(&self.encode())
    }
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

#[allow(clippy::cast_possible_truncation)]
fn put_var(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_u64(b: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[..8]);
    u64::from_be_bytes(arr)
}

struct Reader<'a> {
    frame_type: u8,
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(frame_type: u8, buf: &'a [u8]) -> Self {
        Self { frame_type, buf }
    }

    fn malformed(&self, reason: &'static str) -> FrameError {
        FrameError::Malformed {
            frame_type: self.frame_type,
            reason,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.buf.len() < n {
            return Err(self.malformed("truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        Ok(read_u64(self.take(8)?))
    }

    fn var(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.take(4)?;
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, FrameError> {
        let bytes = self.var()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.malformed("invalid UTF-8"))
    }
}
