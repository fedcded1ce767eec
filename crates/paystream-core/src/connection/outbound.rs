//! Outbound path: packet assembly, the per-packet send task, and resolution
//! of fulfills and rejects back into stream state.

use super::ConnectionInner;
use super::state::{ConnectionCore, ConnectionState, Handshake};
use crate::MAX_PAYLOAD_SIZE;
use crate::error::{ConnectionError, StreamError};
use crate::frame::{Frame, PACKET_HEADER_SIZE, PacketType, StreamPacket};
use crate::stream::{STREAM_DATA_OVERHEAD, SendFlag};
use paystream_crypto::fulfillment_to_condition;
use paystream_transport::{
    AmountTooLarge, ErrorClass, ErrorCode, Packet, Prepare, TransportError,
};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;
use tracing::Instrument;

/// Room kept free in a packet for a stream's limit frames
const LIMIT_FRAMES_RESERVE: usize = 64;

/// What a packet is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketKind {
    /// Stream frames and connection control
    Normal,
    /// Client's first packet
    Handshake,
    /// Final `ConnectionClose`
    Close,
}

/// A packet handed to a send task
#[derive(Debug, Clone)]
pub(crate) struct OutgoingPacket {
    pub(crate) amount: u64,
    pub(crate) frames: Vec<Frame>,
    pub(crate) kind: PacketKind,
}

/// Final result of sending one packet
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Receiver fulfilled; response frames were readable if present
    Fulfilled {
        delivered: Option<u64>,
        frames: Vec<Frame>,
    },
    /// `F08`; contributions go back to their streams
    AmountTooLarge(Option<AmountTooLarge>),
    /// Final reject
    Rejected {
        code: ErrorCode,
        message: String,
        frames: Vec<Frame>,
    },
    /// Retries exhausted or the connection went away
    Failed(StreamError),
}

/// What happens to each frame's contribution
#[derive(Debug, Clone)]
enum Disposition {
    Delivered,
    Returned,
    Failed(StreamError),
}

/// One attempt's verdict
enum Attempt {
    Done(Outcome),
    Retry(&'static str),
}

impl ConnectionCore {
    /// Assemble the next packet, reserving its budget with congestion control.
    pub(crate) fn next_packet(&mut self) -> Option<OutgoingPacket> {
        let packet = match self.state {
            ConnectionState::Idle | ConnectionState::Closed => None,
            ConnectionState::Connecting => self.handshake_packet(),
            ConnectionState::Open | ConnectionState::Closing => {
                if self.remote_address.is_none() || !self.congestion.can_send() {
                    return None;
                }
                self.stream_packet().or_else(|| self.close_packet())
            }
        }?;
        self.congestion.on_packet_sent(packet.amount);
        self.packets_sent += 1;
        Some(packet)
    }

    fn handshake_packet(&mut self) -> Option<OutgoingPacket> {
        if self.handshake != Handshake::NotSent || !self.congestion.can_send() {
            return None;
        }
        self.handshake = Handshake::InFlight;
        let mut frames = vec![
            Frame::ConnectionNewAddress {
                source_account: self.local.address.clone(),
            },
            Frame::ConnectionAssetDetails {
                asset_code: self.local.asset_code.clone(),
                asset_scale: self.local.asset_scale,
            },
        ];
        frames.extend(self.limit_frames());
        Some(OutgoingPacket {
            amount: 0,
            frames,
            kind: PacketKind::Handshake,
        })
    }

    /// Connection-level limits, marking them advertised
    pub(crate) fn limit_frames(&mut self) -> [Frame; 2] {
        self.advertised_max_stream_id = self.advertised_max_stream_id.max(self.local_max_stream_id);
        self.advertised_conn_max = self.advertised_conn_max.max(self.conn_max_target());
        self.max_stream_id_update = false;
        self.conn_max_update = false;
        [
            Frame::ConnectionMaxStreamId {
                max_stream_id: self.advertised_max_stream_id,
            },
            Frame::ConnectionMaxData {
                max_offset: self.advertised_conn_max,
            },
        ]
    }

    fn connection_frames(&mut self, frames: &mut Vec<Frame>) {
        if self.max_stream_id_update || self.conn_max_update {
            frames.extend(self.limit_frames());
        }
        if self.conn_blocked {
            self.conn_blocked = false;
            self.conn_blocked_at = Some(self.remote_conn_max);
            frames.push(Frame::ConnectionDataBlocked {
                max_offset: self.remote_conn_max,
            });
        }
        if self.stream_id_blocked {
            self.stream_id_blocked = false;
            self.stream_id_blocked_at = Some(self.remote_max_stream_id);
            frames.push(Frame::ConnectionStreamIdBlocked {
                max_stream_id: self.remote_max_stream_id,
            });
        }
    }

    fn stream_packet(&mut self) -> Option<OutgoingPacket> {
        if self.config.receive_only {
            self.fail_unsendable_money(&StreamError::ReceiveOnly);
        } else if self.congestion.max_packet_amount() == 0 {
            self.fail_unsendable_money(&StreamError::Rejected {
                code: ErrorCode::F08_AMOUNT_TOO_LARGE,
                message: "path cannot carry any amount".into(),
            });
        }
        let mut frames = Vec::new();
        self.connection_frames(&mut frames);
        let mut size = PACKET_HEADER_SIZE + frames.iter().map(Frame::encoded_len).sum::<usize>();
        let mut budget = if self.config.receive_only {
            0
        } else {
            self.congestion.available_amount()
        };
        let mut amount = 0u64;

        for stream in self.streams.values_mut() {
            if size + STREAM_DATA_OVERHEAD + LIMIT_FRAMES_RESERVE >= MAX_PAYLOAD_SIZE {
                break;
            }
            let id = stream.id();
            let start = frames.len();

            frames.extend(stream.take_close_frame());
            let money = stream.take_money(budget);
            if money > 0 {
                budget -= money;
                amount += money;
                frames.push(Frame::StreamMoney {
                    stream_id: id,
                    shares: money,
                });
            } else {
                frames.extend(stream.take_money_blocked());
            }
            frames.extend(stream.take_money_close());

            let used: usize = frames[start..].iter().map(Frame::encoded_len).sum();
            let room = MAX_PAYLOAD_SIZE
                .saturating_sub(size + used + STREAM_DATA_OVERHEAD + LIMIT_FRAMES_RESERVE);
            if let Some((offset, data, fin)) = stream.take_data(room) {
                frames.push(Frame::StreamData {
                    stream_id: id,
                    offset,
                    fin,
                    data,
                });
            }
            frames.extend(stream.take_data_blocked());

            let carried = frames.len() > start;
            if stream.wants_limit_update() || (carried && !stream.announced) {
                frames.extend(stream.limit_frames());
            }
            size += frames[start..].iter().map(Frame::encoded_len).sum::<usize>();
        }

        if frames.is_empty() {
            return None;
        }
        Some(OutgoingPacket {
            amount,
            frames,
            kind: PacketKind::Normal,
        })
    }

    fn close_packet(&mut self) -> Option<OutgoingPacket> {
        let intent = self.close.as_ref()?;
        if self.state != ConnectionState::Closing
            || !intent.notify_peer
            || self.close_packet != SendFlag::Idle
            || self.congestion.packets_in_flight() > 0
        {
            return None;
        }
        if intent.graceful && self.streams.values().any(|s| s.has_output()) {
            return None;
        }
        let frame = Frame::ConnectionClose {
            code: intent.code,
            message: intent.message.clone(),
        };
        self.close_packet = SendFlag::InFlight;
        Some(OutgoingPacket {
            amount: 0,
            frames: vec![frame],
            kind: PacketKind::Close,
        })
    }

    /// Pending money can never go out; fail it so waiters and closes
    /// do not hang on it.
    fn fail_unsendable_money(&mut self, err: &StreamError) {
        for stream in self.streams.values_mut() {
            let pending = stream.take_money(u64::MAX);
            if pending > 0 {
                stream.on_money_failed(pending, err.clone());
            }
        }
    }

    /// Apply the result of a packet to connection and stream state.
    pub(crate) fn resolve(&mut self, packet: OutgoingPacket, outcome: Outcome) {
        self.congestion.on_packet_resolved(packet.amount);

        let disposition = match &outcome {
            Outcome::Fulfilled { delivered, frames } => {
                self.packets_fulfilled += 1;
                self.last_activity = Instant::now();
                self.total_sent = self.total_sent.saturating_add(packet.amount);
                self.total_delivered = self
                    .total_delivered
                    .saturating_add(delivered.unwrap_or(0));
                self.congestion.on_fulfilled(packet.amount);
                self.apply_response_frames(frames);
                Disposition::Delivered
            }
            Outcome::AmountTooLarge(details) => {
                self.packets_rejected += 1;
                self.congestion.on_amount_too_large(packet.amount, *details);
                Disposition::Returned
            }
            Outcome::Rejected {
                code,
                message,
                frames,
            } => {
                self.packets_rejected += 1;
                self.apply_response_frames(frames);
                if *code == ErrorCode::F99_APPLICATION_ERROR && receiver_limited(&packet.frames, frames) {
                    Disposition::Returned
                } else {
                    Disposition::Failed(StreamError::Rejected {
                        code: *code,
                        message: message.clone(),
                    })
                }
            }
            Outcome::Failed(err) => Disposition::Failed(err.clone()),
        };

        match packet.kind {
            PacketKind::Handshake => self.resolve_handshake(&outcome, &disposition),
            PacketKind::Close => self.close_packet = SendFlag::Done,
            PacketKind::Normal => self.resolve_frames(packet.frames, &disposition),
        }
        self.wake_all();
    }

    fn resolve_handshake(&mut self, outcome: &Outcome, disposition: &Disposition) {
        match disposition {
            Disposition::Delivered => {
                self.handshake = Handshake::Done;
                self.transition_to(ConnectionState::Open);
                tracing::info!(
                    remote_asset = ?self.remote_asset,
                    "Connection established"
                );
            }
            Disposition::Returned => self.handshake = Handshake::NotSent,
            Disposition::Failed(err) => {
                let error = match outcome {
                    Outcome::Rejected { code, message, .. } => ConnectionError::HandshakeRejected {
                        code: *code,
                        message: message.clone(),
                    },
                    _ => ConnectionError::timeout(format!("handshake: {err}")),
                };
                tracing::warn!(error = %error, "Handshake failed");
                self.close_error.get_or_insert(error);
                self.start_close(super::state::CloseIntent::abort(
                    crate::frame::CloseCode::NoError,
                    "handshake failed",
                    false,
                ));
            }
        }
    }

    fn resolve_frames(&mut self, frames: Vec<Frame>, disposition: &Disposition) {
        let delivered = matches!(disposition, Disposition::Delivered);
        let retry = matches!(disposition, Disposition::Returned);
        for frame in frames {
            match frame {
                Frame::ConnectionMaxData { .. } | Frame::ConnectionMaxStreamId { .. } if !delivered => {
                    self.conn_max_update = true;
                    self.max_stream_id_update = true;
                }
                Frame::StreamMoney { stream_id, shares } => {
                    let Some(stream) = self.streams.get_mut(&stream_id) else {
                        continue;
                    };
                    match disposition {
                        Disposition::Delivered => stream.on_money_delivered(shares),
                        Disposition::Returned => stream.on_money_returned(shares),
                        Disposition::Failed(err) => stream.on_money_failed(shares, err.clone()),
                    }
                }
                Frame::StreamData {
                    stream_id,
                    offset,
                    fin,
                    data,
                } => {
                    let Some(stream) = self.streams.get_mut(&stream_id) else {
                        continue;
                    };
                    let len = data.len() as u64;
                    match disposition {
                        Disposition::Delivered => stream.on_data_delivered(len, fin),
                        Disposition::Returned => stream.on_data_returned(offset, data, fin),
                        Disposition::Failed(err) => stream.on_data_failed(len, err.clone()),
                    }
                }
                Frame::StreamMoneyClose { stream_id } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.on_money_close_resolved(retry);
                    }
                }
                Frame::StreamClose { stream_id, .. } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.on_close_frame_resolved(retry);
                    }
                }
                Frame::StreamMaxMoney { stream_id, .. } if !delivered => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.max_money_update = true;
                    }
                }
                Frame::StreamMaxData { stream_id, .. } if !delivered => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.max_data_update = true;
                    }
                }
                _ => {}
            }
        }
    }

    /// Frames a receiver put in a fulfill or reject
    pub(crate) fn apply_response_frames(&mut self, frames: &[Frame]) {
        for frame in frames {
            match frame {
                Frame::StreamMaxMoney {
                    stream_id,
                    receive_max,
                    total_received,
                } => {
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        stream.on_remote_max_money(*receive_max, *total_received);
                    }
                }
                Frame::StreamMaxData {
                    stream_id,
                    max_offset,
                } => {
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        stream.on_remote_max_data(*max_offset);
                    }
                }
                Frame::StreamClose {
                    stream_id,
                    code,
                    message,
                } => {
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        stream.on_remote_close(*code, message.clone());
                    }
                }
                Frame::ConnectionMaxData { max_offset } => {
                    self.remote_conn_max = self.remote_conn_max.max(*max_offset);
                }
                Frame::ConnectionMaxStreamId { max_stream_id } => {
                    self.remote_max_stream_id = self.remote_max_stream_id.max(*max_stream_id);
                }
                Frame::ConnectionAssetDetails {
                    asset_code,
                    asset_scale,
                } => {
                    self.remote_asset = Some((asset_code.clone(), *asset_scale));
                }
                Frame::ConnectionClose { code, message } => {
                    self.on_remote_close(*code, message.clone());
                }
                _ => {}
            }
        }
    }
}

/// An `F99` whose response lowers the money limit of a stream the packet
/// paid into. The money is rescheduled under the new limit.
fn receiver_limited(sent: &[Frame], response: &[Frame]) -> bool {
    if response
        .iter()
        .any(|f| matches!(f, Frame::ConnectionClose { .. } | Frame::StreamClose { .. }))
    {
        return false;
    }
    response.iter().any(|r| match r {
        Frame::StreamMaxMoney { stream_id, .. } => sent.iter().any(|s| {
            matches!(s, Frame::StreamMoney { stream_id: id, shares } if id == stream_id && *shares > 0)
        }),
        _ => false,
    })
}

impl ConnectionInner {
    /// Hand a packet to its own task
    pub(crate) fn spawn_send(self: &Arc<Self>, packet: OutgoingPacket) {
        let inner = Arc::clone(self);
        tokio::spawn(inner.send_packet(packet).instrument(self.span.clone()));
    }

    async fn send_packet(self: Arc<Self>, packet: OutgoingPacket) {
        let retry = &self.config.retry;
        let mut attempt: u32 = 0;
        let outcome = loop {
            let (sequence, destination) = {
                let mut core = self.core.lock().await;
                if core.is_aborting() && packet.kind != PacketKind::Close {
                    break Outcome::Failed(StreamError::ConnectionClosed);
                }
                let Some(destination) = core.remote_address.clone() else {
                    break Outcome::Failed(StreamError::ConnectionClosed);
                };
                (core.next_sequence(), destination)
            };

            match self.attempt(&packet, sequence, destination).await {
                Attempt::Done(outcome) => break outcome,
                Attempt::Retry(reason) => {
                    if attempt >= retry.max_retries {
                        tracing::debug!(sequence, attempts = attempt + 1, reason, "Giving up on packet");
                        break Outcome::Failed(StreamError::DeliveryFailed {
                            attempts: attempt + 1,
                        });
                    }
                    let delay = retry.backoff_duration(attempt);
                    tracing::trace!(sequence, attempt, ?delay, reason, "Retrying packet");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let state = {
            let mut core = self.core.lock().await;
            core.resolve(packet, outcome);
            core.state
        };
        self.publish_state(state);
        self.wake_sender();
    }

    async fn attempt(&self, packet: &OutgoingPacket, sequence: u64, destination: String) -> Attempt {
        let payload = StreamPacket::new(PacketType::Prepare, sequence, packet.amount, packet.frames.clone());
        let data = match payload.seal(&self.cipher) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to seal packet");
                return Attempt::Retry("seal failed");
            }
        };
        let prepare = Prepare {
            amount: packet.amount,
            expires_at: SystemTime::now() + self.config.packet_timeout,
            execution_condition: self.cipher.condition(&data),
            destination,
            data,
        };
        tracing::trace!(
            sequence,
            amount = packet.amount,
            frames = packet.frames.len(),
            condition = %hex::encode(&prepare.execution_condition[..8]),
            "Sending packet"
        );

        let result = tokio::time::timeout(
            self.config.packet_timeout,
            self.plugin.send_data(prepare.to_bytes()),
        )
        .await;
        match result {
            Err(_) => Attempt::Retry("timed out"),
            Ok(Err(e)) => self.transport_failure(&e),
            Ok(Ok(bytes)) => self.classify(sequence, &prepare, &bytes),
        }
    }

    fn transport_failure(&self, e: &TransportError) -> Attempt {
        if e.is_transient() {
            tracing::debug!(error = %e, "Transport send failed");
            Attempt::Retry("transport error")
        } else {
            tracing::warn!(error = %e, "Transport unusable");
            Attempt::Done(Outcome::Failed(StreamError::ConnectionClosed))
        }
    }

    fn classify(&self, sequence: u64, prepare: &Prepare, bytes: &[u8]) -> Attempt {
        match Packet::from_bytes(bytes) {
            Ok(Packet::Fulfill(fulfill)) => {
                if fulfillment_to_condition(&fulfill.fulfillment) != prepare.execution_condition {
                    tracing::warn!(sequence, "Fulfillment does not match condition");
                    return Attempt::Done(Outcome::Rejected {
                        code: ErrorCode::F05_WRONG_CONDITION,
                        message: "fulfillment does not match condition".into(),
                        frames: Vec::new(),
                    });
                }
                let response = self.open_response(&fulfill.data, sequence, PacketType::Fulfill);
                Attempt::Done(Outcome::Fulfilled {
                    delivered: response.as_ref().map(|p| p.prepare_amount),
                    frames: response.map(|p| p.frames).unwrap_or_default(),
                })
            }
            Ok(Packet::Reject(reject)) => {
                if reject.code == ErrorCode::F08_AMOUNT_TOO_LARGE {
                    return Attempt::Done(Outcome::AmountTooLarge(reject.amount_too_large()));
                }
                match reject.code.class() {
                    ErrorClass::Temporary | ErrorClass::Relative => Attempt::Retry("temporary reject"),
                    ErrorClass::Final | ErrorClass::Unknown => {
                        tracing::debug!(
                            sequence,
                            code = %reject.code,
                            triggered_by = %reject.triggered_by,
                            "Packet rejected"
                        );
                        let frames = self
                            .open_response(&reject.data, sequence, PacketType::Reject)
                            .map(|p| p.frames)
                            .unwrap_or_default();
                        Attempt::Done(Outcome::Rejected {
                            code: reject.code,
                            message: reject.message,
                            frames,
                        })
                    }
                }
            }
            Ok(Packet::Prepare(_)) | Err(_) => Attempt::Retry("unreadable response"),
        }
    }

    /// Decrypt a receiver's response payload. Anything that is not a
    /// response to `sequence` is ignored.
    fn open_response(&self, data: &[u8], sequence: u64, expected: PacketType) -> Option<StreamPacket> {
        if data.is_empty() {
            return None;
        }
        let plaintext = self.cipher.decrypt(data).ok()?;
        let packet = StreamPacket::decode(&plaintext).ok()?;
        if packet.packet_type != expected || packet.sequence != sequence {
            tracing::debug!(sequence, got = packet.sequence, "Ignoring mismatched response payload");
            return None;
        }
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::state::{CloseIntent, Role};
    use paystream_transport::AddressInfo;

    fn open_core() -> ConnectionCore {
        let mut core = ConnectionCore::new(
            ConnectionConfig::default(),
            Role::Client,
            AddressInfo::new("test.client", "USD", 2),
            Some("test.server.tok".into()),
        );
        core.state = ConnectionState::Open;
        core
    }

    fn money_of(packet: &OutgoingPacket) -> Vec<(u64, u64)> {
        packet
            .frames
            .iter()
            .filter_map(|f| match f {
                Frame::StreamMoney { stream_id, shares } => Some((*stream_id, *shares)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_handshake_packet() {
        let mut core = open_core();
        core.state = ConnectionState::Connecting;
        let packet = core.next_packet().unwrap();
        assert_eq!(packet.kind, PacketKind::Handshake);
        assert_eq!(packet.amount, 0);
        assert!(matches!(
            packet.frames[0],
            Frame::ConnectionNewAddress { ref source_account } if source_account == "test.client"
        ));
        assert!(packet.frames.contains(&Frame::ConnectionMaxStreamId { max_stream_id: 40 }));
        assert!(core.next_packet().is_none());

        core.resolve(
            packet,
            Outcome::Fulfilled {
                delivered: Some(0),
                frames: vec![Frame::ConnectionAssetDetails {
                    asset_code: "EUR".into(),
                    asset_scale: 6,
                }],
            },
        );
        assert_eq!(core.state, ConnectionState::Open);
        assert_eq!(core.remote_asset, Some(("EUR".into(), 6)));
    }

    #[test]
    fn test_money_packet_and_fulfill() {
        let mut core = open_core();
        let shared = core.open_local_stream().unwrap();
        core.streams.get_mut(&shared.id).unwrap().set_send_max(100).unwrap();

        let packet = core.next_packet().unwrap();
        assert_eq!(packet.amount, 100);
        assert_eq!(money_of(&packet), vec![(1, 100)]);
        assert!(packet
            .frames
            .iter()
            .any(|f| matches!(f, Frame::StreamMaxData { stream_id: 1, .. })));
        assert!(core.next_packet().is_none());

        core.resolve(
            packet,
            Outcome::Fulfilled {
                delivered: Some(100),
                frames: vec![],
            },
        );
        assert_eq!(core.total_sent, 100);
        assert_eq!(core.total_delivered, 100);
        assert_eq!(core.congestion.packets_in_flight(), 0);
        let stream = core.streams.get_mut(&1).unwrap();
        assert_eq!(stream.money_progress(100), Some(Ok(())));
    }

    #[test]
    fn test_amount_too_large_requeues_lower() {
        let mut core = open_core();
        let shared = core.open_local_stream().unwrap();
        core.streams.get_mut(&shared.id).unwrap().set_send_max(1000).unwrap();

        let packet = core.next_packet().unwrap();
        core.resolve(
            packet,
            Outcome::AmountTooLarge(Some(AmountTooLarge {
                received_amount: 1000,
                maximum_amount: 300,
            })),
        );
        assert_eq!(core.congestion.max_packet_amount(), 300);

        let packet = core.next_packet().unwrap();
        assert!(packet.amount <= 300);
        assert_eq!(money_of(&packet), vec![(1, 300)]);
    }

    #[test]
    fn test_final_reject_fails_money() {
        let mut core = open_core();
        let shared = core.open_local_stream().unwrap();
        core.streams.get_mut(&shared.id).unwrap().set_send_max(50).unwrap();
        let packet = core.next_packet().unwrap();
        core.resolve(
            packet,
            Outcome::Rejected {
                code: ErrorCode::F02_UNREACHABLE,
                message: String::new(),
                frames: vec![],
            },
        );
        let stream = core.streams.get_mut(&1).unwrap();
        assert!(matches!(
            stream.money_progress(50),
            Some(Err(StreamError::Rejected { code, .. })) if code == ErrorCode::F02_UNREACHABLE
        ));
        assert_eq!(stream.pending_money(), 0);
    }

    #[test]
    fn test_receiver_limit_reschedules() {
        let mut core = open_core();
        let shared = core.open_local_stream().unwrap();
        core.streams.get_mut(&shared.id).unwrap().set_send_max(100).unwrap();
        let packet = core.next_packet().unwrap();
        core.resolve(
            packet,
            Outcome::Rejected {
                code: ErrorCode::F99_APPLICATION_ERROR,
                message: String::new(),
                frames: vec![Frame::StreamMaxMoney {
                    stream_id: 1,
                    receive_max: 40,
                    total_received: 0,
                }],
            },
        );
        let packet = core.next_packet().unwrap();
        assert_eq!(money_of(&packet), vec![(1, 40)]);
    }

    #[test]
    fn test_data_packet_split_by_size() {
        let mut core = open_core();
        let shared = core.open_local_stream().unwrap();
        let stream = core.streams.get_mut(&shared.id).unwrap();
        stream.on_remote_max_data(1 << 20);
        stream.push_data(&vec![7u8; 100_000]);

        let mut total = 0;
        while let Some(packet) = core.next_packet() {
            let mut plain_len = PACKET_HEADER_SIZE;
            for frame in &packet.frames {
                plain_len += frame.encoded_len();
                if let Frame::StreamData { data, .. } = frame {
                    total += data.len();
                }
            }
            assert!(plain_len <= MAX_PAYLOAD_SIZE);
        }
        assert_eq!(total, 100_000);
        assert_eq!(core.congestion.packets_in_flight(), 4);
    }

    #[test]
    fn test_close_packet_after_streams_flush() {
        let mut core = open_core();
        let shared = core.open_local_stream().unwrap();
        core.streams.get_mut(&shared.id).unwrap().push_data(b"bye");
        core.start_close(CloseIntent::graceful());

        // Data, fin and the money close share one packet.
        let packet = core.next_packet().unwrap();
        assert_eq!(packet.kind, PacketKind::Normal);
        assert!(packet.frames.contains(&Frame::StreamMoneyClose { stream_id: 1 }));
        assert!(packet
            .frames
            .iter()
            .any(|f| matches!(f, Frame::StreamData { fin: true, .. })));
        assert!(core.next_packet().is_none());

        core.resolve(
            packet,
            Outcome::Fulfilled {
                delivered: Some(0),
                frames: vec![],
            },
        );
        let close = core.next_packet().unwrap();
        assert_eq!(close.kind, PacketKind::Close);
        assert!(!core.try_finish());
        core.resolve(close, Outcome::Failed(StreamError::ConnectionClosed));
        assert!(core.try_finish());
    }

    #[test]
    fn test_failed_handshake_closes() {
        let mut core = open_core();
        core.state = ConnectionState::Connecting;
        let packet = core.next_packet().unwrap();
        core.resolve(
            packet,
            Outcome::Rejected {
                code: ErrorCode::F02_UNREACHABLE,
                message: "nope".into(),
                frames: vec![],
            },
        );
        assert_eq!(core.state, ConnectionState::Closing);
        assert!(matches!(
            core.close_error,
            Some(ConnectionError::HandshakeRejected { .. })
        ));
        assert!(core.try_finish());
    }
}
