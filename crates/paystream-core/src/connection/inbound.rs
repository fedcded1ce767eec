//! Inbound path: authenticate, validate and apply a peer's packet.
//!
//! Validation runs over the whole packet before anything is applied, so a
//! refused packet leaves every stream untouched.

use super::ConnectionInner;
use super::state::{CloseIntent, ConnectionCore, ConnectionState};
use crate::INITIAL_STREAM_WINDOW;
use crate::error::{ConnectionError, opaque_reject};
use crate::frame::{CloseCode, Frame, PacketType, StreamPacket};
use paystream_crypto::fulfillment_to_condition;
use paystream_transport::{ErrorCode, Fulfill, Packet, Prepare, Reject};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::Instant;

/// Verdict on one inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// Indistinguishable from an unknown destination
    Opaque,
    /// Fulfill with these response frames
    Fulfill(Vec<Frame>),
    /// `F99` with these response frames; nothing was applied
    Reject(Vec<Frame>),
    /// The peer broke the protocol; the connection closes
    Fatal {
        code: CloseCode,
        message: String,
    },
}

/// Where a stream frame lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Existing,
    New,
    Closed,
}

enum Refusal {
    Reject(Vec<Frame>),
    Fatal(CloseCode, String),
}

fn fatal(code: CloseCode, message: impl Into<String>) -> Refusal {
    Refusal::Fatal(code, message.into())
}

/// Everything validation learned that applying needs
#[derive(Default)]
struct Plan {
    /// Amount credited by each `StreamMoney`, in frame order
    money: Vec<u64>,
    /// Peer stream ids to create
    new_streams: BTreeSet<u64>,
}

impl ConnectionCore {
    /// Validate and apply a decrypted request carrying `amount`.
    pub(crate) fn apply_inbound(
        &mut self,
        packet: StreamPacket,
        amount: u64,
        condition_ok: bool,
    ) -> Inbound {
        if self.is_aborting() {
            return Inbound::Opaque;
        }
        if let Err(e) = self.replay.check(packet.sequence) {
            tracing::debug!(sequence = packet.sequence, error = ?e, "Refusing replayed packet");
            return Inbound::Opaque;
        }
        self.replay.commit(packet.sequence);
        self.last_activity = Instant::now();

        if !condition_ok {
            tracing::debug!(sequence = packet.sequence, "Condition mismatch, rejecting");
            return Inbound::Reject(self.touched_limit_frames(&packet.frames));
        }
        if amount < packet.prepare_amount {
            tracing::debug!(amount, minimum = packet.prepare_amount, "Received less than the sender's minimum");
            return Inbound::Reject(self.touched_limit_frames(&packet.frames));
        }

        let plan = match self.validate(&packet.frames, amount) {
            Ok(plan) => plan,
            Err(Refusal::Reject(frames)) => return Inbound::Reject(frames),
            Err(Refusal::Fatal(code, message)) => {
                tracing::warn!(code = ?code, message = %message, "Peer violated the protocol");
                return Inbound::Fatal { code, message };
            }
        };

        let new_address = self.apply(packet.frames.clone(), plan);
        if self.state == ConnectionState::Idle {
            self.transition_to(ConnectionState::Open);
        }

        let mut response = Vec::new();
        if new_address {
            response.push(Frame::ConnectionAssetDetails {
                asset_code: self.local.asset_code.clone(),
                asset_scale: self.local.asset_scale,
            });
        }
        if new_address || self.conn_max_update || self.max_stream_id_update {
            response.extend(self.limit_frames());
        }
        response.extend(self.touched_limit_frames(&packet.frames));
        Inbound::Fulfill(response)
    }

    /// Current limits of every live stream the frames mention
    fn touched_limit_frames(&mut self, frames: &[Frame]) -> Vec<Frame> {
        let ids: BTreeSet<u64> = frames.iter().filter_map(Frame::stream_id).collect();
        let mut out = Vec::new();
        for id in ids {
            if let Some(stream) = self.streams.get_mut(&id) {
                if !stream.aborted() {
                    out.extend(stream.limit_frames());
                }
            }
        }
        out
    }

    fn classify_stream(&self, id: u64) -> Result<Target, Refusal> {
        if self.streams.contains_key(&id) {
            return Ok(Target::Existing);
        }
        if id == 0 {
            return Err(fatal(CloseCode::StreamIdError, "stream id 0"));
        }
        if self.role.owns_stream(id) {
            if id < self.next_local_stream_id {
                return Ok(Target::Closed);
            }
            return Err(fatal(CloseCode::StreamIdError, format!("stream {id} was never opened")));
        }
        if id <= self.highest_remote_stream_id {
            return Ok(Target::Closed);
        }
        if id > self.advertised_max_stream_id {
            return Err(fatal(
                CloseCode::StreamIdError,
                format!("stream {id} exceeds limit {}", self.advertised_max_stream_id),
            ));
        }
        Ok(Target::New)
    }

    fn validate(&mut self, frames: &[Frame], amount: u64) -> Result<Plan, Refusal> {
        let mut plan = Plan {
            money: split_amount(frames, amount)?,
            ..Plan::default()
        };

        let mut money_in: BTreeMap<u64, u64> = BTreeMap::new();
        let mut recv_high: BTreeMap<u64, u64> = BTreeMap::new();
        let mut conn_growth: u64 = 0;
        let mut money_index = 0;
        let mut closed_refs = Vec::new();

        for frame in frames {
            let Some(id) = frame.stream_id() else {
                continue;
            };
            let target = self.classify_stream(id)?;
            if target == Target::New && !matches!(frame, Frame::StreamClose { .. }) {
                plan.new_streams.insert(id);
            }
            let existing = self.streams.get(&id);

            match frame {
                Frame::StreamMoney { .. } => {
                    let credit = plan.money.get(money_index).copied().unwrap_or(0);
                    money_index += 1;
                    if credit == 0 {
                        continue;
                    }
                    match target {
                        Target::Closed => closed_refs.push(id),
                        _ => {
                            if existing.is_some_and(|s| s.remote_money_closed()) {
                                return Err(fatal(
                                    CloseCode::StreamStateError,
                                    format!("money on stream {id} after money close"),
                                ));
                            }
                            let sum = money_in.entry(id).or_insert(0);
                            *sum = sum.saturating_add(credit);
                        }
                    }
                }
                Frame::StreamData {
                    offset, fin, data, ..
                } => {
                    if target == Target::Closed {
                        continue;
                    }
                    let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
                        fatal(CloseCode::FlowControlError, "data offset overflow")
                    })?;
                    let limit = existing.map_or(INITIAL_STREAM_WINDOW, |s| s.local_max_offset());
                    if end > limit {
                        return Err(fatal(
                            CloseCode::FlowControlError,
                            format!("stream {id} data to {end} exceeds window {limit}"),
                        ));
                    }
                    let high = recv_high
                        .entry(id)
                        .or_insert_with(|| existing.map_or(0, |s| s.recv_high()));
                    if let Some(final_end) = existing.and_then(|s| s.remote_fin()) {
                        if end > final_end || (*fin && end != final_end) {
                            return Err(fatal(
                                CloseCode::StreamStateError,
                                format!("stream {id} data past its end"),
                            ));
                        }
                    }
                    if *fin && end < *high {
                        return Err(fatal(
                            CloseCode::StreamStateError,
                            format!("stream {id} ends below received data"),
                        ));
                    }
                    if end > *high {
                        conn_growth = conn_growth.saturating_add(end - *high);
                        *high = end;
                    }
                }
                _ => {}
            }
        }

        if self.conn_recv_high.saturating_add(conn_growth) > self.advertised_conn_max {
            return Err(fatal(
                CloseCode::FlowControlError,
                "connection receive window exceeded",
            ));
        }

        for (&id, &credit) in &money_in {
            let Some(stream) = self.streams.get(&id) else {
                continue;
            };
            if stream.total_received().saturating_add(credit) > stream.receive_max() {
                tracing::debug!(
                    stream_id = id,
                    credit,
                    receive_max = stream.receive_max(),
                    "Money exceeds receive max"
                );
                return Err(Refusal::Reject(self.touched_limit_frames(frames)));
            }
        }

        if let Some(&id) = closed_refs.first() {
            let mut response = self.touched_limit_frames(frames);
            response.push(Frame::StreamClose {
                stream_id: id,
                code: CloseCode::StreamStateError,
                message: "stream is closed".into(),
            });
            return Err(Refusal::Reject(response));
        }

        Ok(plan)
    }

    /// Apply validated frames. Returns true if the peer announced its address.
    fn apply(&mut self, frames: Vec<Frame>, plan: Plan) -> bool {
        for &id in &plan.new_streams {
            self.open_remote_stream(id);
        }

        let mut new_address = false;
        let mut close = None;
        let mut credits = plan.money.into_iter();

        for frame in frames {
            match frame {
                Frame::ConnectionNewAddress { source_account } => {
                    if self.remote_address.as_deref() != Some(source_account.as_str()) {
                        tracing::debug!(address = %source_account, "Peer address learned");
                    }
                    self.remote_address = Some(source_account);
                    new_address = true;
                }
                Frame::ConnectionAssetDetails {
                    asset_code,
                    asset_scale,
                } => self.remote_asset = Some((asset_code, asset_scale)),
                Frame::ConnectionMaxData { max_offset } => {
                    self.remote_conn_max = self.remote_conn_max.max(max_offset);
                }
                Frame::ConnectionDataBlocked { .. } => self.conn_max_update = true,
                Frame::ConnectionMaxStreamId { max_stream_id } => {
                    self.remote_max_stream_id = self.remote_max_stream_id.max(max_stream_id);
                }
                Frame::ConnectionStreamIdBlocked { .. } => self.max_stream_id_update = true,
                Frame::ConnectionClose { code, message } => close = Some((code, message)),
                Frame::StreamMoney { stream_id, .. } => {
                    let credit = credits.next().unwrap_or(0);
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.receive_money(credit);
                        self.total_received = self.total_received.saturating_add(credit);
                    }
                }
                Frame::StreamData {
                    stream_id,
                    offset,
                    fin,
                    data,
                } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        let (grown, discarded) = stream.receive_data(offset, data, fin);
                        self.conn_recv_high += grown;
                        if discarded > 0 {
                            self.on_bytes_consumed(discarded);
                        }
                    }
                }
                Frame::StreamClose {
                    stream_id,
                    code,
                    message,
                } => match self.streams.get_mut(&stream_id) {
                    Some(stream) => stream.on_remote_close(code, message),
                    None if !self.role.owns_stream(stream_id)
                        && stream_id > self.highest_remote_stream_id =>
                    {
                        // Opened and closed in one packet: the id is spent.
                        self.highest_remote_stream_id = stream_id;
                        self.local_max_stream_id += 2;
                        self.max_stream_id_update = true;
                    }
                    None => {}
                },
                Frame::StreamMaxMoney {
                    stream_id,
                    receive_max,
                    total_received,
                } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.on_remote_max_money(receive_max, total_received);
                    }
                }
                Frame::StreamMaxData {
                    stream_id,
                    max_offset,
                } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.on_remote_max_data(max_offset);
                    }
                }
                Frame::StreamMoneyBlocked { stream_id, .. } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.on_remote_money_blocked();
                    }
                }
                Frame::StreamDataBlocked { stream_id, .. } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.on_remote_data_blocked();
                    }
                }
                Frame::StreamMoneyClose { stream_id } => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.on_remote_money_close();
                    }
                }
            }
        }

        if let Some((code, message)) = close {
            tracing::info!(code = ?code, message = %message, "Peer closed connection");
            self.on_remote_close(code, message);
        }
        new_address
    }
}

/// Split `amount` across the packet's `StreamMoney` frames by shares. The
/// rounding remainder goes to the last frame with shares.
fn split_amount(frames: &[Frame], amount: u64) -> Result<Vec<u64>, Refusal> {
    let shares: Vec<u64> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::StreamMoney { shares, .. } => Some(*shares),
            _ => None,
        })
        .collect();
    let total: u128 = shares.iter().map(|&s| u128::from(s)).sum();
    if total == 0 {
        if amount > 0 {
            tracing::debug!(amount, "Money with no stream to credit");
            return Err(Refusal::Reject(Vec::new()));
        }
        return Ok(vec![0; shares.len()]);
    }

    let mut split: Vec<u64> = shares
        .iter()
        .map(|&s| {
            let part = u128::from(amount) * u128::from(s) / total;
            u64::try_from(part).unwrap_or(u64::MAX)
        })
        .collect();
    let assigned: u64 = split.iter().sum();
    if let Some(last) = shares.iter().rposition(|&s| s > 0) {
        split[last] += amount - assigned;
    }
    Ok(split)
}

impl ConnectionInner {
    /// Answer one request addressed to this connection.
    pub(crate) async fn handle_prepare(self: &Arc<Self>, prepare: Prepare) -> Packet {
        if prepare.is_expired() {
            return Reject::new(ErrorCode::R00_TRANSFER_TIMED_OUT, &self.own_address).into();
        }
        let Ok(plaintext) = self.cipher.decrypt(&prepare.data) else {
            tracing::debug!("Payload failed to authenticate");
            return opaque_reject(&self.own_address).into();
        };
        let packet = match StreamPacket::decode(&plaintext) {
            Ok(packet) => packet,
            Err(e) if e.is_fatal() => {
                tracing::warn!(error = %e, "Authenticated packet is undecodable, closing");
                return self.fatal_reject(0, CloseCode::ProtocolViolation, e.to_string()).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Malformed payload");
                return opaque_reject(&self.own_address).into();
            }
        };
        if packet.packet_type != PacketType::Prepare {
            return opaque_reject(&self.own_address).into();
        }

        let fulfillment = self.cipher.fulfillment(&prepare.data);
        let condition_ok = fulfillment_to_condition(&fulfillment) == prepare.execution_condition;
        let sequence = packet.sequence;

        let (verdict, new_streams, state) = {
            let mut core = self.core.lock().await;
            let verdict = core.apply_inbound(packet, prepare.amount, condition_ok);
            if let Inbound::Fatal { code, message } = &verdict {
                core.close_error
                    .get_or_insert_with(|| ConnectionError::protocol(message.clone()));
                core.start_close(CloseIntent::abort(*code, message.clone(), false));
            }
            core.wake_all();
            (verdict, std::mem::take(&mut core.new_streams), core.state)
        };
        self.publish_state(state);
        self.wake_sender();
        for shared in new_streams {
            self.announce_stream(shared);
        }

        match verdict {
            Inbound::Opaque => opaque_reject(&self.own_address).into(),
            Inbound::Fulfill(frames) => {
                let data = self.seal_response(PacketType::Fulfill, sequence, prepare.amount, frames);
                Fulfill { fulfillment, data }.into()
            }
            Inbound::Reject(frames) => {
                let data = self.seal_response(PacketType::Reject, sequence, prepare.amount, frames);
                self.application_reject(data).into()
            }
            Inbound::Fatal { code, message } => {
                let frames = vec![Frame::ConnectionClose { code, message }];
                let data = self.seal_response(PacketType::Reject, sequence, prepare.amount, frames);
                self.application_reject(data).into()
            }
        }
    }

    /// Close on an undecodable packet and tell the peer in the reject.
    async fn fatal_reject(self: &Arc<Self>, sequence: u64, code: CloseCode, message: String) -> Packet {
        let state = {
            let mut core = self.core.lock().await;
            core.close_error
                .get_or_insert_with(|| ConnectionError::protocol(message.clone()));
            core.start_close(CloseIntent::abort(code, message.clone(), false));
            core.state
        };
        self.publish_state(state);
        self.wake_sender();
        let frames = vec![Frame::ConnectionClose { code, message }];
        let data = self.seal_response(PacketType::Reject, sequence, 0, frames);
        self.application_reject(data).into()
    }

    fn application_reject(&self, data: Vec<u8>) -> Reject {
        Reject {
            code: ErrorCode::F99_APPLICATION_ERROR,
            triggered_by: self.own_address.clone(),
            message: String::new(),
            data,
        }
    }

    fn seal_response(&self, packet_type: PacketType, sequence: u64, amount: u64, frames: Vec<Frame>) -> Vec<u8> {
        StreamPacket::new(packet_type, sequence, amount, frames)
            .seal(&self.cipher)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to seal response");
                Vec::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::state::Role;
    use paystream_transport::AddressInfo;

    fn server_core() -> ConnectionCore {
        ConnectionCore::new(
            ConnectionConfig::default(),
            Role::Server,
            AddressInfo::new("test.server", "USD", 2),
            None,
        )
    }

    fn request(sequence: u64, frames: Vec<Frame>) -> StreamPacket {
        StreamPacket::new(PacketType::Prepare, sequence, 0, frames)
    }

    fn hello() -> Vec<Frame> {
        vec![
            Frame::ConnectionNewAddress {
                source_account: "test.client".into(),
            },
            Frame::ConnectionAssetDetails {
                asset_code: "EUR".into(),
                asset_scale: 6,
            },
        ]
    }

    #[test]
    fn test_handshake_opens_and_answers() {
        let mut core = server_core();
        let verdict = core.apply_inbound(request(1, hello()), 0, true);
        let Inbound::Fulfill(frames) = verdict else {
            panic!("expected fulfill, got {verdict:?}");
        };
        assert_eq!(core.state, ConnectionState::Open);
        assert_eq!(core.remote_address.as_deref(), Some("test.client"));
        assert_eq!(core.remote_asset, Some(("EUR".into(), 6)));
        assert!(frames.contains(&Frame::ConnectionAssetDetails {
            asset_code: "USD".into(),
            asset_scale: 2,
        }));
        assert!(frames.contains(&Frame::ConnectionMaxStreamId { max_stream_id: 40 }));
    }

    #[test]
    fn test_replay_is_opaque() {
        let mut core = server_core();
        assert!(matches!(core.apply_inbound(request(1, hello()), 0, true), Inbound::Fulfill(_)));
        assert_eq!(core.apply_inbound(request(1, vec![]), 0, true), Inbound::Opaque);
    }

    #[test]
    fn test_replayed_money_and_data_change_nothing() {
        let mut core = server_core();
        let frames = vec![
            Frame::StreamMoney {
                stream_id: 1,
                shares: 1,
            },
            Frame::StreamData {
                stream_id: 1,
                offset: 0,
                fin: false,
                data: b"paid".to_vec(),
            },
        ];
        let packet = request(1, frames);
        assert!(matches!(core.apply_inbound(packet.clone(), 25, true), Inbound::Fulfill(_)));

        let total_received = core.total_received;
        let conn_recv_high = core.conn_recv_high;
        let new_streams = core.new_streams.len();
        let stream = &core.streams[&1];
        let (stream_received, stream_high, unread) =
            (stream.total_received(), stream.recv_high(), stream.unread());

        assert_eq!(core.apply_inbound(packet, 25, true), Inbound::Opaque);
        assert_eq!(core.total_received, total_received);
        assert_eq!(core.conn_recv_high, conn_recv_high);
        assert_eq!(core.new_streams.len(), new_streams);
        let stream = core.streams.get_mut(&1).unwrap();
        assert_eq!(stream.total_received(), stream_received);
        assert_eq!(stream.recv_high(), stream_high);
        assert_eq!(stream.unread(), unread);
        assert_eq!(stream.next_money(), Some(Some(25)));
        assert_eq!(stream.read_chunk(), Some(b"paid".to_vec()));
        assert_eq!(stream.read_chunk(), None);
    }

    #[test]
    fn test_money_split_by_shares() {
        let mut core = server_core();
        let frames = vec![
            Frame::StreamMoney {
                stream_id: 1,
                shares: 1,
            },
            Frame::StreamMoney {
                stream_id: 3,
                shares: 2,
            },
        ];
        let verdict = core.apply_inbound(request(1, frames), 100, true);
        assert!(matches!(verdict, Inbound::Fulfill(_)));
        assert_eq!(core.streams[&1].total_received(), 33);
        assert_eq!(core.streams[&3].total_received(), 67);
        assert_eq!(core.total_received, 100);
        assert_eq!(core.new_streams.len(), 2);
    }

    #[test]
    fn test_money_without_shares_rejected() {
        let mut core = server_core();
        let verdict = core.apply_inbound(request(1, vec![]), 10, true);
        assert_eq!(verdict, Inbound::Reject(vec![]));
        assert_eq!(core.total_received, 0);
    }

    #[test]
    fn test_condition_mismatch_applies_nothing() {
        let mut core = server_core();
        let frames = vec![Frame::StreamMoney {
            stream_id: 1,
            shares: 1,
        }];
        let verdict = core.apply_inbound(request(1, frames), 10, false);
        assert!(matches!(verdict, Inbound::Reject(_)));
        assert!(core.streams.is_empty());
        assert_eq!(core.total_received, 0);
    }

    #[test]
    fn test_receive_max_exceeded_rejects_with_limits() {
        let mut core = server_core();
        core.apply_inbound(
            request(
                1,
                vec![Frame::StreamMoney {
                    stream_id: 1,
                    shares: 1,
                }],
            ),
            10,
            true,
        );
        core.streams.get_mut(&1).unwrap().set_receive_max(15);

        let verdict = core.apply_inbound(
            request(
                2,
                vec![Frame::StreamMoney {
                    stream_id: 1,
                    shares: 1,
                }],
            ),
            10,
            true,
        );
        let Inbound::Reject(frames) = verdict else {
            panic!("expected reject, got {verdict:?}");
        };
        assert!(frames.contains(&Frame::StreamMaxMoney {
            stream_id: 1,
            receive_max: 15,
            total_received: 10,
        }));
        assert_eq!(core.streams[&1].total_received(), 10);
    }

    #[test]
    fn test_stream_id_above_limit_is_fatal() {
        let mut core = server_core();
        let frames = vec![Frame::StreamMaxData {
            stream_id: 41,
            max_offset: 10,
        }];
        assert!(matches!(
            core.apply_inbound(request(1, frames), 0, true),
            Inbound::Fatal {
                code: CloseCode::StreamIdError,
                ..
            }
        ));
        assert!(core.streams.is_empty());
    }

    #[test]
    fn test_stream_id_of_wrong_parity_is_fatal() {
        let mut core = server_core();
        let frames = vec![Frame::StreamMoney {
            stream_id: 2,
            shares: 1,
        }];
        assert!(matches!(
            core.apply_inbound(request(1, frames), 0, true),
            Inbound::Fatal {
                code: CloseCode::StreamIdError,
                ..
            }
        ));
    }

    #[test]
    fn test_data_beyond_window_is_fatal() {
        let mut core = server_core();
        let frames = vec![Frame::StreamData {
            stream_id: 1,
            offset: INITIAL_STREAM_WINDOW,
            fin: false,
            data: vec![1],
        }];
        assert!(matches!(
            core.apply_inbound(request(1, frames), 0, true),
            Inbound::Fatal {
                code: CloseCode::FlowControlError,
                ..
            }
        ));
        assert!(core.streams.is_empty());
    }

    #[test]
    fn test_data_is_applied_and_acknowledged() {
        let mut core = server_core();
        let frames = vec![Frame::StreamData {
            stream_id: 1,
            offset: 0,
            fin: true,
            data: b"hello".to_vec(),
        }];
        let Inbound::Fulfill(response) = core.apply_inbound(request(1, frames), 0, true) else {
            panic!("expected fulfill");
        };
        assert_eq!(core.conn_recv_high, 5);
        assert!(response
            .iter()
            .any(|f| matches!(f, Frame::StreamMaxData { stream_id: 1, .. })));
        let stream = core.streams.get_mut(&1).unwrap();
        assert_eq!(stream.read_chunk(), Some(b"hello".to_vec()));
        assert_eq!(stream.read_end(), Some(Ok(())));
    }

    #[test]
    fn test_money_to_released_stream_rejected() {
        let mut core = server_core();
        core.highest_remote_stream_id = 5;
        let frames = vec![Frame::StreamMoney {
            stream_id: 3,
            shares: 1,
        }];
        let verdict = core.apply_inbound(request(1, frames), 10, true);
        assert_eq!(
            verdict,
            Inbound::Reject(vec![Frame::StreamClose {
                stream_id: 3,
                code: CloseCode::StreamStateError,
                message: "stream is closed".into(),
            }])
        );
    }

    #[test]
    fn test_remote_close_applied_last() {
        let mut core = server_core();
        core.apply_inbound(request(1, hello()), 0, true);
        let frames = vec![
            Frame::ConnectionClose {
                code: CloseCode::NoError,
                message: String::new(),
            },
            Frame::StreamMoney {
                stream_id: 1,
                shares: 1,
            },
        ];
        assert!(matches!(
            core.apply_inbound(request(2, frames), 7, true),
            Inbound::Fulfill(_)
        ));
        assert_eq!(core.total_received, 7);
        assert_eq!(core.state, ConnectionState::Closing);
        assert_eq!(core.apply_inbound(request(3, vec![]), 0, true), Inbound::Opaque);
    }

    #[test]
    fn test_split_amount_remainder() {
        let frames = vec![
            Frame::StreamMoney {
                stream_id: 1,
                shares: 1,
            },
            Frame::StreamMoney {
                stream_id: 3,
                shares: 1,
            },
            Frame::StreamMoney {
                stream_id: 5,
                shares: 1,
            },
        ];
        let Ok(split) = split_amount(&frames, 10) else {
            panic!("split refused");
        };
        assert_eq!(split, vec![3, 3, 4]);
        assert_eq!(split.iter().sum::<u64>(), 10);
    }
}
