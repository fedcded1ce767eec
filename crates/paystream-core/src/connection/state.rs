//! Connection state shared by the send loop, packet tasks and the inbound
//! path. Everything here runs under the connection's single lock.

use crate::config::ConnectionConfig;
use crate::congestion::CongestionController;
use crate::error::{ConnectionError, StreamError};
use crate::frame::CloseCode;
use crate::replay::ReplayWindow;
use crate::stream::{SendFlag, StreamShared, StreamState};
use crate::{INITIAL_CONNECTION_WINDOW, INITIAL_MAX_STREAM_ID};
use paystream_transport::AddressInfo;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Constructed, no packets exchanged
    Idle,
    /// Handshake sent, waiting for the response
    Connecting,
    /// Normal operation
    Open,
    /// Close initiated by either side; in-flight packets still resolve
    Closing,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// True if the lifecycle allows moving to `next`
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self != Self::Closed && next > self
    }
}

/// Which end of the connection this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Opened by `create_connection`; odd stream ids
    Client,
    /// Created by the server router; even stream ids
    Server,
}

impl Role {
    fn first_stream_id(self) -> u64 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// True if `id` belongs to streams this side opens
    pub(crate) fn owns_stream(self, id: u64) -> bool {
        (id % 2 == 1) == (self == Self::Client)
    }
}

/// How a close was requested
#[derive(Debug, Clone)]
pub(crate) struct CloseIntent {
    pub(crate) code: CloseCode,
    pub(crate) message: String,
    /// Flush streams before closing
    pub(crate) graceful: bool,
    /// Send a `ConnectionClose` packet
    pub(crate) notify_peer: bool,
    /// Error handed to streams that are still open
    pub(crate) stream_error: Option<StreamError>,
}

impl CloseIntent {
    /// Local graceful close
    pub(crate) fn graceful() -> Self {
        Self {
            code: CloseCode::NoError,
            message: String::new(),
            graceful: true,
            notify_peer: true,
            stream_error: None,
        }
    }

    /// Immediate close
    pub(crate) fn abort(code: CloseCode, message: impl Into<String>, notify_peer: bool) -> Self {
        Self {
            code,
            message: message.into(),
            graceful: false,
            notify_peer,
            stream_error: Some(StreamError::ConnectionClosed),
        }
    }
}

/// Handshake progress (client role only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handshake {
    NotSent,
    InFlight,
    Done,
}

/// Mutable connection state
#[derive(Debug)]
pub(crate) struct ConnectionCore {
    pub(crate) config: ConnectionConfig,
    pub(crate) role: Role,
    pub(crate) state: ConnectionState,
    pub(crate) local: AddressInfo,
    pub(crate) streams: BTreeMap<u64, StreamState>,
    /// Remotely opened streams waiting to be handed to the application
    pub(crate) new_streams: Vec<Arc<StreamShared>>,

    // ============ Stream ids ============
    pub(crate) next_local_stream_id: u64,
    pub(crate) remote_max_stream_id: u64,
    pub(crate) stream_id_blocked: bool,
    pub(crate) stream_id_blocked_at: Option<u64>,
    pub(crate) highest_remote_stream_id: u64,
    pub(crate) local_max_stream_id: u64,
    pub(crate) advertised_max_stream_id: u64,
    pub(crate) max_stream_id_update: bool,

    // ============ Connection window ============
    pub(crate) remote_conn_max: u64,
    pub(crate) conn_write_end: u64,
    pub(crate) conn_blocked: bool,
    pub(crate) conn_blocked_at: Option<u64>,
    pub(crate) conn_recv_high: u64,
    pub(crate) conn_read: u64,
    pub(crate) advertised_conn_max: u64,
    pub(crate) conn_max_update: bool,

    // ============ Packets ============
    next_sequence: u64,
    pub(crate) replay: ReplayWindow,
    pub(crate) congestion: CongestionController,
    pub(crate) handshake: Handshake,
    pub(crate) last_activity: Instant,

    // ============ Peer ============
    pub(crate) remote_address: Option<String>,
    pub(crate) remote_asset: Option<(String, u8)>,

    // ============ Close ============
    pub(crate) close: Option<CloseIntent>,
    pub(crate) close_packet: SendFlag,
    pub(crate) close_error: Option<ConnectionError>,

    // ============ Totals ============
    pub(crate) total_sent: u64,
    pub(crate) total_delivered: u64,
    pub(crate) total_received: u64,
    pub(crate) packets_sent: u64,
    pub(crate) packets_fulfilled: u64,
    pub(crate) packets_rejected: u64,
}

impl ConnectionCore {
    pub(crate) fn new(
        config: ConnectionConfig,
        role: Role,
        local: AddressInfo,
        remote_address: Option<String>,
    ) -> Self {
        let replay = ReplayWindow::new(config.reorder_window);
        let congestion = CongestionController::new(&config.congestion, config.max_packets_in_flight);
        let local_max_stream_id = config.max_remote_streams.saturating_mul(2);
        Self {
            role,
            state: ConnectionState::Idle,
            local,
            streams: BTreeMap::new(),
            new_streams: Vec::new(),
            next_local_stream_id: role.first_stream_id(),
            remote_max_stream_id: INITIAL_MAX_STREAM_ID,
            stream_id_blocked: false,
            stream_id_blocked_at: None,
            highest_remote_stream_id: 0,
            local_max_stream_id,
            advertised_max_stream_id: INITIAL_MAX_STREAM_ID,
            max_stream_id_update: false,
            remote_conn_max: INITIAL_CONNECTION_WINDOW,
            conn_write_end: 0,
            conn_blocked: false,
            conn_blocked_at: None,
            conn_recv_high: 0,
            conn_read: 0,
            advertised_conn_max: INITIAL_CONNECTION_WINDOW,
            conn_max_update: false,
            next_sequence: 1,
            replay,
            congestion,
            handshake: Handshake::NotSent,
            last_activity: Instant::now(),
            remote_address,
            remote_asset: None,
            close: None,
            close_packet: SendFlag::Idle,
            close_error: None,
            total_sent: 0,
            total_delivered: 0,
            total_received: 0,
            packets_sent: 0,
            packets_fulfilled: 0,
            packets_rejected: 0,
            config,
        }
    }

    /// Move to `next`, logging the transition. Disallowed moves are ignored.
    pub(crate) fn transition_to(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "Connection state transition");
        self.state = next;
    }

    /// Sequence number for the next outbound attempt
    pub(crate) fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Closed, or closing without waiting for streams
    pub(crate) fn is_aborting(&self) -> bool {
        self.state == ConnectionState::Closed || self.close.as_ref().is_some_and(|c| !c.graceful)
    }

    // ============ Streams ============

    /// Allocate the next local stream id.
    pub(crate) fn open_local_stream(&mut self) -> Result<Arc<StreamShared>, ConnectionError> {
        if self.state >= ConnectionState::Closing {
            return Err(ConnectionError::Closed);
        }
        let id = self.next_local_stream_id;
        if id > self.remote_max_stream_id {
            if self.stream_id_blocked_at != Some(self.remote_max_stream_id) {
                self.stream_id_blocked = true;
            }
            return Err(ConnectionError::StreamIdBlocked {
                requested: id,
                max: self.remote_max_stream_id,
            });
        }
        self.next_local_stream_id += 2;
        let stream = StreamState::new(id, false, self.config.max_buffered_data);
        let shared = Arc::clone(&stream.shared);
        self.streams.insert(id, stream);
        tracing::debug!(stream_id = id, "Opened stream");
        Ok(shared)
    }

    /// Register a stream the peer opened
    pub(crate) fn open_remote_stream(&mut self, id: u64) {
        let stream = StreamState::new(id, true, self.config.max_buffered_data);
        self.new_streams.push(Arc::clone(&stream.shared));
        self.streams.insert(id, stream);
        self.highest_remote_stream_id = self.highest_remote_stream_id.max(id);
        tracing::debug!(stream_id = id, "Peer opened stream");
    }

    /// Abort one stream at the application's request
    pub(crate) fn destroy_stream(&mut self, id: u64) {
        if let Some(stream) = self.streams.get_mut(&id) {
            let discarded = stream.destroy();
            stream.shared.wake();
            self.on_bytes_consumed(discarded);
        }
    }

    /// Drop streams whose every direction has ended
    pub(crate) fn release_finished_streams(&mut self) {
        let finished: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, s)| s.finished())
            .map(|(&id, _)| id)
            .collect();
        for id in finished {
            let Some(stream) = self.streams.remove(&id) else {
                continue;
            };
            if stream.remote_opened {
                self.local_max_stream_id += 2;
                self.max_stream_id_update = true;
            }
            self.conn_read += stream.unread();
            stream.shared.wake();
            tracing::trace!(stream_id = id, "Released stream");
        }
    }

    /// Wake every handle waiting on a stream
    pub(crate) fn wake_all(&self) {
        for stream in self.streams.values() {
            stream.shared.wake();
        }
    }

    // ============ Connection window ============

    /// Writer found the connection window exhausted
    pub(crate) fn note_conn_blocked(&mut self) {
        if self.conn_blocked_at != Some(self.remote_conn_max) {
            self.conn_blocked = true;
        }
    }

    /// Offset the peer will be allowed once the next update goes out
    pub(crate) fn conn_max_target(&self) -> u64 {
        self.conn_read.saturating_add(self.config.connection_buffer_size)
    }

    /// Bytes left the receive buffers, by reading or discarding
    pub(crate) fn on_bytes_consumed(&mut self, len: u64) {
        self.conn_read += len;
        let raise = self.conn_max_target().saturating_sub(self.advertised_conn_max);
        if raise >= self.config.connection_buffer_size / 2 {
            self.conn_max_update = true;
        }
    }

    /// The reader took `len` bytes
    pub(crate) fn on_bytes_read(&mut self, len: u64) {
        self.on_bytes_consumed(len);
    }

    // ============ Close ============

    /// Begin closing. A graceful close can be escalated to an abort; nothing
    /// else changes an existing close.
    pub(crate) fn start_close(&mut self, mut intent: CloseIntent) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(existing) = &self.close {
            if !existing.graceful || intent.graceful {
                return;
            }
        }
        if self.remote_address.is_none() {
            intent.notify_peer = false;
        }
        tracing::info!(
            code = ?intent.code,
            message = %intent.message,
            graceful = intent.graceful,
            "Closing connection"
        );
        for stream in self.streams.values_mut() {
            if intent.graceful {
                stream.close_data();
                stream.close_money();
            } else {
                stream.terminate(intent.stream_error.clone());
            }
        }
        self.transition_to(ConnectionState::Closing);
        self.close = Some(intent);
    }

    /// Peer sent `ConnectionClose`
    pub(crate) fn on_remote_close(&mut self, code: CloseCode, message: String) {
        let (error, stream_error) = match code {
            CloseCode::NoError => (None, None),
            _ => (
                Some(ConnectionError::RemoteClosed {
                    code,
                    message: message.clone(),
                }),
                Some(StreamError::ConnectionClosed),
            ),
        };
        if self.close_error.is_none() {
            self.close_error = error;
        }
        self.start_close(CloseIntent {
            code,
            message,
            graceful: false,
            notify_peer: false,
            stream_error,
        });
    }

    /// Move to `Closed` once nothing is left to resolve. Returns true on the
    /// transition.
    pub(crate) fn try_finish(&mut self) -> bool {
        if self.state != ConnectionState::Closing {
            return false;
        }
        let Some(intent) = &self.close else {
            return false;
        };
        if self.congestion.packets_in_flight() > 0 {
            return false;
        }
        if intent.graceful && self.streams.values().any(StreamState::has_output) {
            return false;
        }
        if intent.notify_peer && self.close_packet != SendFlag::Done {
            return false;
        }
        let stream_error = intent.stream_error.clone();
        for stream in self.streams.values_mut() {
            stream.terminate(stream_error.clone());
        }
        self.transition_to(ConnectionState::Closed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(role: Role) -> ConnectionCore {
        ConnectionCore::new(
            ConnectionConfig::default(),
            role,
            AddressInfo::new("test.local", "XRP", 9),
            Some("test.remote".into()),
        )
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Idle.can_transition_to(Open));
        assert!(Connecting.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Open.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closing.can_transition_to(Open));
    }

    #[test]
    fn test_stream_id_parity() {
        let mut client = core(Role::Client);
        assert_eq!(client.open_local_stream().unwrap().id, 1);
        assert_eq!(client.open_local_stream().unwrap().id, 3);
        assert!(Role::Client.owns_stream(5));
        assert!(!Role::Client.owns_stream(4));

        let mut server = core(Role::Server);
        assert_eq!(server.open_local_stream().unwrap().id, 2);
        assert_eq!(server.open_local_stream().unwrap().id, 4);
        assert!(Role::Server.owns_stream(6));
    }

    #[test]
    fn test_stream_id_limit() {
        let mut client = core(Role::Client);
        client.remote_max_stream_id = 3;
        client.open_local_stream().unwrap();
        client.open_local_stream().unwrap();
        let err = client.open_local_stream().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::StreamIdBlocked { requested: 5, max: 3 }
        ));
        assert!(err.is_transient());
        assert!(client.stream_id_blocked);
    }

    #[test]
    fn test_release_raises_stream_limit() {
        let mut server = core(Role::Server);
        let before = server.local_max_stream_id;
        server.open_remote_stream(1);
        let stream = server.streams.get_mut(&1).unwrap();
        stream.destroy();
        stream.take_close_frame().unwrap();
        stream.on_close_frame_resolved(false);

        server.release_finished_streams();
        assert!(server.streams.is_empty());
        assert_eq!(server.local_max_stream_id, before + 2);
        assert!(server.max_stream_id_update);
        assert_eq!(server.new_streams.len(), 1);
    }

    #[test]
    fn test_window_update_after_half_read() {
        let mut c = core(Role::Client);
        c.advertised_conn_max = c.conn_max_target();
        c.on_bytes_read(c.config.connection_buffer_size / 2 - 1);
        assert!(!c.conn_max_update);
        c.on_bytes_read(1);
        assert!(c.conn_max_update);
    }

    #[test]
    fn test_graceful_close_can_escalate() {
        let mut c = core(Role::Client);
        c.state = ConnectionState::Open;
        c.start_close(CloseIntent::graceful());
        assert_eq!(c.state, ConnectionState::Closing);
        assert!(!c.is_aborting());

        c.start_close(CloseIntent::abort(CloseCode::InternalError, "idle", false));
        assert!(c.is_aborting());

        c.start_close(CloseIntent::graceful());
        assert!(c.is_aborting());
    }

    #[test]
    fn test_finish_waits_for_close_packet() {
        let mut c = core(Role::Client);
        c.state = ConnectionState::Open;
        c.start_close(CloseIntent::graceful());
        assert!(!c.try_finish());
        c.close_packet = SendFlag::Done;
        assert!(c.try_finish());
        assert_eq!(c.state, ConnectionState::Closed);
    }

    #[test]
    fn test_close_without_peer_address_finishes() {
        let mut c = ConnectionCore::new(
            ConnectionConfig::default(),
            Role::Server,
            AddressInfo::new("test.server", "XRP", 9),
            None,
        );
        c.start_close(CloseIntent::graceful());
        assert!(c.try_finish());
    }
}
