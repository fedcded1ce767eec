//! Streams carrying ordered bytes and money in both directions.
//!
//! [`StreamState`] holds everything the connection engine needs for one
//! stream id: the outgoing byte buffer and the remote window on it, the
//! outgoing money target and the remote receive limit, reassembly of
//! incoming bytes, and incoming money events. It never performs I/O.
//!
//! [`DataAndMoneyStream`] is the application's handle. Every method locks
//! the owning connection, acts on the state and, if it cannot make progress
//! yet, waits for the stream to be woken by the engine.

use crate::connection::ConnectionInner;
use crate::error::StreamError;
use crate::frame::{CloseCode, Frame};
use crate::{INITIAL_STREAM_WINDOW, connection::ConnectionState};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

/// Encoded size of a `StreamData` frame without its bytes
pub(crate) const STREAM_DATA_OVERHEAD: usize = crate::frame::FRAME_HEADER_SIZE + 21;

/// Progress of a one-shot frame (fin, money close, stream close)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendFlag {
    /// Not requested
    Idle,
    /// Requested, waiting for a packet
    Pending,
    /// Carried by an unresolved packet
    InFlight,
    /// Acknowledged or abandoned
    Done,
}

/// Parts of a stream the handle reads without taking the connection lock
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) id: u64,
    pub(crate) notify: Notify,
    outcome: OnceLock<StreamError>,
    total_sent: AtomicU64,
    total_received: AtomicU64,
}

impl StreamShared {
    fn new(id: u64) -> Self {
        Self {
            id,
            notify: Notify::new(),
            outcome: OnceLock::new(),
            total_sent: AtomicU64::new(0),
            total_received: AtomicU64::new(0),
        }
    }

    /// Record the error the stream ended with. The first one wins.
    pub(crate) fn set_outcome(&self, err: StreamError) {
        if self.outcome.set(err).is_err() {
            tracing::trace!(stream_id = self.id, "Stream outcome already recorded");
        }
    }

    fn outcome(&self) -> Option<StreamError> {
        self.outcome.get().cloned()
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }
}

/// Engine-side state of one stream
#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) shared: Arc<StreamShared>,
    /// Opened by the peer
    pub(crate) remote_opened: bool,
    /// Peer has seen this stream id
    pub(crate) announced: bool,

    // ============ Outgoing data ============
    send_buf: VecDeque<u8>,
    /// Offset of `send_buf[0]`
    send_offset: u64,
    retransmit: BTreeMap<u64, Vec<u8>>,
    data_in_flight: u64,
    remote_max_offset: u64,
    fin: SendFlag,
    data_blocked: bool,
    data_blocked_at: Option<u64>,

    // ============ Outgoing money ============
    send_max: u64,
    total_sent: u64,
    money_in_flight: u64,
    remote_receive_max: u64,
    remote_total_received: u64,
    money_close: SendFlag,
    money_blocked_at: Option<u64>,
    money_failure: Option<StreamError>,

    // ============ Incoming data ============
    recv_pending: BTreeMap<u64, Vec<u8>>,
    recv_ready: VecDeque<Vec<u8>>,
    recv_contiguous: u64,
    recv_high: u64,
    read_offset: u64,
    max_buffered_data: u64,
    /// Max offset last advertised to the peer
    local_max_offset: u64,
    remote_fin: Option<u64>,
    pub(crate) max_data_update: bool,

    // ============ Incoming money ============
    receive_max: u64,
    total_received: u64,
    /// Received but not yet reported by `next_money`
    money_unreported: u64,
    remote_money_closed: bool,
    pub(crate) max_money_update: bool,

    // ============ Abort ============
    close_frame: SendFlag,
    close_code: CloseCode,
    close_message: String,
    local_closed: bool,
    /// The connection ended; unread bytes and money stay readable
    terminated: bool,
    remote_closed: Option<(CloseCode, String)>,
    data_error: Option<StreamError>,
}

impl StreamState {
    /// Create state for a stream id
    pub(crate) fn new(id: u64, remote_opened: bool, max_buffered_data: u64) -> Self {
        Self {
            shared: Arc::new(StreamShared::new(id)),
            remote_opened,
            announced: remote_opened,
            send_buf: VecDeque::new(),
            send_offset: 0,
            retransmit: BTreeMap::new(),
            data_in_flight: 0,
            remote_max_offset: INITIAL_STREAM_WINDOW,
            fin: SendFlag::Idle,
            data_blocked: false,
            data_blocked_at: None,
            send_max: 0,
            total_sent: 0,
            money_in_flight: 0,
            remote_receive_max: u64::MAX,
            remote_total_received: 0,
            money_close: SendFlag::Idle,
            money_blocked_at: None,
            money_failure: None,
            recv_pending: BTreeMap::new(),
            recv_ready: VecDeque::new(),
            recv_contiguous: 0,
            recv_high: 0,
            read_offset: 0,
            max_buffered_data,
            local_max_offset: INITIAL_STREAM_WINDOW,
            remote_fin: None,
            max_data_update: false,
            receive_max: u64::MAX,
            total_received: 0,
            money_unreported: 0,
            remote_money_closed: false,
            max_money_update: false,
            close_frame: SendFlag::Idle,
            close_code: CloseCode::NoError,
            close_message: String::new(),
            local_closed: false,
            terminated: false,
            remote_closed: None,
            data_error: None,
        }
    }

    /// Stream id
    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    /// Either side aborted the stream, or data delivery failed for good
    pub(crate) fn aborted(&self) -> bool {
        self.local_closed || self.terminated || self.remote_closed.is_some() || self.data_error.is_some()
    }

    // ============ Outgoing data ============

    fn write_end(&self) -> u64 {
        self.send_offset + self.send_buf.len() as u64
    }

    /// Why a write cannot be accepted, if it cannot
    pub(crate) fn write_error(&self) -> Option<StreamError> {
        if let Some(err) = &self.data_error {
            return Some(err.clone());
        }
        if let Some((code, message)) = &self.remote_closed {
            return Some(remote_close_error(*code, message));
        }
        if self.terminated {
            return Some(self.shared.outcome().unwrap_or(StreamError::ConnectionClosed));
        }
        (self.local_closed || self.fin != SendFlag::Idle).then_some(StreamError::Closed)
    }

    /// Bytes the peer will currently accept beyond what was written
    pub(crate) fn send_window(&self) -> u64 {
        self.remote_max_offset.saturating_sub(self.write_end())
    }

    /// Buffer bytes already checked against both windows
    pub(crate) fn push_data(&mut self, data: &[u8]) {
        self.send_buf.extend(data);
        self.data_blocked = false;
    }

    /// Writer found the stream window exhausted
    pub(crate) fn note_data_blocked(&mut self) {
        if self.data_blocked_at != Some(self.remote_max_offset) {
            self.data_blocked = true;
        }
    }

    /// Request the data direction be closed once buffered bytes are out
    pub(crate) fn close_data(&mut self) {
        if self.fin == SendFlag::Idle && !self.aborted() {
            self.fin = SendFlag::Pending;
        }
    }

    fn has_data_to_send(&self) -> bool {
        !self.aborted()
            && (!self.retransmit.is_empty() || !self.send_buf.is_empty() || self.fin == SendFlag::Pending)
    }

    /// All written bytes are acknowledged (or the direction is dead)
    pub(crate) fn data_flushed(&self) -> bool {
        self.aborted() || (!self.has_data_to_send() && self.data_in_flight == 0)
    }

    /// Take the next chunk to send, at most `max` bytes.
    ///
    /// Returns `(offset, bytes, fin)`. A bare fin is returned as an empty
    /// chunk once every byte has been handed out.
    pub(crate) fn take_data(&mut self, max: usize) -> Option<(u64, Vec<u8>, bool)> {
        if self.aborted() {
            return None;
        }
        let (offset, chunk) = if let Some((&offset, _)) = self.retransmit.first_key_value() {
            if max == 0 {
                return None;
            }
            let mut chunk = self.retransmit.remove(&offset)?;
            if chunk.len() > max {
                let rest = chunk.split_off(max);
                self.retransmit.insert(offset + max as u64, rest);
            }
            (offset, chunk)
        } else if !self.send_buf.is_empty() {
            if max == 0 {
                return None;
            }
            let n = self.send_buf.len().min(max);
            let offset = self.send_offset;
            let chunk: Vec<u8> = self.send_buf.drain(..n).collect();
            self.send_offset += n as u64;
            (offset, chunk)
        } else if self.fin == SendFlag::Pending {
            (self.write_end(), Vec::new())
        } else {
            return None;
        };

        let end = offset + chunk.len() as u64;
        let fin = self.fin == SendFlag::Pending
            && self.retransmit.is_empty()
            && self.send_buf.is_empty()
            && end == self.write_end();
        if fin {
            self.fin = SendFlag::InFlight;
        }
        self.data_in_flight += chunk.len() as u64;
        Some((offset, chunk, fin))
    }

    /// Blocked frame owed to the peer, if any
    pub(crate) fn take_data_blocked(&mut self) -> Option<Frame> {
        if !self.data_blocked || self.aborted() {
            return None;
        }
        self.data_blocked = false;
        self.data_blocked_at = Some(self.remote_max_offset);
        Some(Frame::StreamDataBlocked {
            stream_id: self.id(),
            max_offset: self.remote_max_offset,
        })
    }

    /// A packet carrying this chunk was fulfilled
    pub(crate) fn on_data_delivered(&mut self, len: u64, fin: bool) {
        self.data_in_flight = self.data_in_flight.saturating_sub(len);
        if fin {
            self.fin = SendFlag::Done;
        }
    }

    /// A packet carrying this chunk must be resent
    pub(crate) fn on_data_returned(&mut self, offset: u64, data: Vec<u8>, fin: bool) {
        self.data_in_flight = self.data_in_flight.saturating_sub(data.len() as u64);
        if self.aborted() {
            return;
        }
        if !data.is_empty() {
            self.retransmit.insert(offset, data);
        }
        if fin && self.fin == SendFlag::InFlight {
            self.fin = SendFlag::Pending;
        }
    }

    /// A packet carrying this chunk failed for good. The stream is aborted.
    pub(crate) fn on_data_failed(&mut self, len: u64, err: StreamError) {
        self.data_in_flight = self.data_in_flight.saturating_sub(len);
        if self.aborted() {
            return;
        }
        tracing::debug!(stream_id = self.id(), error = %err, "Stream data delivery failed");
        self.shared.set_outcome(err.clone());
        self.data_error = Some(err);
        self.discard_outgoing();
        self.queue_close(CloseCode::ApplicationError, "data delivery failed");
    }

    /// Peer raised its receive window
    pub(crate) fn on_remote_max_data(&mut self, max_offset: u64) {
        self.remote_max_offset = self.remote_max_offset.max(max_offset);
    }

    /// Peer says it is blocked on our window
    pub(crate) fn on_remote_data_blocked(&mut self) {
        self.max_data_update = true;
    }

    // ============ Outgoing money ============

    /// Money that may go out in the next packet. A pending money close
    /// still drains what was requested before it.
    pub(crate) fn pending_money(&self) -> u64 {
        if self.aborted() || matches!(self.money_close, SendFlag::InFlight | SendFlag::Done) {
            return 0;
        }
        self.send_max
            .min(self.remote_receive_max)
            .saturating_sub(self.total_sent + self.money_in_flight)
    }

    /// Money waits on the peer's receive max, not on us
    fn money_blocked(&self) -> bool {
        !self.aborted()
            && self.pending_money() == 0
            && self.send_max > self.total_sent + self.money_in_flight
    }

    /// Reserve up to `budget` of the pending money for a packet
    pub(crate) fn take_money(&mut self, budget: u64) -> u64 {
        let give = self.pending_money().min(budget);
        self.money_in_flight += give;
        give
    }

    /// Blocked frame owed to the peer, if any
    pub(crate) fn take_money_blocked(&mut self) -> Option<Frame> {
        if !self.money_blocked() || self.money_blocked_at == Some(self.remote_receive_max) {
            return None;
        }
        self.money_blocked_at = Some(self.remote_receive_max);
        Some(Frame::StreamMoneyBlocked {
            stream_id: self.id(),
            send_max: self.send_max,
            total_sent: self.total_sent,
        })
    }

    /// Raise the total this stream should send
    pub(crate) fn set_send_max(&mut self, send_max: u64) -> Result<(), StreamError> {
        if let Some(err) = self.write_error_money() {
            return Err(err);
        }
        if send_max < self.total_sent {
            return Err(StreamError::SendMaxBelowSent {
                requested: send_max,
                sent: self.total_sent,
            });
        }
        self.send_max = send_max;
        self.money_failure = None;
        Ok(())
    }

    fn write_error_money(&self) -> Option<StreamError> {
        if let Some((code, message)) = &self.remote_closed {
            return Some(remote_close_error(*code, message));
        }
        if self.terminated {
            return Some(self.shared.outcome().unwrap_or(StreamError::ConnectionClosed));
        }
        (self.local_closed || self.money_close != SendFlag::Idle).then_some(StreamError::Closed)
    }

    /// Current target total
    pub(crate) fn send_max(&self) -> u64 {
        self.send_max
    }

    /// Outcome of waiting for `target` to be sent
    pub(crate) fn money_progress(&mut self, target: u64) -> Option<Result<(), StreamError>> {
        if self.total_sent >= target {
            return Some(Ok(()));
        }
        if let Some(err) = self.money_failure.take() {
            return Some(Err(err));
        }
        let draining = self.money_close == SendFlag::Pending && !self.aborted();
        if self.money_in_flight == 0 && self.pending_money() == 0 && !draining {
            if let Some(err) = self.write_error_money() {
                return Some(Err(err));
            }
        }
        None
    }

    /// A packet carrying this money was fulfilled
    pub(crate) fn on_money_delivered(&mut self, amount: u64) {
        self.money_in_flight = self.money_in_flight.saturating_sub(amount);
        self.total_sent = self.total_sent.saturating_add(amount);
        self.shared.total_sent.store(self.total_sent, Ordering::Relaxed);
    }

    /// A packet carrying this money will be rebuilt
    pub(crate) fn on_money_returned(&mut self, amount: u64) {
        self.money_in_flight = self.money_in_flight.saturating_sub(amount);
    }

    /// A packet carrying this money failed for good.
    ///
    /// The target drops back to what is already sent or in flight so the
    /// failure is not retried behind the caller's back.
    pub(crate) fn on_money_failed(&mut self, amount: u64, err: StreamError) {
        self.money_in_flight = self.money_in_flight.saturating_sub(amount);
        self.send_max = self.total_sent + self.money_in_flight;
        tracing::debug!(stream_id = self.id(), error = %err, "Stream money delivery failed");
        self.money_failure = Some(err);
    }

    /// Peer's latest money limit
    pub(crate) fn on_remote_max_money(&mut self, receive_max: u64, total_received: u64) {
        self.remote_receive_max = receive_max;
        self.remote_total_received = self.remote_total_received.max(total_received);
    }

    /// Request the money direction be closed once requested money is out.
    /// The send max is frozen; further raises are refused.
    pub(crate) fn close_money(&mut self) {
        if self.money_close == SendFlag::Idle && !self.aborted() {
            self.money_close = SendFlag::Pending;
        }
    }

    /// Nothing requested is waiting for a packet or a fulfill
    fn money_drained(&self) -> bool {
        self.pending_money() == 0 && self.money_in_flight == 0
    }

    /// `StreamMoneyClose` owed to the peer, once requested money is out.
    ///
    /// Money still held back by the peer's receive max is failed here
    /// rather than waited on.
    pub(crate) fn take_money_close(&mut self) -> Option<Frame> {
        if self.money_close != SendFlag::Pending || !self.money_drained() || self.aborted() {
            return None;
        }
        if self.send_max > self.total_sent {
            let unsent = self.send_max - self.total_sent;
            tracing::debug!(stream_id = self.id(), unsent, "Closing money with amount held back by peer");
            self.send_max = self.total_sent;
            self.money_failure = Some(StreamError::ReceiveMaxReached { unsent });
        }
        self.money_close = SendFlag::InFlight;
        Some(Frame::StreamMoneyClose {
            stream_id: self.id(),
        })
    }

    /// Resolution of a packet that carried `StreamMoneyClose`
    pub(crate) fn on_money_close_resolved(&mut self, retry: bool) {
        if self.money_close == SendFlag::InFlight {
            self.money_close = if retry { SendFlag::Pending } else { SendFlag::Done };
        }
    }

    // ============ Incoming data ============

    /// Highest byte offset received plus one
    pub(crate) fn recv_high(&self) -> u64 {
        self.recv_high
    }

    /// Offset the peer may send up to
    pub(crate) fn local_max_offset(&self) -> u64 {
        self.local_max_offset
    }

    /// Offset the peer will be allowed once the next update goes out
    fn local_max_offset_target(&self) -> u64 {
        self.read_offset.saturating_add(self.max_buffered_data)
    }

    /// Offset at which the peer ended the data direction
    pub(crate) fn remote_fin(&self) -> Option<u64> {
        self.remote_fin
    }

    /// Reassemble an incoming chunk.
    ///
    /// Returns the growth of `recv_high` and how many of those bytes were
    /// discarded unread. Bounds were checked by the caller.
    pub(crate) fn receive_data(&mut self, offset: u64, data: Vec<u8>, fin: bool) -> (u64, u64) {
        let end = offset + data.len() as u64;
        if fin {
            self.remote_fin = Some(end);
        }
        let grown = end.saturating_sub(self.recv_high);
        self.recv_high = self.recv_high.max(end);

        if self.local_closed {
            self.recv_contiguous = self.recv_high;
            self.read_offset = self.recv_high;
            return (grown, grown);
        }
        if end <= self.recv_contiguous || data.is_empty() {
            return (grown, 0);
        }
        if offset > self.recv_contiguous {
            let keep = self
                .recv_pending
                .get(&offset)
                .is_none_or(|existing| existing.len() < data.len());
            if keep {
                self.recv_pending.insert(offset, data);
            }
            return (grown, 0);
        }

        self.push_ready(offset, data);
        while let Some((&next, _)) = self.recv_pending.first_key_value() {
            if next > self.recv_contiguous {
                break;
            }
            if let Some(chunk) = self.recv_pending.remove(&next) {
                self.push_ready(next, chunk);
            }
        }
        (grown, 0)
    }

    fn push_ready(&mut self, offset: u64, mut data: Vec<u8>) {
        let end = offset + data.len() as u64;
        if end <= self.recv_contiguous {
            return;
        }
        let skip = usize::try_from(self.recv_contiguous - offset).unwrap_or(usize::MAX);
        if skip > 0 {
            data.drain(..skip.min(data.len()));
        }
        self.recv_contiguous = end;
        self.recv_ready.push_back(data);
    }

    /// Hand the next ordered chunk to the reader
    pub(crate) fn read_chunk(&mut self) -> Option<Vec<u8>> {
        let chunk = self.recv_ready.pop_front()?;
        self.read_offset += chunk.len() as u64;
        let raise = self.local_max_offset_target().saturating_sub(self.local_max_offset);
        if raise >= self.max_buffered_data / 2 && !self.remote_fin_reached() {
            self.max_data_update = true;
        }
        Some(chunk)
    }

    fn remote_fin_reached(&self) -> bool {
        self.remote_fin.is_some_and(|fin| self.recv_contiguous >= fin)
    }

    /// Reader's view once no chunk is ready
    pub(crate) fn read_end(&self) -> Option<Result<(), StreamError>> {
        if !self.recv_ready.is_empty() {
            return None;
        }
        if self.local_closed || self.remote_fin.is_some_and(|fin| self.read_offset >= fin) {
            return Some(Ok(()));
        }
        if self.terminated && self.remote_closed.is_none() {
            return Some(match self.shared.outcome() {
                Some(err @ StreamError::RemoteClosed { .. }) => Err(err),
                _ => Ok(()),
            });
        }
        if let Some((code, message)) = &self.remote_closed {
            return Some(match code {
                CloseCode::NoError => Ok(()),
                _ => Err(remote_close_error(*code, message)),
            });
        }
        None
    }

    /// Peer says it is blocked on our money limit
    pub(crate) fn on_remote_money_blocked(&mut self) {
        self.max_money_update = true;
    }

    // ============ Incoming money ============

    /// Money limit for incoming payments
    pub(crate) fn receive_max(&self) -> u64 {
        self.receive_max
    }

    /// Money received so far
    pub(crate) fn total_received(&self) -> u64 {
        self.total_received
    }

    /// Peer ended the money direction
    pub(crate) fn remote_money_closed(&self) -> bool {
        self.remote_money_closed
    }

    /// Credit money. Bounds were checked by the caller.
    pub(crate) fn receive_money(&mut self, amount: u64) {
        self.total_received = self.total_received.saturating_add(amount);
        self.shared
            .total_received
            .store(self.total_received, Ordering::Relaxed);
        self.money_unreported = self.money_unreported.saturating_add(amount);
    }

    /// Peer sent `StreamMoneyClose`
    pub(crate) fn on_remote_money_close(&mut self) {
        self.remote_money_closed = true;
    }

    /// Change the incoming money limit
    pub(crate) fn set_receive_max(&mut self, receive_max: u64) {
        self.receive_max = receive_max;
        self.max_money_update = true;
    }

    /// Money received since the last report, or whether the direction has
    /// ended
    pub(crate) fn next_money(&mut self) -> Option<Option<u64>> {
        if self.money_unreported > 0 {
            return Some(Some(std::mem::take(&mut self.money_unreported)));
        }
        (self.remote_money_closed || self.remote_closed.is_some() || self.local_closed || self.terminated)
            .then_some(None)
    }

    /// Current limit frames, marking them advertised
    pub(crate) fn limit_frames(&mut self) -> [Frame; 2] {
        self.local_max_offset = self.local_max_offset.max(self.local_max_offset_target());
        self.max_data_update = false;
        self.max_money_update = false;
        self.announced = true;
        [
            Frame::StreamMaxMoney {
                stream_id: self.id(),
                receive_max: self.receive_max,
                total_received: self.total_received,
            },
            Frame::StreamMaxData {
                stream_id: self.id(),
                max_offset: self.local_max_offset,
            },
        ]
    }

    /// Limit updates worth a packet of their own
    pub(crate) fn wants_limit_update(&self) -> bool {
        !self.aborted() && (self.max_data_update || self.max_money_update)
    }

    // ============ Abort ============

    fn discard_outgoing(&mut self) {
        self.send_offset = self.write_end();
        self.send_buf.clear();
        self.retransmit.clear();
        self.send_max = self.total_sent + self.money_in_flight;
    }

    fn queue_close(&mut self, code: CloseCode, message: &str) {
        if self.close_frame == SendFlag::Idle && self.remote_closed.is_none() {
            self.close_code = code;
            self.close_message = message.to_string();
            self.close_frame = SendFlag::Pending;
        }
    }

    /// Abort locally and tell the peer. Returns the count of received
    /// bytes discarded unread.
    pub(crate) fn destroy(&mut self) -> u64 {
        if self.local_closed || self.terminated {
            return 0;
        }
        self.discard_outgoing();
        self.queue_close(CloseCode::NoError, "");
        self.local_closed = true;
        self.recv_ready.clear();
        self.recv_pending.clear();
        self.money_unreported = 0;
        let discarded = self.unread();
        self.recv_contiguous = self.recv_high;
        self.read_offset = self.recv_high;
        discarded
    }

    /// Received bytes not yet handed to the reader
    pub(crate) fn unread(&self) -> u64 {
        self.recv_high - self.read_offset
    }

    /// Abort because the connection ended. No frame is owed; whatever was
    /// already received stays readable.
    pub(crate) fn terminate(&mut self, err: Option<StreamError>) {
        if let Some(err) = err {
            self.shared.set_outcome(err);
        }
        self.discard_outgoing();
        self.close_frame = SendFlag::Done;
        self.money_close = SendFlag::Done;
        self.fin = SendFlag::Done;
        self.terminated = true;
    }

    /// Peer aborted the stream
    pub(crate) fn on_remote_close(&mut self, code: CloseCode, message: String) {
        if self.remote_closed.is_some() {
            return;
        }
        tracing::debug!(stream_id = self.id(), ?code, %message, "Stream closed by peer");
        if code != CloseCode::NoError {
            self.shared.set_outcome(remote_close_error(code, &message));
        }
        self.discard_outgoing();
        self.remote_closed = Some((code, message));
        if self.close_frame == SendFlag::Pending {
            self.close_frame = SendFlag::Done;
        }
    }

    /// `StreamClose` owed to the peer, if any
    pub(crate) fn take_close_frame(&mut self) -> Option<Frame> {
        if self.close_frame != SendFlag::Pending {
            return None;
        }
        self.close_frame = SendFlag::InFlight;
        Some(Frame::StreamClose {
            stream_id: self.id(),
            code: self.close_code,
            message: self.close_message.clone(),
        })
    }

    /// Resolution of a packet that carried `StreamClose`
    pub(crate) fn on_close_frame_resolved(&mut self, retry: bool) {
        if self.close_frame == SendFlag::InFlight {
            self.close_frame = if retry { SendFlag::Pending } else { SendFlag::Done };
        }
    }

    /// Something this stream can put in a packet right now
    pub(crate) fn has_output(&self) -> bool {
        self.close_frame == SendFlag::Pending
            || self.has_data_to_send()
            || self.pending_money() > 0
            || (self.money_close == SendFlag::Pending && self.money_drained())
            || self.data_blocked
            || self.wants_limit_update()
    }

    /// Bytes and money in unresolved packets
    pub(crate) fn in_flight(&self) -> bool {
        self.data_in_flight > 0
            || self.money_in_flight > 0
            || self.close_frame == SendFlag::InFlight
            || self.money_close == SendFlag::InFlight
            || self.fin == SendFlag::InFlight
    }

    /// Every direction has ended and nothing is left to deliver or read.
    pub(crate) fn finished(&self) -> bool {
        if self.in_flight() || self.close_frame == SendFlag::Pending {
            return false;
        }
        let outgoing_done = self.aborted()
            || (self.fin == SendFlag::Done && self.money_close == SendFlag::Done);
        let incoming_done = self.local_closed
            || ((self.remote_closed.is_some()
                || self.terminated
                || (self.remote_fin_reached() && self.remote_money_closed))
                && self.recv_ready.is_empty()
                && self.money_unreported == 0);
        outgoing_done && incoming_done
    }
}

fn remote_close_error(code: CloseCode, message: &str) -> StreamError {
    match code {
        CloseCode::NoError => StreamError::Closed,
        _ => StreamError::RemoteClosed {
            code,
            message: message.to_string(),
        },
    }
}

/// A bidirectional stream of bytes and money on a [`crate::Connection`].
///
/// Handles are cheap to clone; all clones refer to the same stream.
#[derive(Clone)]
pub struct DataAndMoneyStream {
    shared: Arc<StreamShared>,
    conn: Arc<ConnectionInner>,
}

impl std::fmt::Debug for DataAndMoneyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAndMoneyStream")
            .field("id", &self.shared.id)
            .field("total_sent", &self.total_sent())
            .field("total_received", &self.total_received())
            .finish_non_exhaustive()
    }
}

impl DataAndMoneyStream {
    pub(crate) fn new(shared: Arc<StreamShared>, conn: Arc<ConnectionInner>) -> Self {
        Self { shared, conn }
    }

    /// Stream id (odd if opened by the client, even if by the server)
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Money delivered to the peer on this stream
    #[must_use]
    pub fn total_sent(&self) -> u64 {
        self.shared.total_sent.load(Ordering::Relaxed)
    }

    /// Money received from the peer on this stream
    #[must_use]
    pub fn total_received(&self) -> u64 {
        self.shared.total_received.load(Ordering::Relaxed)
    }

    fn gone(&self) -> StreamError {
        self.shared.outcome().unwrap_or(StreamError::Closed)
    }

    /// Write bytes, waiting while the peer's window is exhausted.
    ///
    /// Returns once every byte is buffered for sending, not delivered; use
    /// [`DataAndMoneyStream::flush`] to wait for delivery.
    ///
    /// # Errors
    ///
    /// Fails if the data direction is closed, the stream was aborted, or the
    /// connection is closing.
    pub async fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        let id = self.shared.id;
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            let n = self
                .conn
                .poll_stream(&self.shared, |core| {
                    if core.state >= ConnectionState::Closing {
                        return Some(Err(StreamError::ConnectionClosed));
                    }
                    let conn_room = core.remote_conn_max.saturating_sub(core.conn_write_end);
                    let Some(stream) = core.streams.get_mut(&id) else {
                        return Some(Err(self.gone()));
                    };
                    if let Some(err) = stream.write_error() {
                        return Some(Err(err));
                    }
                    let room = stream.send_window().min(conn_room);
                    if room == 0 {
                        if stream.send_window() == 0 {
                            stream.note_data_blocked();
                        } else {
                            core.note_conn_blocked();
                        }
                        return None;
                    }
                    let n = usize::try_from(room).unwrap_or(usize::MAX).min(rest.len());
                    stream.push_data(&rest[..n]);
                    core.conn_write_end += n as u64;
                    Some(Ok(n))
                })
                .await?;
            written += n;
        }
        Ok(())
    }

    /// Wait until every written byte has been acknowledged by the peer.
    ///
    /// # Errors
    ///
    /// Fails if data delivery failed or the stream was aborted with an error.
    pub async fn flush(&self) -> Result<(), StreamError> {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                let closed = core.state == ConnectionState::Closed;
                let Some(stream) = core.streams.get_mut(&id) else {
                    return Some(self.shared.outcome().map_or(Ok(()), Err));
                };
                if let Some(err) = &stream.data_error {
                    return Some(Err(err.clone()));
                }
                if stream.data_flushed() {
                    return Some(Ok(()));
                }
                closed.then(|| Err(StreamError::ConnectionClosed))
            })
            .await
    }

    /// Read the next chunk of bytes in order.
    ///
    /// Returns `Ok(None)` once the peer ended the data direction and every
    /// byte has been read, or the stream is gone.
    ///
    /// # Errors
    ///
    /// Fails if the peer aborted the stream with an error code.
    pub async fn read(&self) -> Result<Option<Vec<u8>>, StreamError> {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                let closed = core.state == ConnectionState::Closed;
                let Some(stream) = core.streams.get_mut(&id) else {
                    return Some(match self.shared.outcome() {
                        Some(err @ StreamError::RemoteClosed { .. }) => Err(err),
                        _ => Ok(None),
                    });
                };
                if let Some(chunk) = stream.read_chunk() {
                    core.on_bytes_read(chunk.len() as u64);
                    return Some(Ok(Some(chunk)));
                }
                match stream.read_end() {
                    Some(Ok(())) => Some(Ok(None)),
                    Some(Err(err)) => Some(Err(err)),
                    None => closed.then_some(Ok(None)),
                }
            })
            .await
    }

    /// Send `amount` more money, waiting until it is delivered.
    ///
    /// # Errors
    ///
    /// Fails if the connection is receive-only, the money direction is
    /// closed, or the money could not be delivered.
    pub async fn send_money(&self, amount: u64) -> Result<(), StreamError> {
        let target = {
            let id = self.shared.id;
            self.conn
                .poll_stream(&self.shared, |core| {
                    if core.config.receive_only {
                        return Some(Err(StreamError::ReceiveOnly));
                    }
                    if core.state >= ConnectionState::Closing {
                        return Some(Err(StreamError::ConnectionClosed));
                    }
                    let Some(stream) = core.streams.get_mut(&id) else {
                        return Some(Err(self.gone()));
                    };
                    let target = stream.send_max().saturating_add(amount);
                    Some(stream.set_send_max(target).map(|()| target))
                })
                .await?
        };
        self.wait_sent(target).await
    }

    /// Set the total this stream should have sent. Returns without waiting.
    ///
    /// # Errors
    ///
    /// Fails if `send_max` is below what was already sent, the connection is
    /// receive-only, or the money direction is closed.
    pub async fn set_send_max(&self, send_max: u64) -> Result<(), StreamError> {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                if core.config.receive_only {
                    return Some(Err(StreamError::ReceiveOnly));
                }
                let Some(stream) = core.streams.get_mut(&id) else {
                    return Some(Err(self.gone()));
                };
                Some(stream.set_send_max(send_max))
            })
            .await
    }

    async fn wait_sent(&self, target: u64) -> Result<(), StreamError> {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                let closed = core.state == ConnectionState::Closed;
                let Some(stream) = core.streams.get_mut(&id) else {
                    return Some(if self.total_sent() >= target {
                        Ok(())
                    } else {
                        Err(self.gone())
                    });
                };
                stream
                    .money_progress(target)
                    .or_else(|| closed.then_some(Err(StreamError::ConnectionClosed)))
            })
            .await
    }

    /// Set the total this stream is willing to receive.
    ///
    /// The new limit is advertised to the peer with the next packet.
    pub async fn set_receive_max(&self, receive_max: u64) {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                if let Some(stream) = core.streams.get_mut(&id) {
                    stream.set_receive_max(receive_max);
                }
                Some(())
            })
            .await;
    }

    /// Wait for incoming money and return everything received since the
    /// last call.
    ///
    /// Returns `None` once the peer closed the money direction and every
    /// unit has been reported.
    pub async fn next_money(&self) -> Option<u64> {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                let closed = core.state == ConnectionState::Closed;
                let Some(stream) = core.streams.get_mut(&id) else {
                    return Some(None);
                };
                stream.next_money().or_else(|| closed.then_some(None))
            })
            .await
    }

    /// End the data direction after buffered bytes are delivered.
    pub async fn close_data(&self) {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                if let Some(stream) = core.streams.get_mut(&id) {
                    stream.close_data();
                }
                Some(())
            })
            .await;
    }

    /// End the money direction. Money already requested is still sent;
    /// raising the send max afterwards is refused.
    pub async fn close_money(&self) {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                if let Some(stream) = core.streams.get_mut(&id) {
                    stream.close_money();
                }
                Some(())
            })
            .await;
    }

    /// Close both outgoing directions and wait until buffered data and
    /// requested money are delivered.
    ///
    /// # Errors
    ///
    /// Fails if buffered data or requested money could not be delivered.
    pub async fn close(&self) -> Result<(), StreamError> {
        let id = self.shared.id;
        let send_max = self
            .conn
            .poll_stream(&self.shared, |core| {
                let Some(stream) = core.streams.get_mut(&id) else {
                    return Some(None);
                };
                stream.close_money();
                stream.close_data();
                Some(Some(stream.send_max()))
            })
            .await;
        self.flush().await?;
        match send_max {
            Some(target) => self.wait_sent(target).await,
            None => Ok(()),
        }
    }

    /// Abort the stream immediately in both directions.
    ///
    /// Unsent bytes and unreceived data are discarded; the peer is told with
    /// a `StreamClose` frame.
    pub async fn destroy(&self) {
        let id = self.shared.id;
        self.conn
            .poll_stream(&self.shared, |core| {
                core.destroy_stream(id);
                Some(())
            })
            .await;
    }
}
