//! Connection engine.
//!
//! A connection owns its streams, sequence numbers, congestion controller
//! and lifecycle. All mutable state sits behind one lock in
//! [`ConnectionCore`]; three kinds of tasks take it:
//!
//! - the send loop, which assembles packets whenever it is woken,
//! - one task per outbound packet, which sends, retries and resolves it,
//! - the inbound path, which validates and applies the peer's packets.
//!
//! Stream handles never send anything themselves. They change state under
//! the lock and wake the send loop.

mod inbound;
mod outbound;
mod state;

pub use state::ConnectionState;
pub(crate) use state::{CloseIntent, ConnectionCore, Handshake, Role};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, Result};
use crate::frame::CloseCode;
use crate::stream::{DataAndMoneyStream, StreamShared};
use paystream_crypto::{PacketCipher, SharedSecret};
use paystream_transport::{AddressInfo, Packet, Plugin, Prepare};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::time::Instant;
use tracing::Instrument;

/// Snapshot of a connection's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Lifecycle state
    pub state: ConnectionState,
    /// Money sent in fulfilled packets, in local units
    pub total_sent: u64,
    /// Money the peer reported receiving, in its units
    pub total_delivered: u64,
    /// Money received on all streams
    pub total_received: u64,
    /// Packets handed to the transport
    pub packets_sent: u64,
    /// Outbound packets fulfilled
    pub packets_fulfilled: u64,
    /// Outbound packets rejected
    pub packets_rejected: u64,
    /// Current per-packet amount estimate
    pub max_packet_amount: u64,
    /// Streams not yet released
    pub open_streams: usize,
    /// Peer's asset code and scale, once known
    pub remote_asset: Option<(String, u8)>,
}

/// Everything needed to build a connection
pub(crate) struct ConnectionParams {
    pub(crate) id: String,
    pub(crate) role: Role,
    pub(crate) config: ConnectionConfig,
    pub(crate) local: AddressInfo,
    pub(crate) remote_address: Option<String>,
    pub(crate) secret: SharedSecret,
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) connection_tag: Option<String>,
    pub(crate) parent_span: tracing::Span,
}

/// Shared half of a connection
pub(crate) struct ConnectionInner {
    pub(crate) core: Mutex<ConnectionCore>,
    pub(crate) cipher: PacketCipher,
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) config: ConnectionConfig,
    /// Address put in `triggered_by` of our rejects
    pub(crate) own_address: String,
    id: String,
    connection_tag: Option<String>,
    pub(crate) span: tracing::Span,
    /// Wakes the send loop
    sender: Notify,
    state_tx: watch::Sender<ConnectionState>,
    incoming_tx: mpsc::UnboundedSender<Arc<StreamShared>>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Arc<StreamShared>>>,
}

impl ConnectionInner {
    /// Run `f` under the lock until it yields a value, sleeping on the
    /// stream's notifier in between. The send loop is woken after every
    /// attempt so that state changes made by `f` go out.
    pub(crate) async fn poll_stream<T>(
        &self,
        shared: &StreamShared,
        mut f: impl FnMut(&mut ConnectionCore) -> Option<T>,
    ) -> T {
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let result = {
                let mut core = self.core.lock().await;
                f(&mut core)
            };
            self.sender.notify_one();
            if let Some(value) = result {
                return value;
            }
            notified.await;
        }
    }

    pub(crate) fn wake_sender(&self) {
        self.sender.notify_one();
    }

    pub(crate) fn publish_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Queue a peer-opened stream for `accept_stream`
    pub(crate) fn announce_stream(&self, shared: Arc<StreamShared>) {
        if self.incoming_tx.send(shared).is_err() {
            tracing::trace!("Incoming stream queue closed");
        }
    }

    /// Send loop: assemble packets until the connection is closed.
    async fn run(self: Arc<Self>) {
        loop {
            let (packets, finished, state, deadline) = {
                let mut core = self.core.lock().await;
                core.release_finished_streams();
                let mut packets = Vec::new();
                while let Some(packet) = core.next_packet() {
                    packets.push(packet);
                }
                let finished = core.try_finish();
                if finished {
                    core.wake_all();
                }
                let deadline = (!core.is_aborting())
                    .then(|| core.last_activity + self.config.idle_timeout);
                (packets, finished, core.state, deadline)
            };

            for packet in packets {
                self.spawn_send(packet);
            }
            self.publish_state(state);
            if finished {
                tracing::info!("Connection closed");
                return;
            }

            tokio::select! {
                () = self.sender.notified() => {}
                () = sleep_until(deadline) => self.check_idle().await,
            }
        }
    }

    async fn check_idle(&self) {
        let mut core = self.core.lock().await;
        if core.is_aborting() || core.last_activity + self.config.idle_timeout > Instant::now() {
            return;
        }
        tracing::info!(idle_timeout = ?self.config.idle_timeout, "Connection idle, closing");
        core.close_error
            .get_or_insert_with(|| ConnectionError::timeout("idle timeout"));
        core.start_close(CloseIntent::abort(CloseCode::NoError, "idle timeout", false));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One end of a paystream connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("connection_tag", &self.inner.connection_tag)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Build the connection and start its send loop.
    pub(crate) fn new(params: ConnectionParams) -> Self {
        let span = tracing::info_span!(
            parent: &params.parent_span,
            "connection",
            id = %params.id,
            role = ?params.role,
        );
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let core = ConnectionCore::new(
            params.config.clone(),
            params.role,
            params.local.clone(),
            params.remote_address,
        );
        let inner = Arc::new(ConnectionInner {
            core: Mutex::new(core),
            cipher: PacketCipher::new(&params.secret),
            plugin: params.plugin,
            config: params.config,
            own_address: params.local.address,
            id: params.id,
            connection_tag: params.connection_tag,
            span: span.clone(),
            sender: Notify::new(),
            state_tx,
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
        });
        tokio::spawn(Arc::clone(&inner).run().instrument(span));
        Self { inner }
    }

    /// Send the handshake and wait for the peer to accept it.
    pub(crate) async fn connect(&self) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();
        {
            let mut core = self.inner.core.lock().await;
            core.transition_to(ConnectionState::Connecting);
            self.inner.publish_state(core.state);
        }
        self.inner.wake_sender();

        if rx.wait_for(|s| *s >= ConnectionState::Open).await.is_err() {
            return Err(ConnectionError::Closed);
        }
        let core = self.inner.core.lock().await;
        if core.handshake == Handshake::Done {
            Ok(())
        } else {
            Err(core.close_error.clone().unwrap_or(ConnectionError::Closed))
        }
    }

    /// Connection id: the token and tag for server connections, the
    /// destination for client connections
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Tag from the address this connection was reached through
    #[must_use]
    pub fn connection_tag(&self) -> Option<&str> {
        self.inner.connection_tag.as_deref()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Open a new stream.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::StreamIdBlocked`] if the peer's stream limit
    /// is reached, or [`ConnectionError::Closed`] once closing has begun.
    pub async fn create_stream(&self) -> Result<DataAndMoneyStream> {
        let shared = {
            let mut core = self.inner.core.lock().await;
            core.open_local_stream()?
        };
        self.inner.wake_sender();
        Ok(DataAndMoneyStream::new(shared, Arc::clone(&self.inner)))
    }

    /// Next stream the peer opened. Returns `None` once the connection is
    /// closed and every announced stream has been taken.
    pub async fn accept_stream(&self) -> Option<DataAndMoneyStream> {
        let mut rx = self.inner.incoming_rx.lock().await;
        let shared = tokio::select! {
            biased;
            shared = rx.recv() => shared,
            () = self.closed() => rx.try_recv().ok(),
        }?;
        Some(DataAndMoneyStream::new(shared, Arc::clone(&self.inner)))
    }

    /// Answer a request addressed to this connection.
    pub async fn handle_prepare(&self, prepare: Prepare) -> Packet {
        self.inner.handle_prepare(prepare).await
    }

    /// Close gracefully: flush every stream, tell the peer, and wait for
    /// outstanding packets.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connection if it was not a clean
    /// close.
    pub async fn close(&self) -> Result<()> {
        self.shutdown(CloseIntent::graceful()).await;
        let core = self.inner.core.lock().await;
        match &core.close_error {
            Some(err @ ConnectionError::RemoteClosed { .. }) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Close immediately, discarding unsent data and money.
    pub async fn destroy(&self) {
        self.shutdown(CloseIntent::abort(
            CloseCode::ApplicationError,
            "connection destroyed",
            true,
        ))
        .await;
    }

    async fn shutdown(&self, intent: CloseIntent) {
        {
            let mut core = self.inner.core.lock().await;
            core.start_close(intent);
            core.wake_all();
            self.inner.publish_state(core.state);
        }
        self.inner.wake_sender();
        self.closed().await;
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        if rx.wait_for(|s| *s == ConnectionState::Closed).await.is_err() {
            tracing::trace!("State channel dropped");
        }
    }

    /// Snapshot of the connection's counters.
    pub async fn stats(&self) -> ConnectionStats {
        let core = self.inner.core.lock().await;
        ConnectionStats {
            state: core.state,
            total_sent: core.total_sent,
            total_delivered: core.total_delivered,
            total_received: core.total_received,
            packets_sent: core.packets_sent,
            packets_fulfilled: core.packets_fulfilled,
            packets_rejected: core.packets_rejected,
            max_packet_amount: core.congestion.max_packet_amount(),
            open_streams: core.streams.len(),
            remote_asset: core.remote_asset.clone(),
        }
    }
}
