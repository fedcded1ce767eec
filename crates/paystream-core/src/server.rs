//! Server: issues addresses and routes incoming packets to connections.
//!
//! A connection is created on the first packet for an unseen connection id
//! that authenticates under the secret derived from its token. Once a
//! connection closes its id is retired for the lifetime of the server; any
//! later packet to it gets the same opaque reject as an unknown id.
//!
//! New connections wait in an accept queue until the application takes
//! them. A connection that closes before it is accepted leaves the queue,
//! so the queue never holds more than the active connections.

use crate::address;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionParams, Role};
use crate::error::{ConnectionError, Result, opaque_reject};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use paystream_crypto::{SharedSecret, Token, generate_token};
use paystream_transport::{AddressInfo, DataHandler, ErrorCode, Packet, Prepare, Reject, ildcp};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::Instrument;

/// Credentials a client needs to open a connection
#[derive(Debug, Clone)]
pub struct AddressAndSecret {
    /// Address to send to, including the token and optional tag
    pub destination_account: String,
    /// Secret the client encrypts with
    pub shared_secret: SharedSecret,
}

struct ServerInner {
    config: ServerConfig,
    local: AddressInfo,
    connections: DashMap<String, Connection>,
    closed_ids: DashSet<String>,
    accepting: AtomicBool,
    /// Created, not yet accepted, not yet closed
    accept_queue: Mutex<VecDeque<Connection>>,
    accept_notify: Notify,
}

impl ServerInner {
    async fn route(self: &Arc<Self>, prepare: Prepare) -> Packet {
        let server_address = self.local.address.as_str();
        let Some(id) = address::connection_id(server_address, &prepare.destination) else {
            tracing::debug!(destination = %prepare.destination, "No connection id in destination");
            return opaque_reject(server_address).into();
        };
        if self.closed_ids.contains(id) {
            tracing::trace!(connection_id = id, "Packet for retired connection");
            return opaque_reject(server_address).into();
        }

        let existing = self.connections.get(id).map(|c| c.value().clone());
        let connection = match existing {
            Some(connection) => connection,
            None => match self.open(id, &prepare).await {
                Some(connection) => connection,
                None => return opaque_reject(server_address).into(),
            },
        };
        connection.handle_prepare(prepare).await
    }

    /// Create the connection for `id` if the packet authenticates under it.
    async fn open(self: &Arc<Self>, id: &str, prepare: &Prepare) -> Option<Connection> {
        let (connection, created) = self.create(id, prepare)?;
        if created {
            tracing::info!(connection_id = id, tag = ?connection.connection_tag(), "New connection");
            self.accept_queue.lock().await.push_back(connection.clone());
            self.accept_notify.notify_one();
            self.watch_close(id.to_string(), connection.clone());
        }
        Some(connection)
    }

    /// Insert the connection for `id` unless another packet already did.
    /// Returns the connection and whether this call created it.
    fn create(&self, id: &str, prepare: &Prepare) -> Option<(Connection, bool)> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }
        let (token, tag) = address::split_tag(id);
        let token = Token::decode(token).ok()?;
        let secret = token.shared_secret(&self.config.server_secret);
        if paystream_crypto::decrypt(&secret, &prepare.data).is_err() {
            tracing::debug!(connection_id = id, "First packet failed to authenticate");
            return None;
        }

        match self.connections.entry(id.to_string()) {
            Entry::Occupied(entry) => Some((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                if self.closed_ids.contains(id) {
                    return None;
                }
                let connection = Connection::new(ConnectionParams {
                    id: id.to_string(),
                    role: Role::Server,
                    config: self.config.connection.clone(),
                    local: self.local.clone(),
                    remote_address: None,
                    secret,
                    plugin: Arc::clone(&self.config.plugin),
                    connection_tag: tag.map(str::to_string),
                    parent_span: self.config.log_span.clone(),
                });
                entry.insert(connection.clone());
                Some((connection, true))
            }
        }
    }

    /// Retire the id once the connection closes.
    fn watch_close(self: &Arc<Self>, id: String, connection: Connection) {
        let inner = Arc::clone(self);
        tokio::spawn(
            async move {
                connection.closed().await;
                inner.closed_ids.insert(id.clone());
                inner.connections.remove(&id);
                inner.accept_queue.lock().await.retain(|queued| queued.id() != id);
                tracing::debug!(connection_id = %id, "Connection retired");
            }
            .instrument(self.config.log_span.clone()),
        );
    }
}

struct ServerHandler {
    inner: Arc<ServerInner>,
}

#[async_trait]
impl DataHandler for ServerHandler {
    async fn handle_data(&self, data: Vec<u8>) -> Vec<u8> {
        let response = match Prepare::from_bytes(&data) {
            Ok(prepare) => self.inner.route(prepare).await,
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable request");
                Reject::new(ErrorCode::F00_BAD_REQUEST, &self.inner.local.address).into()
            }
        };
        response.to_bytes()
    }
}

/// A listening paystream server.
///
/// Cheap to clone; clones share the server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.inner.local.address)
            .field("active_connections", &self.inner.connections.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Connect the plugin, learn the server's address and start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Config`] for invalid configuration and
    /// [`ConnectionError::Transport`] if the plugin cannot connect, discover
    /// its address, or take a handler.
    pub async fn listen(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let span = config.log_span.clone();
        async move {
            config.plugin.connect().await?;
            let local = ildcp::fetch(config.plugin.as_ref()).await?;
            let inner = Arc::new(ServerInner {
                config,
                local,
                connections: DashMap::new(),
                closed_ids: DashSet::new(),
                accepting: AtomicBool::new(true),
                accept_queue: Mutex::new(VecDeque::new()),
                accept_notify: Notify::new(),
            });
            let handler = Arc::new(ServerHandler {
                inner: Arc::clone(&inner),
            });
            inner.config.plugin.register_data_handler(handler).await?;
            tracing::info!(address = %inner.local.address, "Server listening");
            Ok(Self { inner })
        }
        .instrument(span)
        .await
    }

    /// The server's own address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.local.address
    }

    /// Issue a fresh address and the secret a client must use with it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Config`] if the tag violates the tag
    /// policy, or [`ConnectionError::Crypto`] if randomness is unavailable.
    pub fn generate_address_and_secret(&self, connection_tag: Option<&str>) -> Result<AddressAndSecret> {
        if let Some(tag) = connection_tag {
            self.inner.config.tag_policy.check(tag)?;
        }
        let token = generate_token()?;
        Ok(AddressAndSecret {
            destination_account: address::build_address(
                &self.inner.local.address,
                &token.encode(),
                connection_tag,
            ),
            shared_secret: token.shared_secret(&self.inner.config.server_secret),
        })
    }

    /// Next newly created connection that is still open. Returns `None`
    /// after `close`.
    pub async fn accept(&self) -> Option<Connection> {
        loop {
            let notified = self.inner.accept_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.inner.accept_queue.lock().await;
                if let Some(connection) = queue.pop_front() {
                    return Some(connection);
                }
                if !self.inner.accepting.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Connections waiting to be accepted
    #[must_use]
    pub async fn pending_accepts(&self) -> usize {
        self.inner.accept_queue.lock().await.len()
    }

    /// Connections that have not closed yet
    #[must_use]
    pub fn active_connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// True if the id belongs to a connection that has closed
    #[must_use]
    pub fn is_retired(&self, connection_id: &str) -> bool {
        self.inner.closed_ids.contains(connection_id)
    }

    /// Stop accepting, close every connection and wait for each to finish,
    /// then release the plugin.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Transport`] if the plugin fails to
    /// disconnect.
    pub async fn close(&self) -> Result<()> {
        self.inner.accepting.store(false, Ordering::Release);
        tracing::info!(
            active = self.inner.connections.len(),
            "Server closing"
        );

        let connections = self.active_connections();
        let mut closing = tokio::task::JoinSet::new();
        for connection in connections.clone() {
            closing.spawn(async move {
                if let Err(e) = connection.close().await {
                    tracing::debug!(connection_id = connection.id(), error = %e, "Connection closed with error");
                }
            });
        }
        while closing.join_next().await.is_some() {}

        // Close watchers may not have run yet.
        for connection in connections {
            self.inner.closed_ids.insert(connection.id().to_string());
            self.inner.connections.remove(connection.id());
        }

        self.inner.accept_queue.lock().await.clear();
        self.inner.accept_notify.notify_waiters();
        let plugin = &self.inner.config.plugin;
        plugin.deregister_data_handler().await;
        plugin.disconnect().await.map_err(ConnectionError::from)?;
        tracing::info!("Server closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paystream_crypto::ServerSecret;
    use paystream_transport::{MockPlugin, Plugin};

    async fn listening() -> (Server, Arc<MockPlugin>, Arc<MockPlugin>) {
        let (client, server) = MockPlugin::pair(
            AddressInfo::new("test.alice", "XRP", 9),
            AddressInfo::new("test.bob", "XRP", 9),
        );
        let config = ServerConfig::new(server.clone(), ServerSecret::from_bytes([7; 32]));
        let listening = Server::listen(config).await.unwrap();
        (listening, client, server)
    }

    #[tokio::test]
    async fn test_listen_learns_address() {
        let (server, _, plugin) = listening().await;
        assert_eq!(server.address(), "test.bob");
        assert!(plugin.is_connected());
    }

    #[tokio::test]
    async fn test_zero_secret_refused() {
        let (_, plugin) = MockPlugin::pair(
            AddressInfo::new("test.alice", "XRP", 9),
            AddressInfo::new("test.bob", "XRP", 9),
        );
        let config = ServerConfig::new(plugin, ServerSecret::from_bytes([0; 32]));
        assert!(matches!(
            Server::listen(config).await,
            Err(ConnectionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_second_server_on_same_plugin_fails() {
        let (_server, _, plugin) = listening().await;
        let config = ServerConfig::new(plugin, ServerSecret::from_bytes([8; 32]));
        assert!(Server::listen(config).await.is_err());
    }

    #[tokio::test]
    async fn test_generated_address_routes_back() {
        let (server, _, _) = listening().await;
        let credentials = server.generate_address_and_secret(Some("order-42")).unwrap();

        let id = address::connection_id(server.address(), &credentials.destination_account).unwrap();
        let (token, tag) = address::split_tag(id);
        assert_eq!(tag, Some("order-42"));
        let token = Token::decode(token).unwrap();
        let derived = token.shared_secret(&ServerSecret::from_bytes([7; 32]));
        assert_eq!(derived.as_bytes(), credentials.shared_secret.as_bytes());
    }

    #[tokio::test]
    async fn test_addresses_are_unique() {
        let (server, _, _) = listening().await;
        let a = server.generate_address_and_secret(None).unwrap();
        let b = server.generate_address_and_secret(None).unwrap();
        assert_ne!(a.destination_account, b.destination_account);
    }

    #[tokio::test]
    async fn test_unparseable_request_is_bad_request() {
        let (server, _, _) = listening().await;
        let handler = ServerHandler {
            inner: Arc::clone(&server.inner),
        };
        let response = handler.handle_data(vec![0xff, 0x00]).await;
        match Packet::from_bytes(&response).unwrap() {
            Packet::Reject(reject) => assert_eq!(reject.code, ErrorCode::F00_BAD_REQUEST),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_releases_plugin() {
        let (server, _, plugin) = listening().await;
        server.close().await.unwrap();
        assert!(!plugin.is_connected());
        assert!(server.accept().await.is_none());
        assert!(server.active_connections().is_empty());
    }
}
