//! Server and client joined by an in-memory plugin pair.
//!
//! Each mock plugin takes a single data handler, so a fixture carries at
//! most one live client connection at a time. Raw packets can be sent from
//! the client plugin alongside it; the handler only receives.

use paystream_core::{
    AddressAndSecret, ClientConfig, Connection, ConnectionConfig, Server, ServerConfig,
    StreamPacket, create_connection,
};
use paystream_crypto::{PacketCipher, ServerSecret, SharedSecret};
use paystream_transport::{AddressInfo, MockPlugin, Packet, Plugin, Prepare};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::test_helpers::{init_tracing, within};

/// Address the server plugin reports
pub const SERVER_ADDRESS: &str = "test.server";

/// Address the client plugin reports
pub const CLIENT_ADDRESS: &str = "test.client";

/// A listening server and the plugin a client reaches it through
pub struct ServerClientFixture {
    /// The server under test
    pub server: Server,
    /// Plugin the server listens on
    pub server_plugin: Arc<MockPlugin>,
    /// Plugin handed to client connections and raw sends
    pub client_plugin: Arc<MockPlugin>,
}

impl ServerClientFixture {
    /// Fixture with default connection settings on both sides.
    pub async fn new() -> Self {
        Self::with_config(ConnectionConfig::default()).await
    }

    /// Fixture whose server applies `connection` to every connection.
    ///
    /// # Panics
    ///
    /// Panics if the server cannot start.
    pub async fn with_config(connection: ConnectionConfig) -> Self {
        init_tracing();
        let (client_plugin, server_plugin) = MockPlugin::pair(
            AddressInfo::new(CLIENT_ADDRESS, "USD", 2),
            AddressInfo::new(SERVER_ADDRESS, "USD", 2),
        );
        let secret = ServerSecret::generate().expect("server secret");
        let config = ServerConfig::new(server_plugin.clone(), secret).with_connection(connection);
        let server = Server::listen(config).await.expect("server listens");
        Self {
            server,
            server_plugin,
            client_plugin,
        }
    }

    /// Fresh credentials for a connection.
    ///
    /// # Panics
    ///
    /// Panics if the tag is refused.
    pub fn credentials(&self, tag: Option<&str>) -> AddressAndSecret {
        self.server
            .generate_address_and_secret(tag)
            .expect("address and secret")
    }

    /// Connect a client and return it with the server's side of it.
    pub async fn connect(&self, tag: Option<&str>) -> (Connection, Connection) {
        self.connect_with(tag, ConnectionConfig::default()).await
    }

    /// Connect a client using `connection` on the client side.
    ///
    /// # Panics
    ///
    /// Panics if the handshake fails or the server never announces the
    /// connection.
    pub async fn connect_with(
        &self,
        tag: Option<&str>,
        connection: ConnectionConfig,
    ) -> (Connection, Connection) {
        let credentials = self.credentials(tag);
        let config = ClientConfig::new(
            self.client_plugin.clone(),
            credentials.destination_account,
            credentials.shared_secret,
        )
        .with_connection(connection);
        let client = create_connection(config).await.expect("client connects");
        let server_side = within(Duration::from_secs(5), "server accept", self.server.accept())
            .await
            .expect("server side of the connection");
        (client, server_side)
    }

    /// Send a raw request from the client plugin.
    pub async fn send_raw(&self, prepare: &Prepare) -> Packet {
        send_raw(self.client_plugin.as_ref(), prepare).await
    }
}

/// Encrypt `packet` under `secret` into a request for `destination`.
///
/// # Panics
///
/// Panics if encryption fails.
pub fn raw_prepare(
    destination: &str,
    secret: &SharedSecret,
    packet: &StreamPacket,
    amount: u64,
) -> Prepare {
    let cipher = PacketCipher::new(secret);
    let data = packet.seal(&cipher).expect("seal");
    Prepare {
        amount,
        expires_at: SystemTime::now() + Duration::from_secs(30),
        execution_condition: cipher.condition(&data),
        destination: destination.to_string(),
        data,
    }
}

/// Send one request through `plugin`, connecting it first if needed.
///
/// # Panics
///
/// Panics on a transport failure or an unparseable response.
pub async fn send_raw(plugin: &MockPlugin, prepare: &Prepare) -> Packet {
    if !plugin.is_connected() {
        plugin.connect().await.expect("plugin connects");
    }
    let response = plugin.send_data(prepare.to_bytes()).await.expect("send");
    Packet::from_bytes(&response).expect("response parses")
}

/// Decrypt the payload of a response, if it carries one.
pub fn open_response(secret: &SharedSecret, response: &Packet) -> Option<StreamPacket> {
    let data = match response {
        Packet::Fulfill(fulfill) => &fulfill.data,
        Packet::Reject(reject) => &reject.data,
        Packet::Prepare(_) => return None,
    };
    let plaintext = paystream_crypto::decrypt(secret, data).ok()?;
    StreamPacket::decode(&plaintext).ok()
}
