//! Client entry point.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionParams, Role};
use crate::error::Result;
use async_trait::async_trait;
use paystream_transport::{DataHandler, ErrorCode, Plugin, Prepare, Reject, ildcp};
use std::sync::Arc;
use tracing::Instrument;

/// Routes every request the plugin receives to the client's connection
struct ClientHandler {
    connection: Connection,
    address: String,
}

#[async_trait]
impl DataHandler for ClientHandler {
    async fn handle_data(&self, data: Vec<u8>) -> Vec<u8> {
        match Prepare::from_bytes(&data) {
            Ok(prepare) => self.connection.handle_prepare(prepare).await.to_bytes(),
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable request");
                paystream_transport::Packet::from(Reject::new(ErrorCode::F00_BAD_REQUEST, &self.address))
                    .to_bytes()
            }
        }
    }
}

/// Open a connection to a server address and complete the handshake.
///
/// The connection owns the plugin: once it closes, the handler is
/// deregistered and the plugin disconnected.
///
/// # Errors
///
/// Returns [`crate::ConnectionError::Config`] for invalid configuration,
/// [`crate::ConnectionError::Transport`] if the plugin cannot connect or
/// discover its address, and [`crate::ConnectionError::HandshakeRejected`]
/// if the server refuses the handshake.
pub async fn create_connection(config: ClientConfig) -> Result<Connection> {
    config.validate()?;
    let span = config.log_span.clone();
    async move {
        let plugin = Arc::clone(&config.plugin);
        plugin.connect().await?;
        let local = ildcp::fetch(plugin.as_ref()).await?;
        tracing::debug!(
            address = %local.address,
            destination = %config.destination_account,
            "Connecting"
        );

        let connection = Connection::new(ConnectionParams {
            id: config.destination_account.clone(),
            role: Role::Client,
            config: config.connection,
            local: local.clone(),
            remote_address: Some(config.destination_account),
            secret: config.shared_secret,
            plugin: Arc::clone(&plugin),
            connection_tag: None,
            parent_span: config.log_span,
        });
        let handler = Arc::new(ClientHandler {
            connection: connection.clone(),
            address: local.address,
        });
        if let Err(e) = plugin.register_data_handler(handler).await {
            connection.destroy().await;
            return Err(e.into());
        }
        release_plugin_on_close(connection.clone(), plugin);

        if let Err(e) = connection.connect().await {
            tracing::warn!(error = %e, "Handshake failed");
            connection.destroy().await;
            return Err(e);
        }
        Ok(connection)
    }
    .instrument(span)
    .await
}

fn release_plugin_on_close(connection: Connection, plugin: Arc<dyn Plugin>) {
    tokio::spawn(
        async move {
            connection.closed().await;
            plugin.deregister_data_handler().await;
            if let Err(e) = plugin.disconnect().await {
                tracing::debug!(error = %e, "Plugin disconnect failed");
            }
        }
        .in_current_span(),
    );
}
