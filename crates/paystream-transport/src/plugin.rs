//! Plugin trait: the boundary to the conditional-payment network.
//!
//! A plugin carries opaque serialized packets. Outbound, `send_data` hands
//! one serialized request to the network and resolves with the serialized
//! response. Inbound, the plugin calls the registered [`DataHandler`] once per
//! request and returns whatever it answers. There is no unsolicited push.

use async_trait::async_trait;
use std::sync::Arc;

/// Transport layer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Plugin is not connected
    #[error("plugin is not connected")]
    NotConnected,

    /// A data handler is already registered
    #[error("a data handler is already registered")]
    HandlerAlreadyRegistered,

    /// Connecting failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The response could not be parsed
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Plugin-specific error
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// True if a later attempt may succeed without any change on our side.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Other(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Handler for inbound requests.
#[async_trait]
pub trait DataHandler: Send + Sync {
    /// Handle one serialized request and return the serialized response.
    async fn handle_data(&self, data: Vec<u8>) -> Vec<u8>;
}

/// Async plugin trait for the conditional-payment network.
///
/// # Examples
///
/// ```no_run
/// use paystream_transport::{MockPlugin, Plugin, AddressInfo};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (client, _server) = MockPlugin::pair(
///     AddressInfo::new("test.client", "XRP", 9),
///     AddressInfo::new("test.server", "XRP", 9),
/// );
/// client.connect().await?;
/// let response = client.send_data(vec![12]).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Connect to the network.
    ///
    /// # Errors
    /// Returns `TransportError` if the connection cannot be established
    async fn connect(&self) -> TransportResult<()>;

    /// Disconnect and release resources.
    ///
    /// # Errors
    /// Returns `TransportError` if disconnecting fails
    async fn disconnect(&self) -> TransportResult<()>;

    /// Check if the plugin is connected.
    fn is_connected(&self) -> bool;

    /// Send one serialized request and wait for the serialized response.
    ///
    /// # Errors
    /// Returns `TransportError` if the request could not be delivered
    async fn send_data(&self, data: Vec<u8>) -> TransportResult<Vec<u8>>;

    /// Register the handler for inbound requests.
    ///
    /// # Errors
    /// Returns `TransportError::HandlerAlreadyRegistered` if one is set
    async fn register_data_handler(&self, handler: Arc<dyn DataHandler>) -> TransportResult<()>;

    /// Remove the inbound handler, if any.
    async fn deregister_data_handler(&self);

    /// Get plugin statistics.
    fn stats(&self) -> PluginStats {
        PluginStats::default()
    }
}

/// Plugin statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginStats {
    /// Requests sent
    pub requests_sent: u64,
    /// Requests handled
    pub requests_handled: u64,
    /// Amount carried by sent requests that were fulfilled
    pub amount_sent: u64,
    /// Amount carried by handled requests that were fulfilled
    pub amount_received: u64,
    /// Sent requests that were rejected
    pub rejects_received: u64,
}

impl PluginStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound request and its outcome
    pub fn record_send(&mut self, amount: u64, fulfilled: bool) {
        self.requests_sent += 1;
        if fulfilled {
            self.amount_sent = self.amount_sent.saturating_add(amount);
        } else {
            self.rejects_received += 1;
        }
    }

    /// Record an inbound request and its outcome
    pub fn record_handled(&mut self, amount: u64, fulfilled: bool) {
        self.requests_handled += 1;
        if fulfilled {
            self.amount_received = self.amount_received.saturating_add(amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_stats() {
        let mut stats = PluginStats::new();
        assert_eq!(stats.requests_sent, 0);

        stats.record_send(100, true);
        stats.record_send(50, false);
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.amount_sent, 100);
        assert_eq!(stats.rejects_received, 1);

        stats.record_handled(30, true);
        stats.record_handled(70, false);
        assert_eq!(stats.requests_handled, 2);
        assert_eq!(stats.amount_received, 30);
    }

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::Other("x".into()).is_transient());
        assert!(!TransportError::NotConnected.is_transient());
        assert!(!TransportError::HandlerAlreadyRegistered.is_transient());
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::NotConnected.to_string(),
            "plugin is not connected"
        );
        assert_eq!(
            TransportError::ConnectionFailed("refused".into()).to_string(),
            "connection failed: refused"
        );
    }
}
