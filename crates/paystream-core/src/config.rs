//! Connection and server configuration.
//!
//! Every recognized option is an explicit field. Constructors validate
//! eagerly and refuse inconsistent combinations with a [`ConfigError`].

use crate::error::ConfigError;
use crate::{INITIAL_CONNECTION_WINDOW, INITIAL_MAX_STREAM_ID, INITIAL_STREAM_WINDOW};
use paystream_crypto::{ServerSecret, SharedSecret};
use paystream_transport::Plugin;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Largest reorder window the replay bitmap supports
pub const MAX_REORDER_WINDOW: u64 = 64;

/// Retry configuration for temporary failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add random jitter so retries from many packets spread out
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for attempt number
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64
            * self.multiplier.powi(attempt.min(64) as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let duration = if self.jitter {
            // Up to 25% extra
            let jitter_factor = rand::thread_rng().gen_range(0.0..0.25);
            capped * (1.0 + jitter_factor)
        } else {
            capped
        };

        Duration::from_millis(duration as u64)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the multiplier is below 1 or the backoff
    /// bounds are inverted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be >= 1.0"));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "retry.initial_backoff",
                "must not exceed max_backoff",
            ));
        }
        Ok(())
    }
}

/// Congestion control configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionConfig {
    /// Hard cap on the amount of any single packet
    pub max_packet_amount: u64,

    /// Additive increase step is the current estimate divided by this
    pub increase_divisor: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            max_packet_amount: u64::MAX,
            increase_divisor: 16,
        }
    }
}

/// Per-connection configuration, shared by both roles
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Per-stream receive window in bytes
    pub max_buffered_data: u64,

    /// Connection-level receive window in bytes
    pub connection_buffer_size: u64,

    /// Concurrently open streams the peer may have
    pub max_remote_streams: u64,

    /// Refuse to send money on any stream
    pub receive_only: bool,

    /// No packet activity for this long destroys the connection
    pub idle_timeout: Duration,

    /// Expiry put on every outbound request
    pub packet_timeout: Duration,

    /// Unresolved outbound packets allowed at once
    pub max_packets_in_flight: u64,

    /// How far below the highest accepted sequence a fresh sequence may be
    pub reorder_window: u64,

    /// Retry policy for temporary rejects and timeouts
    pub retry: RetryConfig,

    /// Congestion control parameters
    pub congestion: CongestionConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_buffered_data: 64 * 1024,
            connection_buffer_size: 1024 * 1024,
            max_remote_streams: 20,
            receive_only: false,
            idle_timeout: Duration::from_secs(60),
            packet_timeout: Duration::from_secs(30),
            max_packets_in_flight: 8,
            reorder_window: 32,
            retry: RetryConfig::default(),
            congestion: CongestionConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffered_data < INITIAL_STREAM_WINDOW {
            return Err(ConfigError::invalid(
                "max_buffered_data",
                format!("must be at least {INITIAL_STREAM_WINDOW}"),
            ));
        }
        if self.connection_buffer_size < self.max_buffered_data
            || self.connection_buffer_size < INITIAL_CONNECTION_WINDOW
        {
            return Err(ConfigError::invalid(
                "connection_buffer_size",
                "must be at least max_buffered_data and the initial connection window",
            ));
        }
        if self.max_remote_streams.saturating_mul(2) < INITIAL_MAX_STREAM_ID {
            return Err(ConfigError::invalid(
                "max_remote_streams",
                format!("must be at least {}", INITIAL_MAX_STREAM_ID / 2),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::invalid("idle_timeout", "must be positive"));
        }
        if self.packet_timeout.is_zero() {
            return Err(ConfigError::invalid("packet_timeout", "must be positive"));
        }
        if self.max_packets_in_flight == 0 {
            return Err(ConfigError::invalid("max_packets_in_flight", "must be positive"));
        }
        if self.reorder_window > MAX_REORDER_WINDOW {
            return Err(ConfigError::invalid(
                "reorder_window",
                format!("must be at most {MAX_REORDER_WINDOW}"),
            ));
        }
        if self.congestion.max_packet_amount == 0 {
            return Err(ConfigError::invalid(
                "congestion.max_packet_amount",
                "must be positive",
            ));
        }
        if self.congestion.increase_divisor == 0 {
            return Err(ConfigError::invalid(
                "congestion.increase_divisor",
                "must be positive",
            ));
        }
        self.retry.validate()
    }
}

/// Rules for application-chosen connection tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPolicy {
    /// Longest accepted tag
    pub max_length: usize,
}

impl Default for TagPolicy {
    fn default() -> Self {
        Self { max_length: 64 }
    }
}

impl TagPolicy {
    /// Check a tag against the policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTag`] for empty, overlong, or
    /// out-of-charset tags.
    pub fn check(&self, tag: &str) -> Result<(), ConfigError> {
        let valid = !tag.is_empty()
            && tag.len() <= self.max_length
            && tag
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid {
            Ok(())
        } else {
            Err(ConfigError::InvalidTag(tag.to_string()))
        }
    }
}

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Plugin shared by every server-side connection
    pub plugin: Arc<dyn Plugin>,

    /// Secret every connection secret is derived from
    pub server_secret: ServerSecret,

    /// Tag rules for `generate_address_and_secret`
    pub tag_policy: TagPolicy,

    /// Settings applied to every accepted connection
    pub connection: ConnectionConfig,

    /// Parent span for all server logging
    pub log_span: tracing::Span,
}

impl ServerConfig {
    /// Create a configuration with default connection settings.
    #[must_use]
    pub fn new(plugin: Arc<dyn Plugin>, server_secret: ServerSecret) -> Self {
        Self {
            plugin,
            server_secret,
            tag_policy: TagPolicy::default(),
            connection: ConnectionConfig::default(),
            log_span: tracing::info_span!("paystream_server"),
        }
    }

    /// Replace the connection settings.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Replace the tag policy.
    #[must_use]
    pub fn with_tag_policy(mut self, tag_policy: TagPolicy) -> Self {
        self.tag_policy = tag_policy;
        self
    }

    /// Replace the parent logging span.
    #[must_use]
    pub fn with_log_span(mut self, span: tracing::Span) -> Self {
        self.log_span = span;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an all-zero server secret, a zero tag
    /// length, or invalid connection settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_secret.is_zero() {
            return Err(ConfigError::invalid("server_secret", "must not be all zeroes"));
        }
        if self.tag_policy.max_length == 0 {
            return Err(ConfigError::invalid("tag_policy.max_length", "must be positive"));
        }
        self.connection.validate()
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_secret", &self.server_secret)
            .field("tag_policy", &self.tag_policy)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Plugin the client connection owns
    pub plugin: Arc<dyn Plugin>,

    /// Server address including the token and optional tag
    pub destination_account: String,

    /// Secret returned alongside the address
    pub shared_secret: SharedSecret,

    /// Connection settings
    pub connection: ConnectionConfig,

    /// Parent span for all connection logging
    pub log_span: tracing::Span,
}

impl ClientConfig {
    /// Create a configuration with default connection settings.
    #[must_use]
    pub fn new(
        plugin: Arc<dyn Plugin>,
        destination_account: impl Into<String>,
        shared_secret: SharedSecret,
    ) -> Self {
        Self {
            plugin,
            destination_account: destination_account.into(),
            shared_secret,
            connection: ConnectionConfig::default(),
            log_span: tracing::info_span!("paystream_client"),
        }
    }

    /// Replace the connection settings.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Replace the parent logging span.
    #[must_use]
    pub fn with_log_span(mut self, span: tracing::Span) -> Self {
        self.log_span = span;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty destination or invalid connection
    /// settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destination_account.is_empty() {
            return Err(ConfigError::invalid("destination_account", "must not be empty"));
        }
        self.connection.validate()
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("destination_account", &self.destination_account)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
