//! In-memory plugin pair.
//!
//! [`MockPlugin::pair`] returns two plugins wired back to back, standing in
//! for a single connector between a client and a server:
//!
//! - discovery requests are answered locally from the plugin's
//!   [`AddressInfo`],
//! - every other request is delivered to the peer's data handler,
//! - an optional maximum packet amount produces `F08` rejects,
//! - injected temporary failures produce `T04` rejects,
//! - fulfillments are checked against the request's condition.

use crate::ildcp::{self, AddressInfo};
use crate::packet::{AmountTooLarge, ErrorCode, Packet, Prepare, Reject};
use crate::plugin::{DataHandler, Plugin, PluginStats, TransportError, TransportResult};
use async_trait::async_trait;
use paystream_crypto::fulfillment_to_condition;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Address used as `triggered_by` for rejects the connector itself produces.
pub const MOCK_CONNECTOR_ADDRESS: &str = "test.connector";

/// One side of an in-memory plugin pair.
pub struct MockPlugin {
    info: AddressInfo,
    connected: AtomicBool,
    handler: RwLock<Option<Arc<dyn DataHandler>>>,
    peer: OnceLock<Weak<MockPlugin>>,
    max_packet_amount: AtomicU64,
    temporary_failures: AtomicU32,
    latency_ms: AtomicU64,
    requests_sent: AtomicU64,
    requests_handled: AtomicU64,
    amount_sent: AtomicU64,
    amount_received: AtomicU64,
    rejects_received: AtomicU64,
}

impl MockPlugin {
    fn new(info: AddressInfo) -> Self {
        Self {
            info,
            connected: AtomicBool::new(false),
            handler: RwLock::new(None),
            peer: OnceLock::new(),
            max_packet_amount: AtomicU64::new(u64::MAX),
            temporary_failures: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_handled: AtomicU64::new(0),
            amount_sent: AtomicU64::new(0),
            amount_received: AtomicU64::new(0),
            rejects_received: AtomicU64::new(0),
        }
    }

    /// Create two plugins connected to each other.
    #[must_use]
    pub fn pair(a: AddressInfo, b: AddressInfo) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new(a));
        let b = Arc::new(Self::new(b));
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        (a, b)
    }

    /// This plugin's address info.
    #[must_use]
    pub fn address_info(&self) -> &AddressInfo {
        &self.info
    }

    /// Reject outgoing requests above `max` with `F08`.
    pub fn set_max_packet_amount(&self, max: u64) {
        self.max_packet_amount.store(max, Ordering::SeqCst);
    }

    /// Reject the next `count` outgoing requests with `T04`.
    pub fn fail_next(&self, count: u32) {
        self.temporary_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every outgoing request by `latency` before delivery.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// True if a data handler is registered.
    pub async fn has_handler(&self) -> bool {
        self.handler.read().await.is_some()
    }

    fn connector_reject(code: ErrorCode, data: Vec<u8>) -> Vec<u8> {
        Packet::Reject(Reject {
            code,
            triggered_by: MOCK_CONNECTOR_ADDRESS.to_string(),
            message: String::new(),
            data,
        })
        .to_bytes()
    }

    async fn forward(&self, prepare: &Prepare, data: Vec<u8>) -> Vec<u8> {
        let max = self.max_packet_amount.load(Ordering::SeqCst);
        if prepare.amount > max {
            let details = AmountTooLarge {
                received_amount: prepare.amount,
                maximum_amount: max,
            };
            return Self::connector_reject(ErrorCode::F08_AMOUNT_TOO_LARGE, details.encode());
        }

        let failed = self
            .temporary_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Self::connector_reject(ErrorCode::T04_INSUFFICIENT_LIQUIDITY, Vec::new());
        }

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let Some(peer) = self.peer.get().and_then(Weak::upgrade) else {
            return Self::connector_reject(ErrorCode::F02_UNREACHABLE, Vec::new());
        };
        let handler = peer.handler.read().await.clone();
        let Some(handler) = handler else {
            return Self::connector_reject(ErrorCode::F02_UNREACHABLE, Vec::new());
        };

        let remaining = prepare
            .expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Self::connector_reject(ErrorCode::R00_TRANSFER_TIMED_OUT, Vec::new());
        }

        peer.requests_handled.fetch_add(1, Ordering::Relaxed);
        let Ok(response) = tokio::time::timeout(remaining, handler.handle_data(data)).await else {
            return Self::connector_reject(ErrorCode::R00_TRANSFER_TIMED_OUT, Vec::new());
        };

        match Packet::from_bytes(&response) {
            Ok(Packet::Fulfill(fulfill)) => {
                if fulfillment_to_condition(&fulfill.fulfillment) != prepare.execution_condition {
                    tracing::warn!(
                        destination = %prepare.destination,
                        condition = %hex::encode(prepare.execution_condition),
                        "Receiver returned a fulfillment that does not match the condition"
                    );
                    return Self::connector_reject(ErrorCode::F05_WRONG_CONDITION, Vec::new());
                }
                peer.amount_received
                    .fetch_add(prepare.amount, Ordering::Relaxed);
                response
            }
            Ok(Packet::Reject(_)) => response,
            Ok(Packet::Prepare(_)) | Err(_) => {
                Self::connector_reject(ErrorCode::T00_INTERNAL_ERROR, Vec::new())
            }
        }
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    async fn connect(&self) -> TransportResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_data(&self, data: Vec<u8>) -> TransportResult<Vec<u8>> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let prepare = Prepare::from_bytes(&data)
            .map_err(|e| TransportError::Other(format!("malformed request: {e}")))?;

        if ildcp::is_request(&prepare) {
            return Ok(Packet::Fulfill(ildcp::response(&self.info)).to_bytes());
        }

        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        let response = self.forward(&prepare, data).await;
        if response.first() == Some(&crate::packet::TYPE_FULFILL) {
            self.amount_sent
                .fetch_add(prepare.amount, Ordering::Relaxed);
        } else {
            self.rejects_received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(response)
    }

    async fn register_data_handler(&self, handler: Arc<dyn DataHandler>) -> TransportResult<()> {
        let mut slot = self.handler.write().await;
        if slot.is_some() {
            return Err(TransportError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    async fn deregister_data_handler(&self) {
        self.handler.write().await.take();
    }

    fn stats(&self) -> PluginStats {
        PluginStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            amount_sent: self.amount_sent.load(Ordering::Relaxed),
            amount_received: self.amount_received.load(Ordering::Relaxed),
            rejects_received: self.rejects_received.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MockPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPlugin")
            .field("address", &self.info.address)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Fulfill;

    struct FixedFulfill;

    #[async_trait]
    impl DataHandler for FixedFulfill {
        async fn handle_data(&self, _data: Vec<u8>) -> Vec<u8> {
            Packet::Fulfill(Fulfill {
                fulfillment: [1u8; 32],
                data: b"ok".to_vec(),
            })
            .to_bytes()
        }
    }

    fn pair() -> (Arc<MockPlugin>, Arc<MockPlugin>) {
        MockPlugin::pair(
            AddressInfo::new("test.alice", "XRP", 9),
            AddressInfo::new("test.bob", "XRP", 9),
        )
    }

    fn prepare(amount: u64, condition: [u8; 32]) -> Vec<u8> {
        Prepare {
            amount,
            expires_at: SystemTime::now() + Duration::from_secs(5),
            execution_condition: condition,
            destination: "test.bob.x".to_string(),
            data: vec![],
        }
        .to_bytes()
    }

    fn reject_code(bytes: &[u8]) -> ErrorCode {
        match Packet::from_bytes(bytes).unwrap() {
            Packet::Reject(r) => r.code,
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (a, _b) = pair();
        assert!(matches!(
            a.send_data(prepare(1, [0; 32])).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_ildcp_answered_locally() {
        let (a, _b) = pair();
        a.connect().await.unwrap();

        let info = ildcp::fetch(a.as_ref()).await.unwrap();
        assert_eq!(info, AddressInfo::new("test.alice", "XRP", 9));
    }

    #[tokio::test]
    async fn test_no_handler_is_unreachable() {
        let (a, _b) = pair();
        a.connect().await.unwrap();

        let response = a.send_data(prepare(1, [0; 32])).await.unwrap();
        assert_eq!(reject_code(&response), ErrorCode::F02_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_fulfill_delivered() {
        let (a, b) = pair();
        a.connect().await.unwrap();
        b.register_data_handler(Arc::new(FixedFulfill)).await.unwrap();

        let condition = fulfillment_to_condition(&[1u8; 32]);
        let response = a.send_data(prepare(10, condition)).await.unwrap();
        assert!(matches!(Packet::from_bytes(&response), Ok(Packet::Fulfill(_))));
        assert_eq!(a.stats().amount_sent, 10);
        assert_eq!(b.stats().amount_received, 10);
    }

    #[tokio::test]
    async fn test_wrong_fulfillment_rejected() {
        let (a, b) = pair();
        a.connect().await.unwrap();
        b.register_data_handler(Arc::new(FixedFulfill)).await.unwrap();

        let response = a.send_data(prepare(10, [9u8; 32])).await.unwrap();
        assert_eq!(reject_code(&response), ErrorCode::F05_WRONG_CONDITION);
        assert_eq!(b.stats().amount_received, 0);
    }

    #[tokio::test]
    async fn test_max_packet_amount() {
        let (a, b) = pair();
        a.connect().await.unwrap();
        b.register_data_handler(Arc::new(FixedFulfill)).await.unwrap();
        a.set_max_packet_amount(50);

        let response = a.send_data(prepare(51, [0; 32])).await.unwrap();
        let Packet::Reject(reject) = Packet::from_bytes(&response).unwrap() else {
            panic!("expected reject");
        };
        assert_eq!(
            reject.amount_too_large(),
            Some(AmountTooLarge {
                received_amount: 51,
                maximum_amount: 50
            })
        );
    }

    #[tokio::test]
    async fn test_injected_temporary_failures() {
        let (a, b) = pair();
        a.connect().await.unwrap();
        b.register_data_handler(Arc::new(FixedFulfill)).await.unwrap();
        a.fail_next(2);

        let condition = fulfillment_to_condition(&[1u8; 32]);
        for _ in 0..2 {
            let response = a.send_data(prepare(1, condition)).await.unwrap();
            assert_eq!(reject_code(&response), ErrorCode::T04_INSUFFICIENT_LIQUIDITY);
        }
        let response = a.send_data(prepare(1, condition)).await.unwrap();
        assert!(matches!(Packet::from_bytes(&response), Ok(Packet::Fulfill(_))));
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let (a, _b) = pair();
        a.register_data_handler(Arc::new(FixedFulfill)).await.unwrap();
        assert!(matches!(
            a.register_data_handler(Arc::new(FixedFulfill)).await,
            Err(TransportError::HandlerAlreadyRegistered)
        ));
        a.deregister_data_handler().await;
        assert!(!a.has_handler().await);
    }
}
