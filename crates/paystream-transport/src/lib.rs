//! # paystream Transport
//!
//! The boundary between paystream and the conditional-payment network.
//!
//! This crate provides:
//! - The async [`Plugin`] trait and inbound [`DataHandler`] callback
//! - Prepare / Fulfill / Reject records and their byte codec
//! - Address and asset discovery ([`ildcp`])
//! - An in-memory [`MockPlugin`] pair for tests and local wiring

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ildcp;
pub mod mock;
pub mod packet;
pub mod plugin;

pub use ildcp::AddressInfo;
pub use mock::MockPlugin;
pub use packet::{AmountTooLarge, ErrorClass, ErrorCode, Fulfill, Packet, PacketError, Prepare, Reject};
pub use plugin::{DataHandler, Plugin, PluginStats, TransportError, TransportResult};
