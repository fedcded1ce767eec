//! Amount-based congestion control.
//!
//! The network reports capacity through `F08 Amount Too Large` rejects, so
//! the controller tracks a per-packet amount estimate rather than a byte
//! window:
//!
//! - The estimate starts at the configured cap.
//! - An `F08` with details sets it to the reported maximum, scaled by the
//!   ratio of sent to received amount. Without details it halves.
//! - A fulfill of a packet at least as large as the estimate raises it by
//!   an additive step, up to the configured cap.
//!
//! The window on unresolved amount is `estimate * max_packets_in_flight`.

use crate::config::CongestionConfig;
use paystream_transport::AmountTooLarge;

/// Congestion control state for one connection
#[derive(Debug, Clone)]
pub struct CongestionController {
    /// Current per-packet amount estimate
    max_packet_amount: u64,
    /// Configured hard cap
    cap: u64,
    /// Additive increase divisor
    increase_divisor: u64,
    /// Packets sent and not yet resolved
    packets_in_flight: u64,
    /// Amount carried by unresolved packets
    amount_in_flight: u64,
    /// Limit on unresolved packets
    max_packets_in_flight: u64,
    /// True once an `F08` has been seen
    learned: bool,
}

impl CongestionController {
    /// Create a controller
    #[must_use]
    pub fn new(config: &CongestionConfig, max_packets_in_flight: u64) -> Self {
        Self {
            max_packet_amount: config.max_packet_amount,
            cap: config.max_packet_amount,
            increase_divisor: config.increase_divisor.max(1),
            packets_in_flight: 0,
            amount_in_flight: 0,
            max_packets_in_flight: max_packets_in_flight.max(1),
            learned: false,
        }
    }

    /// Current per-packet amount estimate
    #[must_use]
    pub fn max_packet_amount(&self) -> u64 {
        self.max_packet_amount
    }

    /// Unresolved packets
    #[must_use]
    pub fn packets_in_flight(&self) -> u64 {
        self.packets_in_flight
    }

    /// Unresolved amount
    #[must_use]
    pub fn amount_in_flight(&self) -> u64 {
        self.amount_in_flight
    }

    /// Limit on unresolved amount
    #[must_use]
    pub fn window(&self) -> u64 {
        self.max_packet_amount
            .saturating_mul(self.max_packets_in_flight)
    }

    /// True if another packet may be sent at all
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.packets_in_flight < self.max_packets_in_flight
    }

    /// Largest amount the next packet may carry
    #[must_use]
    pub fn available_amount(&self) -> u64 {
        if !self.can_send() {
            return 0;
        }
        self.window()
            .saturating_sub(self.amount_in_flight)
            .min(self.max_packet_amount)
    }

    /// Record a packet handed to the transport
    pub fn on_packet_sent(&mut self, amount: u64) {
        self.packets_in_flight += 1;
        self.amount_in_flight = self.amount_in_flight.saturating_add(amount);
    }

    /// Record a resolved packet (fulfilled, rejected or failed)
    pub fn on_packet_resolved(&mut self, amount: u64) {
        self.packets_in_flight = self.packets_in_flight.saturating_sub(1);
        self.amount_in_flight = self.amount_in_flight.saturating_sub(amount);
    }

    /// Additive increase after a fulfilled packet
    pub fn on_fulfilled(&mut self, amount: u64) {
        if !self.learned || amount < self.max_packet_amount {
            return;
        }
        let step = (self.max_packet_amount / self.increase_divisor).max(1);
        let next = self.max_packet_amount.saturating_add(step).min(self.cap);
        if next != self.max_packet_amount {
            tracing::trace!(from = self.max_packet_amount, to = next, "Raising packet amount");
            self.max_packet_amount = next;
        }
    }

    /// Decrease after an `F08` reject of a packet carrying `sent`.
    ///
    /// Returns the new estimate.
    pub fn on_amount_too_large(&mut self, sent: u64, details: Option<AmountTooLarge>) -> u64 {
        let new_max = match details {
            Some(d) if d.received_amount > 0 => {
                let scaled = u128::from(sent) * u128::from(d.maximum_amount)
                    / u128::from(d.received_amount);
                u64::try_from(scaled).unwrap_or(u64::MAX)
            }
            _ => sent / 2,
        };
        let new_max = new_max.min(sent.saturating_sub(1)).min(self.cap);

        tracing::debug!(
            sent,
            previous = self.max_packet_amount,
            new_max,
            "Lowering packet amount after amount-too-large reject"
        );
        self.max_packet_amount = new_max;
        self.learned = true;
        new_max
    }
}
