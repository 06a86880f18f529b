// utp/punch.rs

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use crate::utp::common::{PUNCH_ACK, PUNCH_INTERVAL_MS, PUNCH_SYN};
use crate::utp::connection::Transmit;

/// Probe/ack exchange that opens NAT bindings towards one peer.
///
/// Probes (`PUNCH`) go out every 500 ms. A probe from the target is answered
/// twice with `PUNCHED`; an answer from the target marks the binding as open
/// in the other direction. The punch succeeds once both happened and fails
/// when the attempts run out first.
#[derive(Debug)]
pub struct HolePunch {
    target: SocketAddr,
    attempts: u32,
    counter: u32,
    ack_sent: bool,
    ack_received: bool,
    next_probe: u64,
    interval: u64,
}

impl HolePunch {
    /// The first probe goes out on the first [`poll`](Self::poll)
    pub fn new(target: SocketAddr, attempts: u32, now: u64) -> Self {
        Self {
            target,
            attempts,
            counter: 0,
            ack_sent: false,
            ack_received: false,
            next_probe: now,
            interval: PUNCH_INTERVAL_MS * 1000,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Feed a datagram received from the target. Returns whether it belonged
    /// to the punch exchange.
    pub fn on_datagram(&mut self, data: &[u8], tx: &dyn Transmit) -> bool {
        if data == PUNCH_SYN {
            tracing::debug!("Received PUNCH from {}", self.target);
            self.send(PUNCH_ACK, tx);
            self.ack_sent = true;
            self.send(PUNCH_ACK, tx);
            true
        } else if data == PUNCH_ACK {
            tracing::debug!("Received PUNCHED from {}", self.target);
            self.ack_received = true;
            true
        } else {
            false
        }
    }

    /// `Some(outcome)` once the punch is decided, sending the next probe when due
    pub fn poll(&mut self, now: u64, tx: &dyn Transmit) -> Option<bool> {
        if self.ack_sent && self.ack_received {
            return Some(true);
        }
        if now < self.next_probe {
            return None;
        }

        self.counter += 1;
        if self.counter > self.attempts {
            return Some(false);
        }
        self.send(PUNCH_SYN, tx);
        self.next_probe = now.saturating_add(self.interval);
        None
    }

    fn send(&self, datagram: &[u8], tx: &dyn Transmit) {
        if let Err(e) = tx.transmit(datagram, self.target) {
            tracing::warn!("Punch datagram to {} failed: {}", self.target, e);
        }
    }
}
