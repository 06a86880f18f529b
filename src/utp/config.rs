// utp/config.rs

#![forbid(unsafe_code)]

use std::time::Duration;

use crate::utp::common::{
    DEFAULT_BUFFER_SIZE, DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_MTU, DEFAULT_RESEND_INTERVAL_MS,
    DEFAULT_TIMEOUT_MS, ID_QUARANTINE_MS, RETRANSMIT_THRESHOLD_MICROS, TIMEOUT_CHECK_INTERVAL_MS,
};

/// Tunables shared by every connection of one socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtpConfig {
    /// Capacity of the outgoing and incoming rings, in packets
    pub buffer_size: usize,
    /// Largest payload carried by one DATA packet
    pub mtu: usize,
    /// Idle timeout and close deadline. Zero disables both.
    pub timeout: Duration,
    pub resend_interval: Duration,
    pub keepalive_interval: Duration,
    pub timeout_check_interval: Duration,
    /// Age after which an unacked packet is sent again
    pub retransmit_threshold: Duration,
    /// How long a freed connection id stays unusable
    pub id_quarantine: Duration,
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            mtu: DEFAULT_MTU,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            resend_interval: Duration::from_millis(DEFAULT_RESEND_INTERVAL_MS),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            timeout_check_interval: Duration::from_millis(TIMEOUT_CHECK_INTERVAL_MS),
            retransmit_threshold: Duration::from_micros(RETRANSMIT_THRESHOLD_MICROS),
            id_quarantine: Duration::from_millis(ID_QUARANTINE_MS),
        }
    }
}

impl UtpConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_id_quarantine(mut self, window: Duration) -> Self {
        self.id_quarantine = window;
        self
    }
}

/// Duration as microseconds on the connection clock, saturating at `u64::MAX`
pub(crate) fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
