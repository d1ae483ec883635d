use std::{default::Default, time::Duration};

use crate::constants::{ACK_VECTOR_BITS, HANDSHAKE_RETRY_LIMIT};

#[derive(Clone, Debug)]
/// Configuration options to tune protocol and runtime behavior.
pub struct Config {
    /// Delay before an unanswered handshake packet is sent again.
    pub handshake_resend_interval: Duration,
    /// Handshake sends per phase before the attempt is abandoned.
    pub handshake_retry_limit: u32,
    /// Age at which an unacknowledged reliable datagram is retransmitted.
    pub resend_interval: Duration,
    /// Max idle time before a connected peer is considered gone.
    pub idle_timeout: Duration,
    /// Number of recent sequences covered by the receive window and the
    /// piggybacked ack vector.
    pub ack_window_size: u16,
    /// Packets an ordered channel may buffer while waiting for a gap to fill.
    pub reorder_buffer_size: u16,
    /// Reliable packets queued behind the ack window before the sender
    /// starts warning.
    pub max_packets_in_flight: u16,
    /// Max pending handshake entries a listener keeps at once.
    pub max_pending_handshakes: usize,
    /// Age at which a pending handshake entry is swept.
    pub pending_handshake_timeout: Duration,
    /// Read timeout on receive loops; bounds shutdown latency.
    pub receive_poll_timeout: Duration,
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to SO_RCVBUF socket option.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to SO_SNDBUF socket option.
    pub socket_send_buffer_size: Option<usize>,
    /// Time-to-live for outgoing packets (None = use system default).
    /// Corresponds to IP_TTL socket option.
    pub socket_ttl: Option<u32>,
}

impl Config {
    /// Period of the connection timer.
    ///
    /// Half the handshake resend interval, so a due resend goes out within
    /// one period of becoming due.
    pub fn timer_period(&self) -> Duration {
        self.handshake_resend_interval / 2
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_resend_interval: Duration::from_millis(500),
            handshake_retry_limit: HANDSHAKE_RETRY_LIMIT,
            resend_interval: Duration::from_millis(300),
            idle_timeout: Duration::from_secs(5),
            ack_window_size: ACK_VECTOR_BITS,
            reorder_buffer_size: 64,
            max_packets_in_flight: 512,
            max_pending_handshakes: 64, // prevents handshake-table exhaustion
            pending_handshake_timeout: Duration::from_secs(10),
            receive_poll_timeout: Duration::from_millis(100),
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            socket_ttl: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_period_is_half_resend_interval() {
        let config = Config {
            handshake_resend_interval: Duration::from_millis(400),
            ..Config::default()
        };
        assert_eq!(config.timer_period(), Duration::from_millis(200));
    }
}
