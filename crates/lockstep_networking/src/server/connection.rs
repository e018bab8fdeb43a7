//! # Client Records
//!
//! Per-peer bookkeeping kept by the arbiter, keyed by transport address.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Arbiter-side view of one connected client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRecord {
    /// Transport address, used as the client's key.
    pub addr: SocketAddr,
    /// When the session was registered.
    pub connected_at: Instant,
    /// Frame of the most recent ack, if any arrived.
    pub last_ack_frame: Option<u64>,
    /// When the most recent ack arrived.
    pub last_ack_at: Option<Instant>,
    /// When a tick was last sent to this client.
    pub last_tick_sent_at: Option<Instant>,
    /// Time between the last tick sent and its ack.
    pub ping: Duration,
    /// Jitter reported by the client, in nanoseconds.
    pub jitter_ns: u64,
    /// Acks received over the session.
    pub acks_received: u64,
}

impl ClientRecord {
    /// Creates a record for a client that just connected.
    #[must_use]
    pub const fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            connected_at: now,
            last_ack_frame: None,
            last_ack_at: None,
            last_tick_sent_at: None,
            ping: Duration::ZERO,
            jitter_ns: 0,
            acks_received: 0,
        }
    }

    /// Returns true if the client's latest ack is for `frame`.
    #[inline]
    #[must_use]
    pub fn has_acked(&self, frame: u64) -> bool {
        self.last_ack_frame == Some(frame)
    }

    /// Notes that a tick was just sent.
    pub fn record_tick_sent(&mut self, now: Instant) {
        self.last_tick_sent_at = Some(now);
    }

    /// Applies an ack.
    ///
    /// Ping is only measured when the ack answers the tick currently in
    /// flight; an ack for an older frame says nothing about the last send.
    pub fn record_ack(&mut self, frame: u64, jitter_ns: u64, current_frame: u64, now: Instant) {
        self.last_ack_frame = Some(frame);
        self.last_ack_at = Some(now);
        self.jitter_ns = jitter_ns;
        self.acks_received += 1;

        if frame == current_frame {
            if let Some(sent) = self.last_tick_sent_at {
                self.ping = now.saturating_duration_since(sent);
            }
        }
    }

    /// Ping in nanoseconds, as carried in ticks.
    #[must_use]
    pub fn ping_ns(&self) -> u64 {
        u64::try_from(self.ping.as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_new_record_has_not_acked() {
        let record = ClientRecord::new(addr(), Instant::now());
        assert!(!record.has_acked(0));
        assert_eq!(record.ping_ns(), 0);
    }

    #[test]
    fn test_ping_measured_on_current_frame() {
        let start = Instant::now();
        let mut record = ClientRecord::new(addr(), start);
        record.record_tick_sent(start);
        record.record_ack(5, 1_000, 5, start + Duration::from_millis(30));

        assert!(record.has_acked(5));
        assert_eq!(record.ping, Duration::from_millis(30));
        assert_eq!(record.jitter_ns, 1_000);
        assert_eq!(record.acks_received, 1);
    }

    #[test]
    fn test_stale_ack_keeps_ping() {
        let start = Instant::now();
        let mut record = ClientRecord::new(addr(), start);
        record.record_tick_sent(start);
        record.record_ack(3, 0, 4, start + Duration::from_millis(80));

        assert!(record.has_acked(3));
        assert!(!record.has_acked(4));
        assert_eq!(record.ping, Duration::ZERO);
    }
}
