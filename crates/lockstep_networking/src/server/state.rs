//! # Arbiter State
//!
//! The barrier at the heart of the lockstep exchange.
//!
//! ## Cycle
//!
//! ```text
//! Collecting ──all live clients acked frame──▶ Advanced  (frame + 1, broadcast)
//!     │
//!     └──some missing──▶ timeouts + 1 ──> max──▶ Resent (same tick, missing only)
//! ```
//!
//! Nothing here does I/O. Every mutation returns the ticks to send, and the
//! caller transmits them after releasing its lock.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use lockstep_core::{ClientAck, Command, MonotonicClock, ServerTick};

use super::connection::ClientRecord;

/// A tick addressed to one client.
#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    /// Destination.
    pub peer: SocketAddr,
    /// Tick carrying the destination's ping.
    pub tick: ServerTick,
}

/// Result of one timer cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// No client is connected.
    Idle,
    /// Some clients have not acked the current frame yet.
    Waiting {
        /// Clients still missing.
        missing: usize,
        /// Consecutive incomplete cycles so far.
        timeouts: u32,
    },
    /// Every client acked; a new frame was produced for everyone.
    Advanced {
        /// The new frame.
        frame: u64,
        /// One tick per client.
        sends: Vec<Outgoing>,
    },
    /// Too many incomplete cycles; the current tick goes out again.
    Resent {
        /// The unchanged frame.
        frame: u64,
        /// One tick per missing client.
        sends: Vec<Outgoing>,
    },
}

impl CycleOutcome {
    /// Ticks to transmit, if any.
    #[must_use]
    pub fn into_sends(self) -> Vec<Outgoing> {
        match self {
            Self::Advanced { sends, .. } | Self::Resent { sends, .. } => sends,
            Self::Idle | Self::Waiting { .. } => Vec::new(),
        }
    }
}

/// Registry, staged commands and the tick in flight.
pub struct ArbiterState {
    clock: MonotonicClock,
    tick_period_ns: u64,
    max_clients: usize,
    max_tick_timeouts: u32,
    clients: BTreeMap<SocketAddr, ClientRecord>,
    staged: Vec<Command>,
    current: ServerTick,
    timeouts: u32,
    resend_count: u64,
    sessions: u64,
}

impl ArbiterState {
    /// Creates an empty arbiter at frame 0.
    #[must_use]
    pub fn new(tick_period_ns: u64, max_clients: usize, max_tick_timeouts: u32) -> Self {
        let clock = MonotonicClock::new();
        Self {
            clock,
            tick_period_ns,
            max_clients,
            max_tick_timeouts,
            clients: BTreeMap::new(),
            staged: Vec::new(),
            current: ServerTick::new(0, tick_period_ns, clock.now_ns()),
            timeouts: 0,
            resend_count: 0,
            sessions: 0,
        }
    }

    /// Registers a client.
    ///
    /// The first client of an empty registry starts a fresh session at
    /// frame 0. Returns the current tick for the newcomer, or `None` when
    /// the arbiter is full.
    pub fn on_connect(&mut self, peer: SocketAddr, now: Instant) -> Option<Outgoing> {
        if !self.clients.contains_key(&peer) && self.clients.len() >= self.max_clients {
            tracing::warn!("Refusing {}: {} clients connected", peer, self.max_clients);
            return None;
        }

        if self.clients.is_empty() {
            self.staged.clear();
            self.current = ServerTick::new(0, self.tick_period_ns, self.clock.ns_at(now));
            self.timeouts = 0;
            self.sessions += 1;
            tracing::info!("Session {} started", self.sessions);
        }

        let mut record = ClientRecord::new(peer, now);
        record.record_tick_sent(now);
        self.clients.insert(peer, record);
        tracing::info!(
            "Client connected: {} ({} connected, frame {})",
            peer,
            self.clients.len(),
            self.current.frame
        );

        Some(Outgoing {
            peer,
            tick: self.current.with_ping(0),
        })
    }

    /// Removes a client from the quorum. Returns false if it was unknown.
    pub fn on_disconnect(&mut self, peer: SocketAddr) -> bool {
        if self.clients.remove(&peer).is_none() {
            return false;
        }
        tracing::info!(
            "Client disconnected: {} ({} connected, frame {})",
            peer,
            self.clients.len(),
            self.current.frame
        );
        true
    }

    /// Applies an ack and stages its commands for the next frame.
    ///
    /// Acks from unregistered peers are dropped. Returns whether the ack
    /// was accepted.
    pub fn on_ack(&mut self, peer: SocketAddr, ack: ClientAck, now: Instant) -> bool {
        let Some(record) = self.clients.get_mut(&peer) else {
            tracing::warn!("Dropping ack for frame {} from unknown peer {}", ack.frame, peer);
            return false;
        };
        record.record_ack(ack.frame, ack.jitter_ns, self.current.frame, now);
        tracing::trace!(
            "Ack from {} for frame {} with {} commands",
            peer,
            ack.frame,
            ack.commands.len()
        );
        self.staged.extend(ack.commands);
        true
    }

    /// Runs one barrier cycle.
    pub fn cycle(&mut self, now: Instant) -> CycleOutcome {
        if self.clients.is_empty() {
            return CycleOutcome::Idle;
        }

        let frame = self.current.frame;
        let missing: Vec<SocketAddr> = self
            .clients
            .values()
            .filter(|record| !record.has_acked(frame))
            .map(|record| record.addr)
            .collect();

        if missing.is_empty() {
            return self.advance(now);
        }

        self.timeouts += 1;
        if self.timeouts <= self.max_tick_timeouts {
            return CycleOutcome::Waiting {
                missing: missing.len(),
                timeouts: self.timeouts,
            };
        }

        self.timeouts = 0;
        self.resend_count += 1;
        tracing::warn!(
            "Frame {} timed out, resending to {} of {} clients",
            frame,
            missing.len(),
            self.clients.len()
        );
        let sends = missing
            .into_iter()
            .filter_map(|peer| {
                let record = self.clients.get_mut(&peer)?;
                record.record_tick_sent(now);
                Some(Outgoing {
                    peer,
                    tick: self.current.with_ping(record.ping_ns()),
                })
            })
            .collect();
        CycleOutcome::Resent { frame, sends }
    }

    fn advance(&mut self, now: Instant) -> CycleOutcome {
        let frame = self.current.frame + 1;
        let mut tick = ServerTick::new(frame, self.tick_period_ns, self.clock.ns_at(now));
        tick.commands = std::mem::take(&mut self.staged);
        self.current = tick;
        self.timeouts = 0;

        tracing::debug!(
            "Frame {} produced with {} commands for {} clients",
            frame,
            self.current.commands.len(),
            self.clients.len()
        );

        let current = &self.current;
        let sends = self
            .clients
            .values_mut()
            .map(|record| {
                record.record_tick_sent(now);
                Outgoing {
                    peer: record.addr,
                    tick: current.with_ping(record.ping_ns()),
                }
            })
            .collect();
        CycleOutcome::Advanced { frame, sends }
    }

    /// Current frame.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.current.frame
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Snapshot of every client record, ordered by address.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientRecord> {
        self.clients.values().cloned().collect()
    }

    /// Commands waiting for the next frame.
    #[must_use]
    pub fn staged_commands(&self) -> usize {
        self.staged.len()
    }

    /// Consecutive incomplete cycles.
    #[must_use]
    pub const fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Resends performed since startup.
    #[must_use]
    pub const fn resend_count(&self) -> u64 {
        self.resend_count
    }

    /// Sessions started since startup.
    #[must_use]
    pub const fn sessions(&self) -> u64 {
        self.sessions
    }
}
