//! # Lockstep Arbiter
//!
//! The authoritative side: collects every client's ack for the current
//! frame, then broadcasts the next frame with everyone's commands merged.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     LOCKSTEP ARBITER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐                      ┌──────────────┐     │
//! │  │ Network Loop │  connect/ack/leave   │  Tick Loop   │     │
//! │  │ (poll)       │─────────┐  ┌─────────│ (fixed rate) │     │
//! │  └──────────────┘         ▼  ▼         └──────────────┘     │
//! │                  ┌───────────────────┐                      │
//! │                  │ Mutex<ArbiterState│                      │
//! │                  │  registry, staged │                      │
//! │                  │  commands, tick>  │                      │
//! │                  └───────────────────┘                      │
//! │         sends are encoded and written after unlocking       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A stalled client blocks every frame until the transport drops it.

mod connection;
mod state;

pub use connection::ClientRecord;
pub use state::{ArbiterState, CycleOutcome, Outgoing};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use lockstep_core::{CommandParser, Packet};
use parking_lot::Mutex;

use crate::config::LockstepConfig;
use crate::error::{NetError, NetResult, TransportError};
use crate::tick::TickLoop;
use crate::transport::{ServerTransport, TransportEvent};

struct Shared {
    config: LockstepConfig,
    parser: Arc<dyn CommandParser>,
    state: Mutex<ArbiterState>,
    running: AtomicBool,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn network_loop<T: ServerTransport>(&self, transport: &T) {
        while self.is_running() {
            match transport.poll(self.config.recv_timeout()) {
                Ok(Some(event)) => self.on_event(transport, event),
                Ok(None) => {}
                Err(TransportError::Closed) => {
                    tracing::warn!("Transport closed, arbiter network loop exiting");
                    break;
                }
                Err(e) => tracing::warn!("Transport poll failed: {}", e),
            }
        }
        transport.shutdown();
        tracing::debug!("Arbiter network loop stopped");
    }

    fn on_event<T: ServerTransport>(&self, transport: &T, event: TransportEvent) {
        match event {
            TransportEvent::Connected(peer) => {
                let welcome = self.state.lock().on_connect(peer, Instant::now());
                match welcome {
                    Some(out) => self.send(transport, out),
                    None => transport.disconnect(peer),
                }
            }
            TransportEvent::Disconnected(peer) => {
                self.state.lock().on_disconnect(peer);
            }
            TransportEvent::Received(peer, bytes) => self.on_packet(peer, &bytes),
        }
    }

    fn on_packet(&self, peer: SocketAddr, bytes: &[u8]) {
        match Packet::decode(bytes, self.parser.as_ref()) {
            Ok(Packet::Ack(ack)) => {
                self.state.lock().on_ack(peer, ack, Instant::now());
            }
            Ok(Packet::Tick(tick)) => {
                tracing::warn!("Ignoring tick for frame {} sent by client {}", tick.frame, peer);
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable packet from {} ({} bytes): {}", peer, bytes.len(), e);
            }
        }
    }

    fn ticker_loop<T: ServerTransport>(&self, transport: &T) {
        let mut tick_loop = TickLoop::new(self.config.tick_period());
        tick_loop.run(&self.running, |_| {
            let outcome = self.state.lock().cycle(Instant::now());
            for out in outcome.into_sends() {
                self.send(transport, out);
            }
        });
        let stats = tick_loop.stats();
        tracing::debug!(
            "Arbiter tick loop stopped after {} cycles (avg {} us, {} late)",
            tick_loop.tick_count(),
            stats.avg_tick_us,
            stats.late_ticks
        );
    }

    fn send<T: ServerTransport>(&self, transport: &T, out: Outgoing) {
        let frame = out.tick.frame;
        let bytes = match Packet::Tick(out.tick).encode_to_vec(self.config.max_packet_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Tick for frame {} cannot be encoded: {}", frame, e);
                return;
            }
        };
        if let Err(e) = transport.send(out.peer, &bytes) {
            tracing::warn!("Sending frame {} to {} failed: {}", frame, out.peer, e);
            transport.disconnect(out.peer);
        }
    }
}

/// Lockstep arbiter.
///
/// Runs a network loop and a tick loop between [`start`](Self::start)
/// and [`stop`](Self::stop). Dropping the arbiter stops it.
pub struct LockstepServer {
    shared: Arc<Shared>,
    network: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl LockstepServer {
    /// Creates a stopped arbiter.
    ///
    /// `parser` decodes the payloads of commands carried in acks.
    pub fn new(config: LockstepConfig, parser: Arc<dyn CommandParser>) -> NetResult<Self> {
        config.validate()?;
        let state = ArbiterState::new(config.tick_period_ns, config.max_clients, config.max_tick_timeouts);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                parser,
                state: Mutex::new(state),
                running: AtomicBool::new(false),
            }),
            network: None,
            ticker: None,
        })
    }

    /// Starts serving on `transport`.
    pub fn start<T: ServerTransport>(&mut self, transport: T) -> NetResult<()> {
        if self.network.is_some() {
            return Err(NetError::AlreadyRunning);
        }
        self.shared.running.store(true, Ordering::Release);
        let transport = Arc::new(transport);

        let shared = Arc::clone(&self.shared);
        let net_transport = Arc::clone(&transport);
        let network = thread::Builder::new()
            .name("lockstep-arbiter-net".into())
            .spawn(move || shared.network_loop(net_transport.as_ref()))
            .map_err(|source| {
                self.shared.running.store(false, Ordering::Release);
                transport.shutdown();
                NetError::Spawn { name: "network", source }
            })?;
        self.network = Some(network);

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("lockstep-arbiter-tick".into())
            .spawn(move || shared.ticker_loop(transport.as_ref()))
        {
            Ok(handle) => self.ticker = Some(handle),
            Err(source) => {
                self.stop();
                return Err(NetError::Spawn { name: "tick", source });
            }
        }

        tracing::info!(
            "Lockstep arbiter started (tick period {:?}, max {} clients)",
            self.shared.config.tick_period(),
            self.shared.config.max_clients
        );
        Ok(())
    }

    /// Stops both loops.
    ///
    /// The tick loop is joined first, then the network loop, which shuts
    /// the transport down as its last action.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let was_running = self.network.is_some();
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.network.take() {
            let _ = handle.join();
        }
        if was_running {
            tracing::info!("Lockstep arbiter stopped at frame {}", self.frame());
        }
    }

    /// Returns true between `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.network.is_some()
    }

    /// Current frame.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.shared.state.lock().frame()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.state.lock().client_count()
    }

    /// Timeout resends performed.
    #[must_use]
    pub fn resend_count(&self) -> u64 {
        self.shared.state.lock().resend_count()
    }

    /// Commands waiting for the next frame.
    #[must_use]
    pub fn staged_commands(&self) -> usize {
        self.shared.state.lock().staged_commands()
    }

    /// Consecutive cycles the current frame has been waiting on acks.
    #[must_use]
    pub fn timeouts(&self) -> u32 {
        self.shared.state.lock().timeouts()
    }

    /// Sessions started since startup.
    #[must_use]
    pub fn sessions(&self) -> u64 {
        self.shared.state.lock().sessions()
    }

    /// Snapshot of the client registry.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientRecord> {
        self.shared.state.lock().clients()
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &LockstepConfig {
        &self.shared.config
    }
}

impl Drop for LockstepServer {
    fn drop(&mut self) {
        self.stop();
    }
}
