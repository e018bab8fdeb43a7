//! # Lockstep Client
//!
//! Participant side of the lockstep exchange.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     LOCKSTEP CLIENT                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐     │
//! │  │ Network Loop │──▶│  Tick Queue  │──▶│  Dispatcher  │──▶ events()
//! │  │ poll + ack   │   │  (jitter     │   │ (one tick    │     │
//! │  └──────▲───────┘   │   buffer)    │   │  per period) │     │
//! │         │           └──────────────┘   └──────────────┘     │
//! │   push_command()                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every received tick is acknowledged immediately, piggybacking the
//! commands pushed since the previous ack. The dispatcher holds back
//! `floor(jitter / period)` ticks so that bursty arrival reaches the game
//! at a steady pace.

mod queue;
mod reconnect;

pub use queue::TickQueue;
pub use reconnect::ReconnectTimer;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use lockstep_core::{
    ClientAck, CodecError, Command, CommandParser, JitterCalculator, MonotonicClock, Packet,
    ServerTick,
};
use parking_lot::Mutex;

use crate::config::LockstepConfig;
use crate::error::{NetError, NetResult, TransportError};
use crate::tick::TickLoop;
use crate::transport::{ClientTransport, LinkEvent};

/// Sleep between queue checks while an ack is held back.
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(1);

/// Longest sleep of the network loop while disconnected.
const RETRY_POLL: Duration = Duration::from_millis(10);

/// Connection state of a client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    /// No session open; a reconnect may be scheduled.
    #[default]
    Disconnected = 0,
    /// Connection attempt in progress.
    Connecting = 1,
    /// Session open, exchanging ticks and acks.
    Connected = 2,
}

impl ClientState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Event delivered to the host application.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// A session to the arbiter was opened.
    Connected,
    /// The session was lost. Reconnection continues in the background.
    Disconnected,
    /// The next tick, in frame order, released by the dispatcher.
    ServerTick(Arc<ServerTick>),
    /// Commands taken for an ack failed to encode and were not sent.
    ///
    /// The ack itself still went out, without them.
    CommandsDropped {
        /// Frame of the ack.
        frame: u64,
        /// The commands, returned to the host.
        commands: Vec<Command>,
        /// Why encoding failed.
        error: CodecError,
    },
}

/// Client counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Ticks decoded from the arbiter, resends included.
    pub ticks_received: u64,
    /// Resent ticks that were acked but not queued again.
    pub duplicate_ticks: u64,
    /// Ticks handed to the host.
    pub ticks_dispatched: u64,
    /// Acks transmitted.
    pub acks_sent: u64,
    /// Commands carried by transmitted acks.
    pub commands_sent: u64,
    /// Commands handed back through [`ClientEvent::CommandsDropped`].
    pub commands_dropped: u64,
    /// Packets dropped because they did not decode.
    pub decode_errors: u64,
    /// Connection attempts, the first one included.
    pub connect_attempts: u64,
}

#[derive(Default)]
struct Counters {
    ticks_received: AtomicU64,
    duplicate_ticks: AtomicU64,
    ticks_dispatched: AtomicU64,
    acks_sent: AtomicU64,
    commands_sent: AtomicU64,
    commands_dropped: AtomicU64,
    decode_errors: AtomicU64,
    connect_attempts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ClientStats {
        ClientStats {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            duplicate_ticks: self.duplicate_ticks.load(Ordering::Relaxed),
            ticks_dispatched: self.ticks_dispatched.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the network loop, the dispatcher and the host.
struct Shared {
    config: LockstepConfig,
    parser: Arc<dyn CommandParser>,
    clock: MonotonicClock,
    running: AtomicBool,
    state: AtomicU8,
    ping_ns: AtomicU64,
    last_frame: AtomicU64,
    has_frame: AtomicBool,
    pending: Mutex<Vec<Command>>,
    jitter: Mutex<JitterCalculator>,
    queue: TickQueue,
    events: Sender<ClientEvent>,
    counters: Counters,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn emit(&self, event: ClientEvent) {
        // The receiving half lives in `LockstepClient`, which outlives both loops.
        let _ = self.events.send(event);
    }

    fn required_buffer_depth(&self) -> usize {
        self.jitter.lock().required_buffer_depth()
    }

    fn network_loop<T: ClientTransport>(&self, mut transport: T) {
        let mut timer = ReconnectTimer::new(self.config.reconnect_interval());
        self.connect(&mut transport, &mut timer);

        while self.is_running() {
            if !transport.is_connected() {
                let now = Instant::now();
                if !timer.is_armed() {
                    timer.arm(now);
                }
                if timer.fire(now) {
                    self.connect(&mut transport, &mut timer);
                } else {
                    let wait = timer.remaining(now).unwrap_or(RETRY_POLL);
                    thread::sleep(wait.min(RETRY_POLL));
                }
                continue;
            }

            let outcome = match transport.poll(self.config.recv_timeout()) {
                Ok(Some(LinkEvent::Received(bytes))) => self.on_packet(&mut transport, &bytes),
                Ok(Some(LinkEvent::Disconnected)) => Err(TransportError::Closed),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                self.lose_connection(&mut transport, &mut timer, &e);
            }
        }

        transport.disconnect();
        self.set_state(ClientState::Disconnected);
        tracing::debug!("Client network loop stopped");
    }

    fn connect<T: ClientTransport>(&self, transport: &mut T, timer: &mut ReconnectTimer) {
        self.set_state(ClientState::Connecting);
        Counters::bump(&self.counters.connect_attempts);

        match transport.connect() {
            Ok(()) => {
                timer.cancel();
                self.has_frame.store(false, Ordering::Release);
                self.last_frame.store(0, Ordering::Release);
                self.set_state(ClientState::Connected);
                tracing::info!("Connected to arbiter");
                self.emit(ClientEvent::Connected);

                // Announce ourselves straight away so the arbiter can count us.
                if let Err(e) = self.ack(transport, 0, 0) {
                    self.lose_connection(transport, timer, &e);
                }
            }
            Err(e) => {
                self.set_state(ClientState::Disconnected);
                tracing::debug!("Connect attempt {} failed: {}", timer.attempts() + 1, e);
                timer.arm(Instant::now());
            }
        }
    }

    fn lose_connection<T: ClientTransport>(
        &self,
        transport: &mut T,
        timer: &mut ReconnectTimer,
        reason: &TransportError,
    ) {
        transport.disconnect();
        self.set_state(ClientState::Disconnected);
        tracing::warn!("Lost connection to arbiter: {}", reason);
        self.emit(ClientEvent::Disconnected);
        timer.arm(Instant::now());
    }

    fn on_packet<T: ClientTransport>(&self, transport: &mut T, bytes: &[u8]) -> Result<(), TransportError> {
        let tick = match Packet::decode(bytes, self.parser.as_ref()) {
            Ok(Packet::Tick(tick)) => tick,
            Ok(Packet::Ack(ack)) => {
                tracing::warn!("Ignoring ack for frame {} sent by the arbiter", ack.frame);
                return Ok(());
            }
            Err(e) => {
                Counters::bump(&self.counters.decode_errors);
                tracing::warn!("Dropping undecodable packet ({} bytes): {}", bytes.len(), e);
                return Ok(());
            }
        };
        Counters::bump(&self.counters.ticks_received);
        self.ping_ns.store(tick.ping_ns, Ordering::Relaxed);

        let last = self.last_frame.load(Ordering::Acquire);
        let seen = self.has_frame.load(Ordering::Acquire);
        let repeat = seen && tick.frame <= last;
        if !repeat {
            if seen && tick.frame != last.wrapping_add(1) {
                tracing::warn!("Frame gap: expected {}, got {}", last.wrapping_add(1), tick.frame);
            }
            self.last_frame.store(tick.frame, Ordering::Release);
            self.has_frame.store(true, Ordering::Release);
        }

        self.ack(transport, tick.frame, tick.server_timestamp_ns)?;

        if repeat {
            Counters::bump(&self.counters.duplicate_ticks);
            tracing::debug!("Re-acked resent frame {}", tick.frame);
        } else {
            tracing::trace!("Queued frame {} ({} commands)", tick.frame, tick.commands.len());
            self.queue.push(Arc::new(tick));
        }
        Ok(())
    }

    /// Sends an ack, keeping only transport failures as errors.
    fn ack<T: ClientTransport>(&self, transport: &mut T, frame: u64, server_timestamp_ns: u64) -> Result<(), TransportError> {
        match self.send_ack(transport, frame, server_timestamp_ns) {
            Ok(()) => Ok(()),
            Err(NetError::Transport(e)) => Err(e),
            Err(e) => {
                tracing::error!("Ack for frame {} not sent: {}", frame, e);
                Ok(())
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn send_ack<T: ClientTransport>(&self, transport: &mut T, frame: u64, server_timestamp_ns: u64) -> NetResult<()> {
        while self.is_running() && self.queue.len() > self.required_buffer_depth() {
            thread::sleep(BACKPRESSURE_SLEEP);
        }

        let now = self.clock.now_ns();
        let jitter_ns = {
            let mut jitter = self.jitter.lock();
            let estimate = jitter.jitter();
            if let Err(e) = jitter.record_event(now) {
                tracing::error!("Jitter sample rejected: {}", e);
            }
            estimate.max(0.0).round() as u64
        };

        let commands = self.take_batch();
        let count = commands.len();
        let empty = ClientAck {
            frame,
            client_timestamp_ns: now,
            server_timestamp_ns,
            jitter_ns,
            commands: Vec::new(),
        };
        let packet = Packet::Ack(ClientAck {
            commands,
            ..empty.clone()
        });
        let (bytes, carried) = match packet.encode_to_vec(self.config.max_packet_size) {
            Ok(bytes) => (bytes, count),
            Err(error) => {
                let commands = match packet {
                    Packet::Ack(ack) => ack.commands,
                    Packet::Tick(_) => Vec::new(),
                };
                self.drop_commands(frame, commands, error);
                (Packet::Ack(empty).encode_to_vec(self.config.max_packet_size)?, 0)
            }
        };

        transport.send(&bytes)?;
        Counters::bump(&self.counters.acks_sent);
        self.counters
            .commands_sent
            .fetch_add(u64::try_from(carried).unwrap_or(u64::MAX), Ordering::Relaxed);
        tracing::trace!("Acked frame {} with {} commands", frame, carried);
        Ok(())
    }

    /// Takes the longest prefix of pending commands that fits one ack.
    ///
    /// The rest stays pending for the next ack.
    fn take_batch(&self) -> Vec<Command> {
        let budget = self.config.max_packet_size.saturating_sub(Packet::MIN_SIZE);
        let mut pending = self.pending.lock();
        let mut used = 0usize;
        let fits = pending
            .iter()
            .take(usize::from(u16::MAX))
            .take_while(|command| {
                used += command.encoded_len();
                used <= budget
            })
            .count();
        if fits < pending.len() {
            tracing::debug!("{} commands deferred to the next ack", pending.len() - fits);
        }
        pending.drain(..fits).collect()
    }

    fn drop_commands(&self, frame: u64, commands: Vec<Command>, error: CodecError) {
        tracing::error!(
            "Ack for frame {} sent without its {} commands: {}",
            frame,
            commands.len(),
            error
        );
        self.counters
            .commands_dropped
            .fetch_add(u64::try_from(commands.len()).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.emit(ClientEvent::CommandsDropped {
            frame,
            commands,
            error,
        });
    }

    fn dispatch_loop(&self) {
        let mut tick_loop = TickLoop::new(self.config.tick_period());
        let mut held = 0u64;
        tick_loop.run(&self.running, |_| {
            if !self.dispatch_one() {
                held += 1;
            }
        });
        let stats = tick_loop.stats();
        tracing::debug!(
            "Client dispatcher stopped after {} periods ({} held back, {} late, {} skipped)",
            tick_loop.tick_count(),
            held,
            stats.late_ticks,
            stats.skipped_ticks
        );
    }

    /// Releases one tick if the queue is deeper than the jitter buffer.
    fn dispatch_one(&self) -> bool {
        if self.queue.len() <= self.required_buffer_depth() {
            return false;
        }
        let Some(tick) = self.queue.try_pop() else {
            return false;
        };
        Counters::bump(&self.counters.ticks_dispatched);
        self.emit(ClientEvent::ServerTick(tick));
        true
    }
}

/// Lockstep participant.
///
/// Runs two threads between [`start`](Self::start) and
/// [`stop`](Self::stop): the network loop, which owns the transport, and
/// the dispatcher. Dropping the client stops it.
pub struct LockstepClient {
    shared: Arc<Shared>,
    events: Receiver<ClientEvent>,
    network: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

impl LockstepClient {
    /// Creates a stopped client.
    ///
    /// `parser` decodes the payloads of incoming commands.
    pub fn new(config: LockstepConfig, parser: Arc<dyn CommandParser>) -> NetResult<Self> {
        config.validate()?;
        let jitter = JitterCalculator::with_initial_period(config.jitter_alpha, config.tick_period_ns)?;
        let (tx, rx) = unbounded();
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                parser,
                clock: MonotonicClock::new(),
                running: AtomicBool::new(false),
                state: AtomicU8::new(ClientState::Disconnected as u8),
                ping_ns: AtomicU64::new(0),
                last_frame: AtomicU64::new(0),
                has_frame: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                jitter: Mutex::new(jitter),
                queue: TickQueue::new(),
                events: tx,
                counters: Counters::default(),
            }),
            events: rx,
            network: None,
            dispatch: None,
        })
    }

    /// Starts the network loop and the dispatcher.
    ///
    /// The first connection attempt is made immediately; failures are
    /// retried every `reconnect_interval_ms` until [`stop`](Self::stop).
    pub fn start<T: ClientTransport>(&mut self, transport: T) -> NetResult<()> {
        if self.network.is_some() {
            return Err(NetError::AlreadyRunning);
        }
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let network = thread::Builder::new()
            .name("lockstep-client-net".into())
            .spawn(move || shared.network_loop(transport))
            .map_err(|source| {
                self.shared.running.store(false, Ordering::Release);
                NetError::Spawn { name: "network", source }
            })?;
        self.network = Some(network);

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("lockstep-client-dispatch".into())
            .spawn(move || shared.dispatch_loop())
        {
            Ok(handle) => self.dispatch = Some(handle),
            Err(source) => {
                self.stop();
                return Err(NetError::Spawn { name: "dispatch", source });
            }
        }

        tracing::info!(
            "Lockstep client started (tick period {:?}, jitter alpha {})",
            self.shared.config.tick_period(),
            self.shared.config.jitter_alpha
        );
        Ok(())
    }

    /// Stops both loops and closes the transport.
    ///
    /// The dispatcher is joined first, then the network loop, which closes
    /// the transport as its last action.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let was_running = self.network.is_some();
        if let Some(handle) = self.dispatch.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.network.take() {
            let _ = handle.join();
        }
        if was_running {
            tracing::info!("Lockstep client stopped");
        }
    }

    /// Returns true between `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.network.is_some()
    }

    /// Queues a command for the next ack.
    ///
    /// Commands that do not fit the remaining space of one ack wait for the
    /// following ones. A command too large for any ack is rejected here.
    pub fn push_command(&self, command: Command) -> NetResult<()> {
        let limit = self.shared.config.max_packet_size;
        let payload_len = command.payload().encoded_len();
        if u16::try_from(payload_len).is_err() {
            return Err(CodecError::PayloadTooLarge(payload_len).into());
        }
        let needed = Packet::MIN_SIZE + command.encoded_len();
        if needed > limit {
            return Err(NetError::CommandTooLarge {
                kind: command.kind(),
                needed,
                limit,
            });
        }
        self.shared.pending.lock().push(command);
        Ok(())
    }

    /// Number of commands waiting for the next ack.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Event stream for the host application.
    #[must_use]
    pub fn events(&self) -> Receiver<ClientEvent> {
        self.events.clone()
    }

    /// Connection state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Latency measured by the arbiter, as carried by the last tick.
    #[must_use]
    pub fn ping(&self) -> Duration {
        Duration::from_nanos(self.shared.ping_ns.load(Ordering::Relaxed))
    }

    /// Frame of the newest tick received in the current session.
    #[must_use]
    pub fn last_frame(&self) -> Option<u64> {
        self.shared
            .has_frame
            .load(Ordering::Acquire)
            .then(|| self.shared.last_frame.load(Ordering::Acquire))
    }

    /// Ticks waiting in the jitter buffer.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    /// Smoothed inter-arrival jitter, in nanoseconds.
    #[must_use]
    pub fn jitter(&self) -> f64 {
        self.shared.jitter.lock().jitter()
    }

    /// Smoothed inter-arrival period, in nanoseconds.
    #[must_use]
    pub fn period(&self) -> f64 {
        self.shared.jitter.lock().period()
    }

    /// Ticks the dispatcher currently holds back.
    #[must_use]
    pub fn required_buffer_depth(&self) -> usize {
        self.shared.required_buffer_depth()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        self.shared.counters.snapshot()
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &LockstepConfig {
        &self.shared.config
    }
}

impl Drop for LockstepClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryServerTransport, ServerTransport, TransportEvent};
    use lockstep_core::{CodecResult, OpaqueParser, OpaquePayload, WireWriter};
    use std::net::SocketAddr;

    const WAIT: Duration = Duration::from_secs(2);

    fn test_config() -> LockstepConfig {
        LockstepConfig {
            tick_period_ns: 5_000_000,
            recv_timeout_ms: 10,
            reconnect_interval_ms: 20,
            ..LockstepConfig::default()
        }
    }

    fn client() -> LockstepClient {
        LockstepClient::new(test_config(), Arc::new(OpaqueParser)).unwrap()
    }

    fn next_transport_event(server: &MemoryServerTransport) -> TransportEvent {
        server.poll(WAIT).unwrap().expect("transport event")
    }

    fn expect_connected(server: &MemoryServerTransport) -> SocketAddr {
        match next_transport_event(server) {
            TransportEvent::Connected(peer) => peer,
            other => panic!("expected connect, got {other:?}"),
        }
    }

    fn next_ack(server: &MemoryServerTransport) -> ClientAck {
        match next_transport_event(server) {
            TransportEvent::Received(_, bytes) => match Packet::decode(&bytes, &OpaqueParser).unwrap() {
                Packet::Ack(ack) => ack,
                Packet::Tick(_) => panic!("client sent a tick"),
            },
            other => panic!("expected ack, got {other:?}"),
        }
    }

    fn send_tick(server: &MemoryServerTransport, peer: SocketAddr, tick: ServerTick) {
        let bytes = Packet::Tick(tick).encode_to_vec(1024).unwrap();
        server.send(peer, &bytes).unwrap();
    }

    fn next_dispatched(events: &Receiver<ClientEvent>) -> Arc<ServerTick> {
        loop {
            match events.recv_timeout(WAIT).expect("client event") {
                ClientEvent::ServerTick(tick) => return tick,
                ClientEvent::Connected
                | ClientEvent::Disconnected
                | ClientEvent::CommandsDropped { .. } => {}
            }
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = LockstepConfig {
            jitter_alpha: 2.0,
            ..LockstepConfig::default()
        };
        assert!(matches!(
            LockstepClient::new(config, Arc::new(OpaqueParser)),
            Err(NetError::Config(_))
        ));
    }

    #[test]
    fn test_initial_ack_carries_pending_commands() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let mut client = client();
        client.push_command(Command::new(7, None, OpaquePayload(vec![1, 2, 3]))).unwrap();
        client.start(net.client()).unwrap();

        expect_connected(&server);
        let ack = next_ack(&server);
        assert_eq!(ack.frame, 0);
        assert_eq!(ack.server_timestamp_ns, 0);
        assert_eq!(ack.commands.len(), 1);
        assert_eq!(ack.commands[0].kind(), 7);
        assert_eq!(client.pending_commands(), 0);
        assert_eq!(client.state(), ClientState::Connected);
        assert!(matches!(client.start(net.client()), Err(NetError::AlreadyRunning)));
    }

    #[test]
    fn test_resent_tick_is_acked_but_not_queued() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let mut client = client();
        let events = client.events();
        client.start(net.client()).unwrap();

        let peer = expect_connected(&server);
        next_ack(&server);

        send_tick(&server, peer, ServerTick::new(0, 5_000_000, 100).with_ping(1_500));
        assert_eq!(next_ack(&server).frame, 0);
        send_tick(&server, peer, ServerTick::new(0, 5_000_000, 100));
        assert_eq!(next_ack(&server).frame, 0);
        send_tick(&server, peer, ServerTick::new(1, 5_000_000, 200));
        let ack = next_ack(&server);
        assert_eq!(ack.frame, 1);
        assert_eq!(ack.server_timestamp_ns, 200);

        assert_eq!(next_dispatched(&events).frame, 0);
        assert_eq!(next_dispatched(&events).frame, 1);
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());

        let stats = client.stats();
        assert_eq!(stats.duplicate_ticks, 1);
        assert_eq!(stats.ticks_received, 3);
        assert_eq!(client.last_frame(), Some(1));
    }

    #[test]
    fn test_garbage_is_dropped() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let mut client = client();
        client.start(net.client()).unwrap();

        let peer = expect_connected(&server);
        next_ack(&server);

        server.send(peer, &[0xFF, 1, 2]).unwrap();
        send_tick(&server, peer, ServerTick::new(0, 5_000_000, 1).with_ping(2_000_000));
        assert_eq!(next_ack(&server).frame, 0);

        assert_eq!(client.stats().decode_errors, 1);
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.ping(), Duration::from_millis(2));
    }

    #[test]
    fn test_reconnects_after_link_loss() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let mut client = client();
        let events = client.events();
        client.start(net.client()).unwrap();

        let first = expect_connected(&server);
        next_ack(&server);
        send_tick(&server, first, ServerTick::new(0, 5_000_000, 1));
        next_ack(&server);
        assert!(matches!(events.recv_timeout(WAIT), Ok(ClientEvent::Connected)));

        assert!(net.sever(first));
        assert!(matches!(
            next_transport_event(&server),
            TransportEvent::Disconnected(peer) if peer == first
        ));

        let second = expect_connected(&server);
        assert_ne!(first, second);
        assert_eq!(next_ack(&server).frame, 0);

        let mut saw_disconnect = false;
        loop {
            match events.recv_timeout(WAIT).expect("client event") {
                ClientEvent::Disconnected => saw_disconnect = true,
                ClientEvent::Connected => break,
                ClientEvent::ServerTick(_) | ClientEvent::CommandsDropped { .. } => {}
            }
        }
        assert!(saw_disconnect);
        assert_eq!(client.last_frame(), None);
    }

    #[test]
    fn test_retries_until_server_listens() {
        let net = MemoryNetwork::new();
        let mut client = client();
        client.start(net.client()).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_ne!(client.state(), ClientState::Connected);
        assert!(client.stats().connect_attempts >= 2);

        let server = net.listen(4).unwrap();
        expect_connected(&server);
        assert_eq!(next_ack(&server).frame, 0);
    }

    /// Declares more payload bytes than it writes.
    #[derive(Debug)]
    struct ShortPayload;

    impl lockstep_core::CommandPayload for ShortPayload {
        fn encoded_len(&self) -> usize {
            4
        }

        fn encode(&self, writer: &mut WireWriter<'_>) -> CodecResult<()> {
            writer.write_u16(0)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn opaque(len: usize) -> Command {
        Command::new(9, None, OpaquePayload(vec![0x5A; len]))
    }

    #[test]
    fn test_commands_split_across_acks() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let mut client = LockstepClient::new(
            LockstepConfig {
                max_packet_size: 1024,
                ..test_config()
            },
            Arc::new(OpaqueParser),
        )
        .unwrap();
        // Each fits an ack on its own, both together do not.
        client.push_command(opaque(600)).unwrap();
        client.push_command(opaque(600)).unwrap();
        client.start(net.client()).unwrap();

        let peer = expect_connected(&server);
        let hello = next_ack(&server);
        assert_eq!(hello.commands.len(), 1);
        assert_eq!(client.pending_commands(), 1);

        send_tick(&server, peer, ServerTick::new(0, 5_000_000, 1));
        let ack = next_ack(&server);
        assert_eq!(ack.frame, 0);
        assert_eq!(ack.commands.len(), 1);
        assert_eq!(ack.commands[0].payload_as::<OpaquePayload>().unwrap().0.len(), 600);
        assert_eq!(client.pending_commands(), 0);

        let stats = client.stats();
        assert_eq!(stats.commands_sent, 2);
        assert_eq!(stats.commands_dropped, 0);
    }

    #[test]
    fn test_push_rejects_command_no_ack_can_carry() {
        let client = LockstepClient::new(
            LockstepConfig {
                max_packet_size: 1024,
                ..test_config()
            },
            Arc::new(OpaqueParser),
        )
        .unwrap();

        let needed = Packet::MIN_SIZE + 8 + 1024;
        assert!(matches!(
            client.push_command(opaque(1024)),
            Err(NetError::CommandTooLarge { kind: 9, needed: n, limit: 1024 }) if n == needed
        ));
        assert!(client.push_command(opaque(1024 - 8 - Packet::MIN_SIZE)).is_ok());

        let roomy = LockstepClient::new(
            LockstepConfig {
                max_packet_size: 1 << 20,
                ..test_config()
            },
            Arc::new(OpaqueParser),
        )
        .unwrap();
        assert!(matches!(
            roomy.push_command(opaque(70_000)),
            Err(NetError::Codec(CodecError::PayloadTooLarge(70_000)))
        ));
        assert_eq!(client.pending_commands(), 1);
        assert_eq!(roomy.pending_commands(), 0);
    }

    #[test]
    fn test_unencodable_commands_returned_to_host() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let mut client = client();
        let events = client.events();
        client.push_command(Command::new(4, None, ShortPayload)).unwrap();
        client.start(net.client()).unwrap();

        expect_connected(&server);
        let hello = next_ack(&server);
        assert_eq!(hello.frame, 0);
        assert!(hello.commands.is_empty());

        let dropped = loop {
            match events.recv_timeout(WAIT).expect("client event") {
                ClientEvent::CommandsDropped { frame, commands, error } => break (frame, commands, error),
                ClientEvent::Connected | ClientEvent::Disconnected | ClientEvent::ServerTick(_) => {}
            }
        };
        assert_eq!(dropped.0, 0);
        assert_eq!(dropped.1.len(), 1);
        assert_eq!(dropped.1[0].kind(), 4);
        assert!(matches!(dropped.2, CodecError::PayloadMismatch { kind: 4, declared: 4, consumed: 2 }));

        let stats = client.stats();
        assert_eq!(stats.commands_dropped, 1);
        assert_eq!(stats.commands_sent, 0);
        assert_eq!(stats.acks_sent, 1);
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[test]
    fn test_dispatcher_holds_back_buffer_depth() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let mut client = client();
        // Small alpha keeps the seeded depth of 2 through a handful of samples.
        *client.shared.jitter.lock() = JitterCalculator::with_estimates(0.001, 1_000_000, 2_500_000).unwrap();
        assert_eq!(client.required_buffer_depth(), 2);
        let events = client.events();
        client.start(net.client()).unwrap();

        let peer = expect_connected(&server);
        next_ack(&server);
        for frame in 0..3 {
            send_tick(&server, peer, ServerTick::new(frame, 5_000_000, frame + 1));
            assert_eq!(next_ack(&server).frame, frame);
        }

        assert_eq!(next_dispatched(&events).frame, 0);
        let held = events.recv_timeout(Duration::from_millis(50));
        assert!(
            !matches!(held, Ok(ClientEvent::ServerTick(_))),
            "dispatched past the buffer: {held:?}"
        );
        assert_eq!(client.queue_depth(), 2);
        assert_eq!(client.required_buffer_depth(), 2);
        assert_eq!(client.stats().ticks_dispatched, 1);
    }

    #[test]
    fn test_ack_waits_for_dispatcher_to_drain() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let client = client();
        let shared = Arc::clone(&client.shared);
        *shared.jitter.lock() = JitterCalculator::with_estimates(0.001, 1_000_000, 1_500_000).unwrap();
        shared.running.store(true, Ordering::Release);
        for frame in 0..2 {
            shared.queue.push(Arc::new(ServerTick::new(frame, 5_000_000, frame + 1)));
        }

        let mut link = net.client();
        link.connect().unwrap();
        expect_connected(&server);

        let sender = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let sent = shared.send_ack(&mut link, 2, 3).is_ok();
                (sent, link)
            })
        };

        // Two queued, depth one: the ack is held.
        assert!(server.poll(Duration::from_millis(50)).unwrap().is_none());
        assert!(shared.dispatch_one());
        assert_eq!(next_ack(&server).frame, 2);

        // At the threshold the dispatcher holds, and acks flow.
        assert!(!shared.dispatch_one());
        assert_eq!(shared.queue.len(), 1);
        let (sent, _link) = sender.join().unwrap();
        assert!(sent);
    }

    #[test]
    fn test_stop_closes_transport() {
        let net = MemoryNetwork::new();
        let server = net.listen(4).unwrap();
        let mut client = client();
        client.start(net.client()).unwrap();
        let peer = expect_connected(&server);
        next_ack(&server);

        client.stop();
        assert!(!client.is_running());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(next_transport_event(&server), TransportEvent::Disconnected(peer));
    }
}
