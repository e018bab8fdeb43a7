//! # TCP Loopback Test
//!
//! Arbiter and two clients over real sockets on 127.0.0.1.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use lockstep_core::{Command, CommandRegistry, EntityId, ServerTick, WireReader};
use lockstep_networking::transport::{TcpClientTransport, TcpServerTransport};
use lockstep_networking::{ClientEvent, ClientState, LockstepClient, LockstepConfig, LockstepServer};

const WAIT: Duration = Duration::from_secs(10);
const KIND_MOVE: u16 = 3;

/// Typed payload decoded through a registry on both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Move {
    dx: i32,
    dy: i32,
}

impl lockstep_core::CommandPayload for Move {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, writer: &mut lockstep_core::WireWriter<'_>) -> lockstep_core::CodecResult<()> {
        writer.write_u32(self.dx as u32)?;
        writer.write_u32(self.dy as u32)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn registry() -> Arc<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry.register(KIND_MOVE, |reader: &mut WireReader<'_>| {
        Ok(Move {
            dx: reader.read_u32()? as i32,
            dy: reader.read_u32()? as i32,
        })
    });
    Arc::new(registry)
}

fn config(port: u16) -> LockstepConfig {
    LockstepConfig {
        server_port: port,
        tick_period_ns: 10_000_000,
        recv_timeout_ms: 20,
        reconnect_interval_ms: 50,
        ..LockstepConfig::default()
    }
}

fn start_client(config: &LockstepConfig) -> (LockstepClient, Receiver<ClientEvent>) {
    let transport = TcpClientTransport::new(config.server_addr().unwrap(), config.max_packet_size);
    let mut client = LockstepClient::new(config.clone(), registry()).unwrap();
    let events = client.events();
    client.start(transport).unwrap();
    (client, events)
}

/// Collects dispatched ticks until one carries a command.
fn wait_for_command(events: &Receiver<ClientEvent>) -> Arc<ServerTick> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Ok(ClientEvent::ServerTick(tick)) = events.recv_timeout(Duration::from_millis(20)) {
            if !tick.commands.is_empty() {
                return tick;
            }
        }
    }
    panic!("no command dispatched within {WAIT:?}");
}

#[test]
fn test_commands_cross_real_sockets() {
    let transport = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap(), 8, 64 * 1024).unwrap();
    let config = config(transport.local_addr().port());
    let mut server = LockstepServer::new(config.clone(), registry()).unwrap();
    server.start(transport).unwrap();

    let (a, a_events) = start_client(&config);
    let (b, b_events) = start_client(&config);

    let deadline = Instant::now() + WAIT;
    while server.client_count() < 2 {
        assert!(Instant::now() < deadline, "clients never registered");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(a.state(), ClientState::Connected);

    a.push_command(Command::new(KIND_MOVE, Some(EntityId(7)), Move { dx: -3, dy: 4 }))
        .unwrap();

    let seen_a = wait_for_command(&a_events);
    let seen_b = wait_for_command(&b_events);
    assert_eq!(seen_a.frame, seen_b.frame);

    for tick in [&seen_a, &seen_b] {
        assert_eq!(tick.commands.len(), 1);
        let command = &tick.commands[0];
        assert_eq!(command.kind(), KIND_MOVE);
        assert_eq!(command.entity(), Some(EntityId(7)));
        assert_eq!(command.payload_as::<Move>(), Some(&Move { dx: -3, dy: 4 }));
    }

    assert!(server.frame() >= seen_a.frame);
    assert!(b.stats().acks_sent > 0);
}

#[test]
fn test_client_survives_arbiter_restart() {
    let transport = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap(), 8, 64 * 1024).unwrap();
    let addr = transport.local_addr();
    let config = config(addr.port());
    let mut server = LockstepServer::new(config.clone(), registry()).unwrap();
    server.start(transport).unwrap();

    let (client, events) = start_client(&config);
    let deadline = Instant::now() + WAIT;
    while server.frame() < 3 {
        assert!(Instant::now() < deadline, "no progress before restart");
        std::thread::sleep(Duration::from_millis(5));
    }

    server.stop();
    drop(server);

    let deadline = Instant::now() + WAIT;
    let mut lost = false;
    while !lost {
        assert!(Instant::now() < deadline, "disconnect not reported");
        lost = matches!(events.recv_timeout(Duration::from_millis(20)), Ok(ClientEvent::Disconnected));
    }

    let transport = TcpServerTransport::bind(addr, 8, 64 * 1024).unwrap();
    let mut server = LockstepServer::new(config, registry()).unwrap();
    server.start(transport).unwrap();

    let deadline = Instant::now() + WAIT;
    while server.frame() < 3 {
        assert!(Instant::now() < deadline, "no progress after restart");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(client.state(), ClientState::Connected);
    assert!(client.stats().connect_attempts >= 2);
}
