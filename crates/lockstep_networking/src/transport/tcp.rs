//! # TCP Transport
//!
//! Length-prefixed frames over `std::net::TcpStream`.
//!
//! ## Threads
//!
//! - Server: one acceptor thread, plus one reader thread per peer feeding
//!   a shared event channel
//! - Client: one reader thread per session feeding that session's channel
//!
//! Writes happen on the caller's thread under a per-socket lock.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::framing::{read_frame, write_frame};
use super::{ClientTransport, LinkEvent, ServerTransport, TransportEvent};
use crate::error::{TransportError, TransportResult};

/// How long the acceptor sleeps when no connection is pending.
const ACCEPT_IDLE: Duration = Duration::from_millis(5);

/// A write blocked longer than this fails and drops the peer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the client's connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A connected socket. Writers serialize on `write_lock` so frames from
/// the two arbiter loops never interleave.
struct Peer {
    stream: TcpStream,
    write_lock: Mutex<()>,
}

impl Peer {
    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, Arc<Peer>>>>;

/// Accepting side over TCP.
pub struct TcpServerTransport {
    local_addr: SocketAddr,
    peers: PeerMap,
    events: Receiver<TransportEvent>,
    running: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    max_frame: usize,
}

impl TcpServerTransport {
    /// Binds `addr` and starts accepting up to `max_clients` peers.
    pub fn bind(addr: SocketAddr, max_clients: usize, max_frame: usize) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = unbounded();

        let acceptor = {
            let peers = Arc::clone(&peers);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("lockstep-accept".into())
                .spawn(move || accept_loop(&listener, &peers, &running, &tx, max_clients, max_frame))?
        };

        tracing::info!("TCP transport listening on {}", local_addr);
        Ok(Self {
            local_addr,
            peers,
            events: rx,
            running,
            acceptor: Mutex::new(Some(acceptor)),
            max_frame,
        })
    }

    /// Address actually bound (useful with port 0).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn accept_loop(
    listener: &TcpListener,
    peers: &PeerMap,
    running: &AtomicBool,
    events: &Sender<TransportEvent>,
    max_clients: usize,
    max_frame: usize,
) {
    while running.load(Ordering::Acquire) {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
                continue;
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_IDLE);
                continue;
            }
        };

        if peers.lock().len() >= max_clients {
            tracing::warn!("Refusing {}: {} clients connected", addr, max_clients);
            let _ = stream.shutdown(Shutdown::Both);
            continue;
        }
        if let Err(e) = register_peer(stream, addr, peers, events, max_frame) {
            tracing::warn!("Cannot set up {}: {}", addr, e);
        }
    }
}

fn register_peer(
    stream: TcpStream,
    addr: SocketAddr,
    peers: &PeerMap,
    events: &Sender<TransportEvent>,
    max_frame: usize,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let reader = stream.try_clone()?;
    let peer = Arc::new(Peer {
        stream,
        write_lock: Mutex::new(()),
    });

    peers.lock().insert(addr, Arc::clone(&peer));
    // Connected must precede any Received from the reader thread.
    let _ = events.send(TransportEvent::Connected(addr));

    let spawned = {
        let peers = Arc::clone(peers);
        let events = events.clone();
        thread::Builder::new()
            .name(format!("lockstep-peer-{addr}"))
            .spawn(move || peer_reader(reader, addr, &peers, &events, max_frame))
    };
    if let Err(e) = spawned {
        peers.lock().remove(&addr);
        peer.close();
        let _ = events.send(TransportEvent::Disconnected(addr));
        return Err(e);
    }
    Ok(())
}

fn peer_reader(
    stream: TcpStream,
    addr: SocketAddr,
    peers: &PeerMap,
    events: &Sender<TransportEvent>,
    max_frame: usize,
) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader, max_frame) {
            Ok(Some(bytes)) => {
                if events.send(TransportEvent::Received(addr, bytes)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", addr, e);
                break;
            }
        }
    }

    // Only report peers nobody else has removed yet.
    let removed = peers.lock().remove(&addr);
    if let Some(peer) = removed {
        peer.close();
        let _ = events.send(TransportEvent::Disconnected(addr));
    }
}

impl ServerTransport for TcpServerTransport {
    fn poll(&self, timeout: Duration) -> TransportResult<Option<TransportEvent>> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn send(&self, peer: SocketAddr, bytes: &[u8]) -> TransportResult<()> {
        let link = self
            .peers
            .lock()
            .get(&peer)
            .cloned()
            .ok_or(TransportError::UnknownPeer(peer))?;

        let result = {
            let _guard = link.write_lock.lock();
            write_frame(&mut &link.stream, bytes, self.max_frame)
        };
        if let Err(TransportError::Io(e)) = &result {
            tracing::warn!("Write to {} failed: {}", peer, e);
            // The reader thread sees the shutdown and reports the disconnect.
            link.close();
        }
        result
    }

    fn disconnect(&self, peer: SocketAddr) {
        let link = self.peers.lock().get(&peer).cloned();
        if let Some(link) = link {
            link.close();
        }
    }

    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for (_, peer) in self.peers.lock().drain() {
            peer.close();
        }
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
        tracing::info!("TCP transport on {} shut down", self.local_addr);
    }
}

impl Drop for TcpServerTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Session {
    stream: TcpStream,
    inbox: Receiver<LinkEvent>,
    reader: JoinHandle<()>,
}

/// Connecting side over TCP.
pub struct TcpClientTransport {
    server_addr: SocketAddr,
    max_frame: usize,
    session: Option<Session>,
}

impl TcpClientTransport {
    /// Creates an unconnected transport targeting `server_addr`.
    #[must_use]
    pub const fn new(server_addr: SocketAddr, max_frame: usize) -> Self {
        Self {
            server_addr,
            max_frame,
            session: None,
        }
    }

    /// Local address of the current session.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().and_then(|s| s.stream.local_addr().ok())
    }
}

fn link_reader(stream: TcpStream, inbox: &Sender<LinkEvent>, max_frame: usize) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader, max_frame) {
            Ok(Some(bytes)) => {
                if inbox.send(LinkEvent::Received(bytes)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Read from arbiter failed: {}", e);
                break;
            }
        }
    }
    let _ = inbox.send(LinkEvent::Disconnected);
}

impl ClientTransport for TcpClientTransport {
    fn connect(&mut self) -> TransportResult<()> {
        self.disconnect();

        let stream = TcpStream::connect_timeout(&self.server_addr, CONNECT_TIMEOUT).map_err(|e| {
            if e.kind() == io::ErrorKind::ConnectionRefused {
                TransportError::Refused(e.to_string())
            } else {
                TransportError::Io(e)
            }
        })?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let reader_stream = stream.try_clone()?;
        let (tx, rx) = unbounded();
        let max_frame = self.max_frame;
        let reader = thread::Builder::new()
            .name("lockstep-link".into())
            .spawn(move || link_reader(reader_stream, &tx, max_frame))?;

        self.session = Some(Session {
            stream,
            inbox: rx,
            reader,
        });
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> TransportResult<Option<LinkEvent>> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        let event = match session.inbox.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => LinkEvent::Disconnected,
        };
        if event == LinkEvent::Disconnected {
            self.disconnect();
        }
        Ok(Some(event))
    }

    fn send(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        write_frame(&mut &session.stream, bytes, self.max_frame)
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.stream.shutdown(Shutdown::Both);
            let _ = session.reader.join();
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for TcpClientTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    fn next_event(server: &TcpServerTransport) -> TransportEvent {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(event) = server.poll(Duration::from_millis(50)).unwrap() {
                return event;
            }
        }
        panic!("no transport event within {WAIT:?}");
    }

    fn next_link_event(client: &mut TcpClientTransport) -> LinkEvent {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(event) = client.poll(Duration::from_millis(50)).unwrap() {
                return event;
            }
        }
        panic!("no link event within {WAIT:?}");
    }

    fn loopback_server(max_clients: usize) -> TcpServerTransport {
        TcpServerTransport::bind("127.0.0.1:0".parse().unwrap(), max_clients, 1024).unwrap()
    }

    #[test]
    fn test_exchange_over_loopback() {
        let server = loopback_server(4);
        let mut client = TcpClientTransport::new(server.local_addr(), 1024);
        client.connect().unwrap();

        let TransportEvent::Connected(peer) = next_event(&server) else {
            panic!("expected connect");
        };
        assert_eq!(Some(peer), client.local_addr());

        client.send(b"ack").unwrap();
        assert_eq!(next_event(&server), TransportEvent::Received(peer, b"ack".to_vec()));

        server.send(peer, b"tick").unwrap();
        assert_eq!(next_link_event(&mut client), LinkEvent::Received(b"tick".to_vec()));
    }

    #[test]
    fn test_server_disconnect_reaches_client() {
        let server = loopback_server(4);
        let mut client = TcpClientTransport::new(server.local_addr(), 1024);
        client.connect().unwrap();
        let TransportEvent::Connected(peer) = next_event(&server) else {
            panic!("expected connect");
        };

        server.disconnect(peer);
        assert_eq!(next_event(&server), TransportEvent::Disconnected(peer));
        assert_eq!(next_link_event(&mut client), LinkEvent::Disconnected);
        assert!(!client.is_connected());
        assert!(matches!(server.send(peer, b"x"), Err(TransportError::UnknownPeer(_))));
    }

    #[test]
    fn test_client_disconnect_reaches_server() {
        let server = loopback_server(4);
        let mut client = TcpClientTransport::new(server.local_addr(), 1024);
        client.connect().unwrap();
        let TransportEvent::Connected(peer) = next_event(&server) else {
            panic!("expected connect");
        };

        client.disconnect();
        assert_eq!(next_event(&server), TransportEvent::Disconnected(peer));
    }

    #[test]
    fn test_oversized_send_rejected() {
        let server = loopback_server(4);
        let mut client = TcpClientTransport::new(server.local_addr(), 1024);
        client.connect().unwrap();
        assert!(matches!(
            client.send(&[0u8; 2048]),
            Err(TransportError::FrameTooLarge { .. })
        ));
        assert!(client.is_connected());
    }

    #[test]
    fn test_connect_to_closed_port_fails() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut client = TcpClientTransport::new(addr, 1024);
        assert!(client.connect().is_err());
        assert!(!client.is_connected());
    }

    #[test]
    fn test_shutdown_reports_closed() {
        let server = loopback_server(4);
        server.shutdown();
        assert!(matches!(server.poll(Duration::from_millis(10)), Err(TransportError::Closed)));
    }
}
