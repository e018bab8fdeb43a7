//! # In-Memory Transport
//!
//! Reliable, ordered delivery between threads of one process.
//!
//! A [`MemoryNetwork`] plays the role of the wire: one server may listen on
//! it, any number of clients may connect to it. Peers get synthetic
//! loopback addresses. Tests use [`MemoryNetwork::sever`] to cut a link the
//! way a transport-level disconnect would.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{ClientTransport, LinkEvent, ServerTransport, TransportEvent};
use crate::error::{TransportError, TransportResult};

/// First synthetic port handed out to clients.
const FIRST_PORT: u16 = 40_000;

struct Listener {
    id: u64,
    events: Sender<TransportEvent>,
    max_clients: usize,
}

struct Hub {
    listener: Option<Listener>,
    links: HashMap<SocketAddr, Sender<LinkEvent>>,
    next_port: u16,
    next_listener_id: u64,
}

impl Hub {
    /// Removes a link, notifying both ends. Returns false if it was unknown.
    fn sever(&mut self, peer: SocketAddr) -> bool {
        let Some(link) = self.links.remove(&peer) else {
            return false;
        };
        let _ = link.send(LinkEvent::Disconnected);
        if let Some(listener) = &self.listener {
            let _ = listener.events.send(TransportEvent::Disconnected(peer));
        }
        true
    }
}

/// Shared in-process network.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                listener: None,
                links: HashMap::new(),
                next_port: FIRST_PORT,
                next_listener_id: 0,
            })),
        }
    }

    /// Starts listening. Only one server may listen at a time.
    pub fn listen(&self, max_clients: usize) -> TransportResult<MemoryServerTransport> {
        let mut hub = self.hub.lock();
        if hub.listener.is_some() {
            return Err(TransportError::Refused("address already in use".into()));
        }
        let (tx, rx) = unbounded();
        let id = hub.next_listener_id;
        hub.next_listener_id += 1;
        hub.listener = Some(Listener {
            id,
            events: tx,
            max_clients,
        });
        Ok(MemoryServerTransport {
            hub: Arc::clone(&self.hub),
            events: rx,
            listener_id: id,
        })
    }

    /// Creates a client transport attached to this network.
    #[must_use]
    pub fn client(&self) -> MemoryClientTransport {
        MemoryClientTransport {
            hub: Arc::clone(&self.hub),
            link: None,
        }
    }

    /// Cuts one peer's link. Both ends observe a disconnect.
    pub fn sever(&self, peer: SocketAddr) -> bool {
        self.hub.lock().sever(peer)
    }

    /// Cuts every link.
    pub fn sever_all(&self) {
        let mut hub = self.hub.lock();
        let peers: Vec<_> = hub.links.keys().copied().collect();
        for peer in peers {
            hub.sever(peer);
        }
    }

    /// Addresses of the currently connected clients.
    #[must_use]
    pub fn peers(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<_> = self.hub.lock().links.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Returns true while a server is listening.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.hub.lock().listener.is_some()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Server end of a [`MemoryNetwork`].
pub struct MemoryServerTransport {
    hub: Arc<Mutex<Hub>>,
    events: Receiver<TransportEvent>,
    listener_id: u64,
}

impl ServerTransport for MemoryServerTransport {
    fn poll(&self, timeout: Duration) -> TransportResult<Option<TransportEvent>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn send(&self, peer: SocketAddr, bytes: &[u8]) -> TransportResult<()> {
        let hub = self.hub.lock();
        let link = hub.links.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        link.send(LinkEvent::Received(bytes.to_vec()))
            .map_err(|_| TransportError::UnknownPeer(peer))
    }

    fn disconnect(&self, peer: SocketAddr) {
        self.hub.lock().sever(peer);
    }

    fn shutdown(&self) {
        let mut hub = self.hub.lock();
        if hub.listener.as_ref().map(|l| l.id) != Some(self.listener_id) {
            return;
        }
        let peers: Vec<_> = hub.links.keys().copied().collect();
        for peer in peers {
            if let Some(link) = hub.links.remove(&peer) {
                let _ = link.send(LinkEvent::Disconnected);
            }
        }
        // Dropping the listener closes the event channel.
        hub.listener = None;
    }
}

impl Drop for MemoryServerTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ClientLink {
    addr: SocketAddr,
    inbox: Receiver<LinkEvent>,
}

/// Client end of a [`MemoryNetwork`].
pub struct MemoryClientTransport {
    hub: Arc<Mutex<Hub>>,
    link: Option<ClientLink>,
}

impl MemoryClientTransport {
    /// Address assigned to the current session.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().map(|l| l.addr)
    }
}

impl ClientTransport for MemoryClientTransport {
    fn connect(&mut self) -> TransportResult<()> {
        self.disconnect();

        let mut hub = self.hub.lock();
        let Some(listener) = hub.listener.as_ref() else {
            return Err(TransportError::Refused("nobody listening".into()));
        };
        if hub.links.len() >= listener.max_clients {
            return Err(TransportError::Refused("server full".into()));
        }
        let events = listener.events.clone();

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), hub.next_port);
        hub.next_port = hub.next_port.wrapping_add(1).max(FIRST_PORT);

        let (tx, rx) = unbounded();
        hub.links.insert(addr, tx);
        events
            .send(TransportEvent::Connected(addr))
            .map_err(|_| TransportError::Closed)?;

        self.link = Some(ClientLink { addr, inbox: rx });
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> TransportResult<Option<LinkEvent>> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        let event = match link.inbox.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => LinkEvent::Disconnected,
        };
        if event == LinkEvent::Disconnected {
            self.link = None;
        }
        Ok(Some(event))
    }

    fn send(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        let hub = self.hub.lock();
        if !hub.links.contains_key(&link.addr) {
            return Err(TransportError::NotConnected);
        }
        let listener = hub.listener.as_ref().ok_or(TransportError::Closed)?;
        listener
            .events
            .send(TransportEvent::Received(link.addr, bytes.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            let mut hub = self.hub.lock();
            if hub.links.remove(&link.addr).is_some() {
                if let Some(listener) = &hub.listener {
                    let _ = listener.events.send(TransportEvent::Disconnected(link.addr));
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

impl Drop for MemoryClientTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
