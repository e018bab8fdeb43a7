//! # LOCKSTEP Networking
//!
//! Arbiter and client for frame-by-frame lockstep synchronization.
//!
//! ## Architecture
//!
//! - **Server**: [`LockstepServer`] advances a frame only once every live
//!   client acked the previous one, merging their commands into the next
//!   tick
//! - **Client**: [`LockstepClient`] acks every tick with its pending
//!   commands and releases ticks to the host at a steady pace, holding back
//!   enough of them to absorb network jitter
//! - **Transport**: [`transport::ServerTransport`] and
//!   [`transport::ClientTransport`], implemented over TCP and in memory
//!
//! ## Exchange
//!
//! ```text
//! CLIENT A         ARBITER          CLIENT B
//!   |--ack(N, cmds)-->|<--ack(N, cmds)--|
//!   |                 | all acked       |
//!   |<--tick(N+1)-----|-----tick(N+1)-->|
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lockstep_core::OpaqueParser;
//! use lockstep_networking::transport::MemoryNetwork;
//! use lockstep_networking::{ClientEvent, LockstepClient, LockstepConfig, LockstepServer};
//!
//! let config = LockstepConfig::default();
//! let net = MemoryNetwork::new();
//!
//! let mut server = LockstepServer::new(config.clone(), Arc::new(OpaqueParser)).unwrap();
//! server.start(net.listen(config.max_clients).unwrap()).unwrap();
//!
//! let mut client = LockstepClient::new(config, Arc::new(OpaqueParser)).unwrap();
//! let events = client.events();
//! client.start(net.client()).unwrap();
//!
//! while let Ok(event) = events.recv() {
//!     if let ClientEvent::ServerTick(tick) = event {
//!         println!("frame {} with {} commands", tick.frame, tick.commands.len());
//!     }
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod tick;
pub mod transport;

pub use client::{ClientEvent, ClientState, ClientStats, LockstepClient};
pub use config::LockstepConfig;
pub use error::{ConfigError, NetError, NetResult, TransportError, TransportResult};
pub use server::{ClientRecord, LockstepServer};
pub use tick::{TickLoop, TickStats};
