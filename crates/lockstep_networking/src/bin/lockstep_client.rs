//! # Lockstep Demo Client
//!
//! Connects to an arbiter over TCP, issues an opaque command every few
//! ticks and logs what comes back.
//!
//! ## Usage
//!
//! ```bash
//! lockstep_client --host 127.0.0.1 --port 7777 --every 5 --duration 30
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use lockstep_core::{Command, OpaqueParser, OpaquePayload};
use lockstep_networking::transport::TcpClientTransport;
use lockstep_networking::{ClientEvent, LockstepClient, LockstepConfig, NetResult};

/// Command kind used by the demo.
const DEMO_COMMAND: u16 = 1;

#[derive(Parser)]
#[command(name = "lockstep_client")]
#[command(about = "Lockstep demo client")]
struct Args {
    #[arg(short, long, help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Arbiter host")]
    host: Option<String>,

    #[arg(short, long, help = "Arbiter port")]
    port: Option<u16>,

    #[arg(short, long, default_value_t = 10, help = "Send a command every N ticks (0 = never)")]
    every: u64,

    #[arg(short, long, help = "Run for N seconds then exit")]
    duration: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn main() -> NetResult<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let mut config = match &args.config {
        Some(path) => LockstepConfig::load(path)?,
        None => LockstepConfig::default(),
    };
    if let Some(host) = &args.host {
        config.server_host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    config.validate()?;

    let transport = TcpClientTransport::new(config.server_addr()?, config.max_packet_size);
    let mut client = LockstepClient::new(config, Arc::new(OpaqueParser))?;
    let events = client.events();
    client.start(transport)?;

    let start = Instant::now();
    let deadline = args.duration.map(|d| start + Duration::from_secs(d));
    let mut dispatched = 0u64;
    let mut sent = 0u32;

    while deadline.map_or(true, |d| Instant::now() < d) {
        let Ok(event) = events.recv_timeout(Duration::from_millis(100)) else {
            continue;
        };
        match event {
            ClientEvent::Connected => tracing::info!("Connected"),
            ClientEvent::Disconnected => tracing::warn!("Disconnected, retrying in the background"),
            ClientEvent::ServerTick(tick) => {
                dispatched += 1;
                tracing::info!(
                    "frame {:>6}  commands {:>3}  ping {:?}  queued {}  jitter {:.0} ns",
                    tick.frame,
                    tick.commands.len(),
                    client.ping(),
                    client.queue_depth(),
                    client.jitter()
                );
                if args.every > 0 && dispatched % args.every == 0 {
                    let payload = OpaquePayload((sent + 1).to_ne_bytes().to_vec());
                    match client.push_command(Command::new(DEMO_COMMAND, None, payload)) {
                        Ok(()) => sent += 1,
                        Err(e) => tracing::warn!("Demo command rejected: {}", e),
                    }
                }
            }
            ClientEvent::CommandsDropped { frame, commands, error } => {
                tracing::error!("{} commands lost at frame {}: {}", commands.len(), frame, error);
            }
        }
    }

    client.stop();
    let stats = client.stats();
    println!();
    println!("Ticks received:   {}", stats.ticks_received);
    println!("Ticks dispatched: {}", stats.ticks_dispatched);
    println!("Resends seen:     {}", stats.duplicate_ticks);
    println!("Acks sent:        {}", stats.acks_sent);
    println!("Commands queued:  {sent}");
    println!("Commands sent:    {}", stats.commands_sent);
    println!("Commands dropped: {}", stats.commands_dropped);
    Ok(())
}
