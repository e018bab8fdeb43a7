//! # Lockstep Arbiter
//!
//! Serves lockstep ticks over TCP.
//!
//! ## Usage
//!
//! ```bash
//! lockstep_server --config lockstep.toml --port 7777 --duration 60
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use lockstep_core::OpaqueParser;
use lockstep_networking::transport::TcpServerTransport;
use lockstep_networking::{LockstepConfig, LockstepServer, NetResult};

#[derive(Parser)]
#[command(name = "lockstep_server")]
#[command(about = "Lockstep arbiter")]
struct Args {
    #[arg(short, long, help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Port to listen on")]
    port: Option<u16>,

    #[arg(short, long, help = "Maximum number of clients")]
    max_clients: Option<usize>,

    #[arg(short, long, help = "Tick period in milliseconds")]
    tick_ms: Option<u64>,

    #[arg(short, long, help = "Run for N seconds then exit")]
    duration: Option<u64>,

    #[arg(long, default_value_t = 1, help = "Seconds between status lines")]
    status_every: u64,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn load_config(args: &Args) -> NetResult<LockstepConfig> {
    let mut config = match &args.config {
        Some(path) => LockstepConfig::load(path)?,
        None => LockstepConfig::default(),
    };
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_period_ns = tick_ms.saturating_mul(1_000_000);
    }
    config.validate()?;
    Ok(config)
}

fn main() -> NetResult<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let config = load_config(&args)?;

    println!("┌─ CONFIGURATION ─────────────────────────────────────────────────┐");
    println!("│ Bind Address:       {}", config.bind_addr());
    println!("│ Tick Period:        {:?}", config.tick_period());
    println!("│ Max Clients:        {}", config.max_clients);
    println!("│ Resend After:       {} incomplete cycles", config.max_tick_timeouts);
    match args.duration {
        Some(d) => println!("│ Duration:           {d} seconds"),
        None => println!("│ Duration:           infinite"),
    }
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let transport = TcpServerTransport::bind(config.bind_addr(), config.max_clients, config.max_packet_size)?;
    let mut server = LockstepServer::new(config, Arc::new(OpaqueParser))?;
    server.start(transport)?;

    let start = Instant::now();
    let status_every = Duration::from_secs(args.status_every.max(1));
    let mut last_frame = 0;
    loop {
        std::thread::sleep(status_every);
        if args.duration.is_some_and(|d| start.elapsed() >= Duration::from_secs(d)) {
            break;
        }

        let frame = server.frame();
        println!("┌─ ARBITER STATUS (Frame {frame}) ─────────────────────────────────");
        println!("│ Uptime:             {:.1}s", start.elapsed().as_secs_f64());
        println!("│ Frames/interval:    {}", frame.saturating_sub(last_frame));
        println!("│ Clients:            {}", server.client_count());
        println!("│ Resends:            {}", server.resend_count());
        println!("│ Waiting Cycles:     {}", server.timeouts());
        println!("│ Staged Commands:    {}", server.staged_commands());
        println!("│ Sessions:           {}", server.sessions());
        for record in server.clients() {
            println!(
                "│   {:<21} acked {:>8}  ping {:>9.3?}  jitter {:>6} us",
                record.addr,
                record.last_ack_frame.map_or_else(|| "-".to_owned(), |f| f.to_string()),
                record.ping,
                record.jitter_ns / 1_000
            );
        }
        println!("└──────────────────────────────────────────────────────────────────");
        last_frame = frame;
    }

    server.stop();
    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                    ARBITER SHUTDOWN                              ║");
    println!("╠══════════════════════════════════════════════════════════════════╣");
    println!("║ Final Frame:        {:>10}                                   ║", server.frame());
    println!("║ Resends:            {:>10}                                   ║", server.resend_count());
    println!("╚══════════════════════════════════════════════════════════════════╝");
    Ok(())
}
