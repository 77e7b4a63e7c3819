//! Voice peer
//!
//! Runs one side of a two-way call over UDP.
//!
//! ```text
//! peer <peer-addr> [--bind <addr>] [--name <name>] [--config <file>] [--muted]
//! peer --list-devices
//! ```
//!
//! While running, type `m` + Enter to toggle mute and `q` + Enter to hang up.

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_voice_relay::{
    audio::{list_devices, CpalBackend},
    config::SessionConfig,
    constants::DEFAULT_UDP_PORT,
    session::{Session, SessionHandle},
    transport::UdpTransport,
};

struct Args {
    peer: Option<SocketAddr>,
    bind: SocketAddr,
    name: String,
    config: Option<PathBuf>,
    muted: bool,
    list_devices: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        peer: None,
        bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_UDP_PORT)),
        name: std::process::id().to_string(),
        config: None,
        muted: false,
        list_devices: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let value = it.next().context("--bind needs an address")?;
                args.bind = value
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid bind address {}", value))?;
            }
            "--name" => args.name = it.next().context("--name needs a value")?,
            "--config" => args.config = Some(it.next().context("--config needs a path")?.into()),
            "--muted" => args.muted = true,
            "--list-devices" => args.list_devices = true,
            other if other.starts_with("--") => bail!("Unknown option {}", other),
            other => {
                let peer = other
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid peer address {}", other))?;
                args.peer = Some(peer);
            }
        }
    }
    Ok(args)
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();
}

/// Console controls on a side thread
fn spawn_console(handle: SessionHandle, mut muted: bool) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "m" => {
                        muted = !muted;
                        println!("{}", if muted { "Muted" } else { "Unmuted" });
                        handle.set_muted(muted);
                    }
                    "q" => break,
                    _ => println!("m = toggle mute, q = quit"),
                }
            }
            handle.shutdown();
        })
        .map(|_| ())
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }
    let peer = args.peer.context("Missing peer address (e.g. 192.168.1.20:5000)")?;

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    tracing::info!("Starting voice peer {} -> {}", args.name, peer);

    let backend = Arc::new(CpalBackend::new(&config.audio));
    let transport = UdpTransport::bind(args.bind, peer, args.name.clone())
        .context("Failed to open UDP transport")?;

    let mut session = Session::new(config, backend, transport.clone());
    session.on_transition(|t| println!("[{}] -> [{}]", t.from, t.to));

    let handle = session.handle();
    let receiver = transport
        .spawn(handle.clone())
        .context("Failed to spawn transport thread")?;
    spawn_console(handle.clone(), args.muted).context("Failed to spawn console thread")?;

    if args.muted {
        handle.set_muted(true);
    }
    handle.start();

    tracing::info!("Type m to toggle mute, q to quit");
    session.run();

    transport.shutdown();
    if receiver.join().is_err() {
        tracing::error!("Transport thread panicked");
    }
    tracing::info!("Voice peer stopped");
    Ok(())
}
