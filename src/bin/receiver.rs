//! Audio Receiver Application
//!
//! Discovers the sender on the LAN and plays its stream through a jitter
//! buffer. Lines typed on stdin are sent as chat.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_sync::{
    audio::{list_devices, AudioSink, CpalSink, PcmChunk, StreamFormat},
    config::AppConfig,
    error::DeviceError,
    protocol::Role,
    SessionEvent, StreamSession,
};

#[derive(Parser, Debug)]
#[command(name = "receiver", about = "Play live audio streamed from a LAN sender")]
struct Args {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display name announced to peers
    #[arg(short, long)]
    name: Option<String>,

    /// UDP port for discovery, audio and chat
    #[arg(short, long)]
    port: Option<u16>,

    /// Extra unicast presence target, e.g. the sender's address
    #[arg(long)]
    announce: Vec<SocketAddr>,

    /// Playback device id (see --list-devices)
    #[arg(short, long)]
    device: Option<String>,

    /// Discard audio instead of opening a playback device
    #[arg(long)]
    null_sink: bool,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

/// Sink for hosts without an output device
struct NullSink;

impl AudioSink for NullSink {
    fn play(&mut self, _chunk: &PcmChunk) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(name) = &args.name {
        config.node.display_name = name.clone();
    }
    if let Some(port) = args.port {
        config.network.set_port(port);
    }
    config.network.announce.extend(&args.announce);

    tracing::info!("Starting LAN Audio Receiver '{}'", config.node.display_name);

    let format = config.stream;
    let session = StreamSession::start(Role::Receiver, config)?;
    let mut events = session.subscribe();

    session.start_listening(open_sink(&args, format)?)?;

    println!("Commands: /peers, /stats, /start, /stop, /all <text>, /quit; anything else is chat");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Stopped { cause }) => {
                    if let Some(cause) = cause {
                        tracing::error!("Session stopped: {}", cause);
                    }
                    break;
                }
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} session events", n);
                }
                Err(_) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line {
                    "" => {}
                    "/quit" => break,
                    "/peers" => {
                        for peer in session.peers() {
                            println!("  {} '{}' at {}", peer.role, peer.display_name, peer.address);
                        }
                    }
                    "/stats" => print_stats(&session),
                    "/start" => {
                        let started = open_sink(&args, format)
                            .and_then(|sink| Ok(session.start_listening(sink)?));
                        if let Err(e) = started {
                            println!("  cannot start: {}", e);
                        }
                    }
                    "/stop" => session.stop_listening().await?,
                    _ => send_chat(&session, line).await,
                }
            }
        }
    }

    tracing::info!("Shutting down");
    print_stats(&session);
    session.stop().await;
    Ok(())
}

fn open_sink(args: &Args, format: StreamFormat) -> Result<Box<dyn AudioSink>> {
    if args.null_sink {
        tracing::info!("Discarding received audio ({})", format);
        return Ok(Box::new(NullSink));
    }
    let sink = CpalSink::open(args.device.as_deref(), format)
        .context("failed to open playback device")?;
    Ok(Box::new(sink))
}

async fn send_chat(session: &StreamSession, line: &str) {
    let (text, broadcast) = match line.strip_prefix("/all ") {
        Some(text) => (text, true),
        None => (line, false),
    };
    match session.send_chat(text, broadcast).await {
        Ok(message) => println!("[{}] {}: {}", message.timestamp.format("%H:%M:%S"), message.sender_name, message.text),
        Err(e) => println!("  chat not sent: {}", e),
    }
}

fn print_stats(session: &StreamSession) {
    let transport = session.transport_stats();
    println!(
        "  {} packets received ({:.1} KB), {} malformed",
        transport.packets_received,
        transport.bytes_received as f64 / 1024.0,
        transport.malformed
    );
    if let Some(stats) = session.playback_stats() {
        println!(
            "  played {}, lost {} ({:.1}%), late {}, duplicate {}, expired {}, rejected {}, underruns {}, buffered {}/{}",
            stats.played,
            stats.lost,
            stats.loss_rate() * 100.0,
            stats.late,
            stats.duplicate,
            stats.expired,
            stats.rejected,
            stats.underruns,
            stats.level,
            stats.capacity
        );
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::PeerJoined(peer) => {
            println!("+ {} '{}' joined from {}", peer.role, peer.display_name, peer.address)
        }
        SessionEvent::PeerLeft(peer) => {
            println!("- {} '{}' left ({})", peer.role, peer.display_name, peer.address)
        }
        SessionEvent::Chat { message, .. } => println!(
            "[{}] {}: {}",
            message.timestamp.format("%H:%M:%S"),
            message.sender_name,
            message.text
        ),
        SessionEvent::Playback { state, cause } => match cause {
            Some(cause) => println!("* playback {:?}: {}", state, cause),
            None => println!("* playback {:?}", state),
        },
        SessionEvent::Streaming { .. } | SessionEvent::Stopped { .. } => {}
    }
}

fn print_devices() {
    println!("\n=== Available Output Devices ===");
    for device in list_devices().iter().filter(|d| d.is_output) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}
