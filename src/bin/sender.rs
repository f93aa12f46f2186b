//! Audio Sender Application
//!
//! Captures audio (or a test tone) and streams it to every receiver
//! discovered on the LAN. Lines typed on stdin are sent as chat.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_sync::{
    audio::{list_devices, AudioSource, CpalSource, StreamFormat, ToneSource},
    config::AppConfig,
    protocol::Role,
    SessionEvent, StreamSession,
};

#[derive(Parser, Debug)]
#[command(name = "sender", about = "Stream live audio to LAN receivers")]
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

    /// Extra unicast presence target, e.g. a receiver on another subnet
    #[arg(long)]
    announce: Vec<SocketAddr>,

    /// Capture device id (see --list-devices)
    #[arg(short, long)]
    device: Option<String>,

    /// Stream a sine tone at this frequency instead of capturing
    #[arg(long)]
    tone: Option<f32>,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,
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

    tracing::info!("Starting LAN Audio Sender '{}'", config.node.display_name);

    let format = config.stream;
    let session = StreamSession::start(Role::Sender, config)?;
    let mut events = session.subscribe();

    session.start_streaming(open_source(&args, format)?)?;

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
                    "/stats" => {
                        let stats = session.transport_stats();
                        println!(
                            "  {} packets sent ({:.1} KB), {} send errors, {} malformed received",
                            stats.packets_sent,
                            stats.bytes_sent as f64 / 1024.0,
                            stats.send_errors,
                            stats.malformed
                        );
                    }
                    "/start" => {
                        let started = open_source(&args, format)
                            .and_then(|source| Ok(session.start_streaming(source)?));
                        if let Err(e) = started {
                            println!("  cannot start: {}", e);
                        }
                    }
                    "/stop" => session.stop_streaming().await?,
                    _ => send_chat(&session, line).await,
                }
            }
        }
    }

    tracing::info!("Shutting down");
    session.stop().await;
    Ok(())
}

fn open_source(args: &Args, format: StreamFormat) -> Result<Box<dyn AudioSource>> {
    if let Some(frequency) = args.tone {
        tracing::info!("Streaming a {} Hz test tone ({})", frequency, format);
        return Ok(Box::new(ToneSource::new(format, frequency)));
    }
    let source = CpalSource::open(args.device.as_deref(), format)
        .context("failed to open capture device")?;
    Ok(Box::new(source))
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
        SessionEvent::Streaming { state, cause } => match cause {
            Some(cause) => println!("* streaming {:?}: {}", state, cause),
            None => println!("* streaming {:?}", state),
        },
        SessionEvent::Playback { .. } | SessionEvent::Stopped { .. } => {}
    }
}

fn print_devices() {
    println!("\n=== Available Input Devices ===");
    for device in list_devices().iter().filter(|d| d.is_input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}
