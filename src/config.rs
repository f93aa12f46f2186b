//! Application configuration
//!
//! Loaded from a TOML file; every section and field falls back to its default
//! so partial files are fine.
//!
//! ```toml
//! [node]
//! display_name = "Studio"
//!
//! [network]
//! bind_addr = "0.0.0.0:5000"
//! announce = ["255.255.255.255:5000"]
//! presence_interval_ms = 1000
//!
//! [stream]
//! sample_rate = 48000
//! channels = 2
//! chunk_frames = 512
//!
//! [playback]
//! jitter_tolerance = 3
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::audio::StreamFormat;
use crate::constants::*;
use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub stream: StreamFormat,
    pub playback: PlaybackConfig,
}

/// Identity of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub display_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: random_display_name(),
        }
    }
}

/// Socket and discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local endpoint shared by discovery, audio and chat
    pub bind_addr: SocketAddr,
    /// Destinations for presence announcements (broadcast and/or unicast)
    pub announce: Vec<SocketAddr>,
    pub presence_interval_ms: u64,
    /// Defaults to three presence intervals
    pub peer_timeout_ms: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_UDP_PORT)),
            announce: vec![SocketAddr::from((Ipv4Addr::BROADCAST, DEFAULT_UDP_PORT))],
            presence_interval_ms: DEFAULT_PRESENCE_INTERVAL_MS,
            peer_timeout_ms: None,
        }
    }
}

impl NetworkConfig {
    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        match self.peer_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.presence_interval() * PEER_TIMEOUT_FACTOR,
        }
    }

    /// Use `port` for both the local socket and broadcast announcements
    pub fn set_port(&mut self, port: u16) {
        self.bind_addr.set_port(port);
        for target in &mut self.announce {
            if target.ip() == Ipv4Addr::BROADCAST {
                target.set_port(port);
            }
        }
    }
}

/// Receiver jitter buffer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames buffered before the first playout
    pub prefill_frames: usize,
    /// Cycles to wait for a missing frame before skipping past it
    pub jitter_tolerance: u32,
    /// Frames held longer than this are evicted unplayed
    pub max_delay_ms: u64,
    pub capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            prefill_frames: DEFAULT_PREFILL_FRAMES,
            jitter_tolerance: DEFAULT_JITTER_TOLERANCE,
            max_delay_ms: DEFAULT_MAX_BUFFER_DELAY_MS,
            capacity: DEFAULT_JITTER_CAPACITY,
        }
    }
}

impl PlaybackConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Platform config location, e.g. `~/.config/lan-audio-sync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "lan-audio-sync", "lan-audio-sync")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load `path` if given, else the default location if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.stream.validate().map_err(Error::Config)?;

        if self.node.display_name.trim().is_empty() {
            return Err(Error::Config("display name must not be empty".to_string()));
        }
        if self.network.presence_interval_ms == 0 {
            return Err(Error::Config("presence interval must be non-zero".to_string()));
        }
        if self.network.peer_timeout() <= self.network.presence_interval() {
            return Err(Error::Config(
                "peer timeout must exceed the presence interval".to_string(),
            ));
        }
        if self.playback.capacity == 0 {
            return Err(Error::Config("jitter buffer capacity must be non-zero".to_string()));
        }
        if self.playback.prefill_frames > self.playback.capacity {
            return Err(Error::Config(format!(
                "prefill of {} frames exceeds jitter buffer capacity {}",
                self.playback.prefill_frames, self.playback.capacity
            )));
        }
        Ok(())
    }
}

/// Four random alphanumeric characters
fn random_display_name() -> String {
    Uuid::new_v4().simple().to_string()[..4].to_uppercase()
}
