//! Hub configuration
//!
//! Loaded from a TOML file with three sections:
//!
//! ```toml
//! [hub]
//! tcp_port = 4464
//! base_udp_port = 61002
//! max_clients = 16
//! handshake_timeout_ms = 10000
//!
//! [worker]
//! buffer_queue_length = 4
//! underrun_mode = "wavetable"
//!
//! [session]
//! no_traffic_timeout_ms = 10000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// What the audio engine plays when its buffer runs dry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnderrunMode {
    /// Repeat the last buffer
    #[default]
    Wavetable,
    /// Output silence
    Zeros,
}

/// Where periodic IO statistics are written
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoStatStream {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub hub: PoolConfig,
    pub worker: WorkerSettings,
    pub session: SessionConfig,
}

/// Pool and listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Address the TCP listener binds to
    pub bind_address: String,
    /// TCP port clients announce themselves on
    pub tcp_port: u16,
    /// Server UDP port of slot 0; slot `n` uses `base_udp_port + n`
    pub base_udp_port: u16,
    /// Number of worker slots
    pub max_clients: usize,
    /// How long a worker waits for the first datagram
    pub handshake_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            tcp_port: DEFAULT_HUB_TCP_PORT,
            base_udp_port: DEFAULT_BASE_UDP_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl PoolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Per-worker policy forwarded verbatim to every audio session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub connect_default_audio_ports: bool,
    pub buffer_queue_length: u32,
    pub underrun_mode: UnderrunMode,
    /// Empty means "let the session pick"
    pub client_name: String,
    /// Seconds between IO stat reports, 0 disables them
    pub io_stat_timeout_secs: u32,
    pub io_stat_stream: IoStatStream,
    pub buffer_strategy: u8,
    pub simulated_loss_rate: f64,
    pub simulated_jitter_rate: f64,
    pub simulated_delay_rel: f64,
    pub broadcast_queue: bool,
    pub use_rt_udp_priority: bool,
    /// Offset the session id by the worker id (`id + 1`)
    pub append_thread_id: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            connect_default_audio_ports: true,
            buffer_queue_length: DEFAULT_BUFFER_QUEUE_LENGTH,
            underrun_mode: UnderrunMode::default(),
            client_name: String::new(),
            io_stat_timeout_secs: 0,
            io_stat_stream: IoStatStream::default(),
            buffer_strategy: 1,
            simulated_loss_rate: 0.0,
            simulated_jitter_rate: 0.0,
            simulated_delay_rel: 0.0,
            broadcast_queue: false,
            use_rt_udp_priority: false,
            append_thread_id: false,
        }
    }
}

/// Settings for the built-in loopback session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Silence on the data socket after which the session reports no traffic
    pub no_traffic_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            no_traffic_timeout_ms: DEFAULT_NO_TRAFFIC_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    pub fn no_traffic_timeout(&self) -> Duration {
        Duration::from_millis(self.no_traffic_timeout_ms)
    }
}

impl HubConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Platform config location, e.g. `~/.config/audio-hub/hub.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "audio-hub")
            .map(|dirs| dirs.config_dir().join("hub.toml"))
    }

    /// Render back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject settings the hub cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.hub.max_clients == 0 {
            return Err(Error::Config("max_clients must be at least 1".into()));
        }

        let last_port = self.hub.base_udp_port as usize + self.hub.max_clients - 1;
        if last_port > u16::MAX as usize {
            return Err(Error::Config(format!(
                "UDP port range {}..={} exceeds 65535",
                self.hub.base_udp_port, last_port
            )));
        }

        if self.hub.handshake_timeout_ms == 0 {
            return Err(Error::Config("handshake_timeout_ms must be positive".into()));
        }

        let rates = [
            ("simulated_loss_rate", self.worker.simulated_loss_rate),
            ("simulated_jitter_rate", self.worker.simulated_jitter_rate),
        ];
        for (name, rate) in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::Config(format!("{} must be within [0, 1], got {}", name, rate)));
            }
        }

        if self.worker.simulated_delay_rel < 0.0 {
            return Err(Error::Config("simulated_delay_rel must not be negative".into()));
        }

        Ok(())
    }
}
