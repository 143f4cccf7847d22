//! Audio session interface
//!
//! The streaming engine is not part of the hub core. A worker only builds a
//! session from a [`SessionFactory`], hands it the channel counts learned in
//! the handshake, starts it, and waits for it to finish.
//!
//! Sessions talk back through a [`SessionLink`]:
//!
//! ```text
//!   Worker                              AudioSession
//!     │  start(link) ─────────────────────────►│
//!     │                                        │
//!     │◄──────── SessionEvent::NoTraffic ──────│
//!     │◄──────── SessionEvent::Stopped ────────│
//!     │◄──────── SessionEvent::Failed ─────────│
//!     │                                        │
//!     │  stop (sender dropped) ───────────────►│ link.stop_requested()
//!     │  join() ──────────────────────────────►│
//! ```

pub mod loopback;

#[cfg(test)]
pub(crate) mod testing;

pub use loopback::{LoopbackFactory, LoopbackSession};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::config::{IoStatStream, UnderrunMode};
use crate::error::SessionError;
use crate::protocol::ResolvedChannels;

/// Role the session plays towards its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Peer-to-peer server, one client
    Server,
    /// Hub server slot, waits for the client to ping first
    HubServer,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::HubServer => write!(f, "hub-server"),
        }
    }
}

/// Simulated network impairments
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetIssues {
    /// Fraction of packets dropped, 0.0 to 1.0
    pub loss_rate: f64,

    /// Fraction of packets delayed, 0.0 to 1.0
    pub jitter_rate: f64,

    /// Delay applied to jittered packets, relative to the packet period
    pub delay_rel: f64,
}

/// Periodic IO statistics reporting
#[derive(Debug, Clone, PartialEq)]
pub struct IoStat {
    /// Time between two reports
    pub interval: Duration,

    /// Where reports are written
    pub stream: IoStatStream,
}

/// Everything a session is built with
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    /// Transport mode the session runs in
    pub role: SessionRole,

    /// Placeholder until the handshake resolves the real counts
    pub channels: ResolvedChannels,

    /// Packets queued by the jitter buffer
    pub buffer_queue_length: u32,

    /// Wire the session to the default audio ports once started
    pub connect_default_audio_ports: bool,

    /// Client address datagrams are sent to
    pub peer_address: IpAddr,

    /// Local port the session binds its own socket to
    pub bind_port: u16,

    /// Client UDP port datagrams are sent to
    pub peer_port: u16,

    /// Jitter buffer strategy selector, passed through untouched
    pub buffer_strategy: u8,

    /// What to play when the buffer runs dry
    pub underrun_mode: UnderrunMode,

    /// Simulated impairments for testing
    pub net_issues: NetIssues,

    /// Use the broadcast output queue
    pub broadcast_queue: bool,

    /// Request realtime scheduling priority for the UDP threads
    pub use_rt_udp_priority: bool,

    /// Periodic IO statistics, `None` to disable
    pub io_stat: Option<IoStat>,

    /// Name the session registers under
    pub client_name: Option<String>,

    /// Numeric suffix for the session id
    pub id_offset: Option<usize>,
}

/// Notifications a session sends to its worker
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// No packets arrived for the given duration
    NoTraffic(Duration),
    /// The session finished its processes
    Stopped,
    /// The session hit a fault
    Failed(String),
}

/// Session side of the worker/session wiring
#[derive(Debug, Clone)]
pub struct SessionLink {
    /// Notifications back to the worker
    events: Sender<SessionEvent>,

    /// Disconnects when the worker asks for a stop
    stop: Receiver<()>,
}

impl SessionLink {
    pub fn new(events: Sender<SessionEvent>, stop: Receiver<()>) -> Self {
        Self { events, stop }
    }

    /// Report an event. Returns false once nobody listens any more.
    pub fn notify(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// True once the worker asked the session to stop
    pub fn stop_requested(&self) -> bool {
        matches!(self.stop.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that disconnects when a stop is requested, for use in `select!`
    pub fn stop_signal(&self) -> &Receiver<()> {
        &self.stop
    }
}

/// A streaming engine instance driven by a worker
pub trait AudioSession: Send {
    /// Apply the channel counts resolved from the handshake
    fn set_channels(&mut self, channels: ResolvedChannels);

    /// Start streaming. Must not block for the lifetime of the session.
    fn start(&mut self, link: SessionLink) -> Result<(), SessionError>;

    /// Wait for the session's processes to finish after a stop request
    fn join(&mut self) -> Result<(), SessionError>;
}

/// Builds sessions for workers
pub trait SessionFactory: Send + Sync {
    fn create(&self, params: SessionParams) -> Result<Box<dyn AudioSession>, SessionError>;
}
