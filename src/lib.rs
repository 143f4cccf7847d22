//! # Audio Hub
//!
//! Admission and handshake layer of a real-time audio-over-UDP hub server.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 HUB                                       │
//! │                                                                           │
//! │  ┌──────────────────────────────┐                                         │
//! │  │  HubListener (hub::listener) │◄──── TCP: client UDP port (i32 LE)      │
//! │  │  port exchange, one per conn │────► TCP: server UDP port (i32 LE)      │
//! │  └──────────────┬───────────────┘                                         │
//! │                 │ admit()                                                 │
//! │                 ▼                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────────┐ │
//! │  │                      HubPool (hub::pool)                             │ │
//! │  │   Slot 0          Slot 1          Slot 2          ...  Slot N-1      │ │
//! │  │  ┌────────┐      ┌────────┐      ┌────────┐           ┌────────┐     │ │
//! │  │  │ Worker │      │ Worker │      │ Worker │           │ Worker │     │ │
//! │  │  └───┬────┘      └────────┘      └────────┘           └────────┘     │ │
//! │  └──────┼──────────────────────────────────────────────────────────────┘ │
//! │         │ run() on a blocking pool thread                                 │
//! │         ▼                                                                 │
//! │  ┌────────────────────────┐     ┌───────────────────────────────────┐    │
//! │  │ Rendezvous             │     │ AudioSession (session)            │    │
//! │  │ bind port, wait for    │────►│ channels from header, start,      │    │
//! │  │ first datagram, decode │     │ supervised until it ends          │    │
//! │  └────────────────────────┘     └───────────────────────────────────┘    │
//! │                                                  │                        │
//! │                                                  ▼                        │
//! │                                   release_thread(id) back to the pool     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// TCP port clients announce themselves on
    pub const DEFAULT_HUB_TCP_PORT: u16 = 4464;

    /// Server UDP port of the first slot
    pub const DEFAULT_BASE_UDP_PORT: u16 = 61002;

    /// Default number of worker slots
    pub const DEFAULT_MAX_CLIENTS: usize = 16;

    /// How long a worker waits for the client's first datagram
    pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

    /// Sleep increment of the handshake wait
    pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Receive timeout of the loopback session's socket
    pub const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Silence after which a session reports missing traffic
    pub const DEFAULT_NO_TRAFFIC_TIMEOUT_MS: u64 = 10_000;

    /// Default session buffer queue length
    pub const DEFAULT_BUFFER_QUEUE_LENGTH: u32 = 4;

    /// Bound on each step of the TCP port exchange
    pub const PORT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Size of the default packet header
    pub const HEADER_LEN: usize = 16;

    /// Largest UDP payload
    pub const MAX_DATAGRAM_SIZE: usize = 65_535;
}
