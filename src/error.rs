//! Error types for the audio hub

use thiserror::Error;

/// Main error type for the hub
#[derive(Error, Debug)]
pub enum Error {
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Worker {0} was run before it was configured")]
    NotConfigured(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake rendezvous errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Could not bind UDP port {port}, it may already be bound: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Receive failed: {0}")]
    ReceiveFailed(std::io::Error),

    #[error("Malformed header: got {len} bytes, need at least {expected}")]
    MalformedHeader { len: usize, expected: usize },
}

/// Audio session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session construction failed: {0}")]
    Construction(String),

    #[error("Session start failed: {0}")]
    Start(String),

    #[error("Session runtime fault: {0}")]
    Runtime(String),
}

/// Worker pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("All {0} worker slots are busy")]
    Full(usize),

    #[error("Unknown worker slot: {0}")]
    UnknownSlot(usize),

    #[error("Invalid client port: {0}")]
    InvalidClientPort(i32),
}

/// Result type alias for the hub
pub type Result<T> = std::result::Result<T, Error>;
