//! Handshake rendezvous
//!
//! Before a session opens its own transport, the worker binds the slot's
//! UDP port once and waits for the client's first datagram. The header of
//! that datagram tells us how many channels the peer sends and expects.
//! The socket is closed as soon as the datagram is read; the session binds
//! the port again for the data path.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use crate::constants::{HANDSHAKE_POLL_INTERVAL, MAX_DATAGRAM_SIZE};
use crate::error::HandshakeError;
use crate::protocol::{self, resolve_channels, PeerParams, ResolvedChannels};

/// What the hub learned from the peer's first datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Source of the first datagram
    pub from: SocketAddr,

    /// Audio parameters from the header
    pub params: PeerParams,

    /// Channel counts the session should use
    pub channels: ResolvedChannels,
}

/// A bound handshake socket waiting for one datagram
pub struct Rendezvous {
    /// Non-blocking, closed when `wait` returns
    socket: UdpSocket,

    /// Port actually bound, resolved when binding port 0
    port: u16,

    /// Sleep between two receive attempts
    poll_interval: Duration,
}

impl Rendezvous {
    /// Bind `port` on all interfaces
    pub fn bind(port: u16) -> Result<Self, HandshakeError> {
        let bind_failed = |source: io::Error| HandshakeError::BindFailed { port, source };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_failed)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into()).map_err(bind_failed)?;
        socket.set_nonblocking(true).map_err(bind_failed)?;

        let socket: UdpSocket = socket.into();
        let port = socket.local_addr().map_err(bind_failed)?.port();

        Ok(Self {
            socket,
            port,
            poll_interval: HANDSHAKE_POLL_INTERVAL,
        })
    }

    /// Override the poll increment
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Take the pending datagram into a buffer of exactly its length
    fn receive(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut peek = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = self.socket.peek_from(&mut peek)?;

        let mut buf = vec![0u8; len];
        let (read, from) = self.socket.recv_from(&mut buf)?;
        buf.truncate(read);
        Ok((buf, from))
    }

    /// Wait for the first datagram.
    ///
    /// Elapsed time is only checked between poll increments, so a timeout
    /// is noticed up to one increment late. Returns `Ok(None)` when nothing
    /// arrived in time.
    pub fn wait(self, timeout: Duration) -> Result<Option<PeerHandshake>, HandshakeError> {
        let mut elapsed = Duration::ZERO;

        let received = loop {
            match self.receive() {
                Ok(received) => break Some(received),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionReset) => {}
                Err(e) => return Err(HandshakeError::ReceiveFailed(e)),
            }

            if elapsed > timeout {
                break None;
            }
            thread::sleep(self.poll_interval);
            elapsed += self.poll_interval;
            tracing::trace!(port = self.port, "Handshake elapsed time: {:?}", elapsed);
        };

        let port = self.port;
        drop(self.socket);

        let Some((buf, from)) = received else {
            tracing::info!(port, "Not receiving datagrams (timeout after {:?})", elapsed);
            return Ok(None);
        };

        let header = protocol::decode(&buf)?;
        let params = header.peer_params();
        let channels = resolve_channels(params.incoming_channels, params.outgoing_channels);

        tracing::debug!(
            port,
            %from,
            buffer_size = params.buffer_size,
            sampling_rate = ?params.sampling_rate,
            bit_resolution = params.bit_resolution,
            incoming = params.incoming_channels,
            outgoing = params.outgoing_channels,
            "Peer header received"
        );

        Ok(Some(PeerHandshake {
            from,
            params,
            channels,
        }))
    }
}

/// Bind `port` and wait up to `timeout` for the peer's header
pub fn await_peer(port: u16, timeout: Duration) -> Result<Option<PeerHandshake>, HandshakeError> {
    Rendezvous::bind(port)?.wait(timeout)
}
