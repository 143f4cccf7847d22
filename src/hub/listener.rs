//! TCP admission listener
//!
//! Clients announce themselves over TCP: they send their UDP port as a
//! 4-byte little-endian integer, and the hub answers with the server UDP
//! port of the slot it assigned, in the same encoding. The TCP connection
//! is closed right after.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::constants::PORT_EXCHANGE_TIMEOUT;
use crate::error::{Error, PoolError, Result};
use crate::hub::pool::HubPool;

/// Accepts clients and admits them into a [`HubPool`]
pub struct HubListener {
    listener: TcpListener,
    pool: Arc<HubPool>,
}

impl HubListener {
    pub async fn bind(addr: SocketAddr, pool: Arc<HubPool>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Hub listening for clients on {}", listener.local_addr()?);
        Ok(Self { listener, pool })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients forever
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let pool = self.pool.clone();
            tokio::spawn(async move {
                if let Err(e) = admit_connection(stream, peer, &pool).await {
                    tracing::warn!("Client {} not admitted: {}", peer, e);
                }
            });
        }
    }
}

/// Run the port exchange for one TCP connection
pub async fn admit_connection(mut stream: TcpStream, peer: SocketAddr, pool: &Arc<HubPool>) -> Result<u16> {
    let client_port = with_timeout(stream.read_i32_le()).await?;
    let client_port = u16::try_from(client_port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or(PoolError::InvalidClientPort(client_port))?;

    let server_port = pool.admit(peer.ip(), client_port)?;

    with_timeout(stream.write_i32_le(i32::from(server_port))).await?;
    with_timeout(stream.shutdown()).await?;
    Ok(server_port)
}

async fn with_timeout<T>(op: impl std::future::Future<Output = std::io::Result<T>>) -> Result<T> {
    match timeout(PORT_EXCHANGE_TIMEOUT, op).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("port exchange exceeded {:?}", PORT_EXCHANGE_TIMEOUT),
        ))),
    }
}

/// Client side of the port exchange
pub async fn request_server_port(hub: SocketAddr, client_udp_port: u16) -> Result<u16> {
    let mut stream = with_timeout(TcpStream::connect(hub)).await?;
    with_timeout(stream.write_i32_le(i32::from(client_udp_port))).await?;
    let server_port = with_timeout(stream.read_i32_le()).await?;
    u16::try_from(server_port).map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("hub answered with invalid port {}", server_port),
        ))
    })
}
