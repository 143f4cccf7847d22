//! Hub probe client
//!
//! Announces itself to a hub, sends a handshake header and measures echoes.
//! Usage: `hub-probe [hub_addr] [incoming_channels] [outgoing_channels]`

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_hub::{
    constants::{DEFAULT_HUB_TCP_PORT, MAX_DATAGRAM_SIZE},
    hub::request_server_port,
    protocol::{resolve_channels, PacketHeader},
};

const PROBE_PACKETS: u16 = 20;
const PACKET_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let hub: SocketAddr = args
        .next()
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_HUB_TCP_PORT))
        .parse()
        .context("invalid hub address")?;
    let incoming: u8 = args.next().as_deref().unwrap_or("2").parse().context("invalid incoming channels")?;
    let outgoing: u8 = args.next().as_deref().unwrap_or("0").parse().context("invalid outgoing channels")?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let local_port = socket.local_addr()?.port();

    let server_port = request_server_port(hub, local_port).await?;
    let target = SocketAddr::new(hub.ip(), server_port);
    let expected = resolve_channels(incoming, outgoing);
    tracing::info!(
        "Assigned server port {}, hub should use {} in / {} out",
        server_port,
        expected.input,
        expected.output
    );

    let mut header = PacketHeader {
        timestamp: 0,
        sequence: 0,
        buffer_size: 128,
        sampling_rate: 3,
        bit_resolution: 16,
        incoming_channels: incoming,
        outgoing_channels: outgoing,
    };

    let started = Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut echoes = 0u32;
    let mut rtt_total = Duration::ZERO;

    for sequence in 0..PROBE_PACKETS {
        header.sequence = sequence;
        header.timestamp = started.elapsed().as_micros() as u64;
        let sent_at = Instant::now();
        socket.send_to(&header.to_bytes(), target).await?;

        if let Ok(Ok((len, _))) = tokio::time::timeout(PACKET_INTERVAL, socket.recv_from(&mut buf)).await {
            if audio_hub::protocol::decode(&buf[..len]).is_ok() {
                echoes += 1;
                rtt_total += sent_at.elapsed();
            }
        }
        tokio::time::sleep(PACKET_INTERVAL).await;
    }

    // The first datagram is consumed by the handshake
    println!("\n=== Probe Results ===");
    println!("  Hub:       {}", target);
    println!("  Sent:      {}", PROBE_PACKETS);
    println!("  Echoed:    {}", echoes);
    if echoes > 0 {
        println!("  Mean RTT:  {:?}", rtt_total / echoes);
    }

    Ok(())
}
