//! Loopback session
//!
//! Stand-in for the streaming engine: binds the slot's data port and echoes
//! every datagram back to whoever sent it. Good enough to exercise the whole
//! admission path with a real client, and to measure round trips.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::IoStatStream;
use crate::constants::{MAX_DATAGRAM_SIZE, SESSION_POLL_INTERVAL};
use crate::error::SessionError;
use crate::protocol::ResolvedChannels;
use crate::session::{AudioSession, IoStat, SessionEvent, SessionFactory, SessionLink, SessionParams};

/// Builds [`LoopbackSession`]s
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    /// Silence after which sessions report missing traffic
    no_traffic_timeout: Duration,
}

impl LoopbackFactory {
    pub fn new(no_traffic_timeout: Duration) -> Self {
        Self { no_traffic_timeout }
    }
}

impl SessionFactory for LoopbackFactory {
    fn create(&self, params: SessionParams) -> Result<Box<dyn AudioSession>, SessionError> {
        Ok(Box::new(LoopbackSession::new(params, self.no_traffic_timeout)))
    }
}

/// Packet counters
#[derive(Debug, Default)]
pub struct LoopbackStats {
    /// Datagrams read from the socket
    pub packets_received: AtomicU64,

    /// Datagrams echoed back
    pub packets_sent: AtomicU64,

    /// Payload bytes read, headers included
    pub bytes_received: AtomicU64,
}

/// Echoing session bound to one slot's UDP port
pub struct LoopbackSession {
    /// Parameters from the worker, channels updated after the handshake
    params: SessionParams,

    /// Silence after which missing traffic is reported
    no_traffic_timeout: Duration,

    /// Counters shared with the echo thread
    stats: Arc<LoopbackStats>,

    /// Echo thread, present between `start` and `join`
    thread_handle: Option<JoinHandle<()>>,
}

impl LoopbackSession {
    pub fn new(params: SessionParams, no_traffic_timeout: Duration) -> Self {
        Self {
            params,
            no_traffic_timeout,
            stats: Arc::new(LoopbackStats::default()),
            thread_handle: None,
        }
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn stats(&self) -> &LoopbackStats {
        &self.stats
    }

    fn name(&self) -> String {
        let base = self.params.client_name.as_deref().unwrap_or("loopback");
        match self.params.id_offset {
            Some(offset) => format!("{}_{}", base, offset),
            None => base.to_string(),
        }
    }
}

impl AudioSession for LoopbackSession {
    fn set_channels(&mut self, channels: ResolvedChannels) {
        self.params.channels = channels;
    }

    fn start(&mut self, link: SessionLink) -> Result<(), SessionError> {
        let port = self.params.bind_port;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| SessionError::Start(format!("bind port {}: {}", port, e)))?;
        socket
            .set_read_timeout(Some(SESSION_POLL_INTERVAL))
            .map_err(|e| SessionError::Start(e.to_string()))?;

        let reporter = match &self.params.io_stat {
            Some(io_stat) => Some(
                IoStatReporter::open(io_stat, self.name())
                    .map_err(|e| SessionError::Start(format!("io stat stream: {}", e)))?,
            ),
            None => None,
        };

        let net = self.params.net_issues;
        if net.loss_rate > 0.0 || net.jitter_rate > 0.0 || net.delay_rel > 0.0 {
            tracing::debug!(?net, "Loopback session does not simulate network issues");
        }
        if self.params.use_rt_udp_priority {
            tracing::debug!("Loopback session runs at normal priority");
        }

        tracing::info!(
            session = %self.name(),
            role = %self.params.role,
            port,
            peer = %self.params.peer_address,
            input = self.params.channels.input,
            output = self.params.channels.output,
            queue = self.params.buffer_queue_length,
            "Loopback session starting"
        );

        let echo = self.params.channels.output > 0;
        let no_traffic_timeout = self.no_traffic_timeout;
        let stats = self.stats.clone();

        let handle = thread::Builder::new()
            .name(format!("loopback-{}", port))
            .spawn(move || echo_loop(socket, link, echo, no_traffic_timeout, stats, reporter))
            .map_err(|e| SessionError::Start(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn join(&mut self) -> Result<(), SessionError> {
        match self.thread_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| SessionError::Runtime("loopback thread panicked".into())),
            None => Ok(()),
        }
    }
}

fn echo_loop(
    socket: UdpSocket,
    link: SessionLink,
    echo: bool,
    no_traffic_timeout: Duration,
    stats: Arc<LoopbackStats>,
    mut reporter: Option<IoStatReporter>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut last_packet = Instant::now();
    let mut silence_reported = false;

    while !link.stop_requested() {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                last_packet = Instant::now();
                silence_reported = false;

                if echo {
                    match socket.send_to(&buf[..len], from) {
                        Ok(_) => {
                            stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => tracing::warn!("Echo to {} failed: {}", from, e),
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset
                ) => {}
            Err(e) => {
                tracing::error!("Loopback receive failed: {}", e);
                link.notify(SessionEvent::Failed(e.to_string()));
                return;
            }
        }

        let silent_for = last_packet.elapsed();
        if !silence_reported && silent_for >= no_traffic_timeout {
            silence_reported = true;
            tracing::info!("No UDP packets for {:?}", silent_for);
            link.notify(SessionEvent::NoTraffic(silent_for));
        }

        if let Some(reporter) = reporter.as_mut() {
            reporter.tick(&stats);
        }
    }

    link.notify(SessionEvent::Stopped);
}

/// Writes packet counters to the configured stream at a fixed interval
struct IoStatReporter {
    /// Session name prefixed to each line
    name: String,

    interval: Duration,

    last_report: Instant,

    /// Stdout, stderr or an appended file
    out: Box<dyn Write + Send>,
}

impl IoStatReporter {
    fn open(io_stat: &IoStat, name: String) -> io::Result<Self> {
        let out: Box<dyn Write + Send> = match &io_stat.stream {
            IoStatStream::Stdout => Box::new(io::stdout()),
            IoStatStream::Stderr => Box::new(io::stderr()),
            IoStatStream::File(path) => {
                Box::new(OpenOptions::new().create(true).append(true).open(path)?)
            }
        };

        Ok(Self {
            name,
            interval: io_stat.interval,
            last_report: Instant::now(),
            out,
        })
    }

    fn tick(&mut self, stats: &LoopbackStats) {
        if self.last_report.elapsed() < self.interval {
            return;
        }
        self.last_report = Instant::now();

        let line = format!(
            "{} {}: rx={} tx={} bytes={}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.name,
            stats.packets_received.load(Ordering::Relaxed),
            stats.packets_sent.load(Ordering::Relaxed),
            stats.bytes_received.load(Ordering::Relaxed),
        );
        if let Err(e) = self.out.write_all(line.as_bytes()).and_then(|_| self.out.flush()) {
            tracing::warn!("IO stat write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{free_udp_port, session_params};
    use crossbeam_channel::{bounded, unbounded};

    fn start_session(
        port: u16,
        channels: ResolvedChannels,
        no_traffic: Duration,
    ) -> (LoopbackSession, crossbeam_channel::Receiver<SessionEvent>, crossbeam_channel::Sender<()>) {
        let mut session = LoopbackSession::new(session_params(port), no_traffic);
        session.set_channels(channels);

        let (event_tx, event_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        session.start(SessionLink::new(event_tx, stop_rx)).unwrap();
        (session, event_rx, stop_tx)
    }

    #[test]
    fn test_echoes_datagrams() {
        let port = free_udp_port();
        let (mut session, events, stop) =
            start_session(port, ResolvedChannels::new(2, 2), Duration::from_secs(10));

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send_to(b"ping", ("127.0.0.1", port)).unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");

        drop(stop);
        session.join().unwrap();
        assert_eq!(events.recv_timeout(Duration::from_secs(1)).unwrap(), SessionEvent::Stopped);
        assert_eq!(session.stats().packets_sent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_disabled_output_does_not_echo() {
        let port = free_udp_port();
        let (mut session, _events, stop) =
            start_session(port, ResolvedChannels::new(2, 0), Duration::from_secs(10));

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        client.send_to(b"ping", ("127.0.0.1", port)).unwrap();

        let mut buf = [0u8; 16];
        assert!(client.recv_from(&mut buf).is_err());

        drop(stop);
        session.join().unwrap();
        assert_eq!(session.stats().packets_received.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reports_missing_traffic() {
        let port = free_udp_port();
        let (mut session, events, stop) =
            start_session(port, ResolvedChannels::new(1, 1), Duration::from_millis(150));

        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            SessionEvent::NoTraffic(silent) => assert!(silent >= Duration::from_millis(150)),
            other => panic!("unexpected event {:?}", other),
        }

        drop(stop);
        session.join().unwrap();
    }

    #[test]
    fn test_start_fails_on_busy_port() {
        let blocker = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = blocker.local_addr().unwrap().port();

        let mut session = LoopbackSession::new(session_params(port), Duration::from_secs(1));
        let (event_tx, _event_rx) = unbounded();
        let (_stop_tx, stop_rx) = bounded::<()>(0);

        let err = session.start(SessionLink::new(event_tx, stop_rx)).unwrap_err();
        assert!(matches!(err, SessionError::Start(_)));
    }

    #[test]
    fn test_io_stats_written_to_file() {
        let path = std::env::temp_dir().join(format!("audio-hub-io-{}.log", free_udp_port()));
        let _ = std::fs::remove_file(&path);

        let port = free_udp_port();
        let mut params = session_params(port);
        params.io_stat = Some(IoStat {
            interval: Duration::from_millis(50),
            stream: IoStatStream::File(path.clone()),
        });
        let mut session = LoopbackSession::new(params, Duration::from_secs(10));
        let (event_tx, _event_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        session.start(SessionLink::new(event_tx, stop_rx)).unwrap();

        thread::sleep(Duration::from_millis(400));
        drop(stop_tx);
        session.join().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("rx=0"));
        let _ = std::fs::remove_file(&path);
    }
}
