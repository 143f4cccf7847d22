//! Test doubles shared by the worker, pool and listener tests

use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::UnderrunMode;
use crate::error::SessionError;
use crate::hub::SlotRelease;
use crate::protocol::{PacketHeader, ResolvedChannels};
use crate::session::{
    AudioSession, NetIssues, SessionEvent, SessionFactory, SessionLink, SessionParams, SessionRole,
};

/// Ask the OS for a UDP port that is free right now
pub fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

pub fn session_params(port: u16) -> SessionParams {
    SessionParams {
        role: SessionRole::HubServer,
        channels: ResolvedChannels::new(1, 1),
        buffer_queue_length: 4,
        connect_default_audio_ports: false,
        peer_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bind_port: port,
        peer_port: 0,
        buffer_strategy: 1,
        underrun_mode: UnderrunMode::Wavetable,
        net_issues: NetIssues::default(),
        broadcast_queue: false,
        use_rt_udp_priority: false,
        io_stat: None,
        client_name: None,
        id_offset: None,
    }
}

pub fn header(incoming: u8, outgoing: u8) -> PacketHeader {
    PacketHeader {
        timestamp: 1,
        sequence: 0,
        buffer_size: 128,
        sampling_rate: 3,
        bit_resolution: 16,
        incoming_channels: incoming,
        outgoing_channels: outgoing,
    }
}

/// Keep sending `header` to a local port until `done` returns true
pub fn send_header_until(port: u16, header: &PacketHeader, done: impl Fn() -> bool) {
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    let bytes = header.to_bytes();
    let deadline = Instant::now() + Duration::from_secs(10);

    while !done() {
        assert!(Instant::now() < deadline, "peer never picked up the header");
        let _ = client.send_to(&bytes, ("127.0.0.1", port));
        thread::sleep(Duration::from_millis(25));
    }
}

/// What a scripted session does once started
#[derive(Debug, Clone)]
pub enum Script {
    /// Finish on its own after a delay
    StopAfter(Duration),
    /// Report a fault after a delay
    FailAfter(Duration),
    /// Report missing traffic after a delay, then wait for a stop
    NoTrafficAfter(Duration),
    /// Run until asked to stop
    UntilStopped,
    /// Block inside `start` for a while, then run until asked to stop
    SlowStart(Duration),
    /// Finish after a delay but take as long again to wind down
    Linger(Duration),
    /// Refuse to start
    RejectStart,
    /// Panic inside `start`
    PanicOnStart,
}

/// Everything the scripted sessions saw
#[derive(Debug, Default)]
pub struct SessionLog {
    pub created: Vec<SessionParams>,
    pub channels: Vec<ResolvedChannels>,
    /// Calls that entered `start`, including ones still inside it
    pub starting: usize,
    pub started: usize,
    pub joined: usize,
}

pub struct ScriptedFactory {
    script: Script,
    reject_create: bool,
    pub log: Arc<Mutex<SessionLog>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            reject_create: false,
            log: Arc::new(Mutex::new(SessionLog::default())),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_create: true,
            ..Self::new(Script::UntilStopped)
        }
    }

    pub fn started(&self) -> usize {
        self.log.lock().started
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(&self, params: SessionParams) -> Result<Box<dyn AudioSession>, SessionError> {
        if self.reject_create {
            return Err(SessionError::Construction("scripted rejection".into()));
        }
        self.log.lock().created.push(params);
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            log: self.log.clone(),
            handle: None,
        }))
    }
}

struct ScriptedSession {
    script: Script,
    log: Arc<Mutex<SessionLog>>,
    handle: Option<JoinHandle<()>>,
}

impl AudioSession for ScriptedSession {
    fn set_channels(&mut self, channels: ResolvedChannels) {
        self.log.lock().channels.push(channels);
    }

    fn start(&mut self, link: SessionLink) -> Result<(), SessionError> {
        self.log.lock().starting += 1;
        match self.script {
            Script::RejectStart => return Err(SessionError::Start("scripted rejection".into())),
            Script::PanicOnStart => panic!("scripted panic"),
            Script::SlowStart(delay) => thread::sleep(delay),
            _ => {}
        }

        let script = self.script.clone();
        self.handle = Some(thread::spawn(move || match script {
            Script::StopAfter(delay) => {
                thread::sleep(delay);
                link.notify(SessionEvent::Stopped);
            }
            Script::FailAfter(delay) => {
                thread::sleep(delay);
                link.notify(SessionEvent::Failed("scripted fault".into()));
            }
            Script::Linger(delay) => {
                thread::sleep(delay);
                link.notify(SessionEvent::Stopped);
                thread::sleep(delay);
            }
            Script::NoTrafficAfter(delay) => {
                thread::sleep(delay);
                link.notify(SessionEvent::NoTraffic(delay));
                let _ = link.stop_signal().recv();
                link.notify(SessionEvent::Stopped);
            }
            _ => {
                let _ = link.stop_signal().recv();
                link.notify(SessionEvent::Stopped);
            }
        }));

        self.log.lock().started += 1;
        Ok(())
    }

    fn join(&mut self) -> Result<(), SessionError> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| SessionError::Runtime("scripted thread panicked".into()))?;
        }
        self.log.lock().joined += 1;
        Ok(())
    }
}

/// Pool stand-in that only records releases
#[derive(Debug, Default)]
pub struct RecordingPool {
    pub released: Mutex<Vec<usize>>,
}

impl RecordingPool {
    pub fn release_count(&self, id: usize) -> usize {
        self.released.lock().iter().filter(|&&released| released == id).count()
    }
}

impl SlotRelease for RecordingPool {
    fn release_thread(&self, id: usize) {
        self.released.lock().push(id);
    }
}
