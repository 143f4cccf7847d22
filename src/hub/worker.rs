//! Hub worker
//!
//! One worker per pool slot. The pool configures it for an incoming client
//! and schedules [`Worker::run`] on a pool thread. `run` performs the
//! handshake, builds and starts the audio session, then sleeps until the
//! session ends or someone asks it to stop. Whatever happens, the slot is
//! handed back to the pool exactly once.
//!
//! ```text
//!  Idle ─configure─► Spawning ─run─► AwaitingHandshake ─► Active ─► Releasing ─► Idle
//!                        │                   │                          ▲
//!                        └───────────────────┴──────── error/timeout ───┘
//! ```
//!
//! `spawning` is true during setup and teardown and false while the session
//! owns the thread (and once the slot is idle again).

use crossbeam_channel::{bounded, select, unbounded, Sender};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkerSettings;
use crate::error::{Error, Result};
use crate::hub::rendezvous::await_peer;
use crate::protocol::ResolvedChannels;
use crate::session::{IoStat, NetIssues, SessionEvent, SessionFactory, SessionLink, SessionParams, SessionRole};

/// Callback the worker uses to hand its slot back
pub trait SlotRelease: Send + Sync {
    fn release_thread(&self, id: usize);
}

/// Per-connection endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Address of the admitted client
    pub client_address: IpAddr,

    /// Slot port the handshake and session bind to
    pub server_port: u16,

    /// Client UDP port announced during admission
    pub client_port: u16,

    pub connect_default_audio_ports: bool,
}

/// Why a supervised session was torn down
#[derive(Debug, Clone, PartialEq)]
pub enum Teardown {
    NoTraffic(Duration),
    Stopped,
    Failed(String),
    StopRequested,
}

/// How one `run` ended, short of an error
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// No datagram arrived before the handshake timeout
    HandshakeTimedOut,
    /// A session ran and was torn down
    Completed(Teardown),
}

#[derive(Debug, Default)]
struct SlotState {
    /// True during setup and teardown
    spawning: bool,

    /// Dropping this sender asks the active session to stop
    stop: Option<Sender<()>>,
}

/// One reusable pool slot
pub struct Worker {
    /// Slot index, fixed for the worker's lifetime
    id: usize,

    /// Session policy shared by every worker of the pool
    settings: Arc<WorkerSettings>,

    /// How long to wait for the client's first datagram
    handshake_timeout: Duration,

    /// Builds the session for each connection
    factory: Arc<dyn SessionFactory>,

    /// Spawning flag and stop token, read by the pool from other threads
    state: Mutex<SlotState>,

    /// Endpoint recorded by the last `configure`
    connection: Mutex<Option<Connection>>,
}

impl Worker {
    pub fn new(
        id: usize,
        settings: Arc<WorkerSettings>,
        handshake_timeout: Duration,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            id,
            settings,
            handshake_timeout,
            factory,
            state: Mutex::new(SlotState::default()),
            connection: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Record the endpoint for the next run and mark the slot as spawning
    pub fn configure(&self, connection: Connection) {
        self.set_spawning(true);
        *self.connection.lock() = Some(connection);
    }

    pub fn connection(&self) -> Option<Connection> {
        self.connection.lock().clone()
    }

    pub fn is_spawning(&self) -> bool {
        self.state.lock().spawning
    }

    /// Ask the active session, if any, to stop. Does not wait for it.
    pub fn stop_thread(&self) {
        if self.state.lock().stop.take().is_some() {
            tracing::info!(worker = self.id, "Stop requested");
        }
    }

    /// Serve one connection. Always releases the slot before returning.
    pub fn run(&self, pool: &dyn SlotRelease) {
        self.set_spawning(true);

        match panic::catch_unwind(AssertUnwindSafe(|| self.serve())) {
            Ok(Ok(RunOutcome::HandshakeTimedOut)) => {
                tracing::info!(worker = self.id, "Client never sent a header, releasing slot");
            }
            Ok(Ok(RunOutcome::Completed(teardown))) => {
                tracing::info!(worker = self.id, ?teardown, "Session finished");
            }
            Ok(Err(e)) => {
                tracing::error!(worker = self.id, "Couldn't serve client: {}", e);
            }
            Err(_) => {
                tracing::error!(worker = self.id, "Worker panicked while serving client");
            }
        }

        self.release(pool);
    }

    fn serve(&self) -> Result<RunOutcome> {
        let connection = self.connection().ok_or(Error::NotConfigured(self.id))?;

        tracing::debug!(worker = self.id, "Creating session");
        let mut session = self.factory.create(self.session_params(&connection))?;

        let Some(peer) = await_peer(connection.server_port, self.handshake_timeout)? else {
            return Ok(RunOutcome::HandshakeTimedOut);
        };

        tracing::info!(
            worker = self.id,
            client = %peer.from,
            input = peer.channels.input,
            output = peer.channels.output,
            "Handshake complete"
        );
        session.set_channels(peer.channels);

        let (event_tx, event_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        // A stop issued during start must reach the session
        self.state.lock().stop = Some(stop_tx);
        session.start(SessionLink::new(event_tx, stop_rx.clone()))?;
        self.set_spawning(false);

        // Every source ends the wait the same way: tear down
        let teardown = select! {
            recv(event_rx) -> event => match event {
                Ok(SessionEvent::NoTraffic(silent)) => Teardown::NoTraffic(silent),
                Ok(SessionEvent::Stopped) | Err(_) => Teardown::Stopped,
                Ok(SessionEvent::Failed(reason)) => Teardown::Failed(reason),
            },
            recv(stop_rx) -> _ => Teardown::StopRequested,
        };

        {
            let mut state = self.state.lock();
            state.spawning = true;
            state.stop = None;
        }
        session.join()?;

        Ok(RunOutcome::Completed(teardown))
    }

    fn release(&self, pool: &dyn SlotRelease) {
        {
            let mut state = self.state.lock();
            state.stop = None;
            state.spawning = false;
        }
        pool.release_thread(self.id);
        tracing::info!(worker = self.id, "Released from the thread pool");
    }

    fn set_spawning(&self, spawning: bool) {
        self.state.lock().spawning = spawning;
    }

    fn session_params(&self, connection: &Connection) -> SessionParams {
        let settings = &self.settings;
        SessionParams {
            role: SessionRole::HubServer,
            channels: ResolvedChannels::new(1, 1),
            buffer_queue_length: settings.buffer_queue_length,
            connect_default_audio_ports: connection.connect_default_audio_ports,
            peer_address: connection.client_address,
            bind_port: connection.server_port,
            peer_port: connection.client_port,
            buffer_strategy: settings.buffer_strategy,
            underrun_mode: settings.underrun_mode,
            net_issues: NetIssues {
                loss_rate: settings.simulated_loss_rate,
                jitter_rate: settings.simulated_jitter_rate,
                delay_rel: settings.simulated_delay_rel,
            },
            broadcast_queue: settings.broadcast_queue,
            use_rt_udp_priority: settings.use_rt_udp_priority,
            io_stat: (settings.io_stat_timeout_secs > 0).then(|| IoStat {
                interval: Duration::from_secs(settings.io_stat_timeout_secs.into()),
                stream: settings.io_stat_stream.clone(),
            }),
            client_name: (!settings.client_name.is_empty()).then(|| settings.client_name.clone()),
            id_offset: settings.append_thread_id.then_some(self.id + 1),
        }
    }
}
