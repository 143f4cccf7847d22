//! Worker slot pool
//!
//! Fixed array of reusable [`Worker`]s created at startup. Admitting a
//! client takes the first free slot, configures its worker and schedules
//! `run` on the runtime's blocking thread pool. The worker hands the slot
//! back through [`SlotRelease`] when its connection is over.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::config::HubConfig;
use crate::error::{Error, PoolError};
use crate::hub::worker::{Connection, SlotRelease, Worker};
use crate::session::SessionFactory;

/// Occupied slot details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub client_address: IpAddr,

    pub client_port: u16,

    /// Slot port the client was told to send to
    pub server_port: u16,

    /// When the TCP admission completed
    pub admitted_at: DateTime<Utc>,
}

/// Bounded pool of worker slots
pub struct HubPool {
    /// One worker per slot, created up front
    workers: Vec<Arc<Worker>>,

    /// Occupancy, indexed like `workers`
    slots: Mutex<Vec<Option<SlotInfo>>>,

    /// Server port of slot 0; slot `n` uses `base_udp_port + n`
    base_udp_port: u16,

    connect_default_audio_ports: bool,

    /// Runtime whose blocking pool runs the workers
    runtime: Handle,
}

impl HubPool {
    /// Create `config.hub.max_clients` idle workers. Fails if the config
    /// does not validate.
    pub fn new(config: &HubConfig, factory: Arc<dyn SessionFactory>, runtime: Handle) -> Result<Arc<Self>, Error> {
        config.validate()?;

        let settings = Arc::new(config.worker.clone());
        let timeout = config.hub.handshake_timeout();

        let workers = (0..config.hub.max_clients)
            .map(|id| Arc::new(Worker::new(id, settings.clone(), timeout, factory.clone())))
            .collect();

        Ok(Arc::new(Self {
            workers,
            slots: Mutex::new(vec![None; config.hub.max_clients]),
            base_udp_port: config.hub.base_udp_port,
            connect_default_audio_ports: config.worker.connect_default_audio_ports,
            runtime,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.workers.len()
    }

    /// Server UDP port owned by slot `id`, `None` past the last slot
    pub fn server_port(&self, id: usize) -> Option<u16> {
        if id >= self.workers.len() {
            return None;
        }
        u16::try_from(id).ok().and_then(|id| self.base_udp_port.checked_add(id))
    }

    /// Admit a client: claim a slot, configure it and schedule its worker.
    ///
    /// Returns the server UDP port the client should send its header to.
    pub fn admit(self: &Arc<Self>, client_address: IpAddr, client_port: u16) -> Result<u16, PoolError> {
        let (id, server_port) = {
            let mut slots = self.slots.lock();
            let id = slots
                .iter()
                .enumerate()
                .position(|(id, slot)| slot.is_none() && !self.workers[id].is_spawning())
                .ok_or(PoolError::Full(self.workers.len()))?;
            let server_port = self.server_port(id).ok_or(PoolError::UnknownSlot(id))?;

            slots[id] = Some(SlotInfo {
                client_address,
                client_port,
                server_port,
                admitted_at: Utc::now(),
            });
            self.workers[id].configure(Connection {
                client_address,
                server_port,
                client_port,
                connect_default_audio_ports: self.connect_default_audio_ports,
            });
            (id, server_port)
        };

        let pool = Arc::clone(self);
        let worker = self.workers[id].clone();
        self.runtime.spawn_blocking(move || worker.run(&*pool));

        tracing::info!(
            worker = id,
            client = %client_address,
            client_port,
            server_port,
            "Client admitted"
        );
        Ok(server_port)
    }

    pub fn worker(&self, id: usize) -> Option<&Arc<Worker>> {
        self.workers.get(id)
    }

    pub fn slot_info(&self, id: usize) -> Option<SlotInfo> {
        self.slots.lock().get(id).cloned().flatten()
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    /// Ask every active session to stop
    pub fn stop_all(&self) {
        for worker in &self.workers {
            worker.stop_thread();
        }
    }

    /// Wait until every slot is free, up to `timeout`. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

impl SlotRelease for HubPool {
    fn release_thread(&self, id: usize) {
        let mut slots = self.slots.lock();
        match slots.get_mut(id) {
            Some(slot) if slot.is_some() => {
                if let Some(info) = slot.take() {
                    let held = Utc::now() - info.admitted_at;
                    tracing::debug!(
                        worker = id,
                        client = %info.client_address,
                        held_ms = held.num_milliseconds(),
                        "Slot released"
                    );
                }
            }
            Some(_) => tracing::warn!(worker = id, "Release of a slot that is already free"),
            None => tracing::warn!("{}", PoolError::UnknownSlot(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResolvedChannels;
    use crate::session::testing::*;
    use std::net::Ipv4Addr;
    use std::thread;
    use std::time::Instant;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn config(max_clients: usize, handshake_timeout_ms: u64) -> HubConfig {
        let mut config = HubConfig::default();
        config.hub.max_clients = max_clients;
        config.hub.base_udp_port = free_udp_port();
        config.hub.handshake_timeout_ms = handshake_timeout_ms;
        config
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !cond() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    #[test]
    fn test_admit_until_full() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Script::UntilStopped));
        let config = config(2, 200);
        let pool = HubPool::new(&config, factory, runtime.handle().clone()).unwrap();

        let first = pool.admit(LOCALHOST, 4000).unwrap();
        let second = pool.admit(LOCALHOST, 4001).unwrap();
        assert_eq!(first, config.hub.base_udp_port);
        assert_eq!(second, config.hub.base_udp_port + 1);
        assert!(matches!(pool.admit(LOCALHOST, 4002), Err(PoolError::Full(2))));

        let info = pool.slot_info(1).unwrap();
        assert_eq!(info.client_port, 4001);
        assert_eq!(info.server_port, second);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn test_unanswered_slot_released_after_timeout() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Script::UntilStopped));
        let pool = HubPool::new(&config(1, 200), factory.clone(), runtime.handle().clone()).unwrap();

        let started = Instant::now();
        pool.admit(LOCALHOST, 4000).unwrap();
        assert!(wait_until(Duration::from_secs(3), || pool.active_count() == 0));

        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200));
        assert!(waited <= Duration::from_millis(200 + 100 + 400), "took {:?}", waited);
        assert_eq!(factory.started(), 0);
        assert!(!pool.worker(0).unwrap().is_spawning());
    }

    #[test]
    fn test_slot_reused_after_release() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Script::UntilStopped));
        let pool = HubPool::new(&config(1, 100), factory, runtime.handle().clone()).unwrap();

        let port = pool.admit(LOCALHOST, 4000).unwrap();
        assert!(pool.admit(LOCALHOST, 4001).is_err());
        assert!(wait_until(Duration::from_secs(3), || pool.active_count() == 0));

        assert_eq!(pool.admit(LOCALHOST, 4001).unwrap(), port);
    }

    #[test]
    fn test_end_to_end_stereo_session() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Script::StopAfter(Duration::from_millis(100))));
        let pool = HubPool::new(&config(1, 5000), factory.clone(), runtime.handle().clone()).unwrap();

        let port = pool.admit(LOCALHOST, 4000).unwrap();
        send_header_until(port, &header(2, 0), || factory.started() > 0);
        assert!(wait_until(Duration::from_secs(3), || pool.active_count() == 0));

        let log = factory.log.lock();
        assert_eq!(log.channels, vec![ResolvedChannels::new(2, 2)]);
        assert_eq!(log.created[0].peer_port, 4000);
    }

    #[test]
    fn test_stop_all_ends_sessions() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Script::UntilStopped));
        let pool = HubPool::new(&config(1, 5000), factory.clone(), runtime.handle().clone()).unwrap();

        let port = pool.admit(LOCALHOST, 4000).unwrap();
        send_header_until(port, &header(2, 255), || factory.started() > 0);
        let worker = pool.worker(0).unwrap().clone();
        assert!(wait_until(Duration::from_secs(3), || !worker.is_spawning()));

        pool.stop_all();
        assert!(runtime.block_on(pool.drain(Duration::from_secs(3))));
        assert_eq!(factory.log.lock().channels, vec![ResolvedChannels::new(2, 0)]);
    }

    #[test]
    fn test_port_range_overflow_rejected() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Script::UntilStopped));
        let mut config = config(4, 100);
        config.hub.base_udp_port = u16::MAX - 1;

        let result = HubPool::new(&config, factory, runtime.handle().clone());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_server_port_bounds() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Script::UntilStopped));
        let mut config = config(2, 100);
        config.hub.base_udp_port = u16::MAX - 1;

        let pool = HubPool::new(&config, factory, runtime.handle().clone()).unwrap();
        assert_eq!(pool.server_port(1), Some(u16::MAX));
        assert_eq!(pool.server_port(2), None);
        assert_eq!(pool.server_port(usize::MAX), None);
    }

    #[test]
    fn test_stray_release_ignored() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Script::UntilStopped));
        let pool = HubPool::new(&config(1, 100), factory, runtime.handle().clone()).unwrap();

        pool.release_thread(0);
        pool.release_thread(42);
        assert_eq!(pool.active_count(), 0);
    }
}
