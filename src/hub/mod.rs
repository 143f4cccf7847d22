//! Hub admission: pool, workers, handshake and the TCP listener

pub mod listener;
pub mod pool;
pub mod rendezvous;
pub mod worker;

pub use listener::{request_server_port, HubListener};
pub use pool::{HubPool, SlotInfo};
pub use rendezvous::{await_peer, PeerHandshake, Rendezvous};
pub use worker::{Connection, RunOutcome, SlotRelease, Teardown, Worker};
