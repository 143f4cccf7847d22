//! Wire-level pieces of the handshake

pub mod channels;
pub mod header;

pub use channels::{resolve_channels, ResolvedChannels};
pub use header::{decode, PacketHeader, PeerParams, SamplingRate};
