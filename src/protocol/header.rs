//! Default packet header codec
//!
//! Every datagram a peer sends starts with a fixed 16-byte header. The hub
//! only reads it once, from the first datagram of a connection, to learn the
//! peer's audio parameters.
//!
//! ```text
//! 0        8      10      12   13   14   15   16
//! ├────────┼──────┼───────┼────┼────┼────┼────┤
//! │ tstamp │ seq  │ frames│ sr │bits│ in │ out│
//! └────────┴──────┴───────┴────┴────┴────┴────┘
//!   u64 LE  u16 LE u16 LE  u8   u8   u8   u8
//! ```

use bytes::{Buf, BufMut};

use crate::constants::HEADER_LEN;
use crate::error::HandshakeError;

/// Sampling rate as carried in the header (an index, not a frequency)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingRate {
    Sr22,
    Sr32,
    Sr44,
    Sr48,
    Sr88,
    Sr96,
    Sr192,
    Undefined(u8),
}

impl SamplingRate {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Sr22,
            1 => Self::Sr32,
            2 => Self::Sr44,
            3 => Self::Sr48,
            4 => Self::Sr88,
            5 => Self::Sr96,
            6 => Self::Sr192,
            other => Self::Undefined(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Sr22 => 0,
            Self::Sr32 => 1,
            Self::Sr44 => 2,
            Self::Sr48 => 3,
            Self::Sr88 => 4,
            Self::Sr96 => 5,
            Self::Sr192 => 6,
            Self::Undefined(code) => *code,
        }
    }

    /// Frequency in Hz, `None` for codes the hub does not know
    pub fn hz(&self) -> Option<u32> {
        match self {
            Self::Sr22 => Some(22_050),
            Self::Sr32 => Some(32_000),
            Self::Sr44 => Some(44_100),
            Self::Sr48 => Some(48_000),
            Self::Sr88 => Some(88_200),
            Self::Sr96 => Some(96_000),
            Self::Sr192 => Some(192_000),
            Self::Undefined(_) => None,
        }
    }
}

/// Decoded default packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub timestamp: u64,
    pub sequence: u16,
    pub buffer_size: u16,
    pub sampling_rate: u8,
    pub bit_resolution: u8,
    pub incoming_channels: u8,
    pub outgoing_channels: u8,
}

impl PacketHeader {
    /// Append the wire form of this header to `buf`
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.timestamp);
        buf.put_u16_le(self.sequence);
        buf.put_u16_le(self.buffer_size);
        buf.put_u8(self.sampling_rate);
        buf.put_u8(self.bit_resolution);
        buf.put_u8(self.incoming_channels);
        buf.put_u8(self.outgoing_channels);
    }

    /// Wire form as an owned buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        self.encode(&mut buf);
        buf
    }

    /// The five fields the handshake cares about
    pub fn peer_params(&self) -> PeerParams {
        PeerParams {
            buffer_size: self.buffer_size,
            sampling_rate: SamplingRate::from_code(self.sampling_rate),
            bit_resolution: self.bit_resolution,
            incoming_channels: self.incoming_channels,
            outgoing_channels: self.outgoing_channels,
        }
    }
}

/// Peer audio parameters announced in the first datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerParams {
    pub buffer_size: u16,
    pub sampling_rate: SamplingRate,
    pub bit_resolution: u8,
    pub incoming_channels: u8,
    /// Outgoing channel count, or a legacy connection-mode value
    pub outgoing_channels: u8,
}

/// Decode the header at the start of a datagram.
///
/// Bytes past the header (the audio payload) are ignored.
pub fn decode(datagram: &[u8]) -> Result<PacketHeader, HandshakeError> {
    if datagram.len() < HEADER_LEN {
        return Err(HandshakeError::MalformedHeader {
            len: datagram.len(),
            expected: HEADER_LEN,
        });
    }

    let mut buf = &datagram[..HEADER_LEN];
    Ok(PacketHeader {
        timestamp: buf.get_u64_le(),
        sequence: buf.get_u16_le(),
        buffer_size: buf.get_u16_le(),
        sampling_rate: buf.get_u8(),
        bit_resolution: buf.get_u8(),
        incoming_channels: buf.get_u8(),
        outgoing_channels: buf.get_u8(),
    })
}
