//! Wire protocol shared by every chunkserver connection.
//!
//! All frames are `u32 type, u32 length, payload`, integers big-endian.
//! Message type numbers are grouped in families by the talking parties:
//! `ANTOAN` (anyone to anyone), `ANTOCS`/`CSTOAN` (admin tools),
//! `MATOCS`/`CSTOMA` (master), `CUTOCS`/`CSTOCU` (clients) and `CSTOCS`
//! (chunkserver peers). A command response echoes the chunk id and carries a
//! one byte [Status].

mod codec;
mod msg;
mod status;

pub use codec::{FrameBuilder, PacketReader, ProtoError};
pub use msg::*;
pub use status::Status;

/// Frame header length: type + length, both u32.
pub const HDR_SIZE: usize = 8;

/// Largest frame body accepted on the client and peer ports.
pub const MAX_PACKET_SIZE: u32 = 100_000;

/// Largest frame body accepted on the master connection.
pub const MAX_MASTER_PACKET_SIZE: u32 = 10_000;

/// Split a received 8-byte frame header into `(type, length)`.
pub fn parse_header(hdr: &[u8; HDR_SIZE]) -> (u32, u32) {
    let msg_type = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let length = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    (msg_type, length)
}
