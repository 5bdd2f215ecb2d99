//! Local chunk store.
//!
//! A chunk is one regular file: a 1 KiB magic header (`"MFSC 1.0"`, chunk id,
//! version), a 4 KiB CRC table (1024 little-endian u32, one per block), then
//! up to 1024 contiguous 64 KiB data blocks. The file always ends on a block
//! boundary; a shorter logical length only shows up as the chunk's block
//! count.
//!
//! The store keeps an in-memory index over every configured folder, tracks
//! folder usage and I/O errors, and closes idle chunk files from a periodic
//! sweep. All operations are callable from worker threads; events that the
//! master must hear about (damaged or lost chunks, folder errors) are queued
//! and drained by the event loop via [ChunkStore::take_reports].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

mod chunk;
mod folder;
mod store;

pub use folder::{DiskInfo, FolderConfig};
pub use store::{ChunkOp, ChunkStore, Report, SpaceInfo, StatsSnapshot};

/// Data block size; the unit of CRC protection.
pub const BLOCK_SIZE: usize = 0x10000;

/// Maximum number of data blocks in one chunk.
pub const MAX_BLOCKS: u16 = 1024;

/// Maximum logical chunk length (64 MiB).
pub const MAX_CHUNK_SIZE: u32 = 0x0400_0000;

/// Magic header plus CRC table; data blocks start here.
pub const CHUNK_HEADER_SIZE: u64 = 1024 + 4096;

/// Offset of the CRC table within the header.
pub const CHUNK_CRC_OFFSET: u64 = 1024;

pub const CHUNK_MAGIC: &[u8; 8] = b"MFSC 1.0";

/// Idle time after which the sweeper flushes and closes an open chunk.
pub const CLOSE_DELAY: Duration = Duration::from_secs(60);

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// CRC-32 of a full block of zeroes, computed once.
pub fn empty_block_crc() -> u32 {
    static CRC: Lazy<u32> = Lazy::new(|| crc32(&[0u8; BLOCK_SIZE]));
    *CRC
}

/// Wall-clock seconds, used for folder error timestamps.
pub(crate) fn wall_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
