//! In-memory chunk entries and chunk file naming.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::folder::Folder;

/// `chunk_<16 hex id>_<8 hex version>.mfs`
static CHUNK_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^chunk_([0-9A-F]{16})_([0-9A-F]{8})\.mfs$").unwrap());

/// Pre-version filename format, version only in the file header.
static LEGACY_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^chunk_([0-9A-F]{16})\.mfs$").unwrap());

pub(crate) fn chunk_file_name(id: u64, version: u32) -> String {
    format!("chunk_{:016X}_{:08X}.mfs", id, version)
}

/// Chunks spread over 16 subdirectories by the low 4 bits of the id.
pub(crate) fn chunk_subdir(id: u64) -> String {
    format!("{:X}", id & 0xF)
}

pub(crate) fn chunk_path(folder: &Path, id: u64, version: u32) -> PathBuf {
    folder
        .join(chunk_subdir(id))
        .join(chunk_file_name(id, version))
}

pub(crate) fn parse_chunk_name(name: &str) -> Option<(u64, u32)> {
    let caps = CHUNK_NAME_REGEX.captures(name)?;
    let id = u64::from_str_radix(&caps[1], 16).ok()?;
    let version = u32::from_str_radix(&caps[2], 16).ok()?;
    Some((id, version))
}

pub(crate) fn parse_legacy_name(name: &str) -> Option<u64> {
    let caps = LEGACY_NAME_REGEX.captures(name)?;
    u64::from_str_radix(&caps[1], 16).ok()
}

pub(crate) struct Chunk {
    pub id: u64,
    pub folder: Arc<Folder>,
    pub state: Mutex<ChunkState>,
}

/// Volatile per-chunk state, guarded by the chunk mutex.
///
/// `file` and `crc` are loaded together on the first `begin_io` and released
/// together by the idle sweeper once `crc_refcount` is back to zero.
pub(crate) struct ChunkState {
    pub path: PathBuf,
    pub version: u32,
    pub blocks: u16,
    pub file: Option<File>,
    pub crc: Option<Box<[u8]>>,
    pub crc_refcount: u16,
    pub crc_dirty: bool,
    pub last_activity: Instant,
}

impl ChunkState {
    pub fn new(path: PathBuf, version: u32, blocks: u16) -> Self {
        ChunkState {
            path,
            version,
            blocks,
            file: None,
            crc: None,
            crc_refcount: 0,
            crc_dirty: false,
            last_activity: Instant::now(),
        }
    }

    pub fn stored_crc(&self, block: u16) -> u32 {
        let tab = self.crc.as_ref().expect("CRC table not loaded");
        let at = block as usize * 4;
        u32::from_le_bytes([tab[at], tab[at + 1], tab[at + 2], tab[at + 3]])
    }

    pub fn set_stored_crc(&mut self, block: u16, crc: u32) {
        let tab = self.crc.as_mut().expect("CRC table not loaded");
        let at = block as usize * 4;
        tab[at..at + 4].copy_from_slice(&crc.to_le_bytes());
        self.crc_dirty = true;
    }
}

/// Write `crc` into a raw header image at the table slot for `block`.
pub(crate) fn patch_crc_entry(header: &mut [u8], block: u16, crc: u32) {
    let at = crate::CHUNK_CRC_OFFSET as usize + block as usize * 4;
    header[at..at + 4].copy_from_slice(&crc.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        let name = chunk_file_name(0x0000_0000_0000_0100, 7);
        assert_eq!(name, "chunk_0000000000000100_00000007.mfs");
        assert_eq!(parse_chunk_name(&name), Some((0x100, 7)));
        assert_eq!(parse_chunk_name("chunk_00.mfs"), None);
        assert_eq!(parse_chunk_name("chunk_0000000000000100_0000000X.mfs"), None);
    }

    #[test]
    fn legacy_name() {
        assert_eq!(
            parse_legacy_name("chunk_00000000000000AB.mfs"),
            Some(0xAB)
        );
        assert_eq!(parse_legacy_name("chunk_00000000000000AB_00000001.mfs"), None);
    }

    #[test]
    fn subdir_is_low_nibble() {
        assert_eq!(chunk_subdir(0x12F), "F");
        assert_eq!(chunk_subdir(0x10), "0");
    }
}
