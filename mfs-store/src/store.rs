//! The chunk store: index, folders and every chunk operation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

use mfs_proto::Status;

use crate::chunk::{
    chunk_file_name, chunk_path, parse_chunk_name, parse_legacy_name, patch_crc_entry, Chunk,
    ChunkState,
};
use crate::folder::{Folder, FolderConfig};
use crate::{
    crc32, empty_block_crc, wall_secs, DiskInfo, BLOCK_SIZE, CHUNK_CRC_OFFSET, CHUNK_HEADER_SIZE,
    CHUNK_MAGIC, CLOSE_DELAY, MAX_BLOCKS, MAX_CHUNK_SIZE,
};

/// Events queued for the master connection; the event loop drains them with
/// [ChunkStore::take_reports] and turns each into an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    ChunkDamaged(u64),
    ChunkLost(u64),
    ErrorOccurred,
}

/// Aggregate space figures, split between regular and draining folders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    pub used: u64,
    pub total: u64,
    pub chunk_count: u32,
    pub td_used: u64,
    pub td_total: u64,
    pub td_chunk_count: u32,
}

/// One master chunk command; the job pool hands these to [ChunkStore::apply].
#[derive(Debug, Clone, Copy)]
pub enum ChunkOp {
    Create {
        id: u64,
        version: u32,
    },
    Delete {
        id: u64,
        version: u32,
    },
    SetVersion {
        id: u64,
        version: u32,
        old_version: u32,
    },
    Duplicate {
        id: u64,
        version: u32,
        src_id: u64,
        src_version: u32,
    },
    Truncate {
        id: u64,
        length: u32,
        version: u32,
        old_version: u32,
    },
    DupTrunc {
        id: u64,
        version: u32,
        src_id: u64,
        src_version: u32,
        length: u32,
    },
}

impl ChunkOp {
    pub fn chunk_id(&self) -> u64 {
        match *self {
            ChunkOp::Create { id, .. }
            | ChunkOp::Delete { id, .. }
            | ChunkOp::SetVersion { id, .. }
            | ChunkOp::Duplicate { id, .. }
            | ChunkOp::Truncate { id, .. }
            | ChunkOp::DupTrunc { id, .. } => id,
        }
    }
}

#[derive(Default)]
struct Stats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    ops_read: AtomicU64,
    ops_written: AtomicU64,
    data_bytes_read: AtomicU64,
    data_bytes_written: AtomicU64,
    data_ops_read: AtomicU64,
    data_ops_written: AtomicU64,
    read_time_us: AtomicU64,
    write_time_us: AtomicU64,
}

/// Take-and-reset counter snapshot feeding the charts collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub ops_read: u64,
    pub ops_written: u64,
    pub data_bytes_read: u64,
    pub data_bytes_written: u64,
    pub data_ops_read: u64,
    pub data_ops_written: u64,
    pub read_time_us: u64,
    pub write_time_us: u64,
}

struct Registry {
    chunks: HashMap<u64, Arc<Chunk>>,
    folders: Vec<Arc<Folder>>,
    damaged: Vec<Arc<Folder>>,
    /// Chunk ids with a CRC table loaded and a file descriptor open.
    open_chunks: Vec<u64>,
}

pub struct ChunkStore {
    registry: Mutex<Registry>,
    reports: Mutex<Vec<Report>>,
    stats: Stats,
}

impl ChunkStore {
    /// Open every configured folder, scan it for chunk files and build the
    /// index. Fails when no folder is usable or a folder is locked by
    /// another process.
    pub fn open(configs: &[FolderConfig]) -> Result<Self, Error> {
        let mut folders: Vec<Arc<Folder>> = Vec::new();
        let mut chunks: HashMap<u64, Arc<Chunk>> = HashMap::new();

        for cfg in configs {
            let folder = Folder::open(cfg)?;
            for prev in &folders {
                if prev.dev == folder.dev {
                    if prev.ino == folder.ino {
                        bail!(
                            "data folder {:?} already configured (same lock file as {:?})",
                            cfg.path,
                            prev.path
                        );
                    }
                    log::warn!(
                        "data folders {:?} and {:?} are on the same physical device",
                        cfg.path,
                        prev.path
                    );
                }
            }
            let folder = Arc::new(folder);
            scan_folder(&folder, &mut chunks)?;
            folder.refresh_usage();
            folders.push(folder);
        }

        if folders.is_empty() {
            bail!("no usable data folders configured");
        }

        Ok(ChunkStore {
            registry: Mutex::new(Registry {
                chunks,
                folders,
                damaged: Vec::new(),
                open_chunks: Vec::new(),
            }),
            reports: Mutex::new(Vec::new()),
            stats: Stats::default(),
        })
    }

    fn find(&self, id: u64) -> Option<Arc<Chunk>> {
        self.registry.lock().unwrap().chunks.get(&id).cloned()
    }

    fn push_report(&self, report: Report) {
        self.reports.lock().unwrap().push(report);
    }

    pub fn take_reports(&self) -> Vec<Report> {
        std::mem::take(&mut *self.reports.lock().unwrap())
    }

    /// Record an I/O error against the chunk's folder and tell the master.
    fn chunk_error(&self, chunk: &Chunk) {
        chunk.folder.note_error(chunk.id, wall_secs());
        self.push_report(Report::ErrorOccurred);
    }

    fn io_failed(&self, chunk: &Chunk) -> Status {
        self.chunk_error(chunk);
        self.push_report(Report::ChunkDamaged(chunk.id));
        Status::Io
    }

    // ---- I/O guard -------------------------------------------------------

    /// Make sure the chunk file is open and its CRC table resident.
    /// Returns whether this call opened it (the caller then registers the
    /// chunk on the open list once the state lock is released).
    fn ensure_open(&self, chunk: &Chunk, state: &mut ChunkState) -> Result<bool, Status> {
        if state.crc.is_some() {
            return Ok(false);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&state.path)
            .map_err(|err| {
                log::warn!("open {:?} failed - {}", state.path, err);
                Status::Io
            })?;
        let mut tab = vec![0u8; 4096].into_boxed_slice();
        file.read_exact_at(&mut tab, CHUNK_CRC_OFFSET).map_err(|err| {
            log::warn!("CRC table read on {:?} failed - {}", state.path, err);
            Status::Io
        })?;
        self.stats.ops_read.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(4096, Ordering::Relaxed);
        state.file = Some(file);
        state.crc = Some(tab);
        state.crc_dirty = false;
        Ok(true)
    }

    fn register_open(&self, id: u64) {
        let mut reg = self.registry.lock().unwrap();
        if !reg.open_chunks.contains(&id) {
            reg.open_chunks.push(id);
        }
    }

    /// Reference the chunk's CRC table and file for a run of block I/O.
    pub fn begin_io(&self, id: u64) -> Result<(), Status> {
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let newly_opened;
        {
            let mut state = chunk.state.lock().unwrap();
            newly_opened = self.ensure_open(&chunk, &mut state).map_err(|status| {
                self.chunk_error(&chunk);
                self.push_report(Report::ChunkDamaged(id));
                status
            })?;
            state.crc_refcount += 1;
        }
        if newly_opened {
            self.register_open(id);
        }
        Ok(())
    }

    /// Drop one I/O reference; the sweeper flushes and closes later.
    pub fn end_io(&self, id: u64) -> Result<(), Status> {
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let mut state = chunk.state.lock().unwrap();
        if state.crc_refcount > 0 {
            state.crc_refcount -= 1;
        }
        if state.crc_refcount == 0 {
            state.last_activity = Instant::now();
        }
        Ok(())
    }

    fn write_crc_table(&self, chunk: &Chunk, state: &mut ChunkState) -> Result<(), Status> {
        let tab = state.crc.take().expect("CRC table not loaded");
        let res = state
            .file
            .as_ref()
            .expect("chunk file not open")
            .write_all_at(&tab, CHUNK_CRC_OFFSET);
        self.stats.ops_written.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(4096, Ordering::Relaxed);
        chunk.folder.state.lock().unwrap().needs_refresh = true;
        if let Err(err) = res {
            log::warn!("CRC table write on {:?} failed - {}", state.path, err);
            return Err(Status::Io);
        }
        state.crc_dirty = false;
        Ok(())
    }

    /// Flush dirty CRC tables and close files idle longer than `max_idle`.
    pub(crate) fn sweep_idle_for(&self, max_idle: Duration) {
        let ids: Vec<u64> = self.registry.lock().unwrap().open_chunks.clone();
        let now = Instant::now();
        for id in ids {
            let mut evict = true;
            if let Some(chunk) = self.find(id) {
                let mut state = chunk.state.lock().unwrap();
                if state.crc.is_none() {
                    // already closed elsewhere, just forget it
                } else if state.crc_refcount == 0
                    && now.duration_since(state.last_activity) >= max_idle
                {
                    if state.crc_dirty {
                        if self.write_crc_table(&chunk, &mut state).is_err() {
                            self.chunk_error(&chunk);
                            self.push_report(Report::ChunkDamaged(id));
                        }
                    } else {
                        state.crc = None;
                    }
                    state.file = None;
                } else {
                    evict = false;
                }
            }
            if evict {
                let mut reg = self.registry.lock().unwrap();
                reg.open_chunks.retain(|&o| o != id);
            }
        }
    }

    pub fn sweep_idle(&self) {
        self.sweep_idle_for(CLOSE_DELAY);
    }

    /// Flush and close everything, used at shutdown.
    pub fn flush_all(&self) {
        self.sweep_idle_for(Duration::ZERO);
    }

    // ---- lookups ---------------------------------------------------------

    pub fn check_chunk(&self, id: u64, version: u32) -> Result<(), Status> {
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let state = chunk.state.lock().unwrap();
        if version > 0 && state.version != version {
            return Err(Status::WrongVersion);
        }
        Ok(())
    }

    pub fn blocks(&self, id: u64, version: u32) -> Result<u16, Status> {
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let state = chunk.state.lock().unwrap();
        if version > 0 && state.version != version {
            return Err(Status::WrongVersion);
        }
        Ok(state.blocks)
    }

    pub fn chunk_count(&self) -> u32 {
        self.registry.lock().unwrap().chunks.len() as u32
    }

    /// `(chunk id, version)` of every indexed chunk, with bit 31 of the
    /// version marking chunks on draining folders; the registration payload.
    pub fn chunk_list(&self) -> Vec<(u64, u32)> {
        let reg = self.registry.lock().unwrap();
        reg.chunks
            .values()
            .map(|chunk| {
                let mut version = chunk.state.lock().unwrap().version;
                if chunk.folder.to_delete {
                    version |= mfs_proto::REGISTER_TODEL_BIT;
                }
                (chunk.id, version)
            })
            .collect()
    }

    // ---- block I/O -------------------------------------------------------

    fn block_pos(block: u16) -> u64 {
        CHUNK_HEADER_SIZE + (block as u64) * BLOCK_SIZE as u64
    }

    fn check_block_args(block: u16, offset: u32, size: u32) -> Result<(), Status> {
        if block >= MAX_BLOCKS {
            return Err(Status::BnumTooBig);
        }
        if size as usize > BLOCK_SIZE {
            return Err(Status::WrongSize);
        }
        if offset as usize >= BLOCK_SIZE || (offset + size) as usize > BLOCK_SIZE {
            return Err(Status::WrongOffset);
        }
        Ok(())
    }

    /// Read `size` bytes at `offset` inside one block. The whole block is
    /// read and checked against its stored CRC; the returned CRC covers just
    /// the requested range. Blocks past the current end read as zeroes.
    pub fn read_block(
        &self,
        id: u64,
        version: u32,
        block: u16,
        offset: u32,
        size: u32,
    ) -> Result<(Vec<u8>, u32), Status> {
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let mut state = chunk.state.lock().unwrap();
        if version > 0 && state.version != version {
            return Err(Status::WrongVersion);
        }
        Self::check_block_args(block, offset, size)?;

        if block >= state.blocks {
            let buf = vec![0u8; size as usize];
            let crc = if size as usize == BLOCK_SIZE {
                empty_block_crc()
            } else {
                crc32(&buf)
            };
            return Ok((buf, crc));
        }

        if state.crc.is_none() {
            log::warn!("read on chunk {:016X} outside an I/O window", id);
            return Err(Status::Io);
        }

        let start = Instant::now();
        let mut full = vec![0u8; BLOCK_SIZE];
        let res = state
            .file
            .as_ref()
            .expect("chunk file not open")
            .read_exact_at(&mut full, Self::block_pos(block));
        self.stats.data_ops_read.fetch_add(1, Ordering::Relaxed);
        self.stats
            .data_bytes_read
            .fetch_add(BLOCK_SIZE as u64, Ordering::Relaxed);
        self.stats
            .read_time_us
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        if let Err(err) = res {
            log::warn!("read {:?} block {} failed - {}", state.path, block, err);
            drop(state);
            return Err(self.io_failed(&chunk));
        }
        if crc32(&full) != state.stored_crc(block) {
            log::warn!("CRC mismatch on {:?} block {}", state.path, block);
            drop(state);
            self.chunk_error(&chunk);
            self.push_report(Report::ChunkDamaged(id));
            return Err(Status::Crc);
        }

        let range = &full[offset as usize..(offset + size) as usize];
        let crc = crc32(range);
        Ok((range.to_vec(), crc))
    }

    /// Write `data` at `offset` inside one block. `crc` must be the CRC-32
    /// of `data`. Full-block writes past the end grow the chunk, filling
    /// skipped CRC slots with the zero-block CRC; partial writes
    /// read-modify-write the existing block.
    pub fn write_block(
        &self,
        id: u64,
        version: u32,
        block: u16,
        offset: u32,
        crc: u32,
        data: &[u8],
    ) -> Result<(), Status> {
        let size = data.len() as u32;
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let mut state = chunk.state.lock().unwrap();
        if version > 0 && state.version != version {
            return Err(Status::WrongVersion);
        }
        Self::check_block_args(block, offset, size)?;
        if crc != crc32(data) {
            drop(state);
            self.chunk_error(&chunk);
            self.push_report(Report::ChunkDamaged(id));
            return Err(Status::Crc);
        }
        if state.crc.is_none() {
            log::warn!("write on chunk {:016X} outside an I/O window", id);
            return Err(Status::Io);
        }

        if offset == 0 && size as usize == BLOCK_SIZE {
            if block >= state.blocks {
                for skipped in state.blocks..block {
                    state.set_stored_crc(skipped, empty_block_crc());
                }
                state.blocks = block + 1;
            }
            let start = Instant::now();
            let res = state
                .file
                .as_ref()
                .expect("chunk file not open")
                .write_all_at(data, Self::block_pos(block));
            self.stats.data_ops_written.fetch_add(1, Ordering::Relaxed);
            self.stats
                .data_bytes_written
                .fetch_add(BLOCK_SIZE as u64, Ordering::Relaxed);
            self.stats
                .write_time_us
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
            if let Err(err) = res {
                log::warn!("write {:?} block {} failed - {}", state.path, block, err);
                drop(state);
                return Err(self.io_failed(&chunk));
            }
            state.set_stored_crc(block, crc);
        } else {
            let mut full = vec![0u8; BLOCK_SIZE];
            if block < state.blocks {
                let start = Instant::now();
                let res = state
                    .file
                    .as_ref()
                    .expect("chunk file not open")
                    .read_exact_at(&mut full, Self::block_pos(block));
                self.stats.data_ops_read.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .data_bytes_read
                    .fetch_add(BLOCK_SIZE as u64, Ordering::Relaxed);
                self.stats
                    .read_time_us
                    .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
                if let Err(err) = res {
                    log::warn!("read {:?} block {} failed - {}", state.path, block, err);
                    drop(state);
                    return Err(self.io_failed(&chunk));
                }
                if crc32(&full) != state.stored_crc(block) {
                    log::warn!("CRC mismatch on {:?} block {}", state.path, block);
                    drop(state);
                    self.chunk_error(&chunk);
                    self.push_report(Report::ChunkDamaged(id));
                    return Err(Status::Crc);
                }
            } else {
                let new_end = Self::block_pos(block) + BLOCK_SIZE as u64;
                if let Err(err) = state.file.as_ref().unwrap().set_len(new_end) {
                    log::warn!("extend {:?} failed - {}", state.path, err);
                    drop(state);
                    return Err(self.io_failed(&chunk));
                }
                for skipped in state.blocks..block {
                    state.set_stored_crc(skipped, empty_block_crc());
                }
                state.blocks = block + 1;
            }
            full[offset as usize..(offset + size) as usize].copy_from_slice(data);
            let start = Instant::now();
            let res = state
                .file
                .as_ref()
                .unwrap()
                .write_all_at(data, Self::block_pos(block) + offset as u64);
            self.stats.data_ops_written.fetch_add(1, Ordering::Relaxed);
            self.stats
                .data_bytes_written
                .fetch_add(size as u64, Ordering::Relaxed);
            self.stats
                .write_time_us
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
            if let Err(err) = res {
                log::warn!("write {:?} block {} failed - {}", state.path, block, err);
                drop(state);
                return Err(self.io_failed(&chunk));
            }
            state.set_stored_crc(block, crc32(&full));
        }
        Ok(())
    }

    // ---- checksums -------------------------------------------------------

    /// CRC-32 over the whole stored CRC table.
    pub fn checksum(&self, id: u64, version: u32) -> Result<u32, Status> {
        self.check_chunk(id, version)?;
        self.begin_io(id)?;
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let sum = {
            let state = chunk.state.lock().unwrap();
            crc32(state.crc.as_ref().expect("CRC table not loaded"))
        };
        let _ = self.end_io(id);
        Ok(sum)
    }

    /// A copy of the stored 4 KiB CRC table.
    pub fn checksum_tab(&self, id: u64, version: u32) -> Result<Vec<u8>, Status> {
        self.check_chunk(id, version)?;
        self.begin_io(id)?;
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let tab = {
            let state = chunk.state.lock().unwrap();
            state.crc.as_ref().expect("CRC table not loaded").to_vec()
        };
        let _ = self.end_io(id);
        Ok(tab)
    }

    // ---- chunk operations ------------------------------------------------

    pub fn apply(&self, op: &ChunkOp) -> Result<(), Status> {
        match *op {
            ChunkOp::Create { id, version } => self.create(id, version),
            ChunkOp::Delete { id, version } => self.delete(id, version),
            ChunkOp::SetVersion {
                id,
                version,
                old_version,
            } => self.set_version(id, version, old_version),
            ChunkOp::Duplicate {
                id,
                version,
                src_id,
                src_version,
            } => self.duplicate(id, version, src_id, src_version),
            ChunkOp::Truncate {
                id,
                length,
                version,
                old_version,
            } => self.truncate(id, length, version, old_version),
            ChunkOp::DupTrunc {
                id,
                version,
                src_id,
                src_version,
                length,
            } => self.duptrunc(id, version, src_id, src_version, length),
        }
    }

    /// Register a new chunk entry on the emptiest folder. The caller still
    /// has to produce the file; `unregister` undoes this on failure.
    fn register_new(&self, id: u64, version: u32) -> Result<Arc<Chunk>, Status> {
        let mut reg = self.registry.lock().unwrap();
        if reg.chunks.contains_key(&id) {
            return Err(Status::ChunkExist);
        }
        let mut best: Option<(f64, Arc<Folder>)> = None;
        for folder in &reg.folders {
            if folder.to_delete {
                continue;
            }
            let state = folder.state.lock().unwrap();
            if state.total == 0 || state.avail == 0 {
                continue;
            }
            let ratio = state.avail as f64 / state.total as f64;
            if best.as_ref().map_or(true, |(b, _)| ratio > *b) {
                best = Some((ratio, Arc::clone(folder)));
            }
        }
        let (_, folder) = best.ok_or(Status::NoSpace)?;
        let path = chunk_path(&folder.path, id, version);
        let chunk = Arc::new(Chunk {
            id,
            folder: Arc::clone(&folder),
            state: Mutex::new(ChunkState::new(path, version, 0)),
        });
        reg.chunks.insert(id, Arc::clone(&chunk));
        let mut fstate = folder.state.lock().unwrap();
        fstate.chunk_count += 1;
        fstate.needs_refresh = true;
        Ok(chunk)
    }

    fn unregister(&self, id: u64) {
        let mut reg = self.registry.lock().unwrap();
        if let Some(chunk) = reg.chunks.remove(&id) {
            let mut fstate = chunk.folder.state.lock().unwrap();
            fstate.chunk_count = fstate.chunk_count.saturating_sub(1);
            fstate.needs_refresh = true;
        }
    }

    fn fresh_header(id: u64, version: u32) -> Vec<u8> {
        let mut header = vec![0u8; CHUNK_HEADER_SIZE as usize];
        header[..8].copy_from_slice(CHUNK_MAGIC);
        header[8..16].copy_from_slice(&id.to_be_bytes());
        header[16..20].copy_from_slice(&version.to_be_bytes());
        header
    }

    pub fn create(&self, id: u64, version: u32) -> Result<(), Status> {
        let chunk = self.register_new(id, version)?;
        let path = chunk.state.lock().unwrap().path.clone();
        let res = File::create(&path).and_then(|mut file| {
            file.write_all(&Self::fresh_header(id, version))
        });
        self.stats.ops_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(CHUNK_HEADER_SIZE, Ordering::Relaxed);
        if let Err(err) = res {
            log::warn!("create chunk {:?} failed - {}", path, err);
            self.chunk_error(&chunk);
            let _ = std::fs::remove_file(&path);
            self.unregister(id);
            return Err(Status::Io);
        }
        Ok(())
    }

    pub fn delete(&self, id: u64, version: u32) -> Result<(), Status> {
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        {
            let state = chunk.state.lock().unwrap();
            if version > 0 && state.version != version {
                return Err(Status::WrongVersion);
            }
            if let Err(err) = std::fs::remove_file(&state.path) {
                log::warn!("unlink {:?} failed - {}", state.path, err);
                drop(state);
                self.chunk_error(&chunk);
                return Err(Status::Io);
            }
        }
        self.unregister(id);
        Ok(())
    }

    /// Rename the chunk file to carry `version`, then rewrite the version
    /// field in the header. The rename happens first, so a crash in between
    /// leaves a file whose name already matches what the master will record.
    fn bump_version(&self, chunk: &Chunk, state: &mut ChunkState, version: u32) -> Result<(), Status> {
        let new_path = chunk_path(&chunk.folder.path, chunk.id, version);
        if let Err(err) = std::fs::rename(&state.path, &new_path) {
            log::warn!("rename {:?} -> {:?} failed - {}", state.path, new_path, err);
            self.chunk_error(chunk);
            return Err(Status::Io);
        }
        state.path = new_path;
        state.version = version;
        let res = OpenOptions::new()
            .write(true)
            .open(&state.path)
            .and_then(|file| file.write_all_at(&version.to_be_bytes(), 16));
        self.stats.ops_written.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(4, Ordering::Relaxed);
        if let Err(err) = res {
            log::warn!("version rewrite on {:?} failed - {}", state.path, err);
            self.chunk_error(chunk);
            return Err(Status::Io);
        }
        Ok(())
    }

    pub fn set_version(&self, id: u64, version: u32, old_version: u32) -> Result<(), Status> {
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let mut state = chunk.state.lock().unwrap();
        if old_version > 0 && state.version != old_version {
            return Err(Status::WrongVersion);
        }
        self.bump_version(&chunk, &mut state, version)
    }

    pub fn truncate(
        &self,
        id: u64,
        length: u32,
        version: u32,
        old_version: u32,
    ) -> Result<(), Status> {
        if length > MAX_CHUNK_SIZE {
            return Err(Status::WrongSize);
        }
        let chunk = self.find(id).ok_or(Status::NoChunk)?;
        let mut state = chunk.state.lock().unwrap();
        if old_version > 0 && state.version != old_version {
            return Err(Status::WrongVersion);
        }
        self.bump_version(&chunk, &mut state, version)?;

        let newly_opened = self.ensure_open(&chunk, &mut state).map_err(|status| {
            self.chunk_error(&chunk);
            self.push_report(Report::ChunkDamaged(id));
            status
        })?;

        let result = self.truncate_open(&chunk, &mut state, length);
        match result {
            Ok(()) => {
                state.last_activity = Instant::now();
                drop(state);
                if newly_opened {
                    self.register_open(id);
                }
                Ok(())
            }
            Err(status) => {
                if newly_opened && state.crc_refcount == 0 {
                    state.file = None;
                    state.crc = None;
                }
                drop(state);
                self.chunk_error(&chunk);
                self.push_report(Report::ChunkDamaged(id));
                Err(status)
            }
        }
    }

    /// Resize an already open chunk; the version bump happened first.
    fn truncate_open(
        &self,
        chunk: &Chunk,
        state: &mut ChunkState,
        length: u32,
    ) -> Result<(), Status> {
        let new_blocks = ((length as u64 + 0xFFFF) >> 16) as u16;
        let file_len = |blocks: u16| CHUNK_HEADER_SIZE + (blocks as u64) * BLOCK_SIZE as u64;

        if new_blocks > state.blocks {
            if let Err(err) = state.file.as_ref().unwrap().set_len(file_len(new_blocks)) {
                log::warn!("extend {:?} failed - {}", state.path, err);
                return Err(Status::Io);
            }
            for b in state.blocks..new_blocks {
                state.set_stored_crc(b, empty_block_crc());
            }
        } else {
            let tail = length as usize & 0xFFFF;
            if let Err(err) = state
                .file
                .as_ref()
                .unwrap()
                .set_len(CHUNK_HEADER_SIZE + length as u64)
            {
                log::warn!("truncate {:?} failed - {}", state.path, err);
                return Err(Status::Io);
            }
            if tail > 0 {
                // re-extend to the block boundary and rebuild the CRC of the
                // now zero-padded final block
                if let Err(err) = state.file.as_ref().unwrap().set_len(file_len(new_blocks)) {
                    log::warn!("extend {:?} failed - {}", state.path, err);
                    return Err(Status::Io);
                }
                let mut full = vec![0u8; BLOCK_SIZE];
                let res = state
                    .file
                    .as_ref()
                    .unwrap()
                    .read_exact_at(&mut full[..tail], Self::block_pos(new_blocks - 1));
                self.stats.ops_read.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_read
                    .fetch_add(tail as u64, Ordering::Relaxed);
                if let Err(err) = res {
                    log::warn!("tail read on {:?} failed - {}", state.path, err);
                    return Err(Status::Io);
                }
                state.set_stored_crc(new_blocks - 1, crc32(&full));
            }
        }
        if state.blocks != new_blocks {
            chunk.folder.state.lock().unwrap().needs_refresh = true;
        }
        state.blocks = new_blocks;
        Ok(())
    }

    /// Snapshot `(path, version, blocks)` of the copy source.
    fn dup_source(&self, src_id: u64, src_version: u32) -> Result<(std::path::PathBuf, u32, u16), Status> {
        let src = self.find(src_id).ok_or(Status::NoChunk)?;
        let state = src.state.lock().unwrap();
        if src_version > 0 && state.version != src_version {
            return Err(Status::WrongVersion);
        }
        Ok((state.path.clone(), state.version, state.blocks))
    }

    fn dup_failed(&self, id: u64, path: &Path) -> Status {
        let _ = std::fs::remove_file(path);
        self.unregister(id);
        Status::Io
    }

    fn src_read_failed(&self, src_id: u64) {
        if let Some(src) = self.find(src_id) {
            self.chunk_error(&src);
        }
        self.push_report(Report::ChunkDamaged(src_id));
    }

    pub fn duplicate(
        &self,
        id: u64,
        version: u32,
        src_id: u64,
        src_version: u32,
    ) -> Result<(), Status> {
        let (src_path, src_ver, src_blocks) = self.dup_source(src_id, src_version)?;
        let version = if version == 0 { src_ver } else { version };
        let chunk = self.register_new(id, version)?;
        let path = chunk.state.lock().unwrap().path.clone();

        let mut src_file = match File::open(&src_path) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("open {:?} failed - {}", src_path, err);
                self.src_read_failed(src_id);
                return Err(self.dup_failed(id, &path));
            }
        };
        let mut header = vec![0u8; CHUNK_HEADER_SIZE as usize];
        if let Err(err) = src_file.read_exact(&mut header) {
            log::warn!("header read on {:?} failed - {}", src_path, err);
            self.src_read_failed(src_id);
            return Err(self.dup_failed(id, &path));
        }
        self.stats.ops_read.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(CHUNK_HEADER_SIZE, Ordering::Relaxed);
        header[8..16].copy_from_slice(&id.to_be_bytes());
        header[16..20].copy_from_slice(&version.to_be_bytes());

        let dst_file = match File::create(&path) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("create {:?} failed - {}", path, err);
                self.chunk_error(&chunk);
                return Err(self.dup_failed(id, &path));
            }
        };
        if let Err(err) = dst_file.write_all_at(&header, 0) {
            log::warn!("header write on {:?} failed - {}", path, err);
            self.chunk_error(&chunk);
            return Err(self.dup_failed(id, &path));
        }
        self.stats.ops_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(CHUNK_HEADER_SIZE, Ordering::Relaxed);

        let mut buf = vec![0u8; BLOCK_SIZE];
        for block in 0..src_blocks {
            if let Err(err) = src_file.read_exact(&mut buf) {
                log::warn!("data read on {:?} failed - {}", src_path, err);
                self.src_read_failed(src_id);
                return Err(self.dup_failed(id, &path));
            }
            self.stats.ops_read.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_read
                .fetch_add(BLOCK_SIZE as u64, Ordering::Relaxed);
            if let Err(err) = dst_file.write_all_at(&buf, Self::block_pos(block)) {
                log::warn!("data write on {:?} failed - {}", path, err);
                self.chunk_error(&chunk);
                return Err(self.dup_failed(id, &path));
            }
            self.stats.ops_written.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_written
                .fetch_add(BLOCK_SIZE as u64, Ordering::Relaxed);
        }

        chunk.state.lock().unwrap().blocks = src_blocks;
        Ok(())
    }

    pub fn duptrunc(
        &self,
        id: u64,
        version: u32,
        src_id: u64,
        src_version: u32,
        length: u32,
    ) -> Result<(), Status> {
        if length > MAX_CHUNK_SIZE {
            return Err(Status::WrongSize);
        }
        let (src_path, src_ver, src_blocks) = self.dup_source(src_id, src_version)?;
        let version = if version == 0 { src_ver } else { version };
        let chunk = self.register_new(id, version)?;
        let path = chunk.state.lock().unwrap().path.clone();
        let new_blocks = ((length as u64 + 0xFFFF) >> 16) as u16;

        let mut src_file = match File::open(&src_path) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("open {:?} failed - {}", src_path, err);
                self.src_read_failed(src_id);
                return Err(self.dup_failed(id, &path));
            }
        };
        let mut header = vec![0u8; CHUNK_HEADER_SIZE as usize];
        if let Err(err) = src_file.read_exact(&mut header) {
            log::warn!("header read on {:?} failed - {}", src_path, err);
            self.src_read_failed(src_id);
            return Err(self.dup_failed(id, &path));
        }
        self.stats.ops_read.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(CHUNK_HEADER_SIZE, Ordering::Relaxed);
        header[8..16].copy_from_slice(&id.to_be_bytes());
        header[16..20].copy_from_slice(&version.to_be_bytes());

        let dst_file = match File::create(&path) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("create {:?} failed - {}", path, err);
                self.chunk_error(&chunk);
                return Err(self.dup_failed(id, &path));
            }
        };

        let mut copy_block = |block: u16, buf: &mut [u8]| -> Result<(), Status> {
            if let Err(err) = src_file.read_exact(buf) {
                log::warn!("data read on {:?} failed - {}", src_path, err);
                self.src_read_failed(src_id);
                return Err(Status::Io);
            }
            self.stats.ops_read.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_read
                .fetch_add(buf.len() as u64, Ordering::Relaxed);
            if let Err(err) = dst_file.write_all_at(buf, Self::block_pos(block)) {
                log::warn!("data write on {:?} failed - {}", path, err);
                self.chunk_error(&chunk);
                return Err(Status::Io);
            }
            self.stats.ops_written.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_written
                .fetch_add(buf.len() as u64, Ordering::Relaxed);
            Ok(())
        };

        let mut buf = vec![0u8; BLOCK_SIZE];
        if new_blocks > src_blocks {
            // expanding: copy everything, extend, zero-CRC the new tail
            for block in 0..src_blocks {
                if copy_block(block, &mut buf).is_err() {
                    return Err(self.dup_failed(id, &path));
                }
            }
            if let Err(err) = dst_file.set_len(CHUNK_HEADER_SIZE + (new_blocks as u64) * BLOCK_SIZE as u64)
            {
                log::warn!("extend {:?} failed - {}", path, err);
                self.chunk_error(&chunk);
                return Err(self.dup_failed(id, &path));
            }
            for block in src_blocks..new_blocks {
                patch_crc_entry(&mut header, block, empty_block_crc());
            }
        } else {
            let tail = length as usize & 0xFFFF;
            if tail == 0 {
                for block in 0..new_blocks {
                    if copy_block(block, &mut buf).is_err() {
                        return Err(self.dup_failed(id, &path));
                    }
                }
            } else {
                for block in 0..new_blocks - 1 {
                    if copy_block(block, &mut buf).is_err() {
                        return Err(self.dup_failed(id, &path));
                    }
                }
                buf.fill(0);
                if let Err(err) = src_file.read_exact(&mut buf[..tail]) {
                    log::warn!("data read on {:?} failed - {}", src_path, err);
                    self.src_read_failed(src_id);
                    return Err(self.dup_failed(id, &path));
                }
                self.stats.ops_read.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_read.fetch_add(tail as u64, Ordering::Relaxed);
                if let Err(err) = dst_file.write_all_at(&buf, Self::block_pos(new_blocks - 1)) {
                    log::warn!("data write on {:?} failed - {}", path, err);
                    self.chunk_error(&chunk);
                    return Err(self.dup_failed(id, &path));
                }
                self.stats.ops_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_written
                    .fetch_add(BLOCK_SIZE as u64, Ordering::Relaxed);
                patch_crc_entry(&mut header, new_blocks - 1, crc32(&buf));
            }
        }

        if let Err(err) = dst_file.write_all_at(&header, 0) {
            log::warn!("header write on {:?} failed - {}", path, err);
            self.chunk_error(&chunk);
            return Err(self.dup_failed(id, &path));
        }
        self.stats.ops_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(CHUNK_HEADER_SIZE, Ordering::Relaxed);

        chunk.state.lock().unwrap().blocks = new_blocks;
        Ok(())
    }

    // ---- space + folders -------------------------------------------------

    fn space_of(folders: &[Arc<Folder>]) -> SpaceInfo {
        let mut info = SpaceInfo::default();
        for folder in folders {
            let state = folder.state.lock().unwrap();
            if folder.to_delete {
                info.td_used += state.total.saturating_sub(state.avail);
                info.td_total += state.total;
                info.td_chunk_count += state.chunk_count;
            } else {
                info.used += state.total.saturating_sub(state.avail);
                info.total += state.total;
                info.chunk_count += state.chunk_count;
            }
        }
        info
    }

    pub fn space(&self) -> SpaceInfo {
        Self::space_of(&self.registry.lock().unwrap().folders)
    }

    /// Per-second housekeeping: evict folders that crossed the error
    /// threshold (reporting every chunk on them lost) and refresh marked
    /// folders. Returns the new aggregate when anything changed.
    pub fn collect_space(&self) -> Option<SpaceInfo> {
        let now = wall_secs();
        let mut changed = false;
        let mut reg = self.registry.lock().unwrap();

        let mut i = 0;
        while i < reg.folders.len() {
            let folder = Arc::clone(&reg.folders[i]);
            if folder.is_damaged(now) {
                log::warn!(
                    "{} errors within {} seconds on folder {:?} - taking it out of service",
                    crate::folder::LAST_ERR_SIZE,
                    crate::folder::LAST_ERR_TIME,
                    folder.path
                );
                let ids: Vec<u64> = reg
                    .chunks
                    .iter()
                    .filter(|(_, c)| Arc::ptr_eq(&c.folder, &folder))
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    if let Some(chunk) = reg.chunks.remove(&id) {
                        let mut state = chunk.state.lock().unwrap();
                        state.file = None;
                        state.crc = None;
                        drop(state);
                        self.push_report(Report::ChunkLost(id));
                    }
                    reg.open_chunks.retain(|&o| o != id);
                }
                reg.folders.remove(i);
                reg.damaged.push(folder);
                changed = true;
            } else {
                if folder.state.lock().unwrap().needs_refresh {
                    folder.refresh_usage();
                    changed = true;
                }
                i += 1;
            }
        }

        if changed {
            Some(Self::space_of(&reg.folders))
        } else {
            None
        }
    }

    /// Once a minute: flag every folder for a statvfs refresh.
    pub fn mark_refresh_needed(&self) {
        let reg = self.registry.lock().unwrap();
        for folder in &reg.folders {
            folder.state.lock().unwrap().needs_refresh = true;
        }
    }

    pub fn disk_info(&self) -> Vec<DiskInfo> {
        let reg = self.registry.lock().unwrap();
        let mut out = Vec::with_capacity(reg.folders.len() + reg.damaged.len());
        for (folders, damaged) in [(&reg.folders, false), (&reg.damaged, true)] {
            for folder in folders.iter() {
                let state = folder.state.lock().unwrap();
                let last = folder.last_error();
                out.push(DiskInfo {
                    path: folder.path.to_string_lossy().into_owned(),
                    flags: u8::from(folder.to_delete) + if damaged { 2 } else { 0 },
                    last_error_chunk: last.chunk_id,
                    last_error_time: last.timestamp as u32,
                    used: state.total.saturating_sub(state.avail),
                    total: state.total,
                    chunk_count: state.chunk_count,
                });
            }
        }
        out
    }

    pub fn take_stats(&self) -> StatsSnapshot {
        let take = |a: &AtomicU64| a.swap(0, Ordering::Relaxed);
        StatsSnapshot {
            bytes_read: take(&self.stats.bytes_read),
            bytes_written: take(&self.stats.bytes_written),
            ops_read: take(&self.stats.ops_read),
            ops_written: take(&self.stats.ops_written),
            data_bytes_read: take(&self.stats.data_bytes_read),
            data_bytes_written: take(&self.stats.data_bytes_written),
            data_ops_read: take(&self.stats.data_ops_read),
            data_ops_written: take(&self.stats.data_ops_written),
            read_time_us: take(&self.stats.read_time_us),
            write_time_us: take(&self.stats.write_time_us),
        }
    }

    #[cfg(test)]
    fn open_chunk_ids(&self) -> Vec<u64> {
        self.registry.lock().unwrap().open_chunks.clone()
    }
}

/// Index every valid chunk file under the folder, creating the 16 hash
/// subdirectories on the way. Files in the legacy naming format are renamed;
/// malformed or truncated files are removed; duplicate chunk ids keep the
/// higher version.
fn scan_folder(folder: &Arc<Folder>, chunks: &mut HashMap<u64, Arc<Chunk>>) -> Result<(), Error> {
    for sub in 0..16u8 {
        let dir = folder.path.join(format!("{:X}", sub));
        std::fs::create_dir_all(&dir)
            .map_err(|err| format_err!("unable to create {:?} - {}", dir, err))?;
    }

    for entry in walkdir::WalkDir::new(&folder.path)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = match entry.file_name().to_str() {
            Some(name) => name,
            None => continue,
        };
        let mut path = entry.path().to_path_buf();

        let (id, version) = if let Some(parsed) = parse_chunk_name(name) {
            parsed
        } else if let Some(id) = parse_legacy_name(name) {
            match upgrade_legacy_chunk(&mut path, id) {
                Some(version) => (id, version),
                None => continue,
            }
        } else {
            continue;
        };

        let len = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        if len < CHUNK_HEADER_SIZE
            || len > CHUNK_HEADER_SIZE + MAX_CHUNK_SIZE as u64
            || (len - CHUNK_HEADER_SIZE) % BLOCK_SIZE as u64 != 0
        {
            log::warn!("removing chunk file with invalid size: {:?}", path);
            let _ = std::fs::remove_file(&path);
            continue;
        }
        let blocks = ((len - CHUNK_HEADER_SIZE) / BLOCK_SIZE as u64) as u16;

        if let Some(existing) = chunks.get(&id) {
            let existing_state = existing.state.lock().unwrap();
            log::warn!(
                "duplicate chunk {:016X} (versions {:08X} and {:08X})",
                id,
                existing_state.version,
                version
            );
            if version <= existing_state.version {
                let _ = std::fs::remove_file(&path);
                continue;
            }
            let _ = std::fs::remove_file(&existing_state.path);
            drop(existing_state);
            let old = chunks.remove(&id).unwrap();
            let mut fstate = old.folder.state.lock().unwrap();
            fstate.chunk_count = fstate.chunk_count.saturating_sub(1);
        }

        chunks.insert(
            id,
            Arc::new(Chunk {
                id,
                folder: Arc::clone(folder),
                state: Mutex::new(ChunkState::new(path, version, blocks)),
            }),
        );
        folder.state.lock().unwrap().chunk_count += 1;
    }
    Ok(())
}

/// Read the version out of a legacy-named chunk file and rename it into the
/// current format. Returns `None` (removing the file where appropriate) when
/// the file is not a valid chunk.
fn upgrade_legacy_chunk(path: &mut std::path::PathBuf, id: u64) -> Option<u32> {
    let mut header = [0u8; 20];
    match File::open(&*path).and_then(|mut f| f.read_exact(&mut header).map(|_| ())) {
        Ok(()) => {}
        Err(_) => {
            let _ = std::fs::remove_file(&*path);
            return None;
        }
    }
    if &header[..8] != CHUNK_MAGIC {
        let _ = std::fs::remove_file(&*path);
        return None;
    }
    let header_id = u64::from_be_bytes(header[8..16].try_into().unwrap());
    let version = u32::from_be_bytes(header[16..20].try_into().unwrap());
    if header_id != id {
        let _ = std::fs::remove_file(&*path);
        return None;
    }
    let new_path = path.with_file_name(chunk_file_name(id, version));
    match std::fs::rename(&*path, &new_path) {
        Ok(()) => *path = new_path,
        Err(err) => {
            // keep serving it under the old name
            log::warn!("can't rename {:?} to {:?} - {}", path, new_path, err);
        }
    }
    Some(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> ChunkStore {
        ChunkStore::open(&[FolderConfig {
            path: dir.to_path_buf(),
            to_delete: false,
        }])
        .unwrap()
    }

    fn pattern(len: usize, seed: usize) -> Vec<u8> {
        (0..len).map(|i| ((i + seed) % 251) as u8).collect()
    }

    fn file_of(store: &ChunkStore, id: u64) -> std::path::PathBuf {
        store.find(id).unwrap().state.lock().unwrap().path.clone()
    }

    #[test]
    fn create_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.create(0x100, 1).unwrap();
        assert_eq!(store.create(0x100, 1), Err(Status::ChunkExist));

        let buf = pattern(BLOCK_SIZE, 0);
        store.begin_io(0x100).unwrap();
        store
            .write_block(0x100, 1, 0, 0, crc32(&buf), &buf)
            .unwrap();

        let (data, crc) = store.read_block(0x100, 1, 0, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(data, buf);
        assert_eq!(crc, crc32(&buf));

        // a sub-range comes back with the CRC of just that range
        let (data, crc) = store.read_block(0x100, 1, 0, 1000, 500).unwrap();
        assert_eq!(data, &buf[1000..1500]);
        assert_eq!(crc, crc32(&buf[1000..1500]));

        // blocks past the end read as zeroes
        let (data, crc) = store.read_block(0x100, 1, 5, 1000, 500).unwrap();
        assert_eq!(data, vec![0u8; 500]);
        assert_eq!(crc, crc32(&[0u8; 500]));
        let (_, crc) = store.read_block(0x100, 1, 5, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(crc, empty_block_crc());

        store.end_io(0x100).unwrap();

        assert_eq!(
            std::fs::metadata(file_of(&store, 0x100)).unwrap().len(),
            CHUNK_HEADER_SIZE + BLOCK_SIZE as u64
        );
    }

    #[test]
    fn read_validation() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x1, 1).unwrap();

        assert_eq!(
            store.read_block(0x2, 1, 0, 0, 10).unwrap_err(),
            Status::NoChunk
        );
        assert_eq!(
            store.read_block(0x1, 9, 0, 0, 10).unwrap_err(),
            Status::WrongVersion
        );
        assert_eq!(
            store.read_block(0x1, 1, 1024, 0, 10).unwrap_err(),
            Status::BnumTooBig
        );
        assert_eq!(
            store.read_block(0x1, 1, 0, 0, 0x10001).unwrap_err(),
            Status::WrongSize
        );
        assert_eq!(
            store.read_block(0x1, 1, 0, 0xFFFF, 2).unwrap_err(),
            Status::WrongOffset
        );
    }

    #[test]
    fn partial_write_read_modify_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x42, 1).unwrap();
        store.begin_io(0x42).unwrap();

        let full = pattern(BLOCK_SIZE, 3);
        store
            .write_block(0x42, 1, 0, 0, crc32(&full), &full)
            .unwrap();

        let patch = pattern(8192, 77);
        store
            .write_block(0x42, 1, 0, 4096, crc32(&patch), &patch)
            .unwrap();

        let mut expect = full.clone();
        expect[4096..4096 + 8192].copy_from_slice(&patch);
        let (data, _) = store.read_block(0x42, 1, 0, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(data, expect);

        // partial write into a fresh block zero-fills around the range
        let patch = pattern(100, 9);
        store
            .write_block(0x42, 1, 3, 50, crc32(&patch), &patch)
            .unwrap();
        assert_eq!(store.blocks(0x42, 1).unwrap(), 4);
        let (data, _) = store.read_block(0x42, 1, 3, 0, 200).unwrap();
        let mut expect = vec![0u8; 200];
        expect[50..150].copy_from_slice(&patch);
        assert_eq!(data, expect);
        // the skipped blocks 1 and 2 read as zeroes with the known CRC
        let (_, crc) = store.read_block(0x42, 1, 1, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(crc, empty_block_crc());

        store.end_io(0x42).unwrap();
    }

    #[test]
    fn bad_buffer_crc_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x7, 1).unwrap();
        store.begin_io(0x7).unwrap();
        let buf = pattern(1000, 0);
        assert_eq!(
            store.write_block(0x7, 1, 0, 0, crc32(&buf) ^ 1, &buf),
            Err(Status::Crc)
        );
        assert!(store
            .take_reports()
            .contains(&Report::ChunkDamaged(0x7)));
        store.end_io(0x7).unwrap();
    }

    #[test]
    fn set_version_renames_and_rewrites_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x200, 1).unwrap();

        assert_eq!(store.set_version(0x200, 3, 2), Err(Status::WrongVersion));
        store.set_version(0x200, 2, 1).unwrap();

        assert_eq!(store.check_chunk(0x200, 1), Err(Status::WrongVersion));
        store.check_chunk(0x200, 2).unwrap();

        let path = file_of(&store, 0x200);
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("_00000002.mfs"));
        let mut hdr = [0u8; 20];
        File::open(&path)
            .unwrap()
            .read_exact_at(&mut hdr, 0)
            .unwrap();
        assert_eq!(u32::from_be_bytes(hdr[16..20].try_into().unwrap()), 2);
    }

    #[test]
    fn truncate_shrink_with_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x300, 1).unwrap();
        store.begin_io(0x300).unwrap();
        let b0 = pattern(BLOCK_SIZE, 1);
        let b1 = pattern(BLOCK_SIZE, 2);
        store.write_block(0x300, 1, 0, 0, crc32(&b0), &b0).unwrap();
        store.write_block(0x300, 1, 1, 0, crc32(&b1), &b1).unwrap();
        store.end_io(0x300).unwrap();

        store.truncate(0x300, 100_000, 2, 1).unwrap();
        assert_eq!(store.blocks(0x300, 2).unwrap(), 2);
        assert_eq!(
            std::fs::metadata(file_of(&store, 0x300)).unwrap().len(),
            CHUNK_HEADER_SIZE + 2 * BLOCK_SIZE as u64
        );

        let tail = 100_000 - BLOCK_SIZE; // bytes kept in the last block
        let mut expect = vec![0u8; BLOCK_SIZE];
        expect[..tail].copy_from_slice(&b1[..tail]);
        store.begin_io(0x300).unwrap();
        let (data, crc) = store.read_block(0x300, 2, 1, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(data, expect);
        assert_eq!(crc, crc32(&expect));
        store.end_io(0x300).unwrap();
    }

    #[test]
    fn truncate_grow_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x301, 1).unwrap();
        store.begin_io(0x301).unwrap();
        let b0 = pattern(BLOCK_SIZE, 4);
        store.write_block(0x301, 1, 0, 0, crc32(&b0), &b0).unwrap();
        store.end_io(0x301).unwrap();

        store.truncate(0x301, 3 * BLOCK_SIZE as u32, 2, 1).unwrap();
        assert_eq!(store.blocks(0x301, 2).unwrap(), 3);
        store.begin_io(0x301).unwrap();
        let (_, crc) = store.read_block(0x301, 2, 2, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(crc, empty_block_crc());
        let (data, _) = store.read_block(0x301, 2, 0, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(data, b0);
        store.end_io(0x301).unwrap();
    }

    #[test]
    fn crc_error_reported_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x400, 1).unwrap();
        store.begin_io(0x400).unwrap();
        let buf = pattern(BLOCK_SIZE, 5);
        store.write_block(0x400, 1, 0, 0, crc32(&buf), &buf).unwrap();
        store.end_io(0x400).unwrap();
        store.flush_all();
        store.take_reports();

        // flip one byte of block 0 on disk
        let path = file_of(&store, 0x400);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[buf[10] ^ 0xFF], CHUNK_HEADER_SIZE + 10)
            .unwrap();

        store.begin_io(0x400).unwrap();
        assert_eq!(
            store.read_block(0x400, 1, 0, 0, BLOCK_SIZE as u32),
            Err(Status::Crc)
        );
        store.end_io(0x400).unwrap();

        let reports = store.take_reports();
        assert!(reports.contains(&Report::ChunkDamaged(0x400)));
        assert!(reports.contains(&Report::ErrorOccurred));
        let info = store.disk_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].last_error_chunk, 0x400);
    }

    #[test]
    fn idle_sweep_closes_and_persists_crc() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x500, 1).unwrap();
        store.begin_io(0x500).unwrap();
        let buf = pattern(BLOCK_SIZE, 6);
        store.write_block(0x500, 1, 0, 0, crc32(&buf), &buf).unwrap();

        // still referenced: the sweeper must not close it
        store.sweep_idle_for(Duration::ZERO);
        assert_eq!(store.open_chunk_ids(), vec![0x500]);

        store.end_io(0x500).unwrap();
        store.sweep_idle_for(Duration::ZERO);
        assert!(store.open_chunk_ids().is_empty());

        // the CRC table survived the close
        store.begin_io(0x500).unwrap();
        let (data, _) = store.read_block(0x500, 1, 0, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(data, buf);
        store.end_io(0x500).unwrap();
    }

    #[test]
    fn checksum_commands() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x600, 1).unwrap();
        store.begin_io(0x600).unwrap();
        let buf = pattern(BLOCK_SIZE, 7);
        store.write_block(0x600, 1, 0, 0, crc32(&buf), &buf).unwrap();
        store.end_io(0x600).unwrap();

        let tab = store.checksum_tab(0x600, 1).unwrap();
        assert_eq!(tab.len(), 4096);
        assert_eq!(
            u32::from_le_bytes(tab[..4].try_into().unwrap()),
            crc32(&buf)
        );
        assert_eq!(store.checksum(0x600, 1).unwrap(), crc32(&tab));
        assert_eq!(store.checksum(0x600, 2), Err(Status::WrongVersion));
    }

    #[test]
    fn duplicate_copies_blocks_and_crc() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x700, 5).unwrap();
        store.begin_io(0x700).unwrap();
        let b0 = pattern(BLOCK_SIZE, 8);
        let b1 = pattern(BLOCK_SIZE, 9);
        store.write_block(0x700, 5, 0, 0, crc32(&b0), &b0).unwrap();
        store.write_block(0x700, 5, 1, 0, crc32(&b1), &b1).unwrap();
        store.end_io(0x700).unwrap();
        store.flush_all();

        // version 0 request inherits the source version
        store.duplicate(0x701, 0, 0x700, 5).unwrap();
        store.check_chunk(0x701, 5).unwrap();
        assert_eq!(store.blocks(0x701, 5).unwrap(), 2);
        assert_eq!(
            store.checksum_tab(0x701, 5).unwrap(),
            store.checksum_tab(0x700, 5).unwrap()
        );
        store.begin_io(0x701).unwrap();
        let (data, _) = store.read_block(0x701, 5, 1, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(data, b1);
        store.end_io(0x701).unwrap();

        assert_eq!(store.duplicate(0x701, 0, 0x700, 5), Err(Status::ChunkExist));
        assert_eq!(store.duplicate(0x702, 0, 0x700, 4), Err(Status::WrongVersion));
        assert_eq!(store.duplicate(0x702, 0, 0x7FF, 0), Err(Status::NoChunk));
    }

    #[test]
    fn duptrunc_shrinks_with_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x800, 1).unwrap();
        store.begin_io(0x800).unwrap();
        let b0 = pattern(BLOCK_SIZE, 10);
        let b1 = pattern(BLOCK_SIZE, 11);
        store.write_block(0x800, 1, 0, 0, crc32(&b0), &b0).unwrap();
        store.write_block(0x800, 1, 1, 0, crc32(&b1), &b1).unwrap();
        store.end_io(0x800).unwrap();
        store.flush_all();

        store.duptrunc(0x801, 2, 0x800, 1, 100_000).unwrap();
        assert_eq!(store.blocks(0x801, 2).unwrap(), 2);
        let tail = 100_000 - BLOCK_SIZE;
        let mut expect = vec![0u8; BLOCK_SIZE];
        expect[..tail].copy_from_slice(&b1[..tail]);
        store.begin_io(0x801).unwrap();
        let (data, crc) = store.read_block(0x801, 2, 1, 0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(data, expect);
        assert_eq!(crc, crc32(&expect));
        store.end_io(0x801).unwrap();
    }

    #[test]
    fn delete_removes_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.create(0x900, 1).unwrap();
        let path = file_of(&store, 0x900);
        assert_eq!(store.delete(0x900, 2), Err(Status::WrongVersion));
        store.delete(0x900, 1).unwrap();
        assert!(!path.exists());
        assert_eq!(store.check_chunk(0x900, 1), Err(Status::NoChunk));
        assert_eq!(store.chunk_count(), 0);
    }

    #[test]
    fn scan_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.create(0xA00, 1).unwrap();
            store.create(0xA01, 3).unwrap();
            store.begin_io(0xA01).unwrap();
            let buf = pattern(BLOCK_SIZE, 12);
            store.write_block(0xA01, 3, 0, 0, crc32(&buf), &buf).unwrap();
            store.end_io(0xA01).unwrap();
            store.flush_all();
        }

        // a stray file with a bogus size must be cleaned up
        let junk = dir.path().join("3").join("chunk_0000000000000A03_00000001.mfs");
        std::fs::write(&junk, b"short").unwrap();

        let store = open_store(dir.path());
        let mut list = store.chunk_list();
        list.sort_unstable();
        assert_eq!(list, vec![(0xA00, 1), (0xA01, 3)]);
        assert_eq!(store.blocks(0xA01, 3).unwrap(), 1);
        assert!(!junk.exists());
    }

    #[test]
    fn scan_keeps_higher_version_of_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.create(0xB00, 2).unwrap();
        }
        // plant an older copy of the same chunk beside it
        let old = dir.path().join("0").join(chunk_file_name(0xB00, 1));
        let mut hdr = vec![0u8; CHUNK_HEADER_SIZE as usize];
        hdr[..8].copy_from_slice(CHUNK_MAGIC);
        hdr[8..16].copy_from_slice(&0xB00u64.to_be_bytes());
        hdr[16..20].copy_from_slice(&1u32.to_be_bytes());
        std::fs::write(&old, &hdr).unwrap();

        let store = open_store(dir.path());
        assert_eq!(store.chunk_list(), vec![(0xB00, 2)]);
        assert!(!old.exists());
        assert_eq!(store.chunk_count(), 1);
    }

    #[test]
    fn scan_upgrades_legacy_names() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _store = open_store(dir.path()); // creates the subdirs
        }
        let legacy = dir.path().join("4").join("chunk_0000000000000C04.mfs");
        let mut hdr = vec![0u8; CHUNK_HEADER_SIZE as usize];
        hdr[..8].copy_from_slice(CHUNK_MAGIC);
        hdr[8..16].copy_from_slice(&0xC04u64.to_be_bytes());
        hdr[16..20].copy_from_slice(&9u32.to_be_bytes());
        std::fs::write(&legacy, &hdr).unwrap();

        let store = open_store(dir.path());
        assert_eq!(store.chunk_list(), vec![(0xC04, 9)]);
        assert!(!legacy.exists());
        assert!(dir
            .path()
            .join("4")
            .join(chunk_file_name(0xC04, 9))
            .exists());
    }

    #[test]
    fn folder_eviction_after_repeated_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let ids = [0xD00u64, 0xD01, 0xD02];
        for (i, &id) in ids.iter().enumerate() {
            store.create(id, 1).unwrap();
            store.begin_io(id).unwrap();
            let buf = pattern(BLOCK_SIZE, i);
            store.write_block(id, 1, 0, 0, crc32(&buf), &buf).unwrap();
            store.end_io(id).unwrap();
        }
        store.flush_all();
        store.take_reports();

        for &id in &ids {
            let path = file_of(&store, id);
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.write_all_at(&[0xFF], CHUNK_HEADER_SIZE).unwrap();
            store.begin_io(id).unwrap();
            assert_eq!(
                store.read_block(id, 1, 0, 0, BLOCK_SIZE as u32),
                Err(Status::Crc)
            );
            store.end_io(id).unwrap();
        }

        let space = store.collect_space();
        assert!(space.is_some());
        assert_eq!(store.chunk_count(), 0);
        let reports = store.take_reports();
        for &id in &ids {
            assert!(reports.contains(&Report::ChunkLost(id)));
        }
        // the damaged folder no longer accepts chunks
        assert_eq!(store.create(0xD10, 1), Err(Status::NoSpace));
        let info = store.disk_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].flags, 2);
    }

    #[test]
    fn draining_folder_flag_in_listing() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.create(0xE00, 1).unwrap();
        }
        let store = ChunkStore::open(&[FolderConfig {
            path: dir.path().to_path_buf(),
            to_delete: true,
        }])
        .unwrap();
        assert_eq!(
            store.chunk_list(),
            vec![(0xE00, 1 | mfs_proto::REGISTER_TODEL_BIT)]
        );
        // draining folders never take new chunks
        assert_eq!(store.create(0xE01, 1), Err(Status::NoSpace));
        let space = store.space();
        assert_eq!(space.chunk_count, 0);
        assert_eq!(space.td_chunk_count, 1);
    }
}
