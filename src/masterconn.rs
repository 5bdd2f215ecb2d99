//! The single long-lived connection to the metadata master.
//!
//! Life cycle: free -> connecting -> connected -> kill -> free, with a
//! reconnect attempt every `MASTER_RECONNECTION_DELAY` seconds while free.
//! Registration announces the listen address, space figures and the full
//! chunk listing. Chunk commands are decoded here, executed on the job
//! pool, and answered from the job completion hook; checksums and the
//! changelog are served inline. When the link dies, every pending job is
//! disabled and its response dropped.

use std::net::{SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Error;

use mfs_proto::{
    FrameBuilder, PacketReader, ProtoError, Status, ANTOAN_NOP, ANTOCS_CHUNK_CHECKSUM,
    ANTOCS_CHUNK_CHECKSUM_TAB, CSTOAN_CHUNK_CHECKSUM, CSTOAN_CHUNK_CHECKSUM_TAB, CSTOMA_CHUNK_DAMAGED,
    CSTOMA_CHUNK_LOST, CSTOMA_CREATE, CSTOMA_DELETE, CSTOMA_DUPLICATE, CSTOMA_DUPTRUNC,
    CSTOMA_ERROR_OCCURRED, CSTOMA_REGISTER, CSTOMA_REPLICATE, CSTOMA_SET_VERSION, CSTOMA_SPACE,
    CSTOMA_TRUNCATE, MATOCS_CREATE, MATOCS_DELETE, MATOCS_DUPLICATE, MATOCS_DUPTRUNC,
    MATOCS_REPLICATE, MATOCS_SET_VERSION, MATOCS_STRUCTURE_LOG, MATOCS_STRUCTURE_LOG_ROTATE,
    MATOCS_TRUNCATE, MAX_MASTER_PACKET_SIZE, REGISTER_V2, REGISTER_V3,
};
use mfs_store::{ChunkOp, ChunkStore, Report, SpaceInfo};

use crate::config::Settings;
use crate::jobs::{JobData, JobPool, JobWaiters};
use crate::netframe::{FrameReader, FrameWriter, ReadOutcome};
use crate::sockets;

/// Which response frame a finished master job produces.
#[derive(Debug, Clone, Copy)]
pub enum MasterReply {
    Create(u64),
    Delete(u64),
    SetVersion(u64),
    Duplicate(u64),
    Truncate(u64),
    DupTrunc(u64),
    Replicate { chunk_id: u64, version: u32 },
}

enum Mode {
    Free,
    Connecting,
    Connected,
    Kill,
}

pub struct MasterConn {
    mode: Mode,
    sock: Option<TcpStream>,
    reader: FrameReader,
    writer: FrameWriter,
    last_read: Instant,
    last_write: Instant,
    master_addr: SocketAddrV4,
    timeout: Duration,
    listen_ip: u32,
    listen_port: u16,
    back_logs: u32,
    data_path: PathBuf,
    changelog: Option<std::fs::File>,
    bytes_in: u64,
    bytes_out: u64,
}

impl MasterConn {
    pub fn new(settings: &Settings, listen_ip: u32, listen_port: u16) -> Result<Self, Error> {
        let master_addr = sockets::resolve(&settings.master_host, &settings.master_port)?;
        Ok(MasterConn {
            mode: Mode::Free,
            sock: None,
            reader: FrameReader::new(MAX_MASTER_PACKET_SIZE),
            writer: FrameWriter::new(),
            last_read: Instant::now(),
            last_write: Instant::now(),
            master_addr,
            timeout: settings.master_timeout,
            listen_ip,
            listen_port,
            back_logs: settings.back_logs,
            data_path: settings.data_path.clone(),
            changelog: None,
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    pub fn apply_settings(&mut self, settings: &Settings) {
        self.timeout = settings.master_timeout;
        self.back_logs = settings.back_logs;
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.mode, Mode::Connected)
    }

    pub fn fd(&self) -> Option<RawFd> {
        match self.mode {
            Mode::Free | Mode::Kill => None,
            _ => self.sock.as_ref().map(|s| s.as_raw_fd()),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self.mode {
            Mode::Connecting => true,
            Mode::Connected => !self.writer.is_empty(),
            _ => false,
        }
    }

    /// Reconnect tick: start a fresh connect attempt while disconnected.
    pub fn tick_reconnect(&mut self, store: &ChunkStore) {
        if !matches!(self.mode, Mode::Free) {
            return;
        }
        let ip = sockets::ipv4_to_u32(self.master_addr.ip());
        match sockets::connect_nonblocking(ip, self.master_addr.port()) {
            Ok((stream, true)) => {
                log::info!("connected to master at {}", self.master_addr);
                self.sock = Some(stream);
                self.connected(store);
            }
            Ok((stream, false)) => {
                self.sock = Some(stream);
                self.mode = Mode::Connecting;
            }
            Err(err) => {
                log::warn!("master connect failed - {}", err);
            }
        }
    }

    fn connected(&mut self, store: &ChunkStore) {
        self.mode = Mode::Connected;
        self.reader = FrameReader::new(MAX_MASTER_PACKET_SIZE);
        self.writer.clear();
        self.last_read = Instant::now();
        self.last_write = Instant::now();
        self.send_register(store);
    }

    fn send_register(&mut self, store: &ChunkStore) {
        let space = store.space();
        let chunks = store.chunk_list();
        let timeout = self.timeout.as_secs() as u16;
        let v3 = timeout != 60;
        let body = 1 + 4 + 2 + if v3 { 2 } else { 0 } + 8 + 8 + 4 + 8 + 8 + 4 + chunks.len() * 12;
        let mut frame = FrameBuilder::new(CSTOMA_REGISTER, body)
            .put_u8(if v3 { REGISTER_V3 } else { REGISTER_V2 })
            .put_u32(self.listen_ip)
            .put_u16(self.listen_port);
        if v3 {
            frame = frame.put_u16(timeout);
        }
        frame = frame
            .put_u64(space.used)
            .put_u64(space.total)
            .put_u32(space.chunk_count)
            .put_u64(space.td_used)
            .put_u64(space.td_total)
            .put_u32(space.td_chunk_count);
        for (id, version) in chunks {
            frame = frame.put_u64(id).put_u32(version);
        }
        self.writer.push(frame.finish());
    }

    pub fn handle_writable(&mut self, store: &ChunkStore) {
        match self.mode {
            Mode::Connecting => {
                let sock = self.sock.as_ref().unwrap();
                match sockets::connect_finished(sock) {
                    Ok(()) => {
                        log::info!("connected to master at {}", self.master_addr);
                        self.connected(store);
                    }
                    Err(err) => {
                        log::warn!("master connection failed - {}", err);
                        self.sock = None;
                        self.mode = Mode::Free;
                    }
                }
            }
            Mode::Connected => {
                let mut sock = self.sock.as_ref().unwrap();
                match self.writer.write(&mut sock) {
                    Ok(n) => {
                        if n > 0 {
                            self.bytes_out += n as u64;
                            self.last_write = Instant::now();
                        }
                    }
                    Err(err) => {
                        log::info!("master write error - {}", err);
                        self.mode = Mode::Kill;
                    }
                }
            }
            _ => {}
        }
    }

    pub fn handle_readable(
        &mut self,
        store: &ChunkStore,
        pool: &JobPool,
        waiters: &mut JobWaiters<MasterReply>,
    ) {
        if !matches!(self.mode, Mode::Connected) {
            return;
        }
        let mut sock = self.sock.as_ref().unwrap();
        match self.reader.read(&mut sock) {
            Ok(ReadOutcome::Pending) => {
                self.last_read = Instant::now();
            }
            Ok(ReadOutcome::Frame(msg_type, body)) => {
                self.last_read = Instant::now();
                self.bytes_in += (mfs_proto::HDR_SIZE + body.len()) as u64;
                if let Err(err) = self.got_packet(msg_type, &body, store, pool, waiters) {
                    log::warn!("master sent a malformed packet (type {}) - {}", msg_type, err);
                    self.mode = Mode::Kill;
                }
            }
            Ok(ReadOutcome::Closed) => {
                log::info!("master connection lost");
                self.mode = Mode::Kill;
            }
            Err(err) => {
                log::info!("master read error - {}", err);
                self.mode = Mode::Kill;
            }
        }
    }

    fn got_packet(
        &mut self,
        msg_type: u32,
        body: &[u8],
        store: &ChunkStore,
        pool: &JobPool,
        waiters: &mut JobWaiters<MasterReply>,
    ) -> Result<(), ProtoError> {
        let mut rd = PacketReader::new(body);
        match msg_type {
            ANTOAN_NOP => Ok(()),
            MATOCS_CREATE => {
                let id = rd.get_u64()?;
                let version = rd.get_u32()?;
                rd.expect_end()?;
                let job = pool.submit(JobData::ChunkOp(ChunkOp::Create { id, version }));
                waiters.set(job, MasterReply::Create(id));
                Ok(())
            }
            MATOCS_DELETE => {
                let id = rd.get_u64()?;
                let version = rd.get_u32()?;
                rd.expect_end()?;
                let job = pool.submit(JobData::ChunkOp(ChunkOp::Delete { id, version }));
                waiters.set(job, MasterReply::Delete(id));
                Ok(())
            }
            MATOCS_SET_VERSION => {
                let id = rd.get_u64()?;
                let version = rd.get_u32()?;
                let old_version = rd.get_u32()?;
                rd.expect_end()?;
                let job = pool.submit(JobData::ChunkOp(ChunkOp::SetVersion {
                    id,
                    version,
                    old_version,
                }));
                waiters.set(job, MasterReply::SetVersion(id));
                Ok(())
            }
            MATOCS_DUPLICATE => {
                let id = rd.get_u64()?;
                let version = rd.get_u32()?;
                let src_id = rd.get_u64()?;
                let src_version = rd.get_u32()?;
                rd.expect_end()?;
                let job = pool.submit(JobData::ChunkOp(ChunkOp::Duplicate {
                    id,
                    version,
                    src_id,
                    src_version,
                }));
                waiters.set(job, MasterReply::Duplicate(id));
                Ok(())
            }
            MATOCS_TRUNCATE => {
                let id = rd.get_u64()?;
                let length = rd.get_u32()?;
                let version = rd.get_u32()?;
                let old_version = rd.get_u32()?;
                rd.expect_end()?;
                let job = pool.submit(JobData::ChunkOp(ChunkOp::Truncate {
                    id,
                    length,
                    version,
                    old_version,
                }));
                waiters.set(job, MasterReply::Truncate(id));
                Ok(())
            }
            MATOCS_DUPTRUNC => {
                let id = rd.get_u64()?;
                let version = rd.get_u32()?;
                let src_id = rd.get_u64()?;
                let src_version = rd.get_u32()?;
                let length = rd.get_u32()?;
                rd.expect_end()?;
                let job = pool.submit(JobData::ChunkOp(ChunkOp::DupTrunc {
                    id,
                    version,
                    src_id,
                    src_version,
                    length,
                }));
                waiters.set(job, MasterReply::DupTrunc(id));
                Ok(())
            }
            MATOCS_REPLICATE => {
                let chunk_id = rd.get_u64()?;
                let version = rd.get_u32()?;
                let ip = rd.get_u32()?;
                let port = rd.get_u16()?;
                rd.expect_end()?;
                let job = pool.submit(JobData::Replicate {
                    chunk_id,
                    version,
                    ip,
                    port,
                });
                waiters.set(job, MasterReply::Replicate { chunk_id, version });
                Ok(())
            }
            ANTOCS_CHUNK_CHECKSUM => {
                let id = rd.get_u64()?;
                let version = rd.get_u32()?;
                rd.expect_end()?;
                let frame = match store.checksum(id, version) {
                    Ok(checksum) => FrameBuilder::new(CSTOAN_CHUNK_CHECKSUM, 8 + 4 + 4)
                        .put_u64(id)
                        .put_u32(version)
                        .put_u32(checksum),
                    Err(status) => FrameBuilder::new(CSTOAN_CHUNK_CHECKSUM, 8 + 4 + 1)
                        .put_u64(id)
                        .put_u32(version)
                        .put_status(status),
                };
                self.writer.push(frame.finish());
                Ok(())
            }
            ANTOCS_CHUNK_CHECKSUM_TAB => {
                let id = rd.get_u64()?;
                let version = rd.get_u32()?;
                rd.expect_end()?;
                let frame = match store.checksum_tab(id, version) {
                    Ok(tab) => FrameBuilder::new(CSTOAN_CHUNK_CHECKSUM_TAB, 8 + 4 + 4096)
                        .put_u64(id)
                        .put_u32(version)
                        .put_bytes(&tab),
                    Err(status) => FrameBuilder::new(CSTOAN_CHUNK_CHECKSUM_TAB, 8 + 4 + 1)
                        .put_u64(id)
                        .put_u32(version)
                        .put_status(status),
                };
                self.writer.push(frame.finish());
                Ok(())
            }
            MATOCS_STRUCTURE_LOG => {
                self.append_changelog(body)?;
                Ok(())
            }
            MATOCS_STRUCTURE_LOG_ROTATE => {
                rd.expect_end()?;
                self.rotate_changelog();
                Ok(())
            }
            other => {
                log::warn!("got unknown message from master (type {})", other);
                self.mode = Mode::Kill;
                Ok(())
            }
        }
    }

    /// One line per entry: `<change version>: <text>`.
    fn append_changelog(&mut self, body: &[u8]) -> Result<(), ProtoError> {
        use std::io::Write;

        let mut rd = PacketReader::new(body);
        let (version, text) = if body.first() == Some(&0xFF) {
            rd.get_u8()?;
            (rd.get_u64()?, rd.get_rest())
        } else {
            (rd.get_u32()? as u64, rd.get_rest())
        };
        let text = match text.split_last() {
            Some((0, head)) => head, // NUL terminated
            _ => text,
        };
        let text = String::from_utf8_lossy(text);

        if self.changelog.is_none() {
            let path = self.data_path.join("changelog_csback.0.mfs");
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => self.changelog = Some(file),
                Err(err) => log::warn!("unable to open changelog {:?} - {}", path, err),
            }
        }
        match self.changelog.as_mut() {
            Some(file) => {
                if let Err(err) = writeln!(file, "{}: {}", version, text) {
                    log::warn!("changelog write failed - {}", err);
                    self.changelog = None;
                }
            }
            None => log::info!("lost change {}: {}", version, text),
        }
        Ok(())
    }

    fn rotate_changelog(&mut self) {
        self.changelog = None;
        let name = |n: u32| self.data_path.join(format!("changelog_csback.{}.mfs", n));
        if self.back_logs > 0 {
            for n in (1..=self.back_logs).rev() {
                let _ = std::fs::rename(name(n - 1), name(n));
            }
        } else {
            let _ = std::fs::remove_file(name(0));
        }
    }

    /// A finished chunk command turns into its response frame. Does nothing
    /// while disconnected (the response would go nowhere).
    pub fn job_finished(&mut self, reply: MasterReply, status: Status) {
        if !self.is_connected() {
            return;
        }
        let frame = match reply {
            MasterReply::Create(id) => respond(CSTOMA_CREATE, id, status),
            MasterReply::Delete(id) => respond(CSTOMA_DELETE, id, status),
            MasterReply::SetVersion(id) => respond(CSTOMA_SET_VERSION, id, status),
            MasterReply::Duplicate(id) => respond(CSTOMA_DUPLICATE, id, status),
            MasterReply::Truncate(id) => respond(CSTOMA_TRUNCATE, id, status),
            MasterReply::DupTrunc(id) => respond(CSTOMA_DUPTRUNC, id, status),
            MasterReply::Replicate { chunk_id, version } => {
                FrameBuilder::new(CSTOMA_REPLICATE, 8 + 4 + 1)
                    .put_u64(chunk_id)
                    .put_u32(version)
                    .put_status(status)
                    .finish()
            }
        };
        self.writer.push(frame);
    }

    pub fn send_space(&mut self, info: SpaceInfo) {
        if !self.is_connected() {
            return;
        }
        self.writer.push(
            FrameBuilder::new(CSTOMA_SPACE, 8 + 8 + 4 + 8 + 8 + 4)
                .put_u64(info.used)
                .put_u64(info.total)
                .put_u32(info.chunk_count)
                .put_u64(info.td_used)
                .put_u64(info.td_total)
                .put_u32(info.td_chunk_count)
                .finish(),
        );
    }

    pub fn send_report(&mut self, report: Report) {
        if !self.is_connected() {
            return;
        }
        let frame = match report {
            Report::ChunkDamaged(id) => FrameBuilder::new(CSTOMA_CHUNK_DAMAGED, 8)
                .put_u64(id)
                .finish(),
            Report::ChunkLost(id) => FrameBuilder::new(CSTOMA_CHUNK_LOST, 8).put_u64(id).finish(),
            Report::ErrorOccurred => FrameBuilder::new(CSTOMA_ERROR_OCCURRED, 0).finish(),
        };
        self.writer.push(frame);
    }

    /// Keepalive, read timeout and kill cleanup; runs every loop pass.
    pub fn maintain(
        &mut self,
        now: Instant,
        pool: &JobPool,
        waiters: &mut JobWaiters<MasterReply>,
    ) {
        if matches!(self.mode, Mode::Connected) {
            if now.duration_since(self.last_read) > self.timeout {
                log::warn!("master connection timed out");
                self.mode = Mode::Kill;
            } else if now.duration_since(self.last_write) > self.timeout / 2
                && self.writer.is_empty()
            {
                self.writer.push(FrameBuilder::new(ANTOAN_NOP, 0).finish());
            }
        }
        if matches!(self.mode, Mode::Kill) {
            self.sock = None;
            self.writer.clear();
            self.mode = Mode::Free;
            // pending responses have nowhere to go anymore
            pool.disable_all();
            waiters.clear();
        }
    }

    pub fn take_stats(&mut self) -> (u64, u64) {
        (
            std::mem::take(&mut self.bytes_in),
            std::mem::take(&mut self.bytes_out),
        )
    }
}

fn respond(msg_type: u32, chunk_id: u64, status: Status) -> Vec<u8> {
    FrameBuilder::new(msg_type, 8 + 1)
        .put_u64(chunk_id)
        .put_status(status)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mfs_store::FolderConfig;
    use std::sync::Arc;

    fn test_setup() -> (MasterConn, Arc<ChunkStore>, Arc<JobPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ChunkStore::open(&[FolderConfig {
                path: dir.path().join("hdd"),
                to_delete: false,
            }])
            .unwrap(),
        );
        let pool = JobPool::new(0, 0, Arc::clone(&store), Duration::from_secs(1)).unwrap();
        let mut settings = Settings::from_config(&Config::default());
        settings.master_host = "127.0.0.1".into();
        settings.data_path = dir.path().to_path_buf();
        let conn = MasterConn::new(&settings, 0x7F000001, 9422).unwrap();
        (conn, store, pool, dir)
    }

    #[test]
    fn commands_become_jobs_with_reply_contexts() {
        let (mut conn, store, pool, _dir) = test_setup();
        let mut waiters = JobWaiters::new();

        let body = FrameBuilder::new(0, 12).put_u64(0x55).put_u32(3).finish();
        conn.got_packet(MATOCS_CREATE, &body[8..], &store, &pool, &mut waiters)
            .unwrap();
        assert_eq!(pool.jobs_count(), 1);
        assert!(!waiters.is_empty());

        // short body is a protocol error
        assert!(conn
            .got_packet(MATOCS_CREATE, &body[8..14], &store, &pool, &mut waiters)
            .is_err());
    }

    #[test]
    fn responses_echo_id_and_status() {
        let (mut conn, _store, _pool, _dir) = test_setup();
        conn.mode = Mode::Connected;
        conn.job_finished(MasterReply::Create(0xABC), Status::Ok);
        conn.job_finished(
            MasterReply::Replicate {
                chunk_id: 0xDEF,
                version: 4,
            },
            Status::NoChunk,
        );
        assert_eq!(conn.writer.queued_frames(), 2);
    }

    #[test]
    fn changelog_append_and_rotate() {
        let (mut conn, _store, _pool, dir) = test_setup();

        let entry = FrameBuilder::new(0, 1 + 8 + 5)
            .put_u8(0xFF)
            .put_u64(12345)
            .put_bytes(b"MKDIR")
            .finish();
        conn.append_changelog(&entry[8..]).unwrap();
        // old format, NUL terminated
        let entry = FrameBuilder::new(0, 4 + 3)
            .put_u32(7)
            .put_bytes(b"RM\x00")
            .finish();
        conn.append_changelog(&entry[8..]).unwrap();
        conn.changelog = None;

        let log0 = dir.path().join("changelog_csback.0.mfs");
        let text = std::fs::read_to_string(&log0).unwrap();
        assert_eq!(text, "12345: MKDIR\n7: RM\n");

        conn.rotate_changelog();
        assert!(!log0.exists());
        assert!(dir.path().join("changelog_csback.1.mfs").exists());
    }

    #[test]
    fn kill_disables_pending_jobs() {
        let (mut conn, _store, pool, _dir) = test_setup();
        let mut waiters = JobWaiters::new();
        let job = pool.submit(JobData::Inval);
        waiters.set(job, MasterReply::Create(1));

        conn.mode = Mode::Kill;
        conn.maintain(Instant::now(), &pool, &mut waiters);
        assert!(waiters.is_empty());
        assert!(!conn.is_connected());

        // the disabled job reports NotDone when a worker finally runs it
        assert!(pool.worker_step());
        let done = pool.drain_completions();
        assert_eq!(done[0].1.status(), Status::NotDone);
    }
}
