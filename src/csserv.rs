//! The client-facing server: read requests and chained writes.
//!
//! Each accepted connection runs one operation at a time: idle, reading
//! (streaming `READ_DATA` frames one block job at a time, resumed whenever
//! the output queue drains), connecting (waiting for the downstream hop of
//! a write chain), writing, or write-error (the chain broke; the client may
//! still drain its pipeline and gets `DISCONNECTED` for every further
//! write). Block I/O runs on the job pool; while a job is in flight the
//! connection's socket is not read, which keeps chain forwarding in strict
//! arrival order.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use anyhow::Error;

use mfs_proto::{
    FrameBuilder, PacketReader, ProtoError, Status, ANTOAN_NOP, ANTOCS_CHUNK_CHECKSUM,
    ANTOCS_CHUNK_CHECKSUM_TAB, CSTOAN_CHUNK_CHECKSUM, CSTOAN_CHUNK_CHECKSUM_TAB,
    CSTOCS_GET_CHUNK_BLOCKS, CSTOCS_GET_CHUNK_BLOCKS_STATUS, CSTOCU_HDD_LIST, CSTOCU_READ_DATA,
    CSTOCU_READ_STATUS, CSTOCU_WRITE_STATUS, CUTOCS_HDD_LIST, CUTOCS_READ, CUTOCS_WRITE,
    CUTOCS_WRITE_DATA, MAX_PACKET_SIZE,
};
use mfs_store::{ChunkStore, MAX_CHUNK_SIZE};

use crate::config::Settings;
use crate::jobs::{JobData, JobId, JobPool, JobResult, JobWaiters};
use crate::netframe::{FrameReader, FrameWriter, ReadOutcome};
use crate::peerconn::{PeerEvent, PeerId, PeerPool};
use crate::sockets;

pub type ConnId = u32;

/// Reply context of a job submitted on behalf of a client connection.
#[derive(Debug, Clone, Copy)]
pub enum ClientJobCtx {
    ReadOpened(ConnId),
    BlockRead(ConnId),
    WriteOpened(ConnId),
    BlockWritten(ConnId),
    /// Balancing `end_io`; the result goes nowhere.
    Closed,
}

impl ClientJobCtx {
    pub fn conn(&self) -> Option<ConnId> {
        match *self {
            ClientJobCtx::ReadOpened(id)
            | ClientJobCtx::BlockRead(id)
            | ClientJobCtx::WriteOpened(id)
            | ClientJobCtx::BlockWritten(id) => Some(id),
            ClientJobCtx::Closed => None,
        }
    }
}

enum Operation {
    Idle,
    Reading {
        chunk_id: u64,
        version: u32,
        offset: u32,
        size: u32,
        job: Option<JobId>,
        awaiting_drain: bool,
    },
    Connecting {
        chunk_id: u64,
        version: u32,
        chain: Vec<u8>,
    },
    Writing {
        chunk_id: u64,
        version: u32,
        job: Option<JobId>,
    },
    WriteError,
}

impl Operation {
    fn job_in_flight(&self) -> Option<JobId> {
        match self {
            Operation::Reading { job, .. } | Operation::Writing { job, .. } => *job,
            _ => None,
        }
    }
}

struct ClientConn {
    id: ConnId,
    sock: TcpStream,
    reader: FrameReader,
    writer: FrameWriter,
    activity: Instant,
    kill: bool,
    op: Operation,
    peer: Option<PeerId>,
    io_held: bool,
}

#[derive(Default)]
struct ServStats {
    bytes_in: u64,
    bytes_out: u64,
    hlop_read: u64,
    hlop_write: u64,
}

pub struct ClientServ {
    listener: TcpListener,
    listen_ip: u32,
    listen_port: u16,
    conns: HashMap<ConnId, ClientConn>,
    next_id: ConnId,
    timeout: Duration,
    stats: ServStats,
}

struct Ctx<'a> {
    store: &'a ChunkStore,
    pool: &'a JobPool,
    waiters: &'a mut JobWaiters<ClientJobCtx>,
    peers: &'a mut PeerPool,
    stats: &'a mut ServStats,
}

impl ClientServ {
    pub fn new(settings: &Settings) -> Result<Self, Error> {
        let addr = sockets::resolve(&settings.listen_host, &settings.listen_port)?;
        let listener = sockets::tcp_listen(addr, 64)?;
        log::info!("listening for clients on {}", addr);
        Ok(ClientServ {
            listener,
            listen_ip: sockets::ipv4_to_u32(addr.ip()),
            listen_port: addr.port(),
            conns: HashMap::new(),
            next_id: 1,
            timeout: settings.client_timeout,
            stats: ServStats::default(),
        })
    }

    pub fn listen_ip(&self) -> u32 {
        self.listen_ip
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn apply_settings(&mut self, settings: &Settings) {
        self.timeout = settings.client_timeout;
    }

    pub fn accept_ready(&mut self) {
        match self.listener.accept() {
            Ok((sock, addr)) => {
                if let Err(err) = sock.set_nonblocking(true) {
                    log::warn!("unable to set client socket nonblocking - {}", err);
                    return;
                }
                let _ = sock.set_nodelay(true);
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1).max(1);
                log::debug!("client connection from {}", addr);
                self.conns.insert(
                    id,
                    ClientConn {
                        id,
                        sock,
                        reader: FrameReader::new(MAX_PACKET_SIZE),
                        writer: FrameWriter::new(),
                        activity: Instant::now(),
                        kill: false,
                        op: Operation::Idle,
                        peer: None,
                        io_held: false,
                    },
                );
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => log::info!("accept error - {}", err),
        }
    }

    /// `(conn, fd, wants_read, wants_write)` for the poll set.
    pub fn poll_set(&self, peers: &PeerPool) -> Vec<(ConnId, RawFd, bool, bool)> {
        self.conns
            .iter()
            .filter(|(_, conn)| !conn.kill)
            .map(|(&id, conn)| {
                (
                    id,
                    conn.sock.as_raw_fd(),
                    conn.can_read(peers),
                    !conn.writer.is_empty(),
                )
            })
            .collect()
    }

    pub fn handle_readable(
        &mut self,
        id: ConnId,
        store: &ChunkStore,
        pool: &JobPool,
        waiters: &mut JobWaiters<ClientJobCtx>,
        peers: &mut PeerPool,
    ) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) if !conn.kill => conn,
            _ => return,
        };
        if !conn.can_read(peers) {
            return;
        }
        let mut ctx = Ctx {
            store,
            pool,
            waiters,
            peers,
            stats: &mut self.stats,
        };
        match conn.reader.read(&mut (&conn.sock)) {
            Ok(ReadOutcome::Pending) => {
                conn.activity = Instant::now();
            }
            Ok(ReadOutcome::Frame(msg_type, body)) => {
                conn.activity = Instant::now();
                ctx.stats.bytes_in += (mfs_proto::HDR_SIZE + body.len()) as u64;
                if let Err(err) = conn.got_packet(msg_type, &body, &mut ctx) {
                    log::info!("client sent a malformed packet (type {}) - {}", msg_type, err);
                    conn.kill = true;
                }
            }
            Ok(ReadOutcome::Closed) => {
                conn.kill = true;
            }
            Err(err) => {
                log::info!("client read error - {}", err);
                conn.kill = true;
            }
        }
    }

    pub fn handle_writable(
        &mut self,
        id: ConnId,
        pool: &JobPool,
        waiters: &mut JobWaiters<ClientJobCtx>,
    ) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) if !conn.kill => conn,
            _ => return,
        };
        match conn.writer.write(&mut (&conn.sock)) {
            Ok(n) => {
                if n > 0 {
                    conn.activity = Instant::now();
                    self.stats.bytes_out += n as u64;
                }
            }
            Err(err) => {
                log::info!("client write error - {}", err);
                conn.kill = true;
                return;
            }
        }
        // a drained output queue resumes a paused read
        if conn.writer.is_empty() {
            let resume = match &mut conn.op {
                Operation::Reading {
                    awaiting_drain,
                    job: None,
                    ..
                } if *awaiting_drain => {
                    *awaiting_drain = false;
                    true
                }
                _ => false,
            };
            if resume {
                conn.continue_read(pool, waiters);
            }
        }
    }

    pub fn job_finished(
        &mut self,
        ctx_tag: ClientJobCtx,
        result: JobResult,
        store: &ChunkStore,
        pool: &JobPool,
        waiters: &mut JobWaiters<ClientJobCtx>,
        peers: &mut PeerPool,
    ) {
        let id = match ctx_tag.conn() {
            Some(id) => id,
            None => return,
        };
        // connections wait for their in-flight job before they are reaped,
        // so the lookup only misses for stale contexts
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        let mut ctx = Ctx {
            store,
            pool,
            waiters,
            peers,
            stats: &mut self.stats,
        };
        match ctx_tag {
            ClientJobCtx::ReadOpened(_) => conn.read_opened(result.status(), &mut ctx),
            ClientJobCtx::BlockRead(_) => conn.block_read(result, &mut ctx),
            ClientJobCtx::WriteOpened(_) => conn.write_opened(result.status(), &mut ctx),
            ClientJobCtx::BlockWritten(_) => conn.block_written(result, &mut ctx),
            ClientJobCtx::Closed => {}
        }
    }

    pub fn handle_peer_event(
        &mut self,
        event: PeerEvent,
        store: &ChunkStore,
        pool: &JobPool,
        waiters: &mut JobWaiters<ClientJobCtx>,
        peers: &mut PeerPool,
    ) {
        let id = match &event {
            PeerEvent::Connected { client }
            | PeerEvent::WriteStatus { client, .. }
            | PeerEvent::Failed { client } => *client,
        };
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        let mut ctx = Ctx {
            store,
            pool,
            waiters,
            peers,
            stats: &mut self.stats,
        };
        match event {
            PeerEvent::Connected { .. } => conn.peer_connected(&mut ctx),
            PeerEvent::WriteStatus {
                chunk_id,
                write_id,
                status,
                ..
            } => conn.peer_write_status(chunk_id, write_id, status, &mut ctx),
            PeerEvent::Failed { .. } => conn.peer_failed(&mut ctx),
        }
    }

    /// Timeout enforcement and removal of killed connections whose jobs
    /// have all come home.
    pub fn maintain(
        &mut self,
        now: Instant,
        pool: &JobPool,
        waiters: &mut JobWaiters<ClientJobCtx>,
        peers: &mut PeerPool,
    ) {
        for conn in self.conns.values_mut() {
            if !conn.kill && now.duration_since(conn.activity) > self.timeout {
                conn.kill = true;
            }
        }
        let dead: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.kill && conn.op.job_in_flight().is_none())
            .map(|(&id, _)| id)
            .collect();
        for id in dead {
            let mut conn = self.conns.remove(&id).unwrap();
            if let Some(peer) = conn.peer.take() {
                peers.detach(peer);
            }
            if conn.io_held {
                let chunk_id = match conn.op {
                    Operation::Reading { chunk_id, .. } | Operation::Writing { chunk_id, .. } => {
                        Some(chunk_id)
                    }
                    _ => None,
                };
                if let Some(chunk_id) = chunk_id {
                    let job = pool.submit(JobData::Close { chunk_id });
                    waiters.set(job, ClientJobCtx::Closed);
                }
            }
        }
    }

    pub fn take_stats(&mut self) -> (u64, u64, u64, u64) {
        let stats = std::mem::take(&mut self.stats);
        (
            stats.bytes_in,
            stats.bytes_out,
            stats.hlop_read,
            stats.hlop_write,
        )
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

impl ClientConn {
    fn can_read(&self, peers: &PeerPool) -> bool {
        if self.op.job_in_flight().is_some() {
            return false;
        }
        match &self.op {
            Operation::Reading { .. } | Operation::Connecting { .. } => false,
            Operation::Writing { .. } => match self.peer {
                // throttled to the slowest downstream hop
                Some(peer) => !peers.queue_is_filled(peer),
                None => true,
            },
            _ => true,
        }
    }

    fn push_read_status(&mut self, chunk_id: u64, status: Status) {
        self.writer.push(
            FrameBuilder::new(CSTOCU_READ_STATUS, 8 + 1)
                .put_u64(chunk_id)
                .put_status(status)
                .finish(),
        );
    }

    fn push_write_status(&mut self, chunk_id: u64, write_id: u32, status: Status) {
        self.writer.push(
            FrameBuilder::new(CSTOCU_WRITE_STATUS, 8 + 4 + 1)
                .put_u64(chunk_id)
                .put_u32(write_id)
                .put_status(status)
                .finish(),
        );
    }

    fn got_packet(&mut self, msg_type: u32, body: &[u8], ctx: &mut Ctx) -> Result<(), ProtoError> {
        let mut rd = PacketReader::new(body);
        match msg_type {
            ANTOAN_NOP => Ok(()),
            CUTOCS_READ => self.read_init(&mut rd, ctx),
            CUTOCS_WRITE => self.write_init(&mut rd, ctx),
            CUTOCS_WRITE_DATA => self.write_data(&mut rd, ctx),
            CSTOCS_GET_CHUNK_BLOCKS => {
                let chunk_id = rd.get_u64()?;
                let version = rd.get_u32()?;
                rd.expect_end()?;
                let (blocks, status) = match ctx.store.blocks(chunk_id, version) {
                    Ok(blocks) => (blocks, Status::Ok),
                    Err(status) => (0, status),
                };
                self.writer.push(
                    FrameBuilder::new(CSTOCS_GET_CHUNK_BLOCKS_STATUS, 8 + 4 + 2 + 1)
                        .put_u64(chunk_id)
                        .put_u32(version)
                        .put_u16(blocks)
                        .put_status(status)
                        .finish(),
                );
                Ok(())
            }
            ANTOCS_CHUNK_CHECKSUM => {
                let chunk_id = rd.get_u64()?;
                let version = rd.get_u32()?;
                rd.expect_end()?;
                let frame = match ctx.store.checksum(chunk_id, version) {
                    Ok(checksum) => FrameBuilder::new(CSTOAN_CHUNK_CHECKSUM, 8 + 4 + 4)
                        .put_u64(chunk_id)
                        .put_u32(version)
                        .put_u32(checksum),
                    Err(status) => FrameBuilder::new(CSTOAN_CHUNK_CHECKSUM, 8 + 4 + 1)
                        .put_u64(chunk_id)
                        .put_u32(version)
                        .put_status(status),
                };
                self.writer.push(frame.finish());
                Ok(())
            }
            ANTOCS_CHUNK_CHECKSUM_TAB => {
                let chunk_id = rd.get_u64()?;
                let version = rd.get_u32()?;
                rd.expect_end()?;
                let frame = match ctx.store.checksum_tab(chunk_id, version) {
                    Ok(tab) => FrameBuilder::new(CSTOAN_CHUNK_CHECKSUM_TAB, 8 + 4 + 4096)
                        .put_u64(chunk_id)
                        .put_u32(version)
                        .put_bytes(&tab),
                    Err(status) => FrameBuilder::new(CSTOAN_CHUNK_CHECKSUM_TAB, 8 + 4 + 1)
                        .put_u64(chunk_id)
                        .put_u32(version)
                        .put_status(status),
                };
                self.writer.push(frame.finish());
                Ok(())
            }
            CUTOCS_HDD_LIST => {
                rd.expect_end()?;
                self.send_hdd_list(ctx.store);
                Ok(())
            }
            other => {
                log::info!("got unknown message from client (type {})", other);
                self.kill = true;
                Ok(())
            }
        }
    }

    // ---- reading ---------------------------------------------------------

    fn read_init(&mut self, rd: &mut PacketReader, ctx: &mut Ctx) -> Result<(), ProtoError> {
        if !matches!(self.op, Operation::Idle) {
            self.kill = true;
            return Ok(());
        }
        let chunk_id = rd.get_u64()?;
        let version = rd.get_u32()?;
        let offset = rd.get_u32()?;
        let size = rd.get_u32()?;
        rd.expect_end()?;

        if let Err(status) = ctx.store.check_chunk(chunk_id, version) {
            self.push_read_status(chunk_id, status);
            return Ok(());
        }
        if size == 0 || size > MAX_CHUNK_SIZE {
            self.push_read_status(chunk_id, Status::WrongSize);
            return Ok(());
        }
        if offset >= MAX_CHUNK_SIZE || offset as u64 + size as u64 > MAX_CHUNK_SIZE as u64 {
            self.push_read_status(chunk_id, Status::WrongOffset);
            return Ok(());
        }
        ctx.stats.hlop_read += 1;
        let job = ctx.pool.submit(JobData::Open { chunk_id });
        ctx.waiters.set(job, ClientJobCtx::ReadOpened(self.id));
        self.op = Operation::Reading {
            chunk_id,
            version,
            offset,
            size,
            job: Some(job),
            awaiting_drain: false,
        };
        Ok(())
    }

    fn read_opened(&mut self, status: Status, ctx: &mut Ctx) {
        let chunk_id = match &mut self.op {
            Operation::Reading { chunk_id, job, .. } => {
                *job = None;
                *chunk_id
            }
            _ => return,
        };
        if !status.is_ok() {
            self.push_read_status(chunk_id, status);
            self.op = Operation::Idle;
            return;
        }
        self.io_held = true;
        if self.kill {
            return; // the reaper balances the open
        }
        self.continue_read(ctx.pool, ctx.waiters);
    }

    /// Issue the read job for the next block piece.
    fn continue_read(&mut self, pool: &JobPool, waiters: &mut JobWaiters<ClientJobCtx>) {
        let (chunk_id, version, offset, size) = match &self.op {
            Operation::Reading {
                chunk_id,
                version,
                offset,
                size,
                ..
            } => (*chunk_id, *version, *offset, *size),
            _ => return,
        };
        let block = (offset >> 16) as u16;
        let block_offset = offset & 0xFFFF;
        let piece = size.min(0x10000 - block_offset);
        let job = pool.submit(JobData::Read {
            chunk_id,
            version,
            block,
            offset: block_offset,
            size: piece,
        });
        waiters.set(job, ClientJobCtx::BlockRead(self.id));
        if let Operation::Reading { job: slot, .. } = &mut self.op {
            *slot = Some(job);
        }
    }

    fn block_read(&mut self, result: JobResult, ctx: &mut Ctx) {
        let (data, crc, status) = match result {
            JobResult::Read { status, data, crc } => (data, crc, status),
            other => {
                // a cancelled job comes back plain
                (Vec::new(), 0, other.status())
            }
        };
        let (chunk_id, offset, piece) = match &mut self.op {
            Operation::Reading {
                chunk_id,
                offset,
                size,
                job,
                ..
            } => {
                *job = None;
                let block_offset = *offset & 0xFFFF;
                let piece = (*size).min(0x10000 - block_offset);
                (*chunk_id, *offset, piece)
            }
            _ => return,
        };

        if self.kill {
            return;
        }
        if !status.is_ok() {
            self.push_read_status(chunk_id, status);
            self.finish_read(chunk_id, ctx);
            return;
        }

        let block = (offset >> 16) as u16;
        let block_offset = (offset & 0xFFFF) as u16;
        self.writer.push(
            FrameBuilder::new(CSTOCU_READ_DATA, 8 + 2 + 2 + 4 + 4 + data.len())
                .put_u64(chunk_id)
                .put_u16(block)
                .put_u16(block_offset)
                .put_u32(piece)
                .put_u32(crc)
                .put_bytes(&data)
                .finish(),
        );

        let done = match &mut self.op {
            Operation::Reading { offset, size, .. } => {
                *offset += piece;
                *size -= piece;
                *size == 0
            }
            _ => return,
        };
        if done {
            self.push_read_status(chunk_id, Status::Ok);
            self.finish_read(chunk_id, ctx);
        } else if let Operation::Reading { awaiting_drain, .. } = &mut self.op {
            // next piece once the queued frames reached the client
            *awaiting_drain = true;
        }
    }

    fn finish_read(&mut self, chunk_id: u64, ctx: &mut Ctx) {
        if self.io_held {
            let job = ctx.pool.submit(JobData::Close { chunk_id });
            ctx.waiters.set(job, ClientJobCtx::Closed);
            self.io_held = false;
        }
        self.op = Operation::Idle;
    }

    // ---- writing ---------------------------------------------------------

    fn write_init(&mut self, rd: &mut PacketReader, ctx: &mut Ctx) -> Result<(), ProtoError> {
        if !matches!(self.op, Operation::Idle) {
            self.kill = true;
            return Ok(());
        }
        let chunk_id = rd.get_u64()?;
        let version = rd.get_u32()?;
        let chain = rd.get_rest();
        if chain.len() % 6 != 0 {
            return Err(ProtoError::WrongSize {
                got: chain.len() as u32,
                expected: "multiple of 6 chain bytes",
            });
        }

        if let Err(status) = ctx.store.check_chunk(chunk_id, version) {
            self.push_write_status(chunk_id, 0, status);
            return Ok(());
        }

        if !chain.is_empty() {
            let mut hop = PacketReader::new(chain);
            let ip = hop.get_u32()?;
            let port = hop.get_u16()?;
            let rest = hop.get_rest().to_vec();
            match ctx.peers.connect(ip, port, self.id) {
                Some((peer, established)) => {
                    self.peer = Some(peer);
                    self.op = Operation::Connecting {
                        chunk_id,
                        version,
                        chain: rest,
                    };
                    if established {
                        self.peer_connected(ctx);
                    }
                }
                None => {
                    self.push_write_status(chunk_id, 0, Status::CantConnect);
                    self.op = Operation::WriteError;
                }
            }
        } else {
            // last hop of the chain
            let job = ctx.pool.submit(JobData::Open { chunk_id });
            ctx.waiters.set(job, ClientJobCtx::WriteOpened(self.id));
            self.op = Operation::Writing {
                chunk_id,
                version,
                job: Some(job),
            };
        }
        Ok(())
    }

    /// The downstream hop is up: forward the handshake, then open the chunk.
    fn peer_connected(&mut self, ctx: &mut Ctx) {
        let (chunk_id, version, chain) = match &mut self.op {
            Operation::Connecting {
                chunk_id,
                version,
                chain,
            } => (*chunk_id, *version, std::mem::take(chain)),
            _ => {
                self.kill = true;
                return;
            }
        };
        if let Some(peer) = self.peer {
            ctx.peers.send_write_init(peer, chunk_id, version, &chain);
        }
        let job = ctx.pool.submit(JobData::Open { chunk_id });
        ctx.waiters.set(job, ClientJobCtx::WriteOpened(self.id));
        self.op = Operation::Writing {
            chunk_id,
            version,
            job: Some(job),
        };
    }

    fn write_opened(&mut self, status: Status, ctx: &mut Ctx) {
        let chunk_id = match &mut self.op {
            Operation::Writing { chunk_id, job, .. } => {
                *job = None;
                *chunk_id
            }
            _ => return,
        };
        if !status.is_ok() {
            self.push_write_status(chunk_id, 0, status);
            self.drop_chain(ctx);
            self.op = Operation::WriteError;
            return;
        }
        self.io_held = true;
        if self.kill {
            return;
        }
        ctx.stats.hlop_write += 1;
        if self.peer.is_none() {
            // the chain ends here, acknowledge the handshake
            self.push_write_status(chunk_id, 0, Status::Ok);
        }
    }

    fn write_data(&mut self, rd: &mut PacketReader, ctx: &mut Ctx) -> Result<(), ProtoError> {
        let chunk_id = rd.get_u64()?;
        let write_id = rd.get_u32()?;
        let block = rd.get_u16()?;
        let offset = rd.get_u16()?;
        let size = rd.get_u32()?;
        let crc = rd.get_u32()?;
        let data = rd.get_bytes(size as usize)?.to_vec();
        rd.expect_end()?;

        match &self.op {
            Operation::Writing { job: None, .. } => {}
            Operation::WriteError => {
                self.push_write_status(chunk_id, write_id, Status::Disconnected);
                return Ok(());
            }
            _ => return Ok(()), // not writing: drop the frame
        }
        let (own_chunk, version) = match &self.op {
            Operation::Writing {
                chunk_id, version, ..
            } => (*chunk_id, *version),
            _ => unreachable!(),
        };
        if chunk_id != own_chunk {
            self.push_write_status(chunk_id, write_id, Status::WrongChunkId);
            self.write_failed(own_chunk, ctx);
            return Ok(());
        }

        let job = ctx.pool.submit(JobData::Write {
            chunk_id,
            version,
            write_id,
            block,
            offset,
            crc,
            data,
        });
        ctx.waiters.set(job, ClientJobCtx::BlockWritten(self.id));
        if let Operation::Writing { job: slot, .. } = &mut self.op {
            *slot = Some(job);
        }
        Ok(())
    }

    fn block_written(&mut self, result: JobResult, ctx: &mut Ctx) {
        let status = result.status();
        let own_chunk = match &mut self.op {
            Operation::Writing { chunk_id, job, .. } => {
                *job = None;
                *chunk_id
            }
            _ => return,
        };
        if self.kill {
            return;
        }
        match result {
            JobResult::Write {
                status,
                chunk_id,
                write_id,
                block,
                offset,
                crc,
                data,
            } if status.is_ok() => match self.peer {
                Some(peer) => {
                    ctx.peers
                        .send_write_data(peer, chunk_id, write_id, block, offset, crc, &data);
                }
                None => self.push_write_status(chunk_id, write_id, Status::Ok),
            },
            JobResult::Write {
                chunk_id, write_id, ..
            } => {
                self.push_write_status(chunk_id, write_id, status);
                self.write_failed(own_chunk, ctx);
            }
            _ => {
                // cancelled: the write never ran
                self.push_write_status(own_chunk, 0, status);
                self.write_failed(own_chunk, ctx);
            }
        }
    }

    fn peer_write_status(&mut self, chunk_id: u64, write_id: u32, status: Status, ctx: &mut Ctx) {
        if !matches!(self.op, Operation::Writing { .. }) {
            return;
        }
        self.push_write_status(chunk_id, write_id, status);
        if !status.is_ok() {
            let own_chunk = match &self.op {
                Operation::Writing { chunk_id, .. } => *chunk_id,
                _ => return,
            };
            self.write_failed(own_chunk, ctx);
        }
    }

    /// The downstream hop died: tell the client and stop accepting writes.
    fn peer_failed(&mut self, ctx: &mut Ctx) {
        self.peer = None;
        let (chunk_id, status) = match &self.op {
            Operation::Connecting { chunk_id, .. } => (*chunk_id, Status::CantConnect),
            Operation::Writing { chunk_id, .. } => (*chunk_id, Status::Disconnected),
            _ => return,
        };
        self.push_write_status(chunk_id, 0, status);
        if self.io_held {
            let job = ctx.pool.submit(JobData::Close { chunk_id });
            ctx.waiters.set(job, ClientJobCtx::Closed);
            self.io_held = false;
        }
        self.op = Operation::WriteError;
    }

    fn drop_chain(&mut self, ctx: &mut Ctx) {
        if let Some(peer) = self.peer.take() {
            ctx.peers.detach(peer);
        }
    }

    fn write_failed(&mut self, chunk_id: u64, ctx: &mut Ctx) {
        self.drop_chain(ctx);
        if self.io_held {
            let job = ctx.pool.submit(JobData::Close { chunk_id });
            ctx.waiters.set(job, ClientJobCtx::Closed);
            self.io_held = false;
        }
        self.op = Operation::WriteError;
    }

    // ---- disk info -------------------------------------------------------

    fn send_hdd_list(&mut self, store: &ChunkStore) {
        let mut payload = Vec::new();
        for info in store.disk_info() {
            let path = info.path.as_bytes();
            if path.len() > 255 {
                payload.push(255);
                payload.extend_from_slice(b"(...)");
                payload.extend_from_slice(&path[path.len() - 250..]);
            } else {
                payload.push(path.len() as u8);
                payload.extend_from_slice(path);
            }
            payload.push(info.flags);
            payload.extend_from_slice(&info.last_error_chunk.to_be_bytes());
            payload.extend_from_slice(&info.last_error_time.to_be_bytes());
            payload.extend_from_slice(&info.used.to_be_bytes());
            payload.extend_from_slice(&info.total.to_be_bytes());
            payload.extend_from_slice(&info.chunk_count.to_be_bytes());
        }
        self.writer.push(
            FrameBuilder::new(CSTOCU_HDD_LIST, payload.len())
                .put_bytes(&payload)
                .finish(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mfs_store::{FolderConfig, BLOCK_SIZE};
    use std::io::{Read, Write};
    use std::sync::Arc;

    fn crc32(data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    struct Rig {
        serv: ClientServ,
        client: TcpStream,
        conn: ConnId,
        store: Arc<ChunkStore>,
        pool: Arc<JobPool>,
        waiters: JobWaiters<ClientJobCtx>,
        peers: PeerPool,
        _dir: tempfile::TempDir,
    }

    fn setup() -> Rig {
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
        settings.listen_host = "127.0.0.1".into();
        settings.listen_port = "0".into();
        let mut serv = ClientServ::new(&settings).unwrap();
        let port = serv.listener.local_addr().unwrap().port();

        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for _ in 0..100 {
            serv.accept_ready();
            if !serv.conns.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let conn = *serv.conns.keys().next().expect("no connection accepted");

        Rig {
            serv,
            client,
            conn,
            store,
            pool,
            waiters: JobWaiters::new(),
            peers: PeerPool::new(Duration::from_secs(60)),
            _dir: dir,
        }
    }

    impl Rig {
        fn send(&mut self, frame: &[u8]) {
            self.client.write_all(frame).unwrap();
            // the frame needs at least two reads (header, body)
            for _ in 0..50 {
                self.serv.handle_readable(
                    self.conn,
                    &self.store,
                    &self.pool,
                    &mut self.waiters,
                    &mut self.peers,
                );
            }
        }

        /// Run queued jobs and dispatch their completions.
        fn pump(&mut self) {
            loop {
                let mut progressed = false;
                while self.pool.jobs_count() > 0 {
                    self.pool.worker_step();
                    progressed = true;
                }
                let done = self.pool.drain_completions();
                if done.is_empty() && !progressed {
                    break;
                }
                for (id, result) in done {
                    if let Some(ctx) = self.waiters.take(id) {
                        self.serv.job_finished(
                            ctx,
                            result,
                            &self.store,
                            &self.pool,
                            &mut self.waiters,
                            &mut self.peers,
                        );
                    }
                }
            }
        }

        fn flush(&mut self) {
            for _ in 0..1000 {
                let set = self.serv.poll_set(&self.peers);
                let wants_write = set.iter().any(|&(id, _, _, w)| id == self.conn && w);
                if !wants_write {
                    break;
                }
                self.serv
                    .handle_writable(self.conn, &self.pool, &mut self.waiters);
            }
        }

        fn recv_frame(&mut self) -> (u32, Vec<u8>) {
            let mut hdr = [0u8; mfs_proto::HDR_SIZE];
            self.client.read_exact(&mut hdr).unwrap();
            let (msg_type, length) = mfs_proto::parse_header(&hdr);
            let mut body = vec![0u8; length as usize];
            self.client.read_exact(&mut body).unwrap();
            (msg_type, body)
        }
    }

    fn read_request(chunk_id: u64, version: u32, offset: u32, size: u32) -> Vec<u8> {
        FrameBuilder::new(CUTOCS_READ, 20)
            .put_u64(chunk_id)
            .put_u32(version)
            .put_u32(offset)
            .put_u32(size)
            .finish()
    }

    fn write_data_frame(
        chunk_id: u64,
        write_id: u32,
        block: u16,
        offset: u16,
        data: &[u8],
    ) -> Vec<u8> {
        FrameBuilder::new(CUTOCS_WRITE_DATA, 24 + data.len())
            .put_u64(chunk_id)
            .put_u32(write_id)
            .put_u16(block)
            .put_u16(offset)
            .put_u32(data.len() as u32)
            .put_u32(crc32(data))
            .put_bytes(data)
            .finish()
    }

    #[test]
    fn read_of_missing_chunk_reports_status() {
        let mut rig = setup();
        rig.send(&read_request(0x999, 1, 0, 100));
        rig.flush();
        let (msg_type, body) = rig.recv_frame();
        assert_eq!(msg_type, CSTOCU_READ_STATUS);
        let mut rd = PacketReader::new(&body);
        assert_eq!(rd.get_u64().unwrap(), 0x999);
        assert_eq!(rd.get_status().unwrap(), Status::NoChunk);
    }

    #[test]
    fn read_request_validation() {
        let mut rig = setup();
        rig.store.create(0x1, 1).unwrap();

        rig.send(&read_request(0x1, 1, 0, 0));
        rig.flush();
        let (_, body) = rig.recv_frame();
        assert_eq!(
            PacketReader::new(&body[8..]).get_status().unwrap(),
            Status::WrongSize
        );

        rig.send(&read_request(0x1, 1, MAX_CHUNK_SIZE - 10, 100));
        rig.flush();
        let (_, body) = rig.recv_frame();
        assert_eq!(
            PacketReader::new(&body[8..]).get_status().unwrap(),
            Status::WrongOffset
        );
    }

    #[test]
    fn read_streams_blocks_and_status() {
        let mut rig = setup();
        let data: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        rig.store.create(0x5, 1).unwrap();
        rig.store.begin_io(0x5).unwrap();
        rig.store
            .write_block(0x5, 1, 0, 0, crc32(&data[..BLOCK_SIZE]), &data[..BLOCK_SIZE])
            .unwrap();
        rig.store
            .write_block(0x5, 1, 1, 0, crc32(&data[BLOCK_SIZE..]), &data[BLOCK_SIZE..])
            .unwrap();
        rig.store.end_io(0x5).unwrap();

        // crosses the block boundary: two READ_DATA frames
        let offset = BLOCK_SIZE as u32 - 600;
        let total = 1000u32;
        rig.send(&read_request(0x5, 1, offset, total));
        for _ in 0..10 {
            rig.pump();
            rig.flush();
        }

        let (msg_type, body) = rig.recv_frame();
        assert_eq!(msg_type, CSTOCU_READ_DATA);
        let mut rd = PacketReader::new(&body);
        assert_eq!(rd.get_u64().unwrap(), 0x5);
        assert_eq!(rd.get_u16().unwrap(), 0); // block
        assert_eq!(rd.get_u16().unwrap(), (BLOCK_SIZE - 600) as u16);
        assert_eq!(rd.get_u32().unwrap(), 600);
        let crc = rd.get_u32().unwrap();
        let piece = rd.get_rest();
        assert_eq!(piece, &data[BLOCK_SIZE - 600..BLOCK_SIZE]);
        assert_eq!(crc, crc32(piece));

        let (msg_type, body) = rig.recv_frame();
        assert_eq!(msg_type, CSTOCU_READ_DATA);
        let mut rd = PacketReader::new(&body);
        assert_eq!(rd.get_u64().unwrap(), 0x5);
        assert_eq!(rd.get_u16().unwrap(), 1);
        assert_eq!(rd.get_u16().unwrap(), 0);
        assert_eq!(rd.get_u32().unwrap(), 400);
        let _ = rd.get_u32().unwrap();
        assert_eq!(rd.get_rest(), &data[BLOCK_SIZE..BLOCK_SIZE + 400]);

        let (msg_type, body) = rig.recv_frame();
        assert_eq!(msg_type, CSTOCU_READ_STATUS);
        assert_eq!(
            PacketReader::new(&body[8..]).get_status().unwrap(),
            Status::Ok
        );

        // the connection is reusable afterwards
        assert!(matches!(
            rig.serv.conns.get(&rig.conn).unwrap().op,
            Operation::Idle
        ));
    }

    #[test]
    fn tail_write_acknowledges_and_stores() {
        let mut rig = setup();
        rig.store.create(0x7, 3).unwrap();

        let init = FrameBuilder::new(CUTOCS_WRITE, 12)
            .put_u64(0x7)
            .put_u32(3)
            .finish();
        rig.send(&init);
        rig.pump();
        rig.flush();

        // handshake ack carries write id 0
        let (msg_type, body) = rig.recv_frame();
        assert_eq!(msg_type, CSTOCU_WRITE_STATUS);
        let mut rd = PacketReader::new(&body);
        assert_eq!(rd.get_u64().unwrap(), 0x7);
        assert_eq!(rd.get_u32().unwrap(), 0);
        assert_eq!(rd.get_status().unwrap(), Status::Ok);

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        rig.send(&write_data_frame(0x7, 11, 0, 0, &payload));
        rig.pump();
        rig.flush();

        let (msg_type, body) = rig.recv_frame();
        assert_eq!(msg_type, CSTOCU_WRITE_STATUS);
        let mut rd = PacketReader::new(&body);
        assert_eq!(rd.get_u64().unwrap(), 0x7);
        assert_eq!(rd.get_u32().unwrap(), 11);
        assert_eq!(rd.get_status().unwrap(), Status::Ok);

        rig.store.begin_io(0x7).unwrap();
        let (data, _) = rig.store.read_block(0x7, 3, 0, 0, 4096).unwrap();
        assert_eq!(data, payload);
        rig.store.end_io(0x7).unwrap();
    }

    #[test]
    fn wrong_chunk_id_flips_connection_to_write_error() {
        let mut rig = setup();
        rig.store.create(0x8, 1).unwrap();

        let init = FrameBuilder::new(CUTOCS_WRITE, 12)
            .put_u64(0x8)
            .put_u32(1)
            .finish();
        rig.send(&init);
        rig.pump();
        rig.flush();
        let _handshake = rig.recv_frame();

        rig.send(&write_data_frame(0x9, 1, 0, 0, b"abc"));
        rig.pump();
        rig.flush();
        let (_, body) = rig.recv_frame();
        assert_eq!(
            PacketReader::new(&body[12..]).get_status().unwrap(),
            Status::WrongChunkId
        );

        // later writes are refused but the connection survives
        rig.send(&write_data_frame(0x8, 2, 0, 0, b"abc"));
        rig.pump();
        rig.flush();
        let (_, body) = rig.recv_frame();
        assert_eq!(
            PacketReader::new(&body[12..]).get_status().unwrap(),
            Status::Disconnected
        );
        assert_eq!(rig.serv.connection_count(), 1);
    }

    #[test]
    fn get_chunk_blocks_served_inline() {
        let mut rig = setup();
        rig.store.create(0xA, 2).unwrap();
        let req = FrameBuilder::new(CSTOCS_GET_CHUNK_BLOCKS, 12)
            .put_u64(0xA)
            .put_u32(2)
            .finish();
        rig.send(&req);
        rig.flush();
        let (msg_type, body) = rig.recv_frame();
        assert_eq!(msg_type, CSTOCS_GET_CHUNK_BLOCKS_STATUS);
        let mut rd = PacketReader::new(&body);
        assert_eq!(rd.get_u64().unwrap(), 0xA);
        assert_eq!(rd.get_u32().unwrap(), 2);
        assert_eq!(rd.get_u16().unwrap(), 0);
        assert_eq!(rd.get_status().unwrap(), Status::Ok);
    }

    #[test]
    fn unknown_type_kills_the_connection() {
        let mut rig = setup();
        let junk = FrameBuilder::new(0xDEAD, 0).finish();
        rig.send(&junk);
        rig.serv.maintain(
            Instant::now(),
            &rig.pool,
            &mut rig.waiters,
            &mut rig.peers,
        );
        assert_eq!(rig.serv.connection_count(), 0);
    }
}
