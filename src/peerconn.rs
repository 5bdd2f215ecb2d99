//! Outbound connections to other chunkservers, serving as the next hop of
//! client write chains. Owners (client connections) are linked by id; every
//! state change the owner must hear about comes back as a [PeerEvent] that
//! the event loop routes to the client server.

use std::collections::HashMap;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use mfs_proto::{
    FrameBuilder, PacketReader, Status, ANTOAN_NOP, CSTOCU_WRITE_STATUS, CUTOCS_WRITE,
    CUTOCS_WRITE_DATA, MAX_PACKET_SIZE,
};

use crate::csserv::ConnId;
use crate::netframe::{FrameReader, FrameWriter, ReadOutcome};
use crate::sockets;

pub type PeerId = u32;

#[derive(PartialEq)]
enum PeerMode {
    Connecting,
    Connected,
    Kill,
}

pub enum PeerEvent {
    /// The nonblocking connect finished; the chain hop is usable.
    Connected { client: ConnId },
    /// The downstream hop acknowledged one write.
    WriteStatus {
        client: ConnId,
        chunk_id: u64,
        write_id: u32,
        status: Status,
    },
    /// The hop is gone; the owner picks the status to report upstream from
    /// its own state (connect never finished vs established link lost).
    Failed { client: ConnId },
}

struct PeerConn {
    mode: PeerMode,
    sock: TcpStream,
    reader: FrameReader,
    writer: FrameWriter,
    last_read: Instant,
    last_write: Instant,
    /// None once the owner detached; the connection then dies silently.
    client: Option<ConnId>,
}

pub struct PeerPool {
    conns: HashMap<PeerId, PeerConn>,
    next_id: PeerId,
    timeout: Duration,
    bytes_in: u64,
    bytes_out: u64,
}

impl PeerPool {
    pub fn new(timeout: Duration) -> Self {
        PeerPool {
            conns: HashMap::new(),
            next_id: 1,
            timeout,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Start connecting to `ip:port` on behalf of a client connection.
    /// Returns the peer id and whether the connect already finished.
    pub fn connect(&mut self, ip: u32, port: u16, client: ConnId) -> Option<(PeerId, bool)> {
        let (sock, established) = match sockets::connect_nonblocking(ip, port) {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("{}", err);
                return None;
            }
        };
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.conns.insert(
            id,
            PeerConn {
                mode: if established {
                    PeerMode::Connected
                } else {
                    PeerMode::Connecting
                },
                sock,
                reader: FrameReader::new(MAX_PACKET_SIZE),
                writer: FrameWriter::new(),
                last_read: Instant::now(),
                last_write: Instant::now(),
                client: Some(client),
            },
        );
        Some((id, established))
    }

    /// The owner is done with this hop; the connection winds down without
    /// reporting back.
    pub fn detach(&mut self, id: PeerId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.client = None;
            conn.mode = PeerMode::Kill;
        }
    }

    /// More than one queued outbound frame means the hop is not keeping up;
    /// the client-side reader pauses until the queue drains.
    pub fn queue_is_filled(&self, id: PeerId) -> bool {
        self.conns
            .get(&id)
            .map(|conn| conn.writer.queued_frames() > 1)
            .unwrap_or(false)
    }

    /// Forward the write handshake: chunk, version and the rest of the chain.
    pub fn send_write_init(&mut self, id: PeerId, chunk_id: u64, version: u32, chain: &[u8]) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.writer.push(
                FrameBuilder::new(CUTOCS_WRITE, 8 + 4 + chain.len())
                    .put_u64(chunk_id)
                    .put_u32(version)
                    .put_bytes(chain)
                    .finish(),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_write_data(
        &mut self,
        id: PeerId,
        chunk_id: u64,
        write_id: u32,
        block: u16,
        offset: u16,
        crc: u32,
        data: &[u8],
    ) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.writer.push(
                FrameBuilder::new(CUTOCS_WRITE_DATA, 8 + 4 + 2 + 2 + 4 + 4 + data.len())
                    .put_u64(chunk_id)
                    .put_u32(write_id)
                    .put_u16(block)
                    .put_u16(offset)
                    .put_u32(data.len() as u32)
                    .put_u32(crc)
                    .put_bytes(data)
                    .finish(),
            );
        }
    }

    /// `(peer, fd, wants_read, wants_write)` for the poll set.
    pub fn poll_set(&self) -> Vec<(PeerId, RawFd, bool, bool)> {
        self.conns
            .iter()
            .filter(|(_, conn)| conn.mode != PeerMode::Kill)
            .map(|(&id, conn)| {
                let fd = conn.sock.as_raw_fd();
                match conn.mode {
                    PeerMode::Connecting => (id, fd, false, true),
                    _ => (id, fd, true, !conn.writer.is_empty()),
                }
            })
            .collect()
    }

    pub fn handle_readable(&mut self, id: PeerId, events: &mut Vec<PeerEvent>) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) if conn.mode == PeerMode::Connected => conn,
            _ => return,
        };
        match conn.reader.read(&mut (&conn.sock)) {
            Ok(ReadOutcome::Pending) => {
                conn.last_read = Instant::now();
            }
            Ok(ReadOutcome::Frame(msg_type, body)) => {
                conn.last_read = Instant::now();
                self.bytes_in += (mfs_proto::HDR_SIZE + body.len()) as u64;
                Self::got_packet(conn, msg_type, &body, events);
            }
            Ok(ReadOutcome::Closed) => {
                conn.mode = PeerMode::Kill;
            }
            Err(err) => {
                log::info!("chunkserver peer read error - {}", err);
                conn.mode = PeerMode::Kill;
            }
        }
    }

    fn got_packet(conn: &mut PeerConn, msg_type: u32, body: &[u8], events: &mut Vec<PeerEvent>) {
        match msg_type {
            ANTOAN_NOP => {}
            CSTOCU_WRITE_STATUS => {
                let mut rd = PacketReader::new(body);
                let parsed = (|| {
                    let chunk_id = rd.get_u64()?;
                    let write_id = rd.get_u32()?;
                    let status = rd.get_status()?;
                    rd.expect_end()?;
                    Ok::<_, mfs_proto::ProtoError>((chunk_id, write_id, status))
                })();
                match parsed {
                    Ok((chunk_id, write_id, status)) => {
                        if let Some(client) = conn.client {
                            events.push(PeerEvent::WriteStatus {
                                client,
                                chunk_id,
                                write_id,
                                status,
                            });
                        }
                    }
                    Err(err) => {
                        log::warn!("malformed WRITE_STATUS from peer - {}", err);
                        conn.mode = PeerMode::Kill;
                    }
                }
            }
            other => {
                log::info!("got unknown message from chunkserver peer (type {})", other);
            }
        }
    }

    pub fn handle_writable(&mut self, id: PeerId, events: &mut Vec<PeerEvent>) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        match conn.mode {
            PeerMode::Connecting => match sockets::connect_finished(&conn.sock) {
                Ok(()) => {
                    conn.mode = PeerMode::Connected;
                    conn.last_read = Instant::now();
                    conn.last_write = Instant::now();
                    if let Some(client) = conn.client {
                        events.push(PeerEvent::Connected { client });
                    }
                }
                Err(err) => {
                    log::warn!("chunkserver peer {}", err);
                    conn.mode = PeerMode::Kill;
                }
            },
            PeerMode::Connected => match conn.writer.write(&mut (&conn.sock)) {
                Ok(n) => {
                    if n > 0 {
                        self.bytes_out += n as u64;
                        conn.last_write = Instant::now();
                    }
                }
                Err(err) => {
                    log::info!("chunkserver peer write error - {}", err);
                    conn.mode = PeerMode::Kill;
                }
            },
            PeerMode::Kill => {}
        }
    }

    /// Timeouts, keepalive and removal of dead connections.
    pub fn maintain(&mut self, now: Instant, events: &mut Vec<PeerEvent>) {
        for conn in self.conns.values_mut() {
            if conn.mode == PeerMode::Connected {
                if now.duration_since(conn.last_read) > self.timeout {
                    log::info!("chunkserver peer timed out");
                    conn.mode = PeerMode::Kill;
                } else if now.duration_since(conn.last_write) > self.timeout / 2
                    && conn.writer.is_empty()
                {
                    conn.writer.push(FrameBuilder::new(ANTOAN_NOP, 0).finish());
                }
            }
        }
        self.conns.retain(|_, conn| {
            if conn.mode != PeerMode::Kill {
                return true;
            }
            if let Some(client) = conn.client {
                events.push(PeerEvent::Failed { client });
            }
            false
        });
    }

    pub fn take_stats(&mut self) -> (u64, u64) {
        (
            std::mem::take(&mut self.bytes_in),
            std::mem::take(&mut self.bytes_out),
        )
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}
