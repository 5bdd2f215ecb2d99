//! Replication pull: fetch one chunk from a peer chunkserver.
//!
//! Runs on a worker thread with its own blocking connection. The chunk is
//! created locally at version 0, filled block by block from the peer's
//! `READ_DATA` stream, and promoted to the target version only after the
//! final OK status. Any failure deletes the partial chunk, so no half
//! replica ever survives under the real version.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mfs_proto::{
    parse_header, FrameBuilder, PacketReader, Status, ANTOAN_NOP, CSTOCS_GET_CHUNK_BLOCKS,
    CSTOCS_GET_CHUNK_BLOCKS_STATUS, CSTOCU_READ_DATA, CSTOCU_READ_STATUS, CUTOCS_READ, HDR_SIZE,
    MAX_PACKET_SIZE,
};
use mfs_store::{ChunkStore, BLOCK_SIZE};

static REPLICATIONS: AtomicU64 = AtomicU64::new(0);

/// Replications started since the last charts sample.
pub fn take_replication_count() -> u64 {
    REPLICATIONS.swap(0, Ordering::Relaxed)
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u32, Vec<u8>)> {
    let mut hdr = [0u8; HDR_SIZE];
    stream.read_exact(&mut hdr)?;
    let (msg_type, length) = parse_header(&hdr);
    if length > MAX_PACKET_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("packet too long ({}/{})", length, MAX_PACKET_SIZE),
        ));
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body)?;
    Ok((msg_type, body))
}

struct Pull<'a> {
    store: &'a ChunkStore,
    chunk_id: u64,
    io_held: bool,
}

impl Pull<'_> {
    fn fail(&mut self, status: Status) -> Status {
        if self.io_held {
            let _ = self.store.end_io(self.chunk_id);
            self.io_held = false;
        }
        let _ = self.store.delete(self.chunk_id, 0);
        status
    }
}

/// Pull `chunk_id` at `version` from the peer at `ip:port`.
pub fn replicate(
    store: &ChunkStore,
    chunk_id: u64,
    version: u32,
    ip: u32,
    port: u16,
    timeout: Duration,
) -> Status {
    REPLICATIONS.fetch_add(1, Ordering::Relaxed);

    if let Err(status) = store.create(chunk_id, 0) {
        return status;
    }
    let mut pull = Pull {
        store,
        chunk_id,
        io_held: false,
    };

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port));
    let mut stream = match TcpStream::connect_timeout(&addr, timeout) {
        Ok(stream) => stream,
        Err(err) => {
            log::warn!("replication source {} unreachable - {}", addr, err);
            return pull.fail(Status::CantConnect);
        }
    };
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));
    let _ = stream.set_nodelay(true);

    if let Err(status) = store.begin_io(chunk_id) {
        return pull.fail(status);
    }
    pull.io_held = true;

    let request = FrameBuilder::new(CSTOCS_GET_CHUNK_BLOCKS, 8 + 4)
        .put_u64(chunk_id)
        .put_u32(version)
        .finish();
    if let Err(err) = stream.write_all(&request) {
        log::warn!("replication send to {} failed - {}", addr, err);
        return pull.fail(Status::Disconnected);
    }

    let mut expected_blocks: Option<u16> = None;
    let mut written_blocks: u16 = 0;

    loop {
        let (msg_type, body) = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("replication read from {} failed - {}", addr, err);
                return pull.fail(Status::Disconnected);
            }
        };
        let mut rd = PacketReader::new(&body);
        match msg_type {
            ANTOAN_NOP => {}
            CSTOCS_GET_CHUNK_BLOCKS_STATUS => {
                let parsed = (|| {
                    let id = rd.get_u64()?;
                    let ver = rd.get_u32()?;
                    let blocks = rd.get_u16()?;
                    let status = rd.get_status()?;
                    rd.expect_end()?;
                    Ok::<_, mfs_proto::ProtoError>((id, ver, blocks, status))
                })();
                let (id, _ver, blocks, status) = match parsed {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("malformed GET_CHUNK_BLOCKS_STATUS from {} - {}", addr, err);
                        return pull.fail(Status::Disconnected);
                    }
                };
                if id != chunk_id {
                    return pull.fail(Status::WrongChunkId);
                }
                if !status.is_ok() {
                    return pull.fail(status);
                }
                if blocks == 0 {
                    break; // empty chunk: nothing to transfer
                }
                expected_blocks = Some(blocks);
                let read_req = FrameBuilder::new(CUTOCS_READ, 8 + 4 + 4 + 4)
                    .put_u64(chunk_id)
                    .put_u32(version)
                    .put_u32(0)
                    .put_u32(blocks as u32 * BLOCK_SIZE as u32)
                    .finish();
                if let Err(err) = stream.write_all(&read_req) {
                    log::warn!("replication send to {} failed - {}", addr, err);
                    return pull.fail(Status::Disconnected);
                }
            }
            CSTOCU_READ_DATA => {
                let parsed = (|| {
                    let id = rd.get_u64()?;
                    let block = rd.get_u16()?;
                    let offset = rd.get_u16()?;
                    let size = rd.get_u32()?;
                    let crc = rd.get_u32()?;
                    let data = rd.get_bytes(size as usize)?;
                    rd.expect_end()?;
                    Ok::<_, mfs_proto::ProtoError>((id, block, offset, size, crc, data))
                })();
                let (id, block, offset, _size, crc, data) = match parsed {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("malformed READ_DATA from {} - {}", addr, err);
                        return pull.fail(Status::Disconnected);
                    }
                };
                if id != chunk_id {
                    return pull.fail(Status::WrongChunkId);
                }
                if let Err(status) =
                    store.write_block(chunk_id, 0, block, offset as u32, crc, data)
                {
                    return pull.fail(status);
                }
                written_blocks = written_blocks.max(block + 1);
            }
            CSTOCU_READ_STATUS => {
                let parsed = (|| {
                    let id = rd.get_u64()?;
                    let status = rd.get_status()?;
                    rd.expect_end()?;
                    Ok::<_, mfs_proto::ProtoError>((id, status))
                })();
                let (id, status) = match parsed {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("malformed READ_STATUS from {} - {}", addr, err);
                        return pull.fail(Status::Disconnected);
                    }
                };
                if id != chunk_id {
                    return pull.fail(Status::WrongChunkId);
                }
                if !status.is_ok() {
                    return pull.fail(status);
                }
                if expected_blocks != Some(written_blocks) {
                    log::warn!(
                        "replication of chunk {:016X} ended short ({}/{:?} blocks)",
                        chunk_id,
                        written_blocks,
                        expected_blocks
                    );
                    return pull.fail(Status::Disconnected);
                }
                break;
            }
            other => {
                log::warn!("unexpected message {} from replication source {}", other, addr);
                return pull.fail(Status::Disconnected);
            }
        }
    }

    pull.io_held = false;
    if let Err(status) = store.end_io(chunk_id) {
        let _ = store.delete(chunk_id, 0);
        return status;
    }
    if let Err(status) = store.set_version(chunk_id, version, 0) {
        let _ = store.delete(chunk_id, 0);
        return status;
    }
    Status::Ok
}
