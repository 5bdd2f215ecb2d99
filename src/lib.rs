//! MooseFS-style chunkserver.
//!
//! Stores fixed-size file fragments ("chunks") as CRC-protected local
//! files, serves them to clients, forwards chained writes to downstream
//! chunkservers, replicates chunks from peers, and reports state to the
//! metadata master over a framed big-endian TCP protocol.
//!
//! Architecture: a single-threaded event loop ([mainloop]) owns every
//! connection and all completion hooks; bounded pools of worker threads
//! ([jobs]) perform the blocking disk and replication work, waking the
//! loop through a pipe. The chunk store itself lives in the `mfs-store`
//! crate, the wire protocol in `mfs-proto`.

pub mod charts;
pub mod config;
pub mod csserv;
pub mod jobs;
pub mod mainloop;
pub mod masterconn;
pub mod netframe;
pub mod peerconn;
pub mod queue;
pub mod replicator;
pub mod sockets;
