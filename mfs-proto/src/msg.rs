//! Message type constants.
//!
//! Numbering is block-per-family; every port of the system uses the same
//! table, so a connection can be killed on any type it does not serve.

// ANY <-> ANY
pub const ANTOAN_NOP: u32 = 0;

// ADMIN/TOOLS <-> CHUNKSERVER
pub const ANTOCS_CHUNK_CHECKSUM: u32 = 300;
pub const CSTOAN_CHUNK_CHECKSUM: u32 = 301;
pub const ANTOCS_CHUNK_CHECKSUM_TAB: u32 = 302;
pub const CSTOAN_CHUNK_CHECKSUM_TAB: u32 = 303;

// CHUNKSERVER -> MASTER
pub const CSTOMA_REGISTER: u32 = 400;
pub const CSTOMA_SPACE: u32 = 401;
pub const CSTOMA_CHUNK_DAMAGED: u32 = 402;
pub const CSTOMA_CHUNK_LOST: u32 = 403;
pub const CSTOMA_ERROR_OCCURRED: u32 = 404;

// MASTER -> CHUNKSERVER (commands) and their responses
pub const MATOCS_STRUCTURE_LOG: u32 = 405;
pub const MATOCS_STRUCTURE_LOG_ROTATE: u32 = 406;
pub const MATOCS_CREATE: u32 = 410;
pub const CSTOMA_CREATE: u32 = 411;
pub const MATOCS_DELETE: u32 = 412;
pub const CSTOMA_DELETE: u32 = 413;
pub const MATOCS_DUPLICATE: u32 = 414;
pub const CSTOMA_DUPLICATE: u32 = 415;
pub const MATOCS_SET_VERSION: u32 = 416;
pub const CSTOMA_SET_VERSION: u32 = 417;
pub const MATOCS_REPLICATE: u32 = 418;
pub const CSTOMA_REPLICATE: u32 = 419;
pub const MATOCS_TRUNCATE: u32 = 420;
pub const CSTOMA_TRUNCATE: u32 = 421;
pub const MATOCS_DUPTRUNC: u32 = 422;
pub const CSTOMA_DUPTRUNC: u32 = 423;

// CLIENT <-> CHUNKSERVER
pub const CUTOCS_READ: u32 = 500;
pub const CSTOCU_READ_DATA: u32 = 501;
pub const CSTOCU_READ_STATUS: u32 = 502;
pub const CUTOCS_WRITE: u32 = 503;
pub const CUTOCS_WRITE_DATA: u32 = 504;
pub const CSTOCU_WRITE_STATUS: u32 = 505;
pub const CUTOCS_HDD_LIST: u32 = 510;
pub const CSTOCU_HDD_LIST: u32 = 511;

// CHUNKSERVER <-> CHUNKSERVER
pub const CSTOCS_GET_CHUNK_BLOCKS: u32 = 600;
pub const CSTOCS_GET_CHUNK_BLOCKS_STATUS: u32 = 601;

/// Registration protocol tag sent when the master timeout is the 60s default.
pub const REGISTER_V2: u8 = 2;
/// Registration tag carrying an explicit timeout field.
pub const REGISTER_V3: u8 = 3;

/// Bit set on a chunk version in the registration listing when the chunk
/// lives on a draining folder.
pub const REGISTER_TODEL_BIT: u32 = 0x8000_0000;
