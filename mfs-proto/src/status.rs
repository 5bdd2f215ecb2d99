use std::fmt;

/// Protocol status byte carried by every command response.
///
/// This is a closed set: unknown bytes decode to [Status::Einval] rather
/// than failing the frame, since a response must always be deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Eperm = 1,
    Enotdir = 2,
    Enoent = 3,
    Eacces = 4,
    Eexist = 5,
    Einval = 6,
    Io = 7,
    Crc = 8,
    Delayed = 9,
    NoChunk = 10,
    WrongVersion = 11,
    ChunkExist = 12,
    NoSpace = 13,
    BnumTooBig = 14,
    WrongSize = 15,
    WrongOffset = 16,
    CantConnect = 17,
    Disconnected = 18,
    WrongChunkId = 19,
    NotDone = 20,
    OutOfMemory = 21,
    Locked = 22,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Ok,
            1 => Status::Eperm,
            2 => Status::Enotdir,
            3 => Status::Enoent,
            4 => Status::Eacces,
            5 => Status::Eexist,
            7 => Status::Io,
            8 => Status::Crc,
            9 => Status::Delayed,
            10 => Status::NoChunk,
            11 => Status::WrongVersion,
            12 => Status::ChunkExist,
            13 => Status::NoSpace,
            14 => Status::BnumTooBig,
            15 => Status::WrongSize,
            16 => Status::WrongOffset,
            17 => Status::CantConnect,
            18 => Status::Disconnected,
            19 => Status::WrongChunkId,
            20 => Status::NotDone,
            21 => Status::OutOfMemory,
            22 => Status::Locked,
            _ => Status::Einval,
        }
    }
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        s as u8
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Eperm => "operation not permitted",
            Status::Enotdir => "not a directory",
            Status::Enoent => "no such file or directory",
            Status::Eacces => "permission denied",
            Status::Eexist => "already exists",
            Status::Einval => "invalid argument",
            Status::Io => "I/O error",
            Status::Crc => "CRC mismatch",
            Status::Delayed => "operation delayed",
            Status::NoChunk => "no such chunk",
            Status::WrongVersion => "wrong chunk version",
            Status::ChunkExist => "chunk already exists",
            Status::NoSpace => "no space left",
            Status::BnumTooBig => "block number too big",
            Status::WrongSize => "wrong size",
            Status::WrongOffset => "wrong offset",
            Status::CantConnect => "can't connect",
            Status::Disconnected => "disconnected",
            Status::WrongChunkId => "wrong chunk id",
            Status::NotDone => "not done",
            Status::OutOfMemory => "out of memory",
            Status::Locked => "locked",
        };
        f.write_str(name)
    }
}
