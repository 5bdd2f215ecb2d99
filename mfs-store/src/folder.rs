//! Storage folders: usage tracking, error rings, lock files.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};

/// Errors kept per folder; this many within [LAST_ERR_TIME] seconds mark the
/// folder damaged.
pub(crate) const LAST_ERR_SIZE: usize = 3;
pub(crate) const LAST_ERR_TIME: u64 = 3600;

/// Bytes kept free on every folder (the folder reports zero avail below it).
const DEFAULT_LEAVE_FREE: u64 = 0x1000_0000; // about 256 MiB

/// One configured storage directory, parsed from the hdd config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderConfig {
    pub path: PathBuf,
    /// Drain-only folder (`*` prefix in the config): keeps serving its
    /// chunks but never receives new ones.
    pub to_delete: bool,
}

#[derive(Clone, Copy)]
pub(crate) struct IoErrorRecord {
    pub chunk_id: u64,
    pub timestamp: u64,
}

pub(crate) struct FolderState {
    pub avail: u64,
    pub total: u64,
    pub chunk_count: u32,
    pub needs_refresh: bool,
    pub last_errors: [IoErrorRecord; LAST_ERR_SIZE],
    pub err_index: usize,
}

pub(crate) struct Folder {
    pub path: PathBuf,
    pub to_delete: bool,
    pub leave_free: u64,
    pub dev: u64,
    pub ino: u64,
    // held open for the lifetime of the process, keeps the fcntl lock
    _lock_file: File,
    pub state: Mutex<FolderState>,
}

impl Folder {
    pub fn open(cfg: &FolderConfig) -> Result<Self, Error> {
        std::fs::create_dir_all(&cfg.path)
            .map_err(|err| format_err!("unable to create folder {:?} - {}", cfg.path, err))?;

        let (lock_file, dev, ino) = lock_folder(&cfg.path)?;

        Ok(Folder {
            path: cfg.path.clone(),
            to_delete: cfg.to_delete,
            leave_free: DEFAULT_LEAVE_FREE,
            dev,
            ino,
            _lock_file: lock_file,
            state: Mutex::new(FolderState {
                avail: 0,
                total: 0,
                chunk_count: 0,
                needs_refresh: true,
                last_errors: [IoErrorRecord {
                    chunk_id: 0,
                    timestamp: 0,
                }; LAST_ERR_SIZE],
                err_index: 0,
            }),
        })
    }

    /// Re-read avail/total from the file system, honoring `leave_free`.
    pub fn refresh_usage(&self) {
        let mut state = self.state.lock().unwrap();
        match nix::sys::statvfs::statvfs(&self.path) {
            Ok(fsinfo) => {
                let frsize = fsinfo.fragment_size() as u64;
                state.avail = frsize * fsinfo.blocks_available() as u64;
                state.total = frsize * fsinfo.blocks() as u64;
                state.avail = state.avail.saturating_sub(self.leave_free);
            }
            Err(err) => {
                log::warn!("statvfs on {:?} failed - {}", self.path, err);
                state.avail = 0;
                state.total = 0;
            }
        }
        state.needs_refresh = false;
    }

    /// Record one I/O error into the ring.
    pub fn note_error(&self, chunk_id: u64, now: u64) {
        let mut state = self.state.lock().unwrap();
        let i = state.err_index;
        state.last_errors[i] = IoErrorRecord {
            chunk_id,
            timestamp: now,
        };
        state.err_index = (i + 1) % LAST_ERR_SIZE;
    }

    /// True when every slot of the error ring was filled within the window.
    pub fn is_damaged(&self, now: u64) -> bool {
        let state = self.state.lock().unwrap();
        state
            .last_errors
            .iter()
            .all(|e| e.timestamp + LAST_ERR_TIME >= now && e.timestamp != 0)
    }

    pub fn last_error(&self) -> IoErrorRecord {
        let state = self.state.lock().unwrap();
        let i = (state.err_index + LAST_ERR_SIZE - 1) % LAST_ERR_SIZE;
        state.last_errors[i]
    }
}

/// Per-folder row of the disk info report served to clients and tools.
pub struct DiskInfo {
    pub path: String,
    /// 0 = in use, 1 = draining, +2 when damaged.
    pub flags: u8,
    pub last_error_chunk: u64,
    pub last_error_time: u32,
    pub used: u64,
    pub total: u64,
    pub chunk_count: u32,
}

/// Create `<folder>/.lock` and take a non-blocking write lock on it, so two
/// chunkserver processes can never share a folder.
fn lock_folder(path: &PathBuf) -> Result<(File, u64, u64), Error> {
    use std::os::unix::fs::OpenOptionsExt;

    let lock_path = path.join(".lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o640)
        .open(&lock_path)
        .map_err(|err| format_err!("unable to create lock file {:?} - {}", lock_path, err))?;

    let op = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    if let Err(err) = nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op)) {
        if err == nix::errno::Errno::EAGAIN || err == nix::errno::Errno::EACCES {
            bail!("folder {:?} already locked by another process", path);
        }
        bail!("unable to lock {:?} - {}", lock_path, err);
    }

    let meta = file.metadata()?;
    Ok((file, meta.dev(), meta.ino()))
}
