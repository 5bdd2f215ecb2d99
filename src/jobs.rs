//! Background job pool.
//!
//! A fixed set of worker threads pops jobs from a byte-capped queue and runs
//! blocking chunk-store or replication work. Completions travel back on a
//! second queue; the first completion pushed onto an empty queue also writes
//! one byte to the wake pipe, which is what the event loop selects on. The
//! pipe therefore carries exactly one byte while the completion queue is
//! non-empty, and none once it has been drained.
//!
//! Jobs are cancellable but not interruptible: a disabled job that a worker
//! pops later short-circuits to [Status::NotDone] without touching disk.
//! Reply contexts live on the event-loop side in [JobWaiters]; workers
//! never see them.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{format_err, Error};

use mfs_proto::Status;
use mfs_store::{ChunkOp, ChunkStore};

use crate::queue::Queue;
use crate::replicator;

pub type JobId = u32;

#[derive(Debug)]
pub enum JobData {
    Exit,
    Inval,
    ChunkOp(ChunkOp),
    Open {
        chunk_id: u64,
    },
    Close {
        chunk_id: u64,
    },
    Read {
        chunk_id: u64,
        version: u32,
        block: u16,
        offset: u32,
        size: u32,
    },
    Write {
        chunk_id: u64,
        version: u32,
        write_id: u32,
        block: u16,
        offset: u16,
        crc: u32,
        data: Vec<u8>,
    },
    Replicate {
        chunk_id: u64,
        version: u32,
        ip: u32,
        port: u16,
    },
}

impl JobData {
    fn queue_cost(&self) -> usize {
        match self {
            JobData::Write { data, .. } => data.len(),
            _ => 1,
        }
    }
}

/// What a worker hands back; read and write jobs return their buffers and
/// frame fields so the callback can keep using them.
#[derive(Debug)]
pub enum JobResult {
    Plain(Status),
    Read {
        status: Status,
        data: Vec<u8>,
        crc: u32,
    },
    Write {
        status: Status,
        chunk_id: u64,
        write_id: u32,
        block: u16,
        offset: u16,
        crc: u32,
        data: Vec<u8>,
    },
}

impl JobResult {
    pub fn status(&self) -> Status {
        match *self {
            JobResult::Plain(status)
            | JobResult::Read { status, .. }
            | JobResult::Write { status, .. } => status,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum JobState {
    Enabled,
    Disabled,
    InProgress,
}

struct QueuedJob {
    id: JobId,
    data: JobData,
}

struct JobTable {
    states: HashMap<JobId, JobState>,
    next_id: JobId,
}

pub struct JobPool {
    store: Arc<ChunkStore>,
    peer_timeout: Duration,
    in_queue: Queue<QueuedJob>,
    done: Queue<(JobId, JobResult)>,
    pipe_r: OwnedFd,
    pipe_w: OwnedFd,
    /// Makes the "one pipe byte iff completions pending" invariant atomic.
    pipe_lock: Mutex<()>,
    jobs: Mutex<JobTable>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobPool {
    pub fn new(
        workers: u8,
        queue_cap: usize,
        store: Arc<ChunkStore>,
        peer_timeout: Duration,
    ) -> Result<Arc<Self>, Error> {
        let (pipe_r, pipe_w) =
            nix::unistd::pipe().map_err(|err| format_err!("unable to create wake pipe - {}", err))?;
        let pipe_r = unsafe { OwnedFd::from_raw_fd(pipe_r) };
        let pipe_w = unsafe { OwnedFd::from_raw_fd(pipe_w) };
        // a missing wake byte must never hang the event loop
        nix::fcntl::fcntl(
            pipe_r.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let pool = Arc::new(JobPool {
            store,
            peer_timeout,
            in_queue: Queue::new(queue_cap),
            done: Queue::new(0),
            pipe_r,
            pipe_w,
            pipe_lock: Mutex::new(()),
            jobs: Mutex::new(JobTable {
                states: HashMap::new(),
                next_id: 1,
            }),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(workers as usize);
        for i in 0..workers {
            let pool = Arc::clone(&pool);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("bgjob ({})", i))
                    .spawn(move || while pool.worker_step() {})?,
            );
        }
        *pool.workers.lock().unwrap() = handles;
        Ok(pool)
    }

    /// The fd the event loop polls for completion wake-ups.
    pub fn wake_fd(&self) -> RawFd {
        self.pipe_r.as_raw_fd()
    }

    pub fn submit(&self, data: JobData) -> JobId {
        let id = {
            let mut table = self.jobs.lock().unwrap();
            let id = table.next_id;
            table.next_id = table.next_id.wrapping_add(1);
            if table.next_id == 0 {
                table.next_id = 1;
            }
            table.states.insert(id, JobState::Enabled);
            id
        };
        let cost = data.queue_cost();
        self.in_queue.put(QueuedJob { id, data }, cost);
        id
    }

    /// Jobs queued but not yet popped by a worker.
    pub fn jobs_count(&self) -> usize {
        self.in_queue.len()
    }

    /// Advisory cancel: a worker popping this job later reports
    /// [Status::NotDone] instead of running it.
    pub fn disable_job(&self, id: JobId) {
        let mut table = self.jobs.lock().unwrap();
        if let Some(state) = table.states.get_mut(&id) {
            if *state == JobState::Enabled {
                *state = JobState::Disabled;
            }
        }
    }

    /// Disable every job that has not started yet; used when the master
    /// connection drops and pending responses become undeliverable.
    pub fn disable_all(&self) {
        let mut table = self.jobs.lock().unwrap();
        for state in table.states.values_mut() {
            if *state == JobState::Enabled {
                *state = JobState::Disabled;
            }
        }
    }

    fn send_status(&self, id: JobId, result: JobResult) {
        let _guard = self.pipe_lock.lock().unwrap();
        if self.done.is_empty() {
            // first completion: wake the event loop
            if let Err(err) = nix::unistd::write(self.pipe_w.as_raw_fd(), &[0u8]) {
                log::error!("wake pipe write failed - {}", err);
            }
        }
        self.done.put((id, result), 1);
    }

    /// Drain the completion queue, consuming the wake byte once the queue
    /// runs dry. Called from the event loop when the wake fd is readable.
    pub fn drain_completions(&self) -> Vec<(JobId, JobResult)> {
        let mut out = Vec::new();
        loop {
            let guard = self.pipe_lock.lock().unwrap();
            match self.done.try_get() {
                Some(((id, result), _)) => {
                    let drained = self.done.is_empty();
                    if drained {
                        let mut byte = [0u8; 1];
                        let _ = nix::unistd::read(self.pipe_r.as_raw_fd(), &mut byte);
                    }
                    drop(guard);
                    self.jobs.lock().unwrap().states.remove(&id);
                    out.push((id, result));
                    if drained {
                        break;
                    }
                }
                None => break,
            }
        }
        out
    }

    fn run(&self, data: JobData) -> JobResult {
        fn plain(result: Result<(), Status>) -> JobResult {
            JobResult::Plain(result.err().unwrap_or(Status::Ok))
        }
        match data {
            JobData::Exit => unreachable!("exit is handled by the worker loop"),
            JobData::Inval => JobResult::Plain(Status::Einval),
            JobData::ChunkOp(op) => plain(self.store.apply(&op)),
            JobData::Open { chunk_id } => plain(self.store.begin_io(chunk_id)),
            JobData::Close { chunk_id } => plain(self.store.end_io(chunk_id)),
            JobData::Read {
                chunk_id,
                version,
                block,
                offset,
                size,
            } => match self.store.read_block(chunk_id, version, block, offset, size) {
                Ok((data, crc)) => JobResult::Read {
                    status: Status::Ok,
                    data,
                    crc,
                },
                Err(status) => JobResult::Read {
                    status,
                    data: Vec::new(),
                    crc: 0,
                },
            },
            JobData::Write {
                chunk_id,
                version,
                write_id,
                block,
                offset,
                crc,
                data,
            } => {
                let status = self
                    .store
                    .write_block(chunk_id, version, block, offset as u32, crc, &data)
                    .err()
                    .unwrap_or(Status::Ok);
                JobResult::Write {
                    status,
                    chunk_id,
                    write_id,
                    block,
                    offset,
                    crc,
                    data,
                }
            }
            JobData::Replicate {
                chunk_id,
                version,
                ip,
                port,
            } => JobResult::Plain(replicator::replicate(
                &self.store,
                chunk_id,
                version,
                ip,
                port,
                self.peer_timeout,
            )),
        }
    }

    /// Pop and process one job. Returns false on the exit marker.
    pub(crate) fn worker_step(&self) -> bool {
        let (QueuedJob { id, data }, _) = self.in_queue.get();
        if matches!(data, JobData::Exit) {
            return false;
        }
        let enabled = {
            let mut table = self.jobs.lock().unwrap();
            match table.states.get_mut(&id) {
                Some(state) if *state == JobState::Enabled => {
                    *state = JobState::InProgress;
                    true
                }
                _ => false,
            }
        };
        let result = if enabled {
            self.run(data)
        } else {
            JobResult::Plain(Status::NotDone)
        };
        self.send_status(id, result);
        true
    }

    /// Stop the workers; queued jobs that were not popped yet are dropped.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for _ in &handles {
            self.in_queue.put(
                QueuedJob {
                    id: 0,
                    data: JobData::Exit,
                },
                1,
            );
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Event-loop-side registry pairing job ids with a typed reply context.
/// The completion drain looks the context up and discriminates on it; a job
/// whose context was dropped delivers into the void.
pub struct JobWaiters<C> {
    map: HashMap<JobId, C>,
}

impl<C> Default for JobWaiters<C> {
    fn default() -> Self {
        JobWaiters {
            map: HashMap::new(),
        }
    }
}

impl<C> JobWaiters<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: JobId, ctx: C) {
        self.map.insert(id, ctx);
    }

    pub fn take(&mut self, id: JobId) -> Option<C> {
        self.map.remove(&id)
    }

    /// Drop every pending context; the master-reconnect path uses this to
    /// turn undeliverable responses into no-ops.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Drop the contexts selected by `predicate` (e.g. every job owned by a
    /// connection that just went away).
    pub fn drop_where(&mut self, predicate: impl Fn(&C) -> bool) {
        self.map.retain(|_, ctx| !predicate(ctx));
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_store::FolderConfig;
    use nix::poll::{poll, PollFd, PollFlags};

    fn test_pool(workers: u8) -> (Arc<JobPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ChunkStore::open(&[FolderConfig {
                path: dir.path().to_path_buf(),
                to_delete: false,
            }])
            .unwrap(),
        );
        let pool = JobPool::new(workers, 0, store, Duration::from_secs(1)).unwrap();
        (pool, dir)
    }

    fn wake_fd_readable(pool: &JobPool) -> bool {
        let mut fds = [PollFd::new(pool.wake_fd(), PollFlags::POLLIN)];
        poll(&mut fds, 0).unwrap() > 0
    }

    #[test]
    fn job_runs_and_completes() {
        let (pool, _dir) = test_pool(0);
        let id = pool.submit(JobData::ChunkOp(ChunkOp::Create {
            id: 0x10,
            version: 1,
        }));
        assert_eq!(pool.jobs_count(), 1);
        assert!(pool.worker_step());

        assert!(wake_fd_readable(&pool));
        let done = pool.drain_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, id);
        assert_eq!(done[0].1.status(), Status::Ok);
        assert!(!wake_fd_readable(&pool));
        assert!(pool.store.check_chunk(0x10, 1).is_ok());
    }

    #[test]
    fn disabled_job_reports_not_done_without_side_effects() {
        let (pool, _dir) = test_pool(0);
        let id = pool.submit(JobData::ChunkOp(ChunkOp::Create {
            id: 0x20,
            version: 1,
        }));
        pool.disable_job(id);
        assert!(pool.worker_step());

        let done = pool.drain_completions();
        assert_eq!(done[0].1.status(), Status::NotDone);
        assert_eq!(pool.store.check_chunk(0x20, 0), Err(Status::NoChunk));
    }

    #[test]
    fn disable_all_covers_every_queued_job() {
        let (pool, _dir) = test_pool(0);
        let a = pool.submit(JobData::Inval);
        let b = pool.submit(JobData::Inval);
        pool.disable_all();
        assert!(pool.worker_step());
        assert!(pool.worker_step());
        let done = pool.drain_completions();
        assert_eq!(done.len(), 2);
        for (id, result) in done {
            assert!(id == a || id == b);
            assert_eq!(result.status(), Status::NotDone);
        }
    }

    #[test]
    fn wake_pipe_byte_tracks_queue_emptiness() {
        let (pool, _dir) = test_pool(0);
        pool.submit(JobData::Inval);
        pool.submit(JobData::Inval);
        assert!(pool.worker_step());
        assert!(pool.worker_step());

        // two completions pending, still exactly one wake byte
        assert!(wake_fd_readable(&pool));
        let done = pool.drain_completions();
        assert_eq!(done.len(), 2);
        assert!(!wake_fd_readable(&pool));
        assert!(pool.drain_completions().is_empty());
    }

    #[test]
    fn job_ids_skip_zero_on_wrap() {
        let (pool, _dir) = test_pool(0);
        pool.jobs.lock().unwrap().next_id = u32::MAX;
        let a = pool.submit(JobData::Inval);
        let b = pool.submit(JobData::Inval);
        assert_eq!(a, u32::MAX);
        assert_eq!(b, 1);
    }

    #[test]
    fn read_write_jobs_round_trip() {
        let (pool, _dir) = test_pool(1);
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let mut crc = crc32fast::Hasher::new();
        crc.update(&data);
        let crc = crc.finalize();

        let wait_done = |pool: &Arc<JobPool>| loop {
            let done = pool.drain_completions();
            if !done.is_empty() {
                return done;
            }
            std::thread::sleep(Duration::from_millis(2));
        };

        pool.submit(JobData::ChunkOp(ChunkOp::Create {
            id: 0x30,
            version: 1,
        }));
        assert_eq!(wait_done(&pool)[0].1.status(), Status::Ok);
        pool.submit(JobData::Open { chunk_id: 0x30 });
        assert_eq!(wait_done(&pool)[0].1.status(), Status::Ok);

        pool.submit(JobData::Write {
            chunk_id: 0x30,
            version: 1,
            write_id: 7,
            block: 0,
            offset: 0,
            crc,
            data: data.clone(),
        });
        match &wait_done(&pool)[0].1 {
            JobResult::Write {
                status,
                write_id,
                data: returned,
                ..
            } => {
                assert_eq!(*status, Status::Ok);
                assert_eq!(*write_id, 7);
                assert_eq!(returned, &data);
            }
            other => panic!("unexpected result {:?}", other),
        }

        pool.submit(JobData::Read {
            chunk_id: 0x30,
            version: 1,
            block: 0,
            offset: 0,
            size: 8192,
        });
        match &wait_done(&pool)[0].1 {
            JobResult::Read {
                status,
                data: returned,
                crc: got,
            } => {
                assert_eq!(*status, Status::Ok);
                assert_eq!(returned, &data);
                assert_eq!(*got, crc);
            }
            other => panic!("unexpected result {:?}", other),
        }

        pool.submit(JobData::Close { chunk_id: 0x30 });
        assert_eq!(wait_done(&pool)[0].1.status(), Status::Ok);
    }

    #[test]
    fn waiters_take_clear_and_filter() {
        #[derive(Debug, PartialEq)]
        enum Ctx {
            Conn(u32),
            Other,
        }
        let mut waiters = JobWaiters::new();
        waiters.set(1, Ctx::Conn(5));
        waiters.set(2, Ctx::Conn(6));
        waiters.set(3, Ctx::Other);

        assert_eq!(waiters.take(1), Some(Ctx::Conn(5)));
        assert_eq!(waiters.take(1), None);

        waiters.drop_where(|ctx| matches!(ctx, Ctx::Conn(6)));
        assert_eq!(waiters.take(2), None);
        assert_eq!(waiters.take(3), Some(Ctx::Other));

        waiters.set(4, Ctx::Other);
        waiters.clear();
        assert!(waiters.is_empty());
    }
}
