//! The event loop: one thread, poll(2), timers and completion routing.
//!
//! All connection state machines and job completion hooks run here; the
//! only other threads are the two worker pools (master commands and client
//! block I/O), which talk back exclusively through their completion queues
//! and wake pipes. Periodic work: space collection every second, the idle
//! sweep every ten, statvfs refresh marking and a charts sample every
//! minute, master reconnect attempts per the configured delay.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{format_err, Context, Error};
use nix::poll::{poll, PollFd, PollFlags};

use mfs_store::ChunkStore;

use crate::charts::{self, Charts};
use crate::config::{self, Config, Settings};
use crate::csserv::{ClientJobCtx, ClientServ, ConnId};
use crate::jobs::{JobPool, JobWaiters};
use crate::masterconn::{MasterConn, MasterReply};
use crate::peerconn::{PeerEvent, PeerId, PeerPool};
use crate::replicator;

static TERMINATE: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: libc::c_int) {
    TERMINATE.store(true, Ordering::Relaxed);
}

extern "C" fn on_reload(_: libc::c_int) {
    RELOAD.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<(), Error> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let term = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let hup = SigAction::new(
        SigHandler::Handler(on_reload),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGTERM, &term)?;
        sigaction(Signal::SIGINT, &term)?;
        sigaction(Signal::SIGHUP, &hup)?;
        // dead sockets must surface as write errors
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// A timer that fires once its period has elapsed.
struct Periodic {
    period: Duration,
    last: Instant,
}

impl Periodic {
    fn new(period: Duration) -> Self {
        Periodic {
            period,
            last: Instant::now(),
        }
    }

    fn due(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last) >= self.period {
            self.last = now;
            true
        } else {
            false
        }
    }
}

enum Source {
    MasterWake,
    ClientWake,
    Master,
    Listener,
    Client(ConnId),
    Peer(PeerId),
}

pub fn run(config_path: &Path) -> Result<(), Error> {
    let cfg = Config::load(config_path)?;
    let mut settings = Settings::from_config(&cfg);
    log::info!("{} starting", settings.syslog_ident);

    install_signal_handlers()?;

    let folders = config::load_hdd_config(&settings.hdd_conf)?;
    let store = Arc::new(ChunkStore::open(&folders).context("chunk store initialization failed")?);
    log::info!(
        "chunk store ready: {} chunks on {} folders",
        store.chunk_count(),
        folders.len()
    );

    let master_pool = JobPool::new(
        settings.workers,
        settings.job_queue_cap,
        Arc::clone(&store),
        settings.peer_timeout,
    )?;
    let client_pool = JobPool::new(
        settings.workers,
        settings.job_queue_cap,
        Arc::clone(&store),
        settings.peer_timeout,
    )?;

    let mut clients = ClientServ::new(&settings)?;
    let mut master = MasterConn::new(&settings, clients.listen_ip(), clients.listen_port())?;
    let mut peers = PeerPool::new(settings.peer_timeout);
    let mut master_waiters: JobWaiters<MasterReply> = JobWaiters::new();
    let mut client_waiters: JobWaiters<ClientJobCtx> = JobWaiters::new();

    let stats_path = settings.data_path.join("csstats.mfs");
    let mut charts = Charts::load_or_default(&stats_path);

    master.tick_reconnect(&store);

    let mut send_space_timer = Periodic::new(Duration::from_secs(1));
    let mut sweep_timer = Periodic::new(Duration::from_secs(10));
    let mut refresh_timer = Periodic::new(Duration::from_secs(60));
    let mut sample_timer = Periodic::new(Duration::from_secs(60));
    let mut reconnect_timer = Periodic::new(settings.reconnection_delay);

    while !TERMINATE.load(Ordering::Relaxed) {
        if RELOAD.swap(false, Ordering::Relaxed) {
            match Config::load(config_path) {
                Ok(cfg) => {
                    settings = Settings::from_config(&cfg);
                    master.apply_settings(&settings);
                    clients.apply_settings(&settings);
                    log::info!("configuration reloaded");
                }
                Err(err) => log::warn!("configuration reload failed - {}", err),
            }
        }

        // ---- poll set ----------------------------------------------------
        let mut sources = Vec::new();
        let mut fds = Vec::new();
        let mut add = |source: Source, fd, read: bool, write: bool| {
            let mut flags = PollFlags::empty();
            if read {
                flags |= PollFlags::POLLIN;
            }
            if write {
                flags |= PollFlags::POLLOUT;
            }
            if !flags.is_empty() {
                sources.push(source);
                fds.push(PollFd::new(fd, flags));
            }
        };

        add(Source::MasterWake, master_pool.wake_fd(), true, false);
        add(Source::ClientWake, client_pool.wake_fd(), true, false);
        if let Some(fd) = master.fd() {
            add(Source::Master, fd, master.is_connected(), master.wants_write());
        }
        add(Source::Listener, clients.listener_fd(), true, false);
        for (id, fd, read, write) in clients.poll_set(&peers) {
            add(Source::Client(id), fd, read, write);
        }
        for (id, fd, read, write) in peers.poll_set() {
            add(Source::Peer(id), fd, read, write);
        }

        match poll(&mut fds, 300) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(format_err!("poll failed - {}", err)),
        }

        // ---- readiness dispatch ------------------------------------------
        let mut peer_events: Vec<PeerEvent> = Vec::new();
        for (source, fd) in sources.iter().zip(fds.iter()) {
            let revents = fd.revents().unwrap_or_else(PollFlags::empty);
            if revents.is_empty() {
                continue;
            }
            let readable =
                revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP);
            let writable = revents.intersects(PollFlags::POLLOUT);
            match *source {
                Source::MasterWake => {
                    if readable {
                        for (job, result) in master_pool.drain_completions() {
                            if let Some(reply) = master_waiters.take(job) {
                                master.job_finished(reply, result.status());
                            }
                        }
                    }
                }
                Source::ClientWake => {
                    if readable {
                        for (job, result) in client_pool.drain_completions() {
                            if let Some(ctx) = client_waiters.take(job) {
                                clients.job_finished(
                                    ctx,
                                    result,
                                    &store,
                                    &client_pool,
                                    &mut client_waiters,
                                    &mut peers,
                                );
                            }
                        }
                    }
                }
                Source::Master => {
                    if writable {
                        master.handle_writable(&store);
                    }
                    if readable {
                        master.handle_readable(&store, &master_pool, &mut master_waiters);
                    }
                }
                Source::Listener => {
                    if readable {
                        clients.accept_ready();
                    }
                }
                Source::Client(id) => {
                    if readable {
                        clients.handle_readable(
                            id,
                            &store,
                            &client_pool,
                            &mut client_waiters,
                            &mut peers,
                        );
                    }
                    if writable {
                        clients.handle_writable(id, &client_pool, &mut client_waiters);
                    }
                }
                Source::Peer(id) => {
                    if writable {
                        peers.handle_writable(id, &mut peer_events);
                    }
                    if readable {
                        peers.handle_readable(id, &mut peer_events);
                    }
                }
            }
        }

        let now = Instant::now();

        // ---- connection upkeep -------------------------------------------
        peers.maintain(now, &mut peer_events);
        for event in peer_events.drain(..) {
            clients.handle_peer_event(
                event,
                &store,
                &client_pool,
                &mut client_waiters,
                &mut peers,
            );
        }
        clients.maintain(now, &client_pool, &mut client_waiters, &mut peers);
        master.maintain(now, &master_pool, &mut master_waiters);

        // worker-side store events go to the master as soon as possible
        for report in store.take_reports() {
            master.send_report(report);
        }

        // ---- timers ------------------------------------------------------
        if send_space_timer.due(now) {
            if let Some(space) = store.collect_space() {
                master.send_space(space);
            }
        }
        if sweep_timer.due(now) {
            store.sweep_idle();
        }
        if refresh_timer.due(now) {
            store.mark_refresh_needed();
        }
        if sample_timer.due(now) {
            let sample = collect_sample(
                &store,
                &mut master,
                &mut clients,
                &mut peers,
                &master_pool,
                &client_pool,
            );
            charts.add_sample(&sample);
        }
        if reconnect_timer.due(now) {
            master.tick_reconnect(&store);
        }
    }

    log::info!("shutting down");
    if let Err(err) = charts.save(&stats_path) {
        log::warn!("{}", err);
    }
    master_pool.shutdown();
    client_pool.shutdown();
    store.flush_all();
    Ok(())
}

fn collect_sample(
    store: &ChunkStore,
    master: &mut MasterConn,
    clients: &mut ClientServ,
    peers: &mut PeerPool,
    master_pool: &JobPool,
    client_pool: &JobPool,
) -> charts::Sample {
    let mut sample = [0u64; charts::SERIES];
    let (master_in, master_out) = master.take_stats();
    sample[charts::CH_MASTER_IN] = master_in;
    sample[charts::CH_MASTER_OUT] = master_out;

    let (client_in, client_out, hlop_read, hlop_write) = clients.take_stats();
    sample[charts::CH_CLIENT_IN] = client_in;
    sample[charts::CH_CLIENT_OUT] = client_out;
    sample[charts::CH_HL_OPS_READ] = hlop_read;
    sample[charts::CH_HL_OPS_WRITE] = hlop_write;

    let (peer_in, peer_out) = peers.take_stats();
    sample[charts::CH_PEER_IN] = peer_in;
    sample[charts::CH_PEER_OUT] = peer_out;

    let hdd = store.take_stats();
    sample[charts::CH_HDD_OPS_READ] = hdd.ops_read;
    sample[charts::CH_HDD_OPS_WRITE] = hdd.ops_written;
    sample[charts::CH_HDD_BYTES_READ] = hdd.bytes_read;
    sample[charts::CH_HDD_BYTES_WRITE] = hdd.bytes_written;
    sample[charts::CH_DATA_OPS_READ] = hdd.data_ops_read;
    sample[charts::CH_DATA_OPS_WRITE] = hdd.data_ops_written;
    sample[charts::CH_DATA_BYTES_READ] = hdd.data_bytes_read;
    sample[charts::CH_DATA_BYTES_WRITE] = hdd.data_bytes_written;
    sample[charts::CH_READ_TIME_US] = hdd.read_time_us;
    sample[charts::CH_WRITE_TIME_US] = hdd.write_time_us;

    sample[charts::CH_REPLICATIONS] = replicator::take_replication_count();
    sample[charts::CH_CHUNK_COUNT] = store.chunk_count() as u64;
    let space = store.space();
    sample[charts::CH_USED_SPACE] = space.used;
    sample[charts::CH_TOTAL_SPACE] = space.total;
    sample[charts::CH_JOBS_QUEUED] = (master_pool.jobs_count() + client_pool.jobs_count()) as u64;
    sample[charts::CH_CONNECTIONS] =
        (clients.connection_count() + peers.connection_count()) as u64;
    sample
}
