//! The worker pool and request dispatch.
//!
//! A fixed pool of OS threads executes request processing, disconnection
//! post-processing and the keepalive scan. Jobs arrive over a channel; each
//! worker lazily claims a thread index from a shared counter on its first
//! job, stores it in thread-local storage, and takes ownership of the
//! processor table prepared for that index. Completions travel back to the
//! event loop as [`LoopSignal`]s paired with a waker poke.

use crate::config::{code, SPECIAL_COMMUNICATION, UNINITIALIZED_VERSION};
use crate::context::{Core, LoopSignal};
use crate::fanout;
use crate::handle::ClientHandle;
use crate::processor::{Processor, RequestContext};
use crate::request::Request;
use crate::session::{ClientKind, SessionData};
use crate::stats::ExceptionKind;
use crossbeam_channel::{Receiver, Sender};
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Work items executed on the pool.
pub enum Job {
    Request(Arc<Request>),
    Disconnect {
        handle: ClientHandle,
        version: u16,
        session_data: Option<SessionData>,
    },
    KeepAliveScan,
}

type ProcessorTable = HashMap<u16, Box<dyn Processor>>;

thread_local! {
    static THREAD_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

struct WorkerShared {
    core: Arc<Core>,
    next_thread_index: AtomicUsize,
    tables: Vec<Mutex<Option<ProcessorTable>>>,
    active_processors: AtomicI64,
}

/// The fixed worker pool.
pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
    shared: Arc<WorkerShared>,
}

impl WorkerPool {
    /// Clone one processor instance per (thread, version) cell and spawn
    /// the workers. Instances are pre-created here, before the loop starts,
    /// and the table stays immutable afterwards.
    pub fn start(core: Arc<Core>, prototypes: Vec<(u16, Box<dyn Processor>)>) -> std::io::Result<Self> {
        let thread_count = core.common.max_request_processing_threads;

        let mut tables = Vec::with_capacity(thread_count);
        let mut instances = 0i64;
        for _ in 0..thread_count {
            let mut table: ProcessorTable = HashMap::new();
            for (version, prototype) in &prototypes {
                table.insert(*version, prototype.clone_boxed());
                instances += 1;
            }
            tables.push(Mutex::new(Some(table)));
        }

        let shared = Arc::new(WorkerShared {
            core,
            next_thread_index: AtomicUsize::new(0),
            tables,
            active_processors: AtomicI64::new(instances),
        });

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let mut threads = Vec::with_capacity(thread_count);
        for worker in 0..thread_count {
            let shared = Arc::clone(&shared);
            let job_rx: Receiver<Job> = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn(move || worker_loop(shared, job_rx))?;
            threads.push(handle);
        }

        Ok(WorkerPool {
            job_tx: Some(job_tx),
            threads,
            shared,
        })
    }

    pub fn submit(&self, job: Job) {
        if let Some(tx) = &self.job_tx {
            if tx.send(job).is_err() {
                warn!("worker pool already stopped; job dropped");
            }
        }
    }

    /// Stop accepting jobs; workers drain the queue, drop their processor
    /// tables and exit.
    pub fn begin_shutdown(&mut self) {
        self.job_tx.take();
    }

    /// Processor instances not yet dropped; the shutdown sequencer waits
    /// for zero.
    pub fn active_processors(&self) -> i64 {
        self.shared.active_processors.load(Ordering::Acquire)
    }

    pub fn join(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>, job_rx: Receiver<Job>) {
    let mut table: Option<ProcessorTable> = None;

    while let Ok(job) = job_rx.recv() {
        let index = claim_thread_index(&shared);
        let table = table.get_or_insert_with(|| {
            shared.tables[index]
                .lock()
                .expect("processor table lock poisoned")
                .take()
                .expect("processor table already claimed")
        });

        match job {
            Job::Request(request) => handle_request(&shared.core, table, index, request),
            Job::Disconnect {
                handle,
                version,
                session_data,
            } => handle_disconnect(&shared.core, table, handle, version, session_data),
            Job::KeepAliveScan => handle_keepalive_scan(&shared.core),
        }
    }

    // A worker that saw no jobs still owns one unclaimed table; claim it on
    // the way out so every processor instance is dropped and counted.
    let table = table.or_else(|| {
        let index = claim_thread_index(&shared);
        shared.tables[index]
            .lock()
            .expect("processor table lock poisoned")
            .take()
    });
    if let Some(table) = table {
        shared
            .active_processors
            .fetch_sub(table.len() as i64, Ordering::AcqRel);
    }
}

fn claim_thread_index(shared: &WorkerShared) -> usize {
    THREAD_INDEX.with(|cell| match cell.get() {
        Some(index) => index,
        None => {
            let index = shared.next_thread_index.fetch_add(1, Ordering::AcqRel);
            assert!(
                index < shared.core.common.max_request_processing_threads,
                "thread index exceeded the worker pool size"
            );
            cell.set(Some(index));
            index
        }
    })
}

fn handle_request(
    core: &Arc<Core>,
    table: &mut ProcessorTable,
    thread_index: usize,
    request: Arc<Request>,
) {
    let version = request.session().version();
    let mut processed = false;

    match table.get_mut(&version) {
        Some(processor) => {
            if core.pool.shutdown_initiated() {
                // Speeds up shutdown when a backlog of requests is pending.
                core.stats
                    .with_requests(|r| r.requests_not_advised_to_process += 1);
            } else {
                let mut ctx = RequestContext::new(core, &request, version);
                match catch_unwind(AssertUnwindSafe(|| processor.process_request(&mut ctx))) {
                    Ok(ok) => processed = ok,
                    Err(_) => {
                        core.stats
                            .record_exception(ExceptionKind::ProcessorPanic, "process_request");
                        request.set_failure_flag();
                    }
                }
            }
        }
        None => {
            error!(
                version = format_args!("0x{version:X}"),
                "cannot process request: no processor for version"
            );
        }
    }

    if !request.is_deferred() {
        let processing_secs = request.arrival().elapsed().as_secs_f64();
        let payload_len = request.payload().len() as u64;
        core.stats.with_requests(|r| {
            if !processed {
                r.requests_failed_to_process += 1;
            }
            r.requests_processed += 1;
            r.total_request_processing_secs += processing_secs;
            r.total_request_bytes_processed += payload_len;
            r.memory_by_requests_in_queue -= payload_len as i64;
            r.requests_processed_per_thread[thread_index] += 1;
        });
    }

    core.signal(LoopSignal::RequestDone { request, processed });
}

fn handle_disconnect(
    core: &Arc<Core>,
    table: &mut ProcessorTable,
    handle: ClientHandle,
    version: u16,
    session_data: Option<SessionData>,
) {
    // A session that never negotiated a version has no processor to notify.
    if version != UNINITIALIZED_VERSION {
        match table.get_mut(&version) {
            Some(processor) => {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    processor.process_disconnection(handle, session_data)
                }));
                if result.is_err() {
                    core.stats
                        .record_exception(ExceptionKind::ProcessorPanic, "process_disconnection");
                }
            }
            None => error!(
                version = format_args!("0x{version:X}"),
                "cannot process disconnection: no processor for version"
            ),
        }
    }

    core.signal(LoopSignal::DisconnectDone {
        registration: handle.registration,
    });
}

fn handle_keepalive_scan(core: &Arc<Core>) {
    let interval = core.common.keep_alive_interval();

    for kind in [ClientKind::Versioned, ClientKind::Versionless] {
        let idle = core.pool.idle_clients(kind, interval);
        if idle.is_empty() {
            continue;
        }

        // Idle versioned clients get a keepalive; idle versionless clients
        // never completed a handshake and are disconnected instead.
        let code_byte = match kind {
            ClientKind::Versioned => code::KEEP_ALIVE,
            ClientKind::Versionless => code::FATAL_ERROR,
        };
        fanout::store_message(
            core,
            &idle,
            &[code_byte],
            SPECIAL_COMMUNICATION,
            false,
            None,
        );

        match kind {
            ClientKind::Versioned => debug!(count = idle.len(), "queuing keepalives"),
            ClientKind::Versionless => info!(
                count = idle.len(),
                "versionless clients idle too long; disconnecting"
            ),
        }
    }

    core.signal(LoopSignal::KeepAliveDone);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommonParams, VersionParams, VersionTable};
    use crate::handle::ServerAddr;
    use crate::session::Session;
    use crate::stats::ServerStats;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    struct Echo;

    impl Processor for Echo {
        fn clone_boxed(&self) -> Box<dyn Processor> {
            Box::new(Echo)
        }

        fn process_request(&mut self, ctx: &mut RequestContext<'_>) -> bool {
            let sender = ctx.sender();
            let payload = ctx.payload().clone();
            ctx.send_response(sender, &payload);
            true
        }

        fn process_disconnection(&mut self, _: ClientHandle, _: Option<SessionData>) {}
    }

    struct Panicker;

    impl Processor for Panicker {
        fn clone_boxed(&self) -> Box<dyn Processor> {
            Box::new(Panicker)
        }

        fn process_request(&mut self, _: &mut RequestContext<'_>) -> bool {
            panic!("processor blew up");
        }

        fn process_disconnection(&mut self, _: ClientHandle, _: Option<SessionData>) {}
    }

    struct DisconnectCounter(Arc<AtomicUsize>);

    impl Processor for DisconnectCounter {
        fn clone_boxed(&self) -> Box<dyn Processor> {
            Box::new(DisconnectCounter(Arc::clone(&self.0)))
        }

        fn process_request(&mut self, _: &mut RequestContext<'_>) -> bool {
            true
        }

        fn process_disconnection(&mut self, _: ClientHandle, _: Option<SessionData>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn core_with(
        threads: usize,
        keepalive_secs: u64,
    ) -> (Arc<Core>, crossbeam_channel::Receiver<LoopSignal>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let poll = mio::Poll::new().unwrap();
        let waker = mio::Waker::new(poll.registry(), mio::Token(usize::MAX)).unwrap();
        let versions = VersionTable::build([(1, VersionParams::default())]).unwrap();
        let common = CommonParams {
            max_request_processing_threads: threads,
            max_pending_responses: 16,
            keep_alive_frequency_secs: keepalive_secs,
            ..CommonParams::default()
        };
        (
            Arc::new(Core::new(
                common,
                ServerAddr::new(1),
                9000,
                versions,
                ServerStats::new(threads),
                tx,
                waker,
            )),
            rx,
        )
    }

    fn core(threads: usize) -> (Arc<Core>, crossbeam_channel::Receiver<LoopSignal>) {
        core_with(threads, 30)
    }

    fn request_for(core: &Arc<Core>, registration: u64, payload: &'static [u8]) -> Arc<Request> {
        let session = Arc::new(Session::new(ClientHandle::new(
            core.local_server,
            registration,
        )));
        session.set_version(1);
        core.pool.add(Arc::clone(&session)).unwrap();
        Arc::new(Request::new(
            Bytes::from_static(payload),
            Instant::now(),
            session,
        ))
    }

    fn recv_done(rx: &crossbeam_channel::Receiver<LoopSignal>) -> (Arc<Request>, bool) {
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                LoopSignal::RequestDone { request, processed } => return (request, processed),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_request_processed_and_completed() {
        let (core, rx) = core(2);
        let mut pool = WorkerPool::start(Arc::clone(&core), vec![(1, Box::new(Echo))]).unwrap();

        let request = request_for(&core, 1, b"ping");
        pool.submit(Job::Request(Arc::clone(&request)));

        let (done, processed) = recv_done(&rx);
        assert!(processed);
        assert!(Arc::ptr_eq(&done, &request));
        assert_eq!(done.session().queue_len(core.current_side()), 1);
        assert_eq!(core.stats.read_requests(|r| r.requests_processed), 1);

        pool.begin_shutdown();
        pool.join();
        assert_eq!(pool.active_processors(), 0);
    }

    #[test]
    fn test_unsupported_version_counts_failed() {
        let (core, rx) = core(1);
        let mut pool = WorkerPool::start(Arc::clone(&core), vec![(1, Box::new(Echo))]).unwrap();

        // A session whose version has no registered processor.
        let session = Arc::new(Session::new(ClientHandle::new(core.local_server, 2)));
        session.set_version(9);
        core.pool.add(Arc::clone(&session)).unwrap();
        let other = Arc::new(Request::new(
            Bytes::from_static(b"ping"),
            Instant::now(),
            session,
        ));

        pool.submit(Job::Request(Arc::clone(&other)));
        let (_, processed) = recv_done(&rx);
        assert!(!processed);
        assert_eq!(
            core.stats.read_requests(|r| r.requests_failed_to_process),
            1
        );

        pool.begin_shutdown();
        pool.join();
    }

    #[test]
    fn test_processor_panic_flags_request() {
        let (core, rx) = core(1);
        let mut pool =
            WorkerPool::start(Arc::clone(&core), vec![(1, Box::new(Panicker))]).unwrap();

        let request = request_for(&core, 1, b"boom");
        pool.submit(Job::Request(Arc::clone(&request)));

        let (done, processed) = recv_done(&rx);
        assert!(!processed);
        assert!(done.has_failure_flag());

        pool.begin_shutdown();
        pool.join();
    }

    #[test]
    fn test_shutdown_skips_processing() {
        let (core, rx) = core(1);
        let mut pool = WorkerPool::start(Arc::clone(&core), vec![(1, Box::new(Echo))]).unwrap();

        core.pool.set_shutting_down();
        let session = Arc::new(Session::new(ClientHandle::new(core.local_server, 5)));
        session.set_version(1);
        let request = Arc::new(Request::new(
            Bytes::from_static(b"late"),
            Instant::now(),
            session,
        ));
        pool.submit(Job::Request(Arc::clone(&request)));

        let (done, processed) = recv_done(&rx);
        assert!(!processed);
        // Nothing was queued for a request that was not advised to process.
        assert_eq!(done.session().queue_len(core.current_side()), 0);
        assert_eq!(
            core.stats
                .read_requests(|r| r.requests_not_advised_to_process),
            1
        );

        pool.begin_shutdown();
        pool.join();
    }

    #[test]
    fn test_disconnect_job_reaches_processor() {
        let (core, rx) = core(1);
        let count = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::start(
            Arc::clone(&core),
            vec![(1, Box::new(DisconnectCounter(Arc::clone(&count))))],
        )
        .unwrap();

        pool.submit(Job::Disconnect {
            handle: ClientHandle::new(core.local_server, 3),
            version: 1,
            session_data: None,
        });

        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                LoopSignal::DisconnectDone { registration } => {
                    assert_eq!(registration, 3);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        pool.begin_shutdown();
        pool.join();
    }

    #[test]
    fn test_versionless_disconnect_skips_processor() {
        let (core, rx) = core(1);
        let count = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::start(
            Arc::clone(&core),
            vec![(1, Box::new(DisconnectCounter(Arc::clone(&count))))],
        )
        .unwrap();

        pool.submit(Job::Disconnect {
            handle: ClientHandle::new(core.local_server, 4),
            version: UNINITIALIZED_VERSION,
            session_data: None,
        });

        loop {
            if let Ok(LoopSignal::DisconnectDone { .. }) =
                rx.recv_timeout(Duration::from_secs(5))
            {
                break;
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        pool.begin_shutdown();
        pool.join();
    }

    #[test]
    fn test_keepalive_scan_queues_frames_for_idle_clients() {
        // Zero keepalive interval: every quiet client counts as idle.
        let (core, rx) = core_with(1, 0);
        let mut pool = WorkerPool::start(Arc::clone(&core), vec![(1, Box::new(Echo))]).unwrap();

        let versioned = Arc::new(Session::new(ClientHandle::new(core.local_server, 1)));
        versioned.set_version(1);
        core.pool.add(Arc::clone(&versioned)).unwrap();

        let versionless = Arc::new(Session::new(ClientHandle::new(core.local_server, 2)));
        core.pool.add(Arc::clone(&versionless)).unwrap();

        pool.submit(Job::KeepAliveScan);
        loop {
            if let Ok(LoopSignal::KeepAliveDone) = rx.recv_timeout(Duration::from_secs(5)) {
                break;
            }
        }

        let side = core.current_side();
        let to_versioned = versioned.drain_queue(side);
        assert_eq!(to_versioned.len(), 1);
        assert_eq!(to_versioned[0].response_type(), code::KEEP_ALIVE);

        let to_versionless = versionless.drain_queue(side);
        assert_eq!(to_versionless.len(), 1);
        assert!(to_versionless[0].is_fatal_error_for_local_client());

        pool.begin_shutdown();
        pool.join();
    }
}
