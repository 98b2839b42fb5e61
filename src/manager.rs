//! The connections manager: event-loop entry, periodic tick and shutdown
//! sequencer.
//!
//! One dedicated thread owns all socket I/O. It accepts clients, reads and
//! frames their requests, dispatches work to the pool, drains the
//! double-buffered response queues to sockets, drives the peer-server state
//! machines and walks the shutdown gate chain. Workers never touch a
//! socket; everything they produce comes back to this thread through queues
//! plus a waker poke.

use crate::config::{
    Config, ConfigError, VersionParams, HEADER_SIZE, SPECIAL_COMMUNICATION, TICK_INTERVAL,
};
use crate::context::{ControlHandle, Core, LoopSignal};
use crate::dispatch::{Job, WorkerPool};
use crate::forwarded::ForwardedResponseProcessor;
use crate::handle::{ClientHandle, ServerAddr};
use crate::peer::{PeerConn, PeerLink, PeerStatus};
use crate::processor::{Processor, Registration};
use crate::request::Request;
use crate::response::Response;
use crate::session::{CounterKind, Session};
use crate::sink::StatSink;
use crate::stats::{ServerStats, StatSnapshot};
use crate::wire::{self, ParseOutcome};
use bytes::Bytes;
use crossbeam_channel::Receiver;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Receive buffer of one client connection.
///
/// Starts as a scratch of exactly the header size; once a header announces
/// its payload size, a right-sized buffer (or the version's maximum, in
/// streaming mode) replaces it with the header bytes copied into the
/// prefix. `limit` caps how far a read may fill, so a connection can never
/// read past the frame currently being assembled.
#[derive(Debug)]
struct ReadBuf {
    data: Vec<u8>,
    limit: usize,
    filled: usize,
    declared: Option<usize>,
    allocated_for_streaming: bool,
}

impl ReadBuf {
    fn new() -> Self {
        ReadBuf {
            data: vec![0; HEADER_SIZE],
            limit: HEADER_SIZE,
            filled: 0,
            declared: None,
            allocated_for_streaming: false,
        }
    }

    fn space(&self) -> usize {
        self.limit - self.filled
    }

    fn is_scratch(&self) -> bool {
        self.data.len() == HEADER_SIZE
    }
}

/// Event-loop half of a client connection.
struct ClientConn {
    stream: TcpStream,
    session: Arc<Session>,
    read: ReadBuf,
    /// Latch that keeps a run of invalid bytes from logging per read.
    rejected_previous_bytes: bool,
    /// Batch currently written to the socket; cleared between batches,
    /// never shrunk.
    in_flight: Vec<Arc<Response>>,
    write_offset: usize,
    reading: bool,
    in_pool: bool,
    disconnect_initiated: bool,
}

enum Endpoint {
    Client(ClientConn),
    Peer { bits: u32, stream: TcpStream },
}

/// Why a send batch is being completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Written,
    WriteFailed,
    /// A fatal-error response consumed locally: it forces the disconnect
    /// and is never transmitted.
    Suppressed,
    /// Synthesized for peers whose link is down; carries the link state
    /// for the error breakdown.
    LinkDown(PeerLink),
}

#[derive(Default)]
struct ShutdownState {
    requested: bool,
    listener_closed: bool,
    all_clients_disconnected: bool,
    processors_dropped: bool,
    peers_close_initiated: bool,
}

/// A running server, ready to enter its event loop.
pub struct Server {
    core: Arc<Core>,
    poll: Poll,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    conns: Slab<Endpoint>,
    client_tokens: HashMap<u64, usize>,
    peer_conns: HashMap<u32, PeerConn>,
    workers: WorkerPool,
    signal_rx: Receiver<LoopSignal>,
    sink: StatSink,
    next_registration: u64,
    last_stat: Instant,
    last_keepalive: Instant,
    keepalive_in_flight: bool,
    last_snapshot: Option<StatSnapshot>,
    queued_disconnections: usize,
    servers_connected: usize,
    peers_connecting: usize,
    in_send_cycle: bool,
    shutdown: ShutdownState,
    running: bool,
}

impl Server {
    /// Bind the listen socket, pre-create all processor instances and spawn
    /// the worker pool, the stat sink and the file writer. The event loop
    /// itself runs in [`run`](Self::run).
    pub fn start(config: Config, registrations: Vec<Registration>) -> Result<Self, StartError> {
        config.common.validate()?;

        let mut declared: Vec<(u16, VersionParams)> = Vec::new();
        let mut prototypes: Vec<(u16, Box<dyn Processor>)> = Vec::new();
        for registration in registrations {
            declared.push((registration.version, registration.params));
            prototypes.push((registration.version, registration.prototype));
        }
        // The reserved version always has its built-in processor unless the
        // application overrode it.
        if !prototypes.iter().any(|(v, _)| *v == SPECIAL_COMMUNICATION) {
            prototypes.push((SPECIAL_COMMUNICATION, Box::new(ForwardedResponseProcessor)));
        }
        let versions = crate::config::VersionTable::build(declared)?;

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        let stats = ServerStats::new(config.common.max_request_processing_threads);

        let core = Arc::new(Core::new(
            config.common,
            config.address,
            config.port,
            versions,
            stats,
            signal_tx,
            waker,
        ));

        let mut listener = bind_listener(config.address, config.port)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let workers = WorkerPool::start(Arc::clone(&core), prototypes)?;
        let sink = StatSink::start(config.status_file.clone())?;

        let now = Instant::now();
        Ok(Server {
            core,
            poll,
            listener: Some(listener),
            local_addr,
            conns: Slab::new(),
            client_tokens: HashMap::new(),
            peer_conns: HashMap::new(),
            workers,
            signal_rx,
            sink,
            next_registration: 0,
            last_stat: now,
            last_keepalive: now,
            keepalive_in_flight: false,
            last_snapshot: None,
            queued_disconnections: 0,
            servers_connected: 0,
            peers_connecting: 0,
            in_send_cycle: false,
            shutdown: ShutdownState::default(),
            running: true,
        })
    }

    /// Handle for the console/runtime-control collaborator.
    pub fn control(&self) -> ControlHandle {
        ControlHandle::new(Arc::clone(&self.core))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop until graceful shutdown completes.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            address = %self.core.local_server,
            port = self.core.port,
            workers = self.core.common.max_request_processing_threads,
            "started accepting and listening for connections"
        );
        self.log_stat(false);

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut next_tick = Instant::now() + TICK_INTERVAL;

        while self.running {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            self.poll.poll(&mut events, Some(timeout))?;

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => self.accept_clients(),
                    Token(index) => {
                        self.handle_endpoint_event(index, event.is_readable(), event.is_writable())
                    }
                }
            }

            self.drain_signals();

            let now = Instant::now();
            if now >= next_tick {
                next_tick = now + TICK_INTERVAL;
                self.do_periodic_activities();
            }
        }

        self.workers.join();
        self.sink.join();
        info!("server stopped");
        Ok(())
    }

    /* ---------------- accept path ---------------- */

    fn accept_clients(&mut self) {
        loop {
            let listener = match self.listener.as_ref() {
                Some(listener) => listener,
                None => return,
            };
            match listener.accept() {
                Ok((stream, peer_addr)) => self.install_client(stream, peer_addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn install_client(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed on accepted connection");
        }

        // Registration numbers are never reused within a process lifetime.
        self.next_registration += 1;
        let handle = ClientHandle::new(self.core.local_server, self.next_registration);
        let session = Arc::new(Session::new(handle));

        self.core.stats.with_requests(|r| {
            r.clients_connected += 1;
            r.memory_by_clients += client_memory_estimate(self.core.common.max_pending_responses);
        });

        let entry = self.conns.vacant_entry();
        let token = entry.key();
        let mut conn = ClientConn {
            stream,
            session: Arc::clone(&session),
            read: ReadBuf::new(),
            rejected_previous_bytes: false,
            in_flight: Vec::with_capacity(self.core.common.max_pending_responses),
            write_offset: 0,
            reading: false,
            in_pool: false,
            disconnect_initiated: false,
        };

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, Token(token), Interest::READABLE)
        {
            error!(error = %e, "failed to register accepted connection");
            self.core.stats.with_requests(|r| {
                r.clients_disconnected += 1;
                r.memory_by_clients -=
                    client_memory_estimate(self.core.common.max_pending_responses);
            });
            return;
        }
        conn.reading = true;
        entry.insert(Endpoint::Client(conn));
        self.client_tokens.insert(handle.registration, token);

        debug!(token, peer = %peer_addr, %handle, "accepted connection");

        // Fails either because the server is shutting down or under memory
        // pressure; both close the connection.
        match self.core.pool.add(session) {
            Ok(()) => {
                if let Some(Endpoint::Client(conn)) = self.conns.get_mut(token) {
                    conn.in_pool = true;
                }
            }
            Err(e) => {
                error!(error = %e, "cannot add client to pool");
                self.disconnect_and_delete(token, true);
            }
        }
    }

    /* ---------------- event dispatch ---------------- */

    fn handle_endpoint_event(&mut self, index: usize, readable: bool, writable: bool) {
        enum Kind {
            Client,
            Peer(u32),
        }
        let kind = match self.conns.get(index) {
            Some(Endpoint::Client(_)) => Kind::Client,
            Some(Endpoint::Peer { bits, .. }) => Kind::Peer(*bits),
            None => return,
        };

        match kind {
            Kind::Client => {
                if readable {
                    self.handle_client_readable(index);
                }
                if writable && matches!(self.conns.get(index), Some(Endpoint::Client(_))) {
                    self.continue_client_write(index);
                }
            }
            Kind::Peer(bits) => self.handle_peer_event(bits, index, readable, writable),
        }
    }

    /* ---------------- client read path ---------------- */

    fn client_mut(&mut self, index: usize) -> &mut ClientConn {
        match self.conns.get_mut(index) {
            Some(Endpoint::Client(conn)) => conn,
            _ => unreachable!("client token resolved to a non-client endpoint"),
        }
    }

    fn handle_client_readable(&mut self, index: usize) {
        loop {
            if !matches!(self.conns.get(index), Some(Endpoint::Client(_))) {
                return;
            }
            if !self.client_mut(index).reading {
                return;
            }

            self.provision_read_buffer(index);

            enum ReadStep {
                Eof,
                Data(usize),
                Blocked,
                Failed(io::Error),
            }

            let step = {
                let conn = self.client_mut(index);
                if conn.read.space() == 0 {
                    // Either the previous request is still being processed
                    // or allocation is pending; reads resume after the
                    // completion resets the buffer.
                    return;
                }
                let (filled, limit) = (conn.read.filled, conn.read.limit);
                match conn.stream.read(&mut conn.read.data[filled..limit]) {
                    Ok(0) => ReadStep::Eof,
                    Ok(n) => ReadStep::Data(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadStep::Blocked,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => ReadStep::Failed(e),
                }
            };

            match step {
                ReadStep::Eof => {
                    self.disconnect_and_delete(index, false);
                    return;
                }
                ReadStep::Blocked => return,
                ReadStep::Failed(e) => {
                    let version = self.client_mut(index).session.version();
                    info!(
                        error = %e,
                        version = format_args!("0x{version:X}"),
                        "read error; disconnecting client"
                    );
                    self.disconnect_and_delete(index, false);
                    return;
                }
                ReadStep::Data(n) => {
                    let shutting_down = self.core.pool.shutdown_initiated();
                    let conn = self.client_mut(index);
                    if shutting_down || conn.session.is_marked_to_disconnect() {
                        // Bytes arriving for a session on its way out are
                        // counted and dropped.
                        conn.read.filled = 0;
                        conn.rejected_previous_bytes = true;
                        self.core
                            .stats
                            .with_requests(|r| r.request_bytes_ignored += n as u64);
                        continue;
                    }
                    conn.read.filled += n;
                    self.extract_frame(index);
                }
            }
        }
    }

    /// Swap the header scratch for a payload buffer once the declared size
    /// is known (the allocate-buffer step of the session receive contract).
    fn provision_read_buffer(&mut self, index: usize) {
        let version = {
            let conn = self.client_mut(index);
            if conn.read.space() > 0 || conn.read.declared.is_none() {
                return;
            }
            conn.session.version()
        };
        let versions_max = self.core.versions.get(version).map(|p| p.max_request_size);

        let mut allocated_delta = 0i64;
        let mut buffers_delta = 0i64;
        {
            let conn = self.client_mut(index);
            let declared = conn.read.declared.take().expect("declared size checked above");

            if conn.read.is_scratch() {
                let streaming = conn.session.is_streaming();
                let capacity = if streaming {
                    HEADER_SIZE + versions_max.unwrap_or(declared)
                } else {
                    HEADER_SIZE + declared
                };
                let mut data = vec![0u8; capacity];
                data[..HEADER_SIZE].copy_from_slice(&conn.read.data[..HEADER_SIZE]);
                conn.read.data = data;
                conn.read.limit = HEADER_SIZE + declared;
                conn.read.allocated_for_streaming = streaming;
                allocated_delta = capacity as i64;
                buffers_delta = 1;
            } else {
                // Streaming kept the buffer allocated; only the logical
                // limit moves for the new frame.
                debug_assert!(conn.read.allocated_for_streaming);
                conn.read.limit = HEADER_SIZE + declared;
            }
        }

        if allocated_delta != 0 {
            self.core.stats.with_requests(|r| {
                r.memory_by_clients += allocated_delta;
                r.active_client_request_buffers += buffers_delta;
            });
        }
    }

    fn extract_frame(&mut self, index: usize) {
        let outcome = {
            let core = Arc::clone(&self.core);
            let conn = self.client_mut(index);
            let mut version = conn.session.version();
            let outcome = wire::parse_frame(
                &conn.read.data[..conn.read.filled],
                &mut version,
                &core.versions,
            );
            if version != conn.session.version() {
                conn.session.set_version(version);
            }
            outcome
        };

        match outcome {
            ParseOutcome::Found { payload_len } => {
                self.client_mut(index).rejected_previous_bytes = false;
                self.create_request_and_queue(index, payload_len);
            }
            ParseOutcome::WaitForMore { declared } => {
                let conn = self.client_mut(index);
                if let Some(declared) = declared {
                    if conn.read.filled >= HEADER_SIZE && conn.read.space() == 0 {
                        conn.read.declared = Some(declared as usize);
                    }
                }
            }
            invalid => self.process_header_error(index, invalid),
        }
    }

    fn process_header_error(&mut self, index: usize, outcome: ParseOutcome) {
        let first_run = {
            let conn = self.client_mut(index);
            let ignored = conn.read.filled as u64;
            conn.read.filled = 0;
            let first = !conn.rejected_previous_bytes;
            conn.rejected_previous_bytes = true;
            self.core
                .stats
                .with_requests(|r| r.request_bytes_ignored += ignored);
            first
        };

        // The first invalid run after a valid frame is logged and counted;
        // everything after that is silently discarded until the disconnect
        // lands, to avoid log amplification.
        if !first_run {
            return;
        }

        self.core.stats.with_requests(|r| match outcome {
            ParseOutcome::InvalidHeader => r.header_error_preamble += 1,
            ParseOutcome::InvalidVersion => r.header_error_version += 1,
            ParseOutcome::InvalidSize => r.header_error_size += 1,
            _ => unreachable!("not a header error"),
        });
        error!(?outcome, "invalid frame header; disconnecting client");
        self.disconnect_and_delete(index, true);
    }

    fn create_request_and_queue(&mut self, index: usize, payload_len: usize) {
        let handle = self.client_mut(index).session.handle();

        let session = match self.core.pool.increase(&handle, CounterKind::Request) {
            Some(session) => session,
            None => {
                // The session raced a disconnect; drop the frame.
                let conn = self.client_mut(index);
                conn.read.filled = 0;
                self.core.stats.with_requests(|r| {
                    r.request_bytes_ignored += payload_len as u64;
                    r.requests_rejected_by_server += 1;
                });
                return;
            }
        };

        let payload = {
            let conn = self.client_mut(index);
            Bytes::copy_from_slice(&conn.read.data[HEADER_SIZE..HEADER_SIZE + payload_len])
        };
        let request = Arc::new(Request::new(payload, Instant::now(), session));

        self.core.stats.with_requests(|r| {
            r.requests_arrived += 1;
            r.memory_by_requests_in_queue += request.accounted_size();
        });

        {
            let session = request.session();
            let mut activity = session
                .activity
                .write()
                .expect("session counters lock poisoned");
            // No second frame may be parsed while one is in processing.
            assert!(
                !activity.request_in_processing,
                "two concurrent requests created for one session"
            );
            activity.request_in_processing = true;
            activity.processing_finished = false;
        }

        self.workers.submit(Job::Request(request));

        // A request flood could otherwise keep the loop in the read path
        // and starve the drains and the stat output.
        self.do_periodic_activities();
    }

    /// Return the receive buffer to the header scratch after a completed
    /// request, unless streaming mode keeps the payload buffer allocated.
    fn reset_request_buffer(&mut self, index: usize) {
        let mut released = 0i64;
        {
            let conn = self.client_mut(index);
            let keep = conn.session.is_streaming() && conn.read.allocated_for_streaming;
            if !conn.read.is_scratch() && !keep {
                released = conn.read.data.len() as i64;
                conn.read.data = vec![0; HEADER_SIZE];
                conn.read.allocated_for_streaming = false;
            }
            conn.read.limit = HEADER_SIZE;
            conn.read.filled = 0;
            conn.read.declared = None;
        }
        if released != 0 {
            self.core.stats.with_requests(|r| {
                r.memory_by_clients -= released;
                r.active_client_request_buffers -= 1;
            });
        }
    }

    /* ---------------- worker completions ---------------- */

    fn drain_signals(&mut self) {
        while let Ok(signal) = self.signal_rx.try_recv() {
            match signal {
                LoopSignal::RequestDone { request, .. } => self.on_request_done(request),
                LoopSignal::DisconnectDone { registration } => {
                    self.on_disconnect_done(registration)
                }
                LoopSignal::KeepAliveDone => self.keepalive_in_flight = false,
                LoopSignal::RunSendCycle(barrier) => {
                    self.send_responses();
                    barrier.wait();
                }
                LoopSignal::Shutdown => self.initiate_shutdown(),
                LoopSignal::Status => self.log_stat(false),
            }
        }
    }

    fn on_request_done(&mut self, request: Arc<Request>) {
        let session = Arc::clone(request.session());

        // A request that failed hard takes its session with it, except for
        // peer links, whose frames come from another server.
        if request.has_failure_flag() && session.version() != SPECIAL_COMMUNICATION {
            session.mark_to_disconnect(true, &self.core.stats);
        }

        if request.is_deferred() {
            request.set_deferred(false);
            self.workers.submit(Job::Request(request));
            return;
        }

        let token = self.client_tokens.get(&session.registration()).copied();
        if let Some(token) = token {
            // Buffer reset must precede clearing the in-processing flag, or
            // the read path could see stale buffer state.
            self.reset_request_buffer(token);
        }

        {
            let mut activity = session
                .activity
                .write()
                .expect("session counters lock poisoned");
            activity.request_in_processing = false;
            activity.processing_finished = true;
        }

        self.core.stats.with_requests(|r| {
            r.memory_by_requests_in_queue -= std::mem::size_of::<Request>() as i64;
        });
        drop(request);
        self.core.pool.decrease(&session, CounterKind::Request);

        if let Some(token) = token {
            if session.is_marked_to_disconnect() {
                self.disconnect_and_delete(token, true);
            } else if matches!(self.conns.get(token), Some(Endpoint::Client(_))) {
                // Edge-triggered readiness will not refire for bytes that
                // arrived while the buffer was parked; re-drive the read.
                self.handle_client_readable(token);
            }
        }

        self.do_periodic_activities();
    }

    fn on_disconnect_done(&mut self, registration: u64) {
        if let Some(token) = self.client_tokens.remove(&registration) {
            if let Some(Endpoint::Client(mut conn)) = self.conns.try_remove(token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                let mut released =
                    client_memory_estimate(self.core.common.max_pending_responses);
                let mut buffers = 0i64;
                if !conn.read.is_scratch() {
                    released += conn.read.data.len() as i64;
                    buffers = 1;
                }
                self.core.stats.with_requests(|r| {
                    r.clients_disconnected += 1;
                    r.memory_by_clients -= released;
                    r.active_client_request_buffers -= buffers;
                });
            }
        }

        self.queued_disconnections -= 1;

        // Once the last disconnect drains after shutdown, the gate chain
        // can move on.
        if self.core.pool.shutdown_initiated()
            && self.core.pool.count() == 0
            && self.queued_disconnections == 0
            && !self.shutdown.all_clients_disconnected
        {
            info!("all clients disconnected for server shutdown");
            self.shutdown.all_clients_disconnected = true;
        }

        self.do_periodic_activities();
    }

    /* ---------------- disconnection ---------------- */

    /// Mark the session, stop reading, and once nothing is in flight
    /// remove it from the pool and queue the disconnect job. Returns true
    /// when the disconnect was queued (now or earlier).
    fn disconnect_and_delete(&mut self, index: usize, by_server: bool) -> bool {
        let session = {
            let conn = self.client_mut(index);
            if conn.disconnect_initiated {
                return false;
            }
            Arc::clone(&conn.session)
        };

        session.mark_to_disconnect(by_server, &self.core.stats);
        self.client_mut(index).reading = false;

        {
            let activity = session
                .activity
                .read()
                .expect("session counters lock poisoned");
            if activity.request_in_processing || !activity.processing_finished {
                return false;
            }
        }

        // Exclude concurrent fan-outs between the removal check and the
        // removal itself.
        let core = Arc::clone(&self.core);
        let removal_guard = core.pool.removal_guard();
        let in_pool = self.client_mut(index).in_pool;
        let removed = !in_pool || core.pool.remove(&session);
        if removed {
            let conn = self.client_mut(index);
            conn.in_pool = false;
            conn.disconnect_initiated = true;
        }
        drop(removal_guard);

        if removed {
            self.queued_disconnections += 1;
            self.workers.submit(Job::Disconnect {
                handle: session.handle(),
                version: session.version(),
                session_data: session.take_session_data(),
            });
            true
        } else {
            false
        }
    }

    fn disconnect_all_clients(&mut self) -> bool {
        let sessions = self.core.pool.clients();
        let mut any = false;
        for session in sessions {
            if let Some(&token) = self.client_tokens.get(&session.registration()) {
                self.disconnect_and_delete(token, true);
                any = true;
            }
        }
        any
    }

    /* ---------------- send pipeline ---------------- */

    fn do_periodic_activities(&mut self) {
        if self.in_send_cycle {
            return;
        }

        if self.core.stats.responses_in_queue() > 0 {
            self.send_responses();
        }

        let now = Instant::now();
        if now.duration_since(self.last_stat) >= self.core.common.status_interval() {
            self.last_stat = now;
            self.log_stat(true);
        }

        // Strictly greater: a scan a touch late still refreshes marginal
        // clients that the idle scan's >= comparison already caught.
        if now.duration_since(self.last_keepalive) > self.core.common.keep_alive_interval() {
            self.last_keepalive = now;
            self.send_keepalive();
        }

        self.advance_shutdown();
    }

    fn send_keepalive(&mut self) {
        if self.keepalive_in_flight {
            info!("keepalive scan skipped; previous one still in progress");
            return;
        }
        self.keepalive_in_flight = true;
        self.workers.submit(Job::KeepAliveScan);
    }

    /// One send cycle: flip the direction flag, then drain the side workers
    /// were enqueueing onto.
    fn send_responses(&mut self) {
        self.in_send_cycle = true;
        let drain = self.core.toggle_direction();
        self.send_local_client_responses(drain);
        self.send_peer_responses(drain);
        self.in_send_cycle = false;
    }

    fn send_local_client_responses(&mut self, drain: bool) {
        let receivers = self.core.take_client_receivers(drain);
        let max_pending = self.core.common.max_pending_responses;
        let now = Instant::now();

        for registration in receivers {
            let token = match self.client_tokens.get(&registration) {
                Some(&token) => token,
                None => continue,
            };
            if !matches!(self.conns.get(token), Some(Endpoint::Client(_))) {
                continue;
            }
            // A previous batch still in flight: the completion re-inserts
            // this client into a receivers set.
            if !self.client_mut(token).in_flight.is_empty() {
                continue;
            }

            let session = Arc::clone(&self.client_mut(token).session);
            let mut queue = session.drain_queue(drain);
            if queue.is_empty() {
                continue;
            }

            let mut batch: Vec<Arc<Response>> = Vec::with_capacity(max_pending);
            let mut suppressed = false;

            let first_is_fatal = queue
                .back()
                .map_or(false, |r| r.is_fatal_error_for_local_client());
            if first_is_fatal {
                // A fatal at the head of the queue forces the disconnect
                // and stops the batch; it is consumed, never transmitted.
                error!(
                    version = format_args!("0x{:X}", session.version()),
                    "client disconnection requested; marking for disconnect"
                );
                session.mark_to_disconnect(true, &self.core.stats);
                let fatal = queue.pop_back().expect("peeked response must pop");
                fatal.note_queued_for_send(now);
                batch.push(fatal);
                suppressed = true;
            } else {
                while batch.len() < max_pending {
                    let response = match queue.back() {
                        Some(response) => response,
                        None => break,
                    };
                    if response.is_fatal_error_for_local_client() {
                        // A fatal later in the queue stops the batch; next
                        // cycle sees it at position zero.
                        break;
                    }
                    let response = queue.pop_back().expect("peeked response must pop");
                    response.note_queued_for_send(now);
                    batch.push(response);
                }
            }
            session.requeue_front(drain, queue);

            {
                let conn = self.client_mut(token);
                conn.in_flight = batch;
                conn.write_offset = 0;
            }

            if suppressed {
                self.complete_client_batch(token, SendOutcome::Suppressed);
            } else {
                self.start_client_write(token);
            }
        }
    }

    fn start_client_write(&mut self, index: usize) {
        enum WriteStep {
            Done,
            Pending,
            Failed(io::Error),
        }

        let step = {
            let conn = self.client_mut(index);
            loop {
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(conn.in_flight.len());
                gather_slices(&conn.in_flight, conn.write_offset, &mut slices);
                if slices.is_empty() {
                    break WriteStep::Done;
                }
                match conn.stream.write_vectored(&slices) {
                    Ok(0) => {
                        break WriteStep::Failed(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned zero",
                        ))
                    }
                    Ok(n) => conn.write_offset += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break WriteStep::Pending
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break WriteStep::Failed(e),
                }
            }
        };

        match step {
            WriteStep::Done => self.complete_client_batch(index, SendOutcome::Written),
            WriteStep::Pending => {
                let pending = self.client_mut(index).in_flight.len() as i64;
                self.core
                    .stats
                    .with_responses(|r| r.responses_being_sent += pending);
                if let Some(Endpoint::Client(conn)) = self.conns.get_mut(index) {
                    let _ = self.poll.registry().reregister(
                        &mut conn.stream,
                        Token(index),
                        Interest::READABLE | Interest::WRITABLE,
                    );
                }
            }
            WriteStep::Failed(e) => {
                debug!(error = %e, "client write failed");
                self.complete_client_batch(index, SendOutcome::WriteFailed);
            }
        }
    }

    fn continue_client_write(&mut self, index: usize) {
        if self.client_mut(index).in_flight.is_empty() {
            return;
        }
        let pending = self.client_mut(index).in_flight.len() as i64;
        self.core
            .stats
            .with_responses(|r| r.responses_being_sent -= pending);
        self.start_client_write(index);
        if matches!(self.conns.get(index), Some(Endpoint::Client(_)))
            && self.client_mut(index).in_flight.is_empty()
        {
            if let Some(Endpoint::Client(conn)) = self.conns.get_mut(index) {
                let _ = self.poll.registry().reregister(
                    &mut conn.stream,
                    Token(index),
                    Interest::READABLE,
                );
            }
            self.do_periodic_activities();
        }
    }

    fn complete_client_batch(&mut self, index: usize, outcome: SendOutcome) {
        let (session, mut batch) = {
            let conn = self.client_mut(index);
            (Arc::clone(&conn.session), std::mem::take(&mut conn.in_flight))
        };

        for response in batch.iter() {
            match outcome {
                SendOutcome::Written => {
                    let wire_len = response.wire_len() as u64;
                    let kind = response.response_type();
                    self.core.stats.with_responses(|r| {
                        match kind {
                            crate::config::code::KEEP_ALIVE => r.responses_keep_alives += 1,
                            crate::config::code::ERROR => r.responses_errors += 1,
                            crate::config::code::ACK_OF_FORWARDED => {
                                r.responses_acks_of_forwarded += 1
                            }
                            crate::config::code::FATAL_ERROR => r.responses_fatal_errors += 1,
                            _ => r.responses_ordinary += 1,
                        }
                        if response.is_multicast() {
                            r.responses_multicasts += 1;
                        }
                        if response.is_update() {
                            r.responses_updates += 1;
                        }
                        r.responses_sent += 1;
                        r.total_response_bytes_sent += wire_len;
                    });
                }
                SendOutcome::Suppressed => {
                    self.core
                        .stats
                        .with_responses(|r| r.responses_fatal_errors += 1);
                }
                SendOutcome::WriteFailed | SendOutcome::LinkDown(_) => {
                    self.core
                        .stats
                        .with_responses(|r| r.responses_failed_to_send += 1);
                    if session.mark_to_disconnect(true, &self.core.stats) {
                        error!(
                            version = format_args!("0x{:X}", session.version()),
                            "unable to send response; marking client for disconnect"
                        );
                    }
                }
            }
            self.finish_response_delivery(response);
            self.core.pool.decrease(&session, CounterKind::Response);
        }
        batch.clear();
        {
            let conn = self.client_mut(index);
            conn.in_flight = batch;
            conn.write_offset = 0;
        }

        // Requeue into whichever receivers sets still have work for this
        // client.
        let current = self.core.current_side();
        for side in [current, !current] {
            if session.queue_len(side) > 0 {
                self.core.add_client_receiver(side, session.registration());
            }
        }

        if session.is_marked_to_disconnect()
            && session.queue_len(false) == 0
            && session.queue_len(true) == 0
        {
            self.disconnect_and_delete(index, true);
        }
    }

    /// Per-recipient completion accounting; the last recipient tears the
    /// response's queue accounting down.
    fn finish_response_delivery(&mut self, response: &Arc<Response>) {
        if !response.mark_sent() {
            return;
        }
        let accounted = response.accounted_size();
        let is_forward = response.is_forward();
        self.core.stats.with_responses(|r| {
            if is_forward {
                r.responses_in_peer_servers_queues -= 1;
            } else {
                r.responses_in_local_clients_queues -= 1;
            }
            r.memory_by_responses_in_queue -= accounted;
        });
        if let Some(at) = response.queued_at() {
            self.core
                .stats
                .record_queued_duration(at.elapsed().as_secs_f64());
        }
    }

    /* ---------------- peer pipeline ---------------- */

    fn send_peer_responses(&mut self, drain: bool) {
        let receivers = self.core.take_peer_receivers(drain);
        let now = Instant::now();

        for bits in receivers {
            if !self.peer_conns.contains_key(&bits) {
                let shared = match self.core.peers.get(ServerAddr::new(bits)) {
                    Some(shared) => shared,
                    None => continue,
                };
                self.peer_conns.insert(bits, PeerConn::new(shared));
            }

            let link = {
                let peer = self.peer_conns.get_mut(&bits).expect("peer entry inserted");
                peer.link(now)
            };
            let link = if link == PeerLink::Initiate {
                self.initiate_peer_connection(bits, now);
                PeerLink::Connecting
            } else {
                link
            };

            if link == PeerLink::Connecting {
                // Leave the queued responses where they are. The drained
                // side is the enqueue side again after the toggle, so
                // re-adding there revisits this peer exactly when its queue
                // is next drained.
                self.core.add_peer_receiver(drain, bits);
                continue;
            }

            {
                let peer = self.peer_conns.get_mut(&bits).expect("peer entry inserted");
                if !peer.in_flight.is_empty() {
                    continue;
                }
                let mut queue = peer.shared.drain_queue(drain);
                if queue.is_empty() {
                    continue;
                }
                // Unlike clients, the whole queue goes out in one batch;
                // reserve exactly what it needs.
                peer.in_flight.reserve(queue.len());
                while let Some(response) = queue.pop_back() {
                    response.note_queued_for_send(now);
                    peer.in_flight.push(response);
                }
                peer.write_offset = 0;
            }

            if link == PeerLink::Connected {
                self.start_peer_write(bits);
            } else {
                let batch = {
                    let peer = self.peer_conns.get_mut(&bits).expect("peer entry inserted");
                    std::mem::take(&mut peer.in_flight)
                };
                self.complete_peer_batch(bits, batch, SendOutcome::LinkDown(link));
            }
        }
    }

    fn initiate_peer_connection(&mut self, bits: u32, now: Instant) {
        let addr = ServerAddr::new(bits);
        let sock_addr = SocketAddr::from((addr.to_ipv4(), self.core.port));

        match TcpStream::connect(sock_addr) {
            Ok(stream) => {
                let token = self.conns.insert(Endpoint::Peer { bits, stream });
                let registered = {
                    let stream = match self.conns.get_mut(token) {
                        Some(Endpoint::Peer { stream, .. }) => stream,
                        _ => unreachable!("just inserted"),
                    };
                    self.poll.registry().register(
                        stream,
                        Token(token),
                        Interest::READABLE | Interest::WRITABLE,
                    )
                };
                let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
                match registered {
                    Ok(()) => {
                        peer.note_connecting(now);
                        peer.token = Some(token);
                        self.peers_connecting += 1;
                        debug!(peer = %addr, "peer connection initiated");
                    }
                    Err(e) => {
                        error!(peer = %addr, error = %e, "failed to register peer socket");
                        self.conns.remove(token);
                        peer.note_disconnected(now);
                    }
                }
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "peer connect failed");
                let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
                peer.note_disconnected(now);
            }
        }
    }

    fn handle_peer_event(&mut self, bits: u32, index: usize, readable: bool, writable: bool) {
        let status = match self.peer_conns.get(&bits) {
            Some(peer) => peer.status,
            None => return,
        };

        if status == PeerStatus::Connecting {
            self.finish_peer_connect(bits, index);
            return;
        }

        if writable {
            self.continue_peer_write(bits);
        }
        if readable && self.peer_conns.get(&bits).map(|p| p.token) == Some(Some(index)) {
            self.read_peer_acks(bits, index);
        }
    }

    fn finish_peer_connect(&mut self, bits: u32, index: usize) {
        let result = {
            let stream = match self.conns.get_mut(index) {
                Some(Endpoint::Peer { stream, .. }) => stream,
                _ => return,
            };
            match stream.take_error() {
                Ok(Some(e)) => Err(e),
                Ok(None) | Err(_) => match stream.peer_addr() {
                    Ok(_) => Ok(()),
                    Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                        return; // still connecting
                    }
                    Err(e) => Err(e),
                },
            }
        };

        self.peers_connecting -= 1;
        let addr = ServerAddr::new(bits);

        // A connect cannot be canceled; one that outlived its window is
        // allowed to complete here and is closed instead of used.
        let timed_out = self
            .peer_conns
            .get(&bits)
            .map_or(false, |p| p.link(Instant::now()) == PeerLink::ConnectingTimedOut);

        match result {
            Ok(()) if timed_out => {
                warn!(peer = %addr, "peer connected after the wait window; closing");
                if let Some(Endpoint::Peer { mut stream, .. }) = self.conns.try_remove(index) {
                    let _ = self.poll.registry().deregister(&mut stream);
                }
                let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
                peer.note_disconnecting();
                peer.note_disconnected(Instant::now());
                self.do_periodic_activities();
            }
            Ok(()) => {
                {
                    let stream = match self.conns.get_mut(index) {
                        Some(Endpoint::Peer { stream, .. }) => stream,
                        _ => return,
                    };
                    let _ = self
                        .poll
                        .registry()
                        .reregister(stream, Token(index), Interest::READABLE);
                }
                let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
                peer.note_connected();
                self.servers_connected += 1;
                info!(peer = %addr, "peer connected");
                self.do_periodic_activities();
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "peer connect failed");
                if let Some(Endpoint::Peer { mut stream, .. }) = self.conns.try_remove(index) {
                    let _ = self.poll.registry().deregister(&mut stream);
                }
                let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
                peer.note_disconnecting();
                peer.note_disconnected(Instant::now());
                self.do_periodic_activities();
            }
        }
    }

    fn start_peer_write(&mut self, bits: u32) {
        enum WriteStep {
            Done,
            Pending,
            Failed(io::Error),
        }

        let token = match self.peer_conns.get(&bits).and_then(|p| p.token) {
            Some(token) => token,
            None => return,
        };

        let step = {
            let peer = match self.peer_conns.get_mut(&bits) {
                Some(peer) => peer,
                None => return,
            };
            let stream = match self.conns.get_mut(token) {
                Some(Endpoint::Peer { stream, .. }) => stream,
                _ => return,
            };
            loop {
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(peer.in_flight.len());
                gather_slices(&peer.in_flight, peer.write_offset, &mut slices);
                if slices.is_empty() {
                    break WriteStep::Done;
                }
                match stream.write_vectored(&slices) {
                    Ok(0) => {
                        break WriteStep::Failed(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned zero",
                        ))
                    }
                    Ok(n) => peer.write_offset += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break WriteStep::Pending
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break WriteStep::Failed(e),
                }
            }
        };

        match step {
            WriteStep::Done => {
                let batch = {
                    let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
                    std::mem::take(&mut peer.in_flight)
                };
                self.complete_peer_batch(bits, batch, SendOutcome::Written);
            }
            WriteStep::Pending => {
                let stream = match self.conns.get_mut(token) {
                    Some(Endpoint::Peer { stream, .. }) => stream,
                    _ => return,
                };
                let _ = self.poll.registry().reregister(
                    stream,
                    Token(token),
                    Interest::READABLE | Interest::WRITABLE,
                );
            }
            WriteStep::Failed(e) => {
                warn!(peer = %ServerAddr::new(bits), error = %e, "peer write failed");
                let batch = {
                    let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
                    std::mem::take(&mut peer.in_flight)
                };
                self.complete_peer_batch(bits, batch, SendOutcome::WriteFailed);
                self.disconnect_peer(bits);
            }
        }
    }

    fn continue_peer_write(&mut self, bits: u32) {
        let has_pending = self
            .peer_conns
            .get(&bits)
            .map_or(false, |p| !p.in_flight.is_empty());
        if has_pending {
            self.start_peer_write(bits);
        }
    }

    fn complete_peer_batch(&mut self, bits: u32, batch: Vec<Arc<Response>>, outcome: SendOutcome) {
        let now = Instant::now();
        let addr = ServerAddr::new(bits);

        for response in batch.iter() {
            match outcome {
                SendOutcome::Written => {
                    debug!(peer = %addr, "response forwarded");
                    if let Some(peer) = self.peer_conns.get_mut(&bits) {
                        peer.note_forwarded(now);
                    }
                    let wire_len = response.wire_len() as u64;
                    self.core.stats.with_responses(|r| {
                        r.responses_forwarded += 1;
                        r.responses_sent += 1;
                        r.total_response_bytes_sent += wire_len;
                    });
                }
                SendOutcome::Suppressed => {
                    unreachable!("fatal-error suppression applies to local clients only")
                }
                SendOutcome::WriteFailed => {
                    self.core.stats.with_responses(|r| {
                        r.responses_failed_to_forward += 1;
                        r.forward_error_writing += 1;
                    });
                }
                SendOutcome::LinkDown(link) => {
                    self.core.stats.with_responses(|r| {
                        r.responses_failed_to_forward += 1;
                        match link {
                            PeerLink::ConnectingTimedOut => {
                                r.forward_error_connecting_timed_out += 1
                            }
                            PeerLink::Disconnecting => r.forward_error_disconnecting += 1,
                            PeerLink::Disconnected => r.forward_error_disconnected += 1,
                            _ => r.forward_error_writing += 1,
                        }
                    });
                }
            }
            self.finish_response_delivery(response);
        }

        if matches!(outcome, SendOutcome::WriteFailed | SendOutcome::LinkDown(_)) {
            error!(peer = %addr, ?outcome, count = batch.len(), "unable to forward responses");
        }

        // Revisit the peer for anything its queues picked up meanwhile.
        if let Some(peer) = self.peer_conns.get(&bits) {
            let current = self.core.current_side();
            for side in [current, !current] {
                if peer.shared.queue_len(side) > 0 {
                    self.core.add_peer_receiver(side, bits);
                }
            }
        }
    }

    fn read_peer_acks(&mut self, bits: u32, index: usize) {
        loop {
            enum ReadStep {
                Eof,
                Data(usize),
                Blocked,
                Failed(io::Error),
            }

            let step = {
                let peer = match self.peer_conns.get_mut(&bits) {
                    Some(peer) => peer,
                    None => return,
                };
                let stream = match self.conns.get_mut(index) {
                    Some(Endpoint::Peer { stream, .. }) => stream,
                    _ => return,
                };
                let filled = peer.ack_filled;
                if filled >= peer.ack_buf.len() {
                    ReadStep::Failed(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "peer ack buffer overflow",
                    ))
                } else {
                    match stream.read(&mut peer.ack_buf[filled..]) {
                        Ok(0) => ReadStep::Eof,
                        Ok(n) => ReadStep::Data(n),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadStep::Blocked,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => ReadStep::Failed(e),
                    }
                }
            };

            match step {
                ReadStep::Blocked => return,
                ReadStep::Eof => {
                    info!(peer = %ServerAddr::new(bits), "peer closed its connection");
                    self.disconnect_peer(bits);
                    return;
                }
                ReadStep::Failed(e) => {
                    error!(peer = %ServerAddr::new(bits), error = %e, "peer read error; disconnecting");
                    self.disconnect_peer(bits);
                    return;
                }
                ReadStep::Data(n) => {
                    {
                        let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
                        peer.ack_filled += n;
                    }
                    if !self.process_peer_acks(bits) {
                        self.disconnect_peer(bits);
                        return;
                    }
                }
            }
        }
    }

    /// Extract every complete frame from the peer's ack buffer. Returns
    /// false on a protocol violation.
    fn process_peer_acks(&mut self, bits: u32) -> bool {
        loop {
            let peer = match self.peer_conns.get_mut(&bits) {
                Some(peer) => peer,
                None => return true,
            };

            let outcome = wire::parse_frame(
                &peer.ack_buf[..peer.ack_filled],
                &mut peer.ack_version,
                &self.core.versions,
            );

            match outcome {
                ParseOutcome::Found { payload_len } => {
                    if peer.ack_version != SPECIAL_COMMUNICATION {
                        error!(
                            peer = %ServerAddr::new(bits),
                            version = format_args!("0x{:X}", peer.ack_version),
                            "peer spoke a non-framework version on the ack stream"
                        );
                        return false;
                    }
                    match peer.ack_buf[HEADER_SIZE] {
                        crate::config::code::KEEP_ALIVE => {
                            debug!(peer = %ServerAddr::new(bits), "keepalive received")
                        }
                        crate::config::code::ERROR => {
                            error!(peer = %ServerAddr::new(bits), "error frame received")
                        }
                        crate::config::code::ACK_OF_FORWARDED => peer.note_ack(),
                        other => {
                            error!(code = other, "unknown framework frame from peer");
                        }
                    }
                    let frame_len = HEADER_SIZE + payload_len;
                    peer.ack_buf.copy_within(frame_len..peer.ack_filled, 0);
                    peer.ack_filled -= frame_len;
                }
                ParseOutcome::WaitForMore { .. } => return true,
                _ => {
                    error!(
                        peer = %ServerAddr::new(bits),
                        ?outcome,
                        "invalid header on peer ack stream"
                    );
                    return false;
                }
            }
        }
    }

    fn disconnect_peer(&mut self, bits: u32) {
        let (token, status) = match self.peer_conns.get(&bits) {
            Some(peer) => (peer.token, peer.status),
            None => return,
        };
        if !matches!(status, PeerStatus::Connected | PeerStatus::Connecting) {
            return;
        }

        if status == PeerStatus::Connected {
            self.servers_connected -= 1;
        } else {
            self.peers_connecting -= 1;
        }

        if let Some(token) = token {
            if let Some(Endpoint::Peer { mut stream, .. }) = self.conns.try_remove(token) {
                let _ = self.poll.registry().deregister(&mut stream);
            }
        }

        let batch = {
            let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
            peer.note_disconnecting();
            std::mem::take(&mut peer.in_flight)
        };
        if !batch.is_empty() {
            self.complete_peer_batch(bits, batch, SendOutcome::LinkDown(PeerLink::Disconnecting));
        }

        let peer = self.peer_conns.get_mut(&bits).expect("peer entry exists");
        peer.note_disconnected(Instant::now());
        debug!(peer = %ServerAddr::new(bits), "peer disconnected");
        self.do_periodic_activities();
    }

    fn disconnect_all_peers(&mut self) {
        let all: Vec<u32> = self.peer_conns.keys().copied().collect();
        for bits in all {
            self.disconnect_peer(bits);
        }
    }

    /* ---------------- statistics and shutdown ---------------- */

    fn log_stat(&mut self, check_redundancy: bool) {
        let snapshot = self
            .core
            .stats
            .snapshot(self.core.pool.count(), self.servers_connected);

        let redundant = check_redundancy
            && self
                .last_snapshot
                .as_ref()
                .map_or(false, |last| snapshot.is_redundant_against(last));
        if !redundant {
            self.sink.publish(snapshot.clone());
            self.last_snapshot = Some(snapshot);
        }

        self.core.stats.reset_interval_counters();
    }

    fn initiate_shutdown(&mut self) {
        if self.shutdown.requested {
            return;
        }
        self.shutdown.requested = true;
        info!("stopping server service");

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.shutdown.listener_closed = true;

        self.core.pool.set_shutting_down();

        if !self.disconnect_all_clients() {
            // Nothing was connected; the gate chain can begin right away.
            info!("no clients connected; waiting for server teardown");
            self.shutdown.all_clients_disconnected = true;
        }

        info!("server shutdown initiated");
    }

    /// One gate per tick; no step advances until its predicate holds.
    fn advance_shutdown(&mut self) {
        if !self.shutdown.all_clients_disconnected {
            return;
        }
        // Responses queued for peers can still be unwinding.
        if self.core.stats.responses_in_queue() != 0 {
            return;
        }
        if !self.shutdown.listener_closed || self.queued_disconnections != 0 {
            return;
        }

        if !self.shutdown.processors_dropped {
            // Processors go away only after every client has closed; their
            // teardown may still consult version parameters.
            info!("dropping request processors");
            self.workers.begin_shutdown();
            self.shutdown.processors_dropped = true;
        } else if self.workers.active_processors() == 0 {
            if !self.shutdown.peers_close_initiated {
                self.disconnect_all_peers();
                self.shutdown.peers_close_initiated = true;
            } else if self.peers_connecting == 0 {
                if self.sink.stop() {
                    info!("stopping stat sink, file writer and event loop");
                    self.running = false;
                }
            } else {
                info!(
                    connecting = self.peers_connecting,
                    "shutdown waiting for peer connection attempts to finish"
                );
            }
        }
    }
}

/// Listener with address reuse, nonblocking, bound to the configured
/// interface.
fn bind_listener(address: ServerAddr, port: u16) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((address.to_ipv4(), port)).into())?;
    socket.listen(256)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Build IoSlices for a batch, skipping the first `offset` bytes already
/// written.
fn gather_slices<'a>(batch: &'a [Arc<Response>], mut offset: usize, out: &mut Vec<IoSlice<'a>>) {
    for response in batch {
        let wire = response.wire();
        if offset >= wire.len() {
            offset -= wire.len();
            continue;
        }
        out.push(IoSlice::new(&wire[offset..]));
        offset = 0;
    }
}

/// Rough per-client footprint charged at accept: session, connection state
/// and the reserved outbound batch.
fn client_memory_estimate(max_pending_responses: usize) -> i64 {
    (std::mem::size_of::<Session>()
        + std::mem::size_of::<ClientConn>()
        + max_pending_responses * std::mem::size_of::<Arc<Response>>()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_slices_skips_written_prefix() {
        let versions =
            crate::config::VersionTable::build([(1, VersionParams::default())]).unwrap();
        let make = |payload: &[u8]| {
            Arc::new(
                Response::for_local_clients(
                    payload,
                    1,
                    &versions,
                    ServerAddr::new(1),
                    1,
                    false,
                    None,
                )
                .unwrap(),
            )
        };
        let batch = vec![make(b"aaaa"), make(b"bb")];
        let first_len = batch[0].wire_len();

        let mut slices = Vec::new();
        gather_slices(&batch, 0, &mut slices);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len() + slices[1].len(), first_len + batch[1].wire_len());

        // Skip into the middle of the first response.
        slices.clear();
        gather_slices(&batch, first_len - 2, &mut slices);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 2);

        // Skip the first response entirely.
        slices.clear();
        gather_slices(&batch, first_len, &mut slices);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), batch[1].wire_len());

        // Everything written.
        slices.clear();
        gather_slices(&batch, first_len + batch[1].wire_len(), &mut slices);
        assert!(slices.is_empty());
    }

    #[test]
    fn test_read_buf_starts_as_header_scratch() {
        let buf = ReadBuf::new();
        assert!(buf.is_scratch());
        assert_eq!(buf.space(), HEADER_SIZE);
        assert_eq!(buf.limit, HEADER_SIZE);
    }
}
