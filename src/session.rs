//! Shared per-connection session state.
//!
//! A session is the half of a connection that workers may touch: the
//! negotiated version, the in-flight counters, the double-buffered response
//! queues and the disconnect latch. The socket, the receive buffer and the
//! in-flight write batch stay with the event loop, which owns all I/O.

use crate::config::UNINITIALIZED_VERSION;
use crate::handle::ClientHandle;
use crate::response::Response;
use crate::stats::ServerStats;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, error};

/// Which in-flight counter an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Request,
    Response,
}

/// Bucket used by the keepalive scan: clients that have negotiated a
/// version get keepalives, clients that never sent a valid frame get
/// disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Versioned,
    Versionless,
}

/// Application-owned per-session data.
pub type SessionData = Box<dyn Any + Send>;

/// In-flight counters plus the request-serialization flags, all under one
/// lock: the pool pins the session with the map read lock and mutates these
/// under this write lock.
#[derive(Debug)]
pub struct Activity {
    pub requests: i64,
    pub responses: i64,
    pub last_activity: Instant,
    /// True from frame dispatch until the loop's completion handler runs.
    /// At most one request per session is ever in this state.
    pub request_in_processing: bool,
    pub processing_finished: bool,
}

impl Default for Activity {
    fn default() -> Self {
        Activity {
            requests: 0,
            responses: 0,
            last_activity: Instant::now(),
            request_in_processing: false,
            processing_finished: true,
        }
    }
}

/// Outcome of a response enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    QueueFull,
}

pub struct Session {
    handle: ClientHandle,
    version: AtomicU16,
    pub(crate) activity: RwLock<Activity>,
    /// Double-buffered response queues, addressed by the direction flag.
    queues: [RwLock<VecDeque<Arc<Response>>>; 2],
    marked_to_disconnect: RwLock<bool>,
    streaming: AtomicBool,
    queue_full_latch: AtomicBool,
    session_data: Mutex<Option<SessionData>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Session data is an opaque application box; show identity only.
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(handle: ClientHandle) -> Self {
        Session {
            handle,
            version: AtomicU16::new(UNINITIALIZED_VERSION),
            activity: RwLock::new(Activity::default()),
            queues: [
                RwLock::new(VecDeque::new()),
                RwLock::new(VecDeque::new()),
            ],
            marked_to_disconnect: RwLock::new(false),
            streaming: AtomicBool::new(false),
            queue_full_latch: AtomicBool::new(false),
            session_data: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    pub fn registration(&self) -> u64 {
        self.handle.registration
    }

    pub fn version(&self) -> u16 {
        self.version.load(Ordering::Acquire)
    }

    /// Record the version negotiated by the first valid frame. Once set it
    /// never changes; the parser rejects frames that disagree.
    pub fn set_version(&self, version: u16) {
        let previous = self.version.swap(version, Ordering::AcqRel);
        debug_assert!(
            previous == UNINITIALIZED_VERSION || previous == version,
            "session version changed after negotiation"
        );
    }

    pub fn kind(&self) -> ClientKind {
        if self.version() == UNINITIALIZED_VERSION {
            ClientKind::Versionless
        } else {
            ClientKind::Versioned
        }
    }

    /// Latch the disconnect flag and charge the right disconnect counter.
    /// Returns false when the session was already marked.
    pub fn mark_to_disconnect(&self, by_server: bool, stats: &ServerStats) -> bool {
        let mut marked = self
            .marked_to_disconnect
            .write()
            .expect("disconnect flag lock poisoned");
        if *marked {
            return false;
        }
        debug!(handle = %self.handle, by_server, "session marked for disconnect");
        *marked = true;

        stats.with_requests(|r| {
            if by_server {
                r.disconnections_by_server += 1;
            } else {
                r.disconnections_by_clients += 1;
            }
        });
        true
    }

    /// Read from workers through the pool, hence the lock.
    pub fn is_marked_to_disconnect(&self) -> bool {
        *self
            .marked_to_disconnect
            .read()
            .expect("disconnect flag lock poisoned")
    }

    pub fn set_streaming(&self, mode: bool) {
        self.streaming.store(mode, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn set_session_data(&self, data: Option<SessionData>) {
        *self.session_data.lock().expect("session data lock poisoned") = data;
    }

    pub fn take_session_data(&self) -> Option<SessionData> {
        self.session_data
            .lock()
            .expect("session data lock poisoned")
            .take()
    }

    pub fn with_session_data<T>(&self, f: impl FnOnce(Option<&mut SessionData>) -> T) -> T {
        let mut guard = self.session_data.lock().expect("session data lock poisoned");
        f(guard.as_mut())
    }

    pub fn queue(&self, side: bool) -> &RwLock<VecDeque<Arc<Response>>> {
        &self.queues[side as usize]
    }

    /// Push a response on the enqueue-side queue. Each of the two queues may
    /// hold at most half of `max_pending_responses`; exceeding it rejects
    /// the enqueue and logs once until the latch clears.
    pub fn try_enqueue_response(
        &self,
        side: bool,
        response: Arc<Response>,
        max_pending_responses: usize,
    ) -> EnqueueOutcome {
        let mut queue = self.queue(side).write().expect("response queue lock poisoned");
        if queue.len() < max_pending_responses / 2 {
            queue.push_front(response);
            self.queue_full_latch.store(false, Ordering::Release);
            EnqueueOutcome::Added
        } else {
            if !self.queue_full_latch.swap(true, Ordering::AcqRel) {
                error!(handle = %self.handle, "response queue full; dropping enqueue");
            }
            EnqueueOutcome::QueueFull
        }
    }

    /// Drain the whole send-side queue for a send cycle. The send side is
    /// the opposite of the enqueue side, so the loop takes the lock only to
    /// swap the contents out.
    pub fn drain_queue(&self, side: bool) -> VecDeque<Arc<Response>> {
        let mut queue = self.queue(side).write().expect("response queue lock poisoned");
        std::mem::take(&mut *queue)
    }

    pub fn queue_len(&self, side: bool) -> usize {
        self.queue(side).read().expect("response queue lock poisoned").len()
    }

    /// Put back responses a partial batch did not take.
    pub fn requeue_front(&self, side: bool, rest: VecDeque<Arc<Response>>) {
        if rest.is_empty() {
            return;
        }
        let mut queue = self.queue(side).write().expect("response queue lock poisoned");
        // `rest` preserves queue order; stitch it back in front of anything
        // that arrived meanwhile (the enqueue side never touches this side).
        for response in rest.into_iter().rev() {
            queue.push_front(response);
        }
    }
}
