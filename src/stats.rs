//! Server statistics.
//!
//! A flat record of counters updated from both the event loop and the
//! workers. The record is split across a request-side lock and a
//! response-side lock to keep the two hot paths from contending with each
//! other; exception tallies sit behind their own lock because they are
//! logged while counted. A snapshot is taken on the status interval and
//! published to the sink.

use std::sync::RwLock;
use std::time::SystemTime;
use tracing::error;

/// Counters touched by the request path (accept, read, dispatch, worker
/// completion).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RequestCounters {
    pub clients_connected: u64,
    pub clients_disconnected: u64,
    pub disconnections_by_server: u64,
    pub disconnections_by_clients: u64,

    pub requests_arrived: u64,
    pub requests_processed: u64,
    pub requests_failed_to_process: u64,
    pub requests_not_advised_to_process: u64,
    pub requests_rejected_by_server: u64,
    pub request_bytes_ignored: u64,
    pub total_request_bytes_processed: u64,
    pub total_request_processing_secs: f64,
    pub requests_processed_per_thread: Vec<u64>,

    pub memory_by_requests_in_queue: i64,
    pub memory_by_clients: i64,
    pub active_client_request_buffers: i64,

    pub header_error_preamble: u64,
    pub header_error_version: u64,
    pub header_error_size: u64,
}

/// Counters touched by the response path (fan-out, send cycles, peer
/// forwarding).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResponseCounters {
    pub responses_keep_alives: u64,
    pub responses_errors: u64,
    pub responses_acks_of_forwarded: u64,
    pub responses_fatal_errors: u64,
    pub responses_ordinary: u64,

    pub responses_forwarded: u64,
    pub responses_multicasts: u64,
    pub responses_updates: u64,

    pub responses_sent: u64,
    pub responses_failed_to_queue: u64,
    pub responses_failed_to_send: u64,
    pub responses_failed_to_forward: u64,
    pub total_response_bytes_sent: u64,

    pub responses_in_local_clients_queues: i64,
    pub responses_in_peer_servers_queues: i64,
    pub responses_being_sent: i64,
    pub memory_by_responses_in_queue: i64,

    pub queued_duration_min_secs: f64,
    pub queued_duration_max_secs: f64,

    pub forward_error_writing: u64,
    pub forward_error_connecting_timed_out: u64,
    pub forward_error_disconnecting: u64,
    pub forward_error_disconnected: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExceptionCounters {
    pub processor_panics: u64,
    pub request_creation: u64,
    pub response_creation: u64,
    pub client_creation: u64,
    pub connection_creation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    ProcessorPanic,
    RequestCreation,
    ResponseCreation,
    ClientCreation,
    ConnectionCreation,
}

/// Shared statistics record.
#[derive(Debug)]
pub struct ServerStats {
    requests: RwLock<RequestCounters>,
    responses: RwLock<ResponseCounters>,
    exceptions: RwLock<ExceptionCounters>,
}

impl ServerStats {
    pub fn new(worker_threads: usize) -> Self {
        ServerStats {
            requests: RwLock::new(RequestCounters {
                requests_processed_per_thread: vec![0; worker_threads],
                ..RequestCounters::default()
            }),
            responses: RwLock::new(ResponseCounters::default()),
            exceptions: RwLock::new(ExceptionCounters::default()),
        }
    }

    pub fn with_requests<T>(&self, f: impl FnOnce(&mut RequestCounters) -> T) -> T {
        let mut guard = self.requests.write().expect("request counters lock poisoned");
        f(&mut guard)
    }

    pub fn read_requests<T>(&self, f: impl FnOnce(&RequestCounters) -> T) -> T {
        let guard = self.requests.read().expect("request counters lock poisoned");
        f(&guard)
    }

    pub fn with_responses<T>(&self, f: impl FnOnce(&mut ResponseCounters) -> T) -> T {
        let mut guard = self
            .responses
            .write()
            .expect("response counters lock poisoned");
        f(&mut guard)
    }

    pub fn read_responses<T>(&self, f: impl FnOnce(&ResponseCounters) -> T) -> T {
        let guard = self.responses.read().expect("response counters lock poisoned");
        f(&guard)
    }

    /// Responses still queued on either side; the shutdown sequencer waits
    /// for this to reach zero.
    pub fn responses_in_queue(&self) -> i64 {
        self.read_responses(|r| {
            r.responses_in_local_clients_queues + r.responses_in_peer_servers_queues
        })
    }

    /// Count and log an exception. Exceptions are rare by construction, so
    /// logging under the lock keeps count and line consistent.
    pub fn record_exception(&self, kind: ExceptionKind, context: &str) {
        let mut guard = self
            .exceptions
            .write()
            .expect("exception counters lock poisoned");
        let name = match kind {
            ExceptionKind::ProcessorPanic => {
                guard.processor_panics += 1;
                "processor panic"
            }
            ExceptionKind::RequestCreation => {
                guard.request_creation += 1;
                "request creation failure"
            }
            ExceptionKind::ResponseCreation => {
                guard.response_creation += 1;
                "response creation failure"
            }
            ExceptionKind::ClientCreation => {
                guard.client_creation += 1;
                "client creation failure"
            }
            ExceptionKind::ConnectionCreation => {
                guard.connection_creation += 1;
                "connection creation failure"
            }
        };
        error!(context, "{name}");
    }

    /// Record how long a fully delivered response sat queued.
    pub fn record_queued_duration(&self, secs: f64) {
        self.with_responses(|r| {
            if r.queued_duration_min_secs == 0.0 || secs < r.queued_duration_min_secs {
                r.queued_duration_min_secs = secs;
            }
            if secs > r.queued_duration_max_secs {
                r.queued_duration_max_secs = secs;
            }
        });
    }

    /// Reset the per-interval extremes after a snapshot.
    pub fn reset_interval_counters(&self) {
        self.with_responses(|r| {
            r.queued_duration_min_secs = 0.0;
            r.queued_duration_max_secs = 0.0;
        });
    }

    pub fn snapshot(&self, clients_active: usize, servers_connected: usize) -> StatSnapshot {
        StatSnapshot {
            requests: self.read_requests(|r| r.clone()),
            responses: self.read_responses(|r| r.clone()),
            exceptions: self
                .exceptions
                .read()
                .expect("exception counters lock poisoned")
                .clone(),
            clients_active,
            servers_connected,
            taken_at: SystemTime::now(),
        }
    }
}

/// Point-in-time copy published to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct StatSnapshot {
    pub requests: RequestCounters,
    pub responses: ResponseCounters,
    pub exceptions: ExceptionCounters,
    pub clients_active: usize,
    pub servers_connected: usize,
    pub taken_at: SystemTime,
}

impl StatSnapshot {
    /// True when nothing moved since `previous`; redundant snapshots are
    /// skipped at the status interval.
    pub fn is_redundant_against(&self, previous: &StatSnapshot) -> bool {
        self.requests == previous.requests
            && self.responses == previous.responses
            && self.exceptions == previous.exceptions
            && self.clients_active == previous.clients_active
            && self.servers_connected == previous.servers_connected
    }
}
