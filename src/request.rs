//! Request objects.
//!
//! A request owns the payload extracted by the frame parser and pins its
//! session through an in-flight request count held in the pool. The count is
//! released by the event loop's completion handler, never by the worker, so
//! the session cannot be torn down between the worker finishing and the loop
//! observing it.

use crate::session::Session;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct Request {
    payload: Bytes,
    arrival: Instant,
    session: Arc<Session>,
    deferred: AtomicBool,
    failed: AtomicBool,
}

impl Request {
    /// `session` must already carry the request-count reference taken via
    /// the pool.
    pub fn new(payload: Bytes, arrival: Instant, session: Arc<Session>) -> Self {
        Request {
            payload,
            arrival,
            session,
            deferred: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Postpone processing: the dispatcher re-queues the request untouched
    /// instead of completing it.
    pub fn set_deferred(&self, flag: bool) {
        self.deferred.store(flag, Ordering::Release);
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    /// Flag a processing failure severe enough to disconnect the
    /// originating session (processor panic, response-allocation failure).
    pub fn set_failure_flag(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn has_failure_flag(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Bytes charged against the request-queue memory counter.
    pub fn accounted_size(&self) -> i64 {
        (self.payload.len() + std::mem::size_of::<Request>()) as i64
    }
}
