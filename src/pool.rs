//! Registry of live local sessions, keyed by registration number.
//!
//! The pool guards the map with a read-write lock; counter updates on an
//! individual session take the map read lock (to pin the session) and the
//! session's own counter write lock. Removal takes the map write lock and
//! succeeds only when both in-flight counters are zero, which is what makes
//! the counters a teardown barrier.

use crate::handle::{ClientHandle, ServerAddr};
use crate::session::{ClientKind, CounterKind, Session};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("server shutdown initiated; not accepting new sessions")]
    ShuttingDown,
}

#[derive(Debug)]
pub struct ClientPool {
    local_server: ServerAddr,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    shutting_down: RwLock<bool>,
    /// Serializes response enqueues against session removal: a fan-out holds
    /// this for read around increase+enqueue, the disconnect path holds it
    /// for write around pool removal. Without it a response could raise the
    /// counter on a session the loop is concurrently retiring.
    enqueue_gate: RwLock<()>,
}

impl ClientPool {
    pub fn new(local_server: ServerAddr) -> Self {
        ClientPool {
            local_server,
            sessions: RwLock::new(HashMap::new()),
            shutting_down: RwLock::new(false),
            enqueue_gate: RwLock::new(()),
        }
    }

    pub fn local_server(&self) -> ServerAddr {
        self.local_server
    }

    /// Called only from the event loop once shutdown keystrokes arrive.
    pub fn set_shutting_down(&self) {
        *self.shutting_down.write().expect("shutdown flag lock poisoned") = true;
    }

    pub fn shutdown_initiated(&self) -> bool {
        *self.shutting_down.read().expect("shutdown flag lock poisoned")
    }

    /// Insert a freshly accepted session. Fails closed once shutdown has
    /// been initiated.
    pub fn add(&self, session: Arc<Session>) -> Result<(), PoolError> {
        if self.shutdown_initiated() {
            return Err(PoolError::ShuttingDown);
        }
        let mut sessions = self.sessions.write().expect("pool map lock poisoned");
        sessions.insert(session.registration(), session);
        Ok(())
    }

    /// Remove the session if and only if both in-flight counters are zero.
    /// Returns whether it was removed.
    pub fn remove(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().expect("pool map lock poisoned");
        match sessions.get(&session.registration()) {
            Some(existing) => {
                assert!(
                    std::ptr::eq(existing.as_ref(), session),
                    "pool entry does not match the session being removed"
                );
                // Exclusive access to the map excludes the incrementors,
                // which all hold the map read lock.
                let activity = session.activity.read().expect("session counters lock poisoned");
                if activity.requests == 0 && activity.responses == 0 {
                    drop(activity);
                    sessions.remove(&session.registration());
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Pin the session behind `handle` and raise one of its in-flight
    /// counters. Rejects unknown registration numbers and sessions already
    /// marked for disconnect; a handle carrying a foreign server address
    /// here is a logic violation.
    pub fn increase(&self, handle: &ClientHandle, kind: CounterKind) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().expect("pool map lock poisoned");
        let session = sessions.get(&handle.registration)?;

        if session.is_marked_to_disconnect() {
            return None;
        }
        assert_eq!(
            handle.server, self.local_server,
            "counter increase for a client of a different server"
        );

        let mut activity = session.activity.write().expect("session counters lock poisoned");
        match kind {
            CounterKind::Request => activity.requests += 1,
            CounterKind::Response => activity.responses += 1,
        }
        activity.last_activity = Instant::now();
        drop(activity);

        Some(Arc::clone(session))
    }

    /// Unconditional decrement; an imbalance against `increase` is a logic
    /// violation.
    pub fn decrease(&self, session: &Session, kind: CounterKind) {
        let _sessions = self.sessions.read().expect("pool map lock poisoned");
        let mut activity = session.activity.write().expect("session counters lock poisoned");
        match kind {
            CounterKind::Request => activity.requests -= 1,
            CounterKind::Response => activity.responses -= 1,
        }
        activity.last_activity = Instant::now();
        assert!(
            activity.requests >= 0 && activity.responses >= 0,
            "in-flight counter went negative"
        );
    }

    /// Snapshot of all live sessions.
    pub fn clients(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().expect("pool map lock poisoned");
        sessions.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().expect("pool map lock poisoned").len()
    }

    /// Handles of sessions with nothing in flight and no activity for at
    /// least `interval`, filtered by version bucket. Refreshes last-activity
    /// for the returned handles so the next scan waits a full interval.
    pub fn idle_clients(&self, kind: ClientKind, interval: Duration) -> BTreeSet<ClientHandle> {
        let sessions = self.sessions.read().expect("pool map lock poisoned");
        let now = Instant::now();
        let mut idle = BTreeSet::new();

        for session in sessions.values() {
            if session.kind() != kind {
                continue;
            }
            let mut activity = session.activity.write().expect("session counters lock poisoned");
            let quiet = activity.requests == 0 && activity.responses == 0;
            if quiet && now.duration_since(activity.last_activity) >= interval {
                idle.insert(session.handle());
                activity.last_activity = now;
            }
        }

        idle
    }

    /// Hold while raising a response count and enqueueing; see field doc.
    pub fn enqueue_guard(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.enqueue_gate.read().expect("enqueue gate lock poisoned")
    }

    /// Hold while deciding whether a session can leave the pool.
    pub fn removal_guard(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.enqueue_gate.write().expect("enqueue gate lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ClientPool {
        ClientPool::new(ServerAddr::new(10))
    }

    fn session(pool: &ClientPool, registration: u64) -> Arc<Session> {
        let session = Arc::new(Session::new(ClientHandle::new(
            pool.local_server(),
            registration,
        )));
        pool.add(Arc::clone(&session)).unwrap();
        session
    }

    #[test]
    fn test_add_fails_after_shutdown() {
        let pool = pool();
        pool.set_shutting_down();
        let s = Arc::new(Session::new(ClientHandle::new(pool.local_server(), 1)));
        assert_eq!(pool.add(s), Err(PoolError::ShuttingDown));
    }

    #[test]
    fn test_increase_decrease_cycle() {
        let pool = pool();
        let s = session(&pool, 1);
        let handle = s.handle();

        let pinned = pool.increase(&handle, CounterKind::Request).unwrap();
        assert_eq!(pinned.registration(), 1);
        assert_eq!(s.activity.read().unwrap().requests, 1);

        pool.decrease(&s, CounterKind::Request);
        assert_eq!(s.activity.read().unwrap().requests, 0);
    }

    #[test]
    fn test_increase_rejects_unknown_and_marked() {
        let pool = pool();
        let stats = crate::stats::ServerStats::new(1);
        let s = session(&pool, 1);

        let unknown = ClientHandle::new(pool.local_server(), 99);
        assert!(pool.increase(&unknown, CounterKind::Response).is_none());

        s.mark_to_disconnect(true, &stats);
        assert!(pool.increase(&s.handle(), CounterKind::Response).is_none());
    }

    #[test]
    fn test_remove_requires_zero_counters() {
        let pool = pool();
        let s = session(&pool, 1);

        pool.increase(&s.handle(), CounterKind::Response).unwrap();
        assert!(!pool.remove(&s));
        assert_eq!(pool.count(), 1);

        pool.decrease(&s, CounterKind::Response);
        assert!(pool.remove(&s));
        assert_eq!(pool.count(), 0);

        // Removing twice is a no-op.
        assert!(!pool.remove(&s));
    }

    #[test]
    fn test_idle_clients_buckets_and_refreshes() {
        let pool = pool();
        let versioned = session(&pool, 1);
        versioned.set_version(1);
        let _versionless = session(&pool, 2);

        // Zero interval: everything idle qualifies.
        let idle = pool.idle_clients(ClientKind::Versioned, Duration::ZERO);
        assert_eq!(idle.len(), 1);
        assert!(idle.contains(&versioned.handle()));

        let idle = pool.idle_clients(ClientKind::Versionless, Duration::ZERO);
        assert_eq!(idle.len(), 1);

        // A client with in-flight work is never idle.
        pool.increase(&versioned.handle(), CounterKind::Request).unwrap();
        let idle = pool.idle_clients(ClientKind::Versioned, Duration::ZERO);
        assert!(idle.is_empty());
    }

    #[test]
    fn test_idle_scan_waits_full_interval_after_refresh() {
        let pool = pool();
        let s = session(&pool, 1);
        s.set_version(1);

        let idle = pool.idle_clients(ClientKind::Versioned, Duration::ZERO);
        assert_eq!(idle.len(), 1);

        // The scan above refreshed last-activity, so a long interval now
        // excludes the client again.
        let idle = pool.idle_clients(ClientKind::Versioned, Duration::from_secs(3600));
        assert!(idle.is_empty());
    }
}
