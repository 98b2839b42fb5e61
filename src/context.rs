//! The runtime context.
//!
//! Everything workers and the event loop both need lives in one explicitly
//! constructed [`Core`], owned by the connections manager and handed around
//! by shared reference: the pool, the peer table, the statistics, the
//! per-version parameters and the double-buffer direction flag. There are no
//! process-wide statics.

use crate::config::{CommonParams, VersionTable};
use crate::handle::ServerAddr;
use crate::pool::ClientPool;
use crate::peer::PeerTable;
use crate::request::Request;
use crate::stats::ServerStats;
use crossbeam_channel::Sender;
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex, RwLock};

/// Messages delivered to the event loop from workers and external control.
/// Each send is paired with a waker poke so the loop notices promptly.
#[derive(Debug)]
pub enum LoopSignal {
    /// A worker finished (or deferred) a request.
    RequestDone {
        request: Arc<Request>,
        processed: bool,
    },
    /// A worker finished disconnect post-processing for a session.
    DisconnectDone { registration: u64 },
    /// The keepalive scan finished.
    KeepAliveDone,
    /// A worker wants one send cycle run now; it blocks on the barrier
    /// until the loop has completed the cycle.
    RunSendCycle(Arc<Barrier>),
    /// Operator asked for shutdown.
    Shutdown,
    /// Operator asked for a status snapshot.
    Status,
}

/// Shared runtime state.
pub struct Core {
    pub common: CommonParams,
    pub local_server: ServerAddr,
    /// Process-wide peer port: handles carry only addresses, every instance
    /// of the framework listens on the same port.
    pub port: u16,
    pub versions: VersionTable,
    pub stats: ServerStats,
    pub pool: ClientPool,
    pub peers: PeerTable,

    /// The response direction flag. Workers read it (shared) to pick the
    /// enqueue side; the loop writes it (exclusive) to toggle once per send
    /// cycle. Holding the read guard across an enqueue guarantees the
    /// enqueue lands on the side the current cycle is not draining.
    direction: RwLock<bool>,

    /// Receivers sets, one pair for clients (registration numbers) and one
    /// for peers (address bits). Locked only while adding; the loop swaps
    /// out the opposite side wholesale.
    client_receivers: [Mutex<HashSet<u64>>; 2],
    peer_receivers: [Mutex<HashSet<u32>>; 2],

    signal_tx: Sender<LoopSignal>,
    waker: mio::Waker,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        common: CommonParams,
        local_server: ServerAddr,
        port: u16,
        versions: VersionTable,
        stats: ServerStats,
        signal_tx: Sender<LoopSignal>,
        waker: mio::Waker,
    ) -> Self {
        Core {
            common,
            local_server,
            port,
            versions,
            stats,
            pool: ClientPool::new(local_server),
            peers: PeerTable::new(),
            direction: RwLock::new(false),
            client_receivers: [Mutex::new(HashSet::new()), Mutex::new(HashSet::new())],
            peer_receivers: [Mutex::new(HashSet::new()), Mutex::new(HashSet::new())],
            signal_tx,
            waker,
        }
    }

    /// Pin the direction flag for the duration of an enqueue. The returned
    /// guard must be held until the response's reference count is final.
    pub fn enqueue_side(&self) -> (std::sync::RwLockReadGuard<'_, bool>, bool) {
        let guard = self.direction.read().expect("direction flag lock poisoned");
        let side = *guard;
        (guard, side)
    }

    /// Toggle the direction flag; returns the side the cycle should drain
    /// (the side workers were enqueueing onto before the toggle).
    pub fn toggle_direction(&self) -> bool {
        let mut guard = self.direction.write().expect("direction flag lock poisoned");
        let drain = *guard;
        *guard = !*guard;
        drain
    }

    /// Current drain side without toggling (completion handlers re-insert
    /// receivers into the correct sets relative to this).
    pub fn current_side(&self) -> bool {
        *self.direction.read().expect("direction flag lock poisoned")
    }

    pub fn add_client_receiver(&self, side: bool, registration: u64) {
        self.client_receivers[side as usize]
            .lock()
            .expect("client receivers lock poisoned")
            .insert(registration);
    }

    pub fn take_client_receivers(&self, side: bool) -> HashSet<u64> {
        std::mem::take(
            &mut *self.client_receivers[side as usize]
                .lock()
                .expect("client receivers lock poisoned"),
        )
    }

    pub fn add_peer_receiver(&self, side: bool, addr_bits: u32) {
        self.peer_receivers[side as usize]
            .lock()
            .expect("peer receivers lock poisoned")
            .insert(addr_bits);
    }

    pub fn take_peer_receivers(&self, side: bool) -> HashSet<u32> {
        std::mem::take(
            &mut *self.peer_receivers[side as usize]
                .lock()
                .expect("peer receivers lock poisoned"),
        )
    }

    pub fn has_receivers(&self, side: bool) -> bool {
        !self.client_receivers[side as usize]
            .lock()
            .expect("client receivers lock poisoned")
            .is_empty()
            || !self.peer_receivers[side as usize]
                .lock()
                .expect("peer receivers lock poisoned")
                .is_empty()
    }

    /// Send a signal to the loop and wake it.
    pub fn signal(&self, signal: LoopSignal) {
        // The loop outlives every signaller except during final teardown,
        // where dropped signals are harmless.
        let _ = self.signal_tx.send(signal);
        let _ = self.waker.wake();
    }

    /// Ask the loop for one send cycle and block until it has run. Two
    /// parties: the calling worker and the loop.
    pub fn run_send_cycle_and_wait(&self) {
        let barrier = Arc::new(Barrier::new(2));
        self.signal(LoopSignal::RunSendCycle(Arc::clone(&barrier)));
        barrier.wait();
    }
}

/// Handle for external runtime control (the console UI collaborator).
#[derive(Clone)]
pub struct ControlHandle {
    core: Arc<Core>,
}

impl ControlHandle {
    pub fn new(core: Arc<Core>) -> Self {
        ControlHandle { core }
    }

    /// Initiate graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        self.core.signal(LoopSignal::Shutdown);
    }

    /// Ask for an immediate status snapshot in the log.
    pub fn request_status(&self) {
        self.core.signal(LoopSignal::Status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VersionParams;

    fn core() -> (Core, crossbeam_channel::Receiver<LoopSignal>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let poll = mio::Poll::new().unwrap();
        let waker = mio::Waker::new(poll.registry(), mio::Token(usize::MAX)).unwrap();
        let versions = VersionTable::build([(1, VersionParams::default())]).unwrap();
        let core = Core::new(
            CommonParams::default(),
            ServerAddr::new(1),
            9000,
            versions,
            ServerStats::new(1),
            tx,
            waker,
        );
        (core, rx)
    }

    #[test]
    fn test_direction_toggle_returns_previous_enqueue_side() {
        let (core, _rx) = core();

        let (_guard, side) = core.enqueue_side();
        assert!(!side);
        drop(_guard);

        assert!(!core.toggle_direction());
        let (_guard, side) = core.enqueue_side();
        assert!(side);
    }

    #[test]
    fn test_receiver_sets_swap() {
        let (core, _rx) = core();

        core.add_client_receiver(false, 1);
        core.add_client_receiver(false, 2);
        core.add_peer_receiver(false, 0xA);
        assert!(core.has_receivers(false));
        assert!(!core.has_receivers(true));

        let clients = core.take_client_receivers(false);
        assert_eq!(clients.len(), 2);
        let peers = core.take_peer_receivers(false);
        assert_eq!(peers.len(), 1);
        assert!(!core.has_receivers(false));
    }

    #[test]
    fn test_signals_reach_the_channel() {
        let (core, rx) = core();
        core.signal(LoopSignal::Status);
        assert!(matches!(rx.try_recv().unwrap(), LoopSignal::Status));
    }
}
