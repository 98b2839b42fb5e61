//! Peer servers: the remote instances this process forwards responses to.
//!
//! Split like sessions are: `PeerShared` is the half workers may touch (the
//! double-buffered forward queues), `PeerConn` is the event-loop half (the
//! connection state machine, the socket bookkeeping, the ack stream and the
//! in-flight batch). A peer entry is created the first time a response
//! targets its address and lives for the rest of the process.

use crate::config::{RETRY_CONNECTION_AFTER, WAIT_FOR_CONNECTION};
use crate::handle::ServerAddr;
use crate::response::Response;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Worker-facing half of a peer entry.
#[derive(Debug)]
pub struct PeerShared {
    addr: ServerAddr,
    queues: [RwLock<VecDeque<Arc<Response>>>; 2],
}

impl PeerShared {
    fn new(addr: ServerAddr) -> Self {
        PeerShared {
            addr,
            queues: [
                RwLock::new(VecDeque::new()),
                RwLock::new(VecDeque::new()),
            ],
        }
    }

    pub fn addr(&self) -> ServerAddr {
        self.addr
    }

    /// Peers have no hard queue-length cap: a slow peer legitimately backs
    /// responses up here, and the per-client cap would be far too small.
    pub fn enqueue_response(&self, side: bool, response: Arc<Response>) {
        self.queues[side as usize]
            .write()
            .expect("peer queue lock poisoned")
            .push_front(response);
    }

    pub fn drain_queue(&self, side: bool) -> VecDeque<Arc<Response>> {
        let mut queue = self.queues[side as usize]
            .write()
            .expect("peer queue lock poisoned");
        std::mem::take(&mut *queue)
    }

    pub fn queue_len(&self, side: bool) -> usize {
        self.queues[side as usize]
            .read()
            .expect("peer queue lock poisoned")
            .len()
    }
}

/// Map of every peer this process has ever needed, keyed by address bits.
/// Workers create entries on demand during fan-out; entries are never
/// removed.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<u32, Arc<PeerShared>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable::default()
    }

    pub fn get(&self, addr: ServerAddr) -> Option<Arc<PeerShared>> {
        self.peers
            .read()
            .expect("peer map lock poisoned")
            .get(&addr.bits())
            .cloned()
    }

    pub fn get_or_create(&self, addr: ServerAddr) -> Arc<PeerShared> {
        if let Some(peer) = self.get(addr) {
            return peer;
        }
        let mut peers = self.peers.write().expect("peer map lock poisoned");
        Arc::clone(
            peers
                .entry(addr.bits())
                .or_insert_with(|| Arc::new(PeerShared::new(addr))),
        )
    }

    pub fn all(&self) -> Vec<Arc<PeerShared>> {
        self.peers
            .read()
            .expect("peer map lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Connection status of a peer, driven entirely by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// No connection attempt has ever been made.
    Uninitiated,
    Connecting,
    Connected,
    /// Close issued, waiting for the socket to go away.
    Disconnecting,
    Disconnected,
}

/// What the send cycle sees when it asks for the connection. Timed-out
/// connects report as their own condition but keep the stored status:
/// an in-flight connect cannot be canceled, only awaited and then closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLink {
    /// Start a connection attempt now (status was Uninitiated, or
    /// Disconnected long enough to retry).
    Initiate,
    Connecting,
    ConnectingTimedOut,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Event-loop half of a peer entry.
#[derive(Debug)]
pub struct PeerConn {
    pub shared: Arc<PeerShared>,
    pub status: PeerStatus,
    /// Slab token of the current socket, when one exists.
    pub token: Option<usize>,
    /// Forwarded responses written but not yet acknowledged.
    pub outstanding_forwards: i64,
    pub connecting_at: Option<Instant>,
    pub disconnected_at: Option<Instant>,
    pub overflowed_at: Option<Instant>,
    /// Version of the inbound ack stream (locks to the reserved version on
    /// the first ack frame).
    pub ack_version: u16,
    /// Fixed inbound buffer for acks; an ack is header + one byte.
    pub ack_buf: Vec<u8>,
    pub ack_filled: usize,
    /// Batch currently written to the socket, with a byte offset for
    /// resuming partial vectored writes.
    pub in_flight: Vec<Arc<Response>>,
    pub write_offset: usize,
}

/// Room for a healthy burst of acks per read.
pub const ACK_BUFFER_SIZE: usize = 1024 * 10;

impl PeerConn {
    pub fn new(shared: Arc<PeerShared>) -> Self {
        PeerConn {
            shared,
            status: PeerStatus::Uninitiated,
            token: None,
            outstanding_forwards: 0,
            connecting_at: None,
            disconnected_at: None,
            overflowed_at: None,
            ack_version: crate::config::UNINITIALIZED_VERSION,
            ack_buf: vec![0; ACK_BUFFER_SIZE],
            ack_filled: 0,
            in_flight: Vec::new(),
            write_offset: 0,
        }
    }

    pub fn addr(&self) -> ServerAddr {
        self.shared.addr()
    }

    /// The state machine's read side: classify the stored status for the
    /// send cycle, telling the caller when to initiate a (re)connect.
    pub fn link(&self, now: Instant) -> PeerLink {
        match self.status {
            PeerStatus::Uninitiated => PeerLink::Initiate,
            PeerStatus::Connecting => {
                let since = self
                    .connecting_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if since > WAIT_FOR_CONNECTION {
                    PeerLink::ConnectingTimedOut
                } else {
                    PeerLink::Connecting
                }
            }
            PeerStatus::Connected => PeerLink::Connected,
            PeerStatus::Disconnecting => PeerLink::Disconnecting,
            PeerStatus::Disconnected => {
                let since = self
                    .disconnected_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if since > RETRY_CONNECTION_AFTER {
                    PeerLink::Initiate
                } else {
                    PeerLink::Disconnected
                }
            }
        }
    }

    /// Transition into Connecting; the caller is about to start the socket
    /// connect.
    pub fn note_connecting(&mut self, now: Instant) {
        self.status = PeerStatus::Connecting;
        self.connecting_at = Some(now);
    }

    pub fn note_connected(&mut self) {
        self.status = PeerStatus::Connected;
    }

    pub fn note_disconnecting(&mut self) {
        self.status = PeerStatus::Disconnecting;
    }

    /// The socket is gone; reset per-connection state and start the retry
    /// clock.
    pub fn note_disconnected(&mut self, now: Instant) {
        self.status = PeerStatus::Disconnected;
        self.disconnected_at = Some(now);
        self.outstanding_forwards = 0;
        self.ack_filled = 0;
        self.ack_version = crate::config::UNINITIALIZED_VERSION;
        self.token = None;
    }

    /// A forwarded response hit the wire. Only counted while still
    /// connected: once the link is down no ack will ever come back.
    pub fn note_forwarded(&mut self, now: Instant) {
        if self.status == PeerStatus::Connected {
            self.outstanding_forwards += 1;
            self.overflowed_at = Some(now);
        }
    }

    /// An ack arrived for one forwarded response.
    pub fn note_ack(&mut self) {
        self.outstanding_forwards -= 1;
    }
}
