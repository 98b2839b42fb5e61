//! Application request processors.
//!
//! A server application registers one processor per protocol version. The
//! framework clones the prototype into a dense per-(worker, version) table
//! before the loop starts, so workers reach their instance without locks.
//! During `process_request` the processor talks back to the framework
//! through a [`RequestContext`] borrowed for the duration of the call.

use crate::config::{code, CommonParams, SPECIAL_COMMUNICATION, UNINITIALIZED_VERSION};
use crate::context::Core;
use crate::fanout;
use crate::handle::{ClientHandle, ServerAddr};
use crate::request::Request;
use crate::session::SessionData;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Contract every version-specific processor satisfies.
///
/// `process_request` runs on worker threads, one invocation at a time per
/// instance; instances are never shared between threads. State that must
/// span instances belongs to the application, behind its own locks.
pub trait Processor: Send {
    /// Produce a fresh instance for one (thread, version) cell.
    fn clone_boxed(&self) -> Box<dyn Processor>;

    /// Process one request. Return false to count the request as failed.
    fn process_request(&mut self, ctx: &mut RequestContext<'_>) -> bool;

    /// Invoked just before a client's session is torn down.
    fn process_disconnection(&mut self, handle: ClientHandle, session_data: Option<SessionData>);
}

/// One registered protocol version: the prototype processor plus its size
/// limits.
pub struct Registration {
    pub version: u16,
    pub params: crate::config::VersionParams,
    pub prototype: Box<dyn Processor>,
}

impl Registration {
    pub fn new(
        version: u16,
        params: crate::config::VersionParams,
        prototype: Box<dyn Processor>,
    ) -> Self {
        Registration {
            version,
            params,
            prototype,
        }
    }
}

/// Framework API available to a processor while it handles one request.
pub struct RequestContext<'a> {
    core: &'a Arc<Core>,
    request: &'a Arc<Request>,
    /// Version of the processor handling the request; the default for
    /// outgoing responses.
    processor_version: u16,
}

impl<'a> RequestContext<'a> {
    pub(crate) fn new(
        core: &'a Arc<Core>,
        request: &'a Arc<Request>,
        processor_version: u16,
    ) -> Self {
        RequestContext {
            core,
            request,
            processor_version,
        }
    }

    /// The request payload, header already stripped.
    pub fn payload(&self) -> &Bytes {
        self.request.payload()
    }

    /// Handle of the client that sent the request.
    pub fn sender(&self) -> ClientHandle {
        self.request.session().handle()
    }

    /// Protocol version negotiated by the sending client.
    pub fn client_version(&self) -> u16 {
        self.request.session().version()
    }

    /// IPv4 address identifying this server in handles.
    pub fn server_addr(&self) -> ServerAddr {
        self.core.local_server
    }

    pub fn common_params(&self) -> &CommonParams {
        &self.core.common
    }

    fn effective_version(&self, version: u16) -> u16 {
        if version == UNINITIALIZED_VERSION {
            self.processor_version
        } else {
            version
        }
    }

    /// Queue a response to a single client, local or remote.
    pub fn send_response(&mut self, handle: ClientHandle, payload: &[u8]) {
        self.send_response_versioned(handle, payload, UNINITIALIZED_VERSION);
    }

    /// Like [`send_response`](Self::send_response) but stamping a version
    /// other than the processor's own. Needed when responding on behalf of
    /// clients of another version.
    pub fn send_response_versioned(&mut self, handle: ClientHandle, payload: &[u8], version: u16) {
        let handles: BTreeSet<ClientHandle> = BTreeSet::from([handle]);
        self.store(&handles, payload, version, false);
    }

    /// Queue one response to many clients at once; they may be connected
    /// anywhere in the farm.
    pub fn send_multicast(&mut self, handles: &BTreeSet<ClientHandle>, payload: &[u8]) {
        self.store(handles, payload, UNINITIALIZED_VERSION, false);
    }

    pub fn send_multicast_versioned(
        &mut self,
        handles: &BTreeSet<ClientHandle>,
        payload: &[u8],
        version: u16,
    ) {
        self.store(handles, payload, version, false);
    }

    /// Queue a response and block until the event loop has run one send
    /// cycle, so the bytes are on the wire (or failed) before this returns.
    pub fn send_update(&mut self, handle: ClientHandle, payload: &[u8]) {
        let handles: BTreeSet<ClientHandle> = BTreeSet::from([handle]);
        self.multicast_update(&handles, payload);
    }

    pub fn multicast_update(&mut self, handles: &BTreeSet<ClientHandle>, payload: &[u8]) {
        self.store(handles, payload, UNINITIALIZED_VERSION, true);
        self.core.run_send_cycle_and_wait();
    }

    /// Send a framework error frame: reserved version, code byte, then the
    /// application error code.
    pub fn store_error(&mut self, handle: ClientHandle, error_code: u8) {
        let payload = [code::ERROR, error_code];
        self.send_response_versioned(handle, &payload, SPECIAL_COMMUNICATION);
    }

    /// Disconnect any client of the farm. Realized as a fatal-error
    /// response: the send pipeline interprets it locally and never
    /// transmits it.
    pub fn disconnect_client(&mut self, handle: ClientHandle) {
        tracing::info!(%handle, "application requested client disconnection");
        self.send_response_versioned(handle, &[code::FATAL_ERROR], SPECIAL_COMMUNICATION);
    }

    /// Postpone this request; the framework re-queues it for another pass
    /// and leaves all session counters untouched.
    pub fn defer_request_processing(&mut self) {
        self.request.set_deferred(true);
    }

    /// Keep the payload receive buffer allocated between frames instead of
    /// reallocating per request.
    pub fn set_streaming_mode(&mut self, mode: bool) {
        self.request.session().set_streaming(mode);
    }

    /// Attach application data to the sending client's session; it lives
    /// until the session is torn down, when it is handed to
    /// `process_disconnection`.
    pub fn set_session_data(&mut self, data: Option<SessionData>) {
        self.request.session().set_session_data(data);
    }

    pub fn with_session_data<T>(&self, f: impl FnOnce(Option<&mut SessionData>) -> T) -> T {
        self.request.session().with_session_data(f)
    }

    fn store(
        &mut self,
        handles: &BTreeSet<ClientHandle>,
        payload: &[u8],
        version: u16,
        is_update: bool,
    ) {
        let version = self.effective_version(version);
        fanout::store_message(
            self.core,
            handles,
            payload,
            version,
            is_update,
            Some(self.request),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VersionParams, VersionTable};
    use crate::session::Session;
    use crate::stats::ServerStats;
    use std::time::Instant;

    struct Probe;

    impl Processor for Probe {
        fn clone_boxed(&self) -> Box<dyn Processor> {
            Box::new(Probe)
        }

        fn process_request(&mut self, ctx: &mut RequestContext<'_>) -> bool {
            let sender = ctx.sender();
            let payload = ctx.payload().clone();
            ctx.send_response(sender, &payload);
            true
        }

        fn process_disconnection(&mut self, _: ClientHandle, _: Option<SessionData>) {}
    }

    fn core() -> Arc<Core> {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::mem::forget(rx);
        let poll = mio::Poll::new().unwrap();
        let waker = mio::Waker::new(poll.registry(), mio::Token(usize::MAX)).unwrap();
        let versions = VersionTable::build([(1, VersionParams::default())]).unwrap();
        Arc::new(Core::new(
            CommonParams::default(),
            ServerAddr::new(1),
            9000,
            versions,
            ServerStats::new(1),
            tx,
            waker,
        ))
    }

    fn request_for(core: &Arc<Core>, payload: &'static [u8]) -> Arc<Request> {
        let session = Arc::new(Session::new(ClientHandle::new(core.local_server, 1)));
        session.set_version(1);
        core.pool.add(Arc::clone(&session)).unwrap();
        Arc::new(Request::new(
            Bytes::from_static(payload),
            Instant::now(),
            session,
        ))
    }

    #[test]
    fn test_echo_processor_queues_response() {
        let core = core();
        let request = request_for(&core, b"hello");
        let mut ctx = RequestContext::new(&core, &request, 1);

        let mut processor = Probe;
        assert!(processor.process_request(&mut ctx));

        let side = core.current_side();
        let queued = request.session().drain_queue(side);
        assert_eq!(queued.len(), 1);
        assert_eq!(
            &queued[0].wire()[crate::config::HEADER_SIZE..],
            b"hello"
        );
    }

    #[test]
    fn test_default_version_is_the_processors() {
        let core = core();
        let request = request_for(&core, b"x");
        let mut ctx = RequestContext::new(&core, &request, 1);
        let sender = ctx.sender();
        ctx.send_response(sender, b"reply");

        let queued = request.session().drain_queue(core.current_side());
        let version = u16::from_be_bytes([queued[0].wire()[3], queued[0].wire()[4]]);
        assert_eq!(version, 1);
    }

    #[test]
    fn test_disconnect_client_queues_untransmitted_fatal() {
        let core = core();
        let request = request_for(&core, b"x");
        let mut ctx = RequestContext::new(&core, &request, 1);
        let sender = ctx.sender();
        ctx.disconnect_client(sender);

        let queued = request.session().drain_queue(core.current_side());
        assert_eq!(queued.len(), 1);
        assert!(queued[0].is_fatal_error_for_local_client());
    }

    #[test]
    fn test_defer_marks_request() {
        let core = core();
        let request = request_for(&core, b"x");
        let mut ctx = RequestContext::new(&core, &request, 1);
        ctx.defer_request_processing();
        assert!(request.is_deferred());
    }

    #[test]
    fn test_session_data_roundtrip_via_context() {
        let core = core();
        let request = request_for(&core, b"x");
        let mut ctx = RequestContext::new(&core, &request, 1);

        ctx.set_session_data(Some(Box::new(String::from("state"))));
        let found = ctx.with_session_data(|data| {
            data.and_then(|d| d.downcast_ref::<String>().cloned())
        });
        assert_eq!(found.as_deref(), Some("state"));
    }
}
