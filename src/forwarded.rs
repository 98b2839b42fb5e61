//! Built-in processor for the reserved framework version.
//!
//! The only request a server receives under the reserved version is a
//! response forwarded by a peer: the body carries the sender's version, the
//! recipients' registration numbers and the original payload. This
//! processor fabricates local handles for the recipients, re-sends the
//! payload to them, and acknowledges the forward with a single-byte ack on
//! the same connection.

use crate::config::{code, SPECIAL_COMMUNICATION};
use crate::handle::ClientHandle;
use crate::processor::{Processor, RequestContext};
use crate::session::SessionData;
use crate::wire;
use std::collections::BTreeSet;
use tracing::error;

pub struct ForwardedResponseProcessor;

impl Processor for ForwardedResponseProcessor {
    fn clone_boxed(&self) -> Box<dyn Processor> {
        Box::new(ForwardedResponseProcessor)
    }

    fn process_request(&mut self, ctx: &mut RequestContext<'_>) -> bool {
        // Peer links stream forwards back to back; keep the receive buffer
        // allocated between frames.
        ctx.set_streaming_mode(true);

        let payload = ctx.payload().clone();
        let message = match wire::decode_forwarded(&payload) {
            Ok(message) => message,
            Err(err) => {
                error!(error = %err, "rejecting malformed forwarded response");
                return false;
            }
        };

        let local = ctx.server_addr();
        let handles: BTreeSet<ClientHandle> = message
            .registrations
            .iter()
            .map(|&registration| ClientHandle::new(local, registration))
            .collect();

        ctx.send_multicast_versioned(
            &handles,
            &payload[message.payload_offset..],
            message.sender_version,
        );

        let sender = ctx.sender();
        ctx.send_response_versioned(sender, &[code::ACK_OF_FORWARDED], SPECIAL_COMMUNICATION);

        true
    }

    fn process_disconnection(&mut self, _handle: ClientHandle, _session_data: Option<SessionData>) {
        // Peer links carry no application state to tear down.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommonParams, VersionParams, VersionTable};
    use crate::context::Core;
    use crate::handle::ServerAddr;
    use crate::request::Request;
    use crate::session::Session;
    use crate::stats::ServerStats;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Instant;

    fn core() -> Arc<Core> {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::mem::forget(rx);
        let poll = mio::Poll::new().unwrap();
        let waker = mio::Waker::new(poll.registry(), mio::Token(usize::MAX)).unwrap();
        let versions = VersionTable::build([(1, VersionParams::default())]).unwrap();
        Arc::new(Core::new(
            CommonParams::default(),
            ServerAddr::new(50),
            9000,
            versions,
            ServerStats::new(1),
            tx,
            waker,
        ))
    }

    /// A peer link session plus local recipient sessions.
    fn setup(core: &Arc<Core>, recipients: &[u64]) -> (Arc<Session>, Vec<Arc<Session>>) {
        let peer_link = Arc::new(Session::new(ClientHandle::new(core.local_server, 1000)));
        peer_link.set_version(SPECIAL_COMMUNICATION);
        core.pool.add(Arc::clone(&peer_link)).unwrap();

        let mut sessions = Vec::new();
        for &registration in recipients {
            let session = Arc::new(Session::new(ClientHandle::new(
                core.local_server,
                registration,
            )));
            session.set_version(1);
            core.pool.add(Arc::clone(&session)).unwrap();
            sessions.push(session);
        }
        (peer_link, sessions)
    }

    #[test]
    fn test_forward_delivers_locally_and_acks() {
        let core = core();
        let (peer_link, sessions) = setup(&core, &[7, 8]);

        let forwarded = wire::encode_forwarded(1, &[7, 8], b"news");
        let body = forwarded.slice(crate::config::HEADER_SIZE..);
        let request = Arc::new(Request::new(body, Instant::now(), Arc::clone(&peer_link)));

        let mut ctx = RequestContext::new(&core, &request, SPECIAL_COMMUNICATION);
        let mut processor = ForwardedResponseProcessor;
        assert!(processor.process_request(&mut ctx));

        // Streaming turned on for the peer link.
        assert!(peer_link.is_streaming());

        let side = core.current_side();
        // Both local recipients share one response carrying the payload
        // under the sender's version.
        let first = sessions[0].drain_queue(side);
        let second = sessions[1].drain_queue(side);
        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(&first[0].wire()[crate::config::HEADER_SIZE..], b"news");
        let version = u16::from_be_bytes([first[0].wire()[3], first[0].wire()[4]]);
        assert_eq!(version, 1);

        // The peer link got a one-byte ack under the reserved version.
        let acks = peer_link.drain_queue(side);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].response_type(), code::ACK_OF_FORWARDED);
        assert_eq!(
            &acks[0].wire()[crate::config::HEADER_SIZE..],
            &[code::ACK_OF_FORWARDED]
        );
    }

    #[test]
    fn test_malformed_forward_fails_without_sending() {
        let core = core();
        let (peer_link, sessions) = setup(&core, &[7]);

        // Handle count claims more registrations than are present.
        let mut body = wire::encode_forwarded(1, &[7], b"x")
            .slice(crate::config::HEADER_SIZE..)
            .to_vec();
        body[2..6].copy_from_slice(&5u32.to_be_bytes());

        let request = Arc::new(Request::new(
            Bytes::from(body),
            Instant::now(),
            Arc::clone(&peer_link),
        ));
        let mut ctx = RequestContext::new(&core, &request, SPECIAL_COMMUNICATION);
        let mut processor = ForwardedResponseProcessor;
        assert!(!processor.process_request(&mut ctx));

        let side = core.current_side();
        assert_eq!(sessions[0].queue_len(side), 0);
        assert_eq!(peer_link.queue_len(side), 0);
    }

    #[test]
    fn test_unknown_recipients_still_ack() {
        let core = core();
        let (peer_link, _sessions) = setup(&core, &[]);

        // Registration 999 is not connected here (raced a disconnect).
        let forwarded = wire::encode_forwarded(1, &[999], b"late");
        let body = forwarded.slice(crate::config::HEADER_SIZE..);
        let request = Arc::new(Request::new(body, Instant::now(), Arc::clone(&peer_link)));

        let mut ctx = RequestContext::new(&core, &request, SPECIAL_COMMUNICATION);
        let mut processor = ForwardedResponseProcessor;
        assert!(processor.process_request(&mut ctx));

        let acks = peer_link.drain_queue(core.current_side());
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].response_type(), code::ACK_OF_FORWARDED);
    }
}
