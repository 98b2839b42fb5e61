//! Response objects.
//!
//! A response owns one contiguous, immutable wire-form buffer and is shared
//! by reference across every recipient queue it lands on. `ref_count` is the
//! number of queued deliveries; `sent_count` grows as per-recipient
//! completions arrive. Queue accounting for the response runs exactly once,
//! when the counts meet; the buffer itself is released when the last
//! `Arc<Response>` drops.

use crate::config::{code, VersionTable, MAX_HANDLES_IN_FORWARDED_RESPONSE, SPECIAL_COMMUNICATION};
use crate::handle::ServerAddr;
use crate::wire;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response payload is empty")]
    EmptyPayload,
    #[error("response payload exceeds the maximum for version 0x{version:X}")]
    TooLarge { version: u16 },
    #[error("no version parameters registered for version 0x{version:X}")]
    UnknownVersion { version: u16 },
    #[error("forwarded response exceeds the handle cap; multicast in batches")]
    TooManyHandles,
}

#[derive(Debug)]
pub struct Response {
    wire: Bytes,
    target: ServerAddr,
    response_type: u8,
    is_forward: bool,
    is_multicast: bool,
    is_update: bool,
    ref_count: AtomicU32,
    sent_count: AtomicU32,
    queued_at: Mutex<Option<Instant>>,
    request_arrival: Option<Instant>,
}

impl Response {
    /// Build the wire form for clients connected to this server:
    /// `"MAI" | version | size | payload`.
    pub fn for_local_clients(
        payload: &[u8],
        version: u16,
        versions: &VersionTable,
        target: ServerAddr,
        recipient_count: usize,
        is_update: bool,
        request_arrival: Option<Instant>,
    ) -> Result<Self, ResponseError> {
        let params = versions
            .get(version)
            .ok_or(ResponseError::UnknownVersion { version })?;
        if payload.is_empty() {
            return Err(ResponseError::EmptyPayload);
        }
        if payload.len() > params.max_response_size {
            return Err(ResponseError::TooLarge { version });
        }

        Ok(Response {
            wire: wire::encode_local(version, payload),
            target,
            response_type: wire::response_type(version, payload),
            is_forward: false,
            is_multicast: recipient_count > 1,
            is_update,
            ref_count: AtomicU32::new(0),
            sent_count: AtomicU32::new(0),
            queued_at: Mutex::new(None),
            request_arrival,
        })
    }

    /// Build the wire form forwarded to a peer server: a reserved-version
    /// frame whose body carries the sender version, the recipients'
    /// registration numbers and the original payload.
    pub fn for_remote_clients(
        payload: &[u8],
        sender_version: u16,
        versions: &VersionTable,
        target: ServerAddr,
        registrations: &[u64],
        is_update: bool,
        request_arrival: Option<Instant>,
    ) -> Result<Self, ResponseError> {
        if payload.is_empty() {
            return Err(ResponseError::EmptyPayload);
        }
        if registrations.len() > MAX_HANDLES_IN_FORWARDED_RESPONSE {
            return Err(ResponseError::TooManyHandles);
        }

        let params = versions
            .get(SPECIAL_COMMUNICATION)
            .ok_or(ResponseError::UnknownVersion {
                version: SPECIAL_COMMUNICATION,
            })?;
        let inner_len = 2 + 4 + registrations.len() * 8 + payload.len();
        if inner_len > params.max_response_size {
            return Err(ResponseError::TooLarge {
                version: SPECIAL_COMMUNICATION,
            });
        }

        Ok(Response {
            wire: wire::encode_forwarded(sender_version, registrations, payload),
            target,
            response_type: wire::response_type(sender_version, payload),
            is_forward: true,
            is_multicast: registrations.len() > 1,
            is_update,
            ref_count: AtomicU32::new(0),
            sent_count: AtomicU32::new(0),
            queued_at: Mutex::new(None),
            request_arrival,
        })
    }

    pub fn wire(&self) -> &Bytes {
        &self.wire
    }

    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    pub fn target(&self) -> ServerAddr {
        self.target
    }

    pub fn response_type(&self) -> u8 {
        self.response_type
    }

    pub fn is_forward(&self) -> bool {
        self.is_forward
    }

    pub fn is_multicast(&self) -> bool {
        self.is_multicast
    }

    pub fn is_update(&self) -> bool {
        self.is_update
    }

    /// A fatal-error response to a local client forces a disconnect instead
    /// of being transmitted.
    pub fn is_fatal_error_for_local_client(&self) -> bool {
        !self.is_forward && self.response_type == code::FATAL_ERROR
    }

    /// Set once by the fan-out after the response has been placed on every
    /// recipient queue it could reach.
    pub fn set_ref_count(&self, refs: u32) {
        self.ref_count.store(refs, Ordering::Release);
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Record one per-recipient completion. Returns true exactly once, for
    /// the completion that makes the delivery count meet the reference
    /// count; the caller then runs the response's final accounting.
    pub fn mark_sent(&self) -> bool {
        let sent = self.sent_count.fetch_add(1, Ordering::AcqRel) + 1;
        let refs = self.ref_count();
        debug_assert!(sent <= refs, "more completions than queued deliveries");
        sent == refs
    }

    pub fn sent_count(&self) -> u32 {
        self.sent_count.load(Ordering::Acquire)
    }

    pub fn note_queued_for_send(&self, at: Instant) {
        *self.queued_at.lock().expect("queued_at lock poisoned") = Some(at);
    }

    pub fn queued_at(&self) -> Option<Instant> {
        *self.queued_at.lock().expect("queued_at lock poisoned")
    }

    pub fn request_arrival(&self) -> Option<Instant> {
        self.request_arrival
    }

    /// Bytes charged against the response-queue memory counters.
    pub fn accounted_size(&self) -> i64 {
        (self.wire.len() + std::mem::size_of::<Response>()) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VersionParams, HEADER_SIZE};

    fn versions() -> VersionTable {
        VersionTable::build([(
            1,
            VersionParams {
                max_request_size: 64,
                max_response_size: 64,
            },
        )])
        .unwrap()
    }

    fn local(payload: &[u8], recipients: usize) -> Response {
        Response::for_local_clients(
            payload,
            1,
            &versions(),
            ServerAddr::new(7),
            recipients,
            false,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_local_wire_form() {
        let response = local(b"hi", 1);
        assert_eq!(&response.wire()[..3], b"MAI");
        assert_eq!(&response.wire()[HEADER_SIZE..], b"hi");
        assert!(!response.is_forward());
        assert!(!response.is_multicast());
        assert_eq!(response.response_type(), code::ORDINARY);
    }

    #[test]
    fn test_multicast_flag_follows_recipients() {
        assert!(!local(b"x", 1).is_multicast());
        assert!(local(b"x", 2).is_multicast());
    }

    #[test]
    fn test_empty_and_oversized_payloads_rejected() {
        let versions = versions();
        let target = ServerAddr::new(7);

        let empty = Response::for_local_clients(b"", 1, &versions, target, 1, false, None);
        assert_eq!(empty.unwrap_err(), ResponseError::EmptyPayload);

        let at_limit = Response::for_local_clients(&[0; 64], 1, &versions, target, 1, false, None);
        assert!(at_limit.is_ok());

        let over = Response::for_local_clients(&[0; 65], 1, &versions, target, 1, false, None);
        assert_eq!(over.unwrap_err(), ResponseError::TooLarge { version: 1 });
    }

    #[test]
    fn test_fatal_error_detection() {
        let versions = versions();
        let fatal = Response::for_local_clients(
            &[code::FATAL_ERROR],
            SPECIAL_COMMUNICATION,
            &versions,
            ServerAddr::new(7),
            1,
            false,
            None,
        )
        .unwrap();
        assert!(fatal.is_fatal_error_for_local_client());
        assert_eq!(fatal.response_type(), code::FATAL_ERROR);

        let keep_alive = Response::for_local_clients(
            &[code::KEEP_ALIVE],
            SPECIAL_COMMUNICATION,
            &versions,
            ServerAddr::new(7),
            1,
            false,
            None,
        )
        .unwrap();
        assert!(!keep_alive.is_fatal_error_for_local_client());
    }

    #[test]
    fn test_forwarded_never_fatal_for_local() {
        let versions = versions();
        let forwarded = Response::for_remote_clients(
            &[code::FATAL_ERROR],
            SPECIAL_COMMUNICATION,
            &versions,
            ServerAddr::new(9),
            &[42],
            false,
            None,
        )
        .unwrap();
        assert!(forwarded.is_forward());
        assert!(!forwarded.is_fatal_error_for_local_client());
    }

    #[test]
    fn test_sent_count_meets_ref_count_once() {
        let response = local(b"hi", 3);
        response.set_ref_count(3);

        assert!(!response.mark_sent());
        assert!(!response.mark_sent());
        assert!(response.mark_sent());
        assert_eq!(response.sent_count(), response.ref_count());
    }

    #[test]
    fn test_forwarded_handle_cap() {
        let versions = versions();
        let registrations = vec![1u64; MAX_HANDLES_IN_FORWARDED_RESPONSE + 1];
        let err = Response::for_remote_clients(
            b"x",
            1,
            &versions,
            ServerAddr::new(9),
            &registrations,
            false,
            None,
        )
        .unwrap_err();
        assert_eq!(err, ResponseError::TooManyHandles);
    }
}
