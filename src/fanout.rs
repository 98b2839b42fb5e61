//! Response fan-out.
//!
//! One `store_message` call may address any mix of local and remote clients.
//! Handles are grouped by target server; each local group becomes one
//! response shared by reference across the recipients' queues, each remote
//! group becomes one forwarded response per chunk of
//! `MAX_HANDLES_IN_FORWARDED_RESPONSE` handles on the peer's queue. The
//! response's reference count is the number of queues it actually landed on;
//! a response that lands nowhere is released immediately.

use crate::config::MAX_HANDLES_IN_FORWARDED_RESPONSE;
use crate::context::Core;
use crate::handle::{ClientHandle, ServerAddr};
use crate::request::Request;
use crate::response::Response;
use crate::session::{CounterKind, EnqueueOutcome};
use crate::stats::ExceptionKind;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Build and enqueue the response(s) for `payload` addressed to `handles`
/// under `version`. Returns the total number of queued deliveries; zero
/// means nothing was enqueued (invalid message, full queues, or every
/// recipient gone).
pub fn store_message(
    core: &Core,
    handles: &BTreeSet<ClientHandle>,
    payload: &[u8],
    version: u16,
    is_update: bool,
    request: Option<&Request>,
) -> u32 {
    let params = core.versions.get(version);

    let valid = params
        .map(|p| !handles.is_empty() && !payload.is_empty() && payload.len() <= p.max_response_size)
        .unwrap_or(false);
    if !valid {
        error!(
            version = format_args!("0x{version:X}"),
            recipients = handles.len(),
            payload_len = payload.len(),
            "cannot store message: no recipients or invalid message attributes"
        );
        return 0;
    }

    let request_arrival = request.map(|r| r.arrival());
    let mut total_refs = 0;

    // BTreeSet iterates ordered by (server, registration), so one linear
    // scan yields the per-server groups.
    let mut group: Vec<ClientHandle> = Vec::new();
    let mut iter = handles.iter().peekable();

    while let Some(&handle) = iter.next() {
        group.push(handle);
        let group_complete = iter
            .peek()
            .map_or(true, |next| next.server != handle.server);
        if group_complete {
            total_refs += store_for_server(
                core,
                handle.server,
                &group,
                payload,
                version,
                is_update,
                request,
                request_arrival,
            );
            group.clear();
        }
    }

    total_refs
}

#[allow(clippy::too_many_arguments)]
fn store_for_server(
    core: &Core,
    server: ServerAddr,
    group: &[ClientHandle],
    payload: &[u8],
    version: u16,
    is_update: bool,
    request: Option<&Request>,
    request_arrival: Option<Instant>,
) -> u32 {
    if server == core.local_server {
        store_local(core, group, payload, version, is_update, request_arrival)
    } else {
        // Each chunk becomes one forwarded response; local groups are
        // never split.
        let mut refs = 0;
        for chunk in group.chunks(MAX_HANDLES_IN_FORWARDED_RESPONSE) {
            refs += store_forwarded(
                core,
                server,
                chunk,
                payload,
                version,
                is_update,
                request,
                request_arrival,
            );
        }
        refs
    }
}

fn store_local(
    core: &Core,
    group: &[ClientHandle],
    payload: &[u8],
    version: u16,
    is_update: bool,
    request_arrival: Option<Instant>,
) -> u32 {
    let response = match Response::for_local_clients(
        payload,
        version,
        &core.versions,
        core.local_server,
        group.len(),
        is_update,
        request_arrival,
    ) {
        Ok(response) => Arc::new(response),
        Err(err) => {
            core.stats
                .record_exception(ExceptionKind::ResponseCreation, &err.to_string());
            return 0;
        }
    };

    // The direction guard pins the enqueue side for the whole fan-out and
    // makes the final reference count visible before the loop's next toggle.
    let (_direction_guard, side) = core.enqueue_side();
    let mut refs = 0;

    for handle in group {
        // Holding the enqueue gate keeps the removal path from retiring the
        // session between the counter increase and the queue push.
        let _gate = core.pool.enqueue_guard();
        let session = match core.pool.increase(handle, CounterKind::Response) {
            Some(session) => session,
            None => continue, // client already gone or being disconnected
        };

        match session.try_enqueue_response(
            side,
            Arc::clone(&response),
            core.common.max_pending_responses,
        ) {
            EnqueueOutcome::Added => {
                core.add_client_receiver(side, session.registration());
                refs += 1;
            }
            EnqueueOutcome::QueueFull => {
                core.pool.decrease(&session, CounterKind::Response);
            }
        }
    }

    response.set_ref_count(refs);
    finish_accounting(core, &response, refs);
    refs
}

#[allow(clippy::too_many_arguments)]
fn store_forwarded(
    core: &Core,
    server: ServerAddr,
    chunk: &[ClientHandle],
    payload: &[u8],
    version: u16,
    is_update: bool,
    request: Option<&Request>,
    request_arrival: Option<Instant>,
) -> u32 {
    let registrations: Vec<u64> = chunk.iter().map(|h| h.registration).collect();

    let response = match Response::for_remote_clients(
        payload,
        version,
        &core.versions,
        server,
        &registrations,
        is_update,
        request_arrival,
    ) {
        Ok(response) => Arc::new(response),
        Err(err) => {
            core.stats
                .record_exception(ExceptionKind::ResponseCreation, &err.to_string());
            if let Some(request) = request {
                request.set_failure_flag();
            }
            return 0;
        }
    };

    let (_direction_guard, side) = core.enqueue_side();
    let refs = if core.common.max_pending_responses > 0 {
        let peer = core.peers.get_or_create(server);
        peer.enqueue_response(side, Arc::clone(&response));
        core.add_peer_receiver(side, server.bits());
        1
    } else {
        error!(peer = %server, "peer forward queue disabled; cannot add response");
        0
    };

    response.set_ref_count(refs);
    finish_accounting(core, &response, refs);
    refs
}

fn finish_accounting(core: &Core, response: &Response, refs: u32) {
    core.stats.with_responses(|r| {
        if refs == 0 {
            r.responses_failed_to_queue += 1;
        } else {
            if response.is_forward() {
                r.responses_in_peer_servers_queues += 1;
            } else {
                r.responses_in_local_clients_queues += 1;
            }
            r.memory_by_responses_in_queue += response.accounted_size();
        }
    });
}
