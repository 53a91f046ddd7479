// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The background receive loop: one thread owning a poll context and a set
//! of receivers.
//!
//! Each cycle applies queued socket work, polls with a bounded timeout,
//! reads one datagram per lock hold (so callbacks always run unlocked), and
//! runs the periodic tick every 120 ms.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::{Events, Poll};

use crate::config::{MAX_PACKET_SIZE, PERIODIC_INTERVAL, POLL_TIMEOUT};
use crate::engine::{self, Engine};
use crate::protocol::{parse_datagram, SacnPacket};
use crate::receiver::state::{self, Note};
use crate::transport::{recv_with_pktinfo, RecvMeta};

pub(crate) fn run(thread_id: usize, running: Arc<AtomicBool>) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            log::warn!("[RECV] thread {} could not create poll context: {}", thread_id, e);
            mark_thread_failed(thread_id);
            return;
        }
    };
    let mut events = Events::with_capacity(64);
    // Datagrams land here; some sources pad past the claimed PDU length.
    let mut buf = [0u8; MAX_PACKET_SIZE + 128];
    let mut next_tick = Instant::now() + PERIODIC_INTERVAL;

    while running.load(Ordering::Acquire) {
        // 1. Apply pending socket adds, subscribes, unsubscribes, and
        //    dead-socket closures queued by API threads.
        {
            let mut guard = engine::lock();
            let Some(engine) = guard.as_mut() else { break };
            engine.threads[thread_id].pool.apply_pending(poll.registry());
        }

        // 2. Wait for traffic with the lock released.
        let timeout = next_tick
            .saturating_duration_since(Instant::now())
            .min(POLL_TIMEOUT);
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::warn!("[RECV] thread {} poll failed: {}", thread_id, e);
            mark_thread_failed(thread_id);
            return;
        }

        // 3. Drain every readable socket.
        for event in events.iter() {
            drain_socket(thread_id, event.token().0, &mut buf);
        }

        // 4. Periodic processing.
        let now = Instant::now();
        if now >= next_tick {
            next_tick = now + PERIODIC_INTERVAL;
            let mut notes: Vec<Note<'static>> = Vec::new();
            {
                let mut guard = engine::lock();
                let Some(engine) = guard.as_mut() else { break };
                state::periodic_tick(engine, thread_id, now, &mut notes);
            }
            state::deliver_notes(notes);
        }
    }

    log::debug!("[RECV] thread {} exiting", thread_id);
}

/// Read datagrams until the socket would block, delivering the resulting
/// notifications between datagrams with the lock released.
fn drain_socket(thread_id: usize, token: usize, buf: &mut [u8]) {
    loop {
        let mut notes = Vec::new();
        let more = recv_and_dispatch(thread_id, token, buf, &mut notes);
        state::deliver_notes(notes);
        if !more {
            return;
        }
    }
}

fn recv_and_dispatch<'a>(
    thread_id: usize,
    token: usize,
    buf: &'a mut [u8],
    notes: &mut Vec<Note<'a>>,
) -> bool {
    let mut guard = engine::lock();
    let Some(engine) = guard.as_mut() else {
        return false;
    };

    let result = {
        let Some(socket_ref) = engine.threads[thread_id].pool.socket_by_token(token) else {
            return false; // closed since the event fired
        };
        recv_with_pktinfo(&socket_ref.socket, &mut *buf)
    };

    let (len, meta) = match result {
        Ok(received) => received,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
        Err(e) => {
            // Transient receive errors are logged and the loop continues.
            log::debug!("[RECV] thread {} recv error: {}", thread_id, e);
            return false;
        }
    };

    dispatch(engine, thread_id, &buf[..len], meta, notes);
    true
}

fn dispatch<'a>(
    engine: &mut Engine,
    thread_id: usize,
    data: &'a [u8],
    meta: RecvMeta,
    notes: &mut Vec<Note<'a>>,
) {
    let Some(packet) = parse_datagram(data) else {
        let ctx = &mut engine.threads[thread_id];
        ctx.packets_dropped += 1;
        log::debug!(
            "[RECV] dropped malformed datagram from {} ({} dropped so far)",
            meta.src,
            ctx.packets_dropped
        );
        return;
    };

    let now = Instant::now();
    match packet {
        SacnPacket::Data(view) => {
            // Multicast and unicast alike resolve to the receiver that owns
            // the packet's universe.
            if let Some(&receiver_handle) = engine.by_universe.get(&view.universe) {
                state::handle_data_packet(engine, receiver_handle, &view, meta, now, notes);
            }
        }
        SacnPacket::Sync(_) => {
            // Synchronization universes are recognized but not implemented.
        }
        SacnPacket::Discovery(view) => {
            crate::source_detector::handle_discovery_page(engine, &view, now, notes);
        }
    }
}

fn mark_thread_failed(thread_id: usize) {
    let mut guard = engine::lock();
    if let Some(engine) = guard.as_mut() {
        if let Some(ctx) = engine.threads.get_mut(thread_id) {
            ctx.failed = true;
            ctx.running.store(false, Ordering::Release);
        }
    }
}
