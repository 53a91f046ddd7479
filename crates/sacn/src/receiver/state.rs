// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-universe receiver state machine: source tracking, sequence checking,
//! the PAP/DMX ordering dance, and the periodic tick.
//!
//! Everything here runs under the engine lock and produces [`Note`]s; the
//! receive thread delivers them after releasing the lock so application
//! callbacks can call back into the API.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{SOURCE_LOSS_TIMEOUT, STARTCODE_DMX, STARTCODE_PRIORITY, WAIT_FOR_PRIORITY};
use crate::engine::Engine;
use crate::merge_receiver::{self, MergeReceiverHandle, MergeReceiverNotify, MergedData};
use crate::protocol::DataView;
use crate::receiver::{
    LostSource, ReceiverClient, ReceiverHandle, ReceiverNotify, RemoteSourceInfo, SacnReceiver,
    UniverseData, UniverseSubrange,
};
use crate::remote_source::{RemoteSourceHandle, RemoteSourceRegistry, SourceCid};
use crate::transport::RecvMeta;

/// Tracked-source receive states: what we are still waiting for before
/// notifications flow freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvState {
    /// Only 0xDD seen so far; waiting for levels.
    WaitingForDmx,
    /// First 0x00 seen outside sampling; waiting for 0xDD or the wait
    /// timer.
    WaitingForPap,
    /// Levels flowing, no per-address priority.
    HaveDmxOnly,
    /// Levels and per-address priority both flowing.
    HaveDmxAndPap,
}

/// A withheld packet, retained so the PAP-before-data ordering holds on the
/// transition to established.
pub(crate) struct HeldPacket {
    pub start_code: u8,
    pub priority: u8,
    pub preview: bool,
    pub values: Vec<u8>,
}

impl HeldPacket {
    fn from_view(view: &DataView<'_>) -> Self {
        Self {
            start_code: view.start_code,
            priority: view.priority,
            preview: view.preview,
            values: view.slots.to_vec(),
        }
    }
}

/// One source being tracked by a receiver.
pub(crate) struct TrackedSource {
    pub handle: RemoteSourceHandle,
    pub cid: SourceCid,
    pub name: String,
    pub addr: SocketAddr,
    pub seq: u8,
    pub terminated: bool,
    pub dmx_received_since_last_tick: bool,
    /// The source arrived during the receiver's sampling period.
    pub sampling: bool,
    /// Liveness: 2.5 s past the last accepted packet.
    pub packet_deadline: Instant,
    /// Meaning depends on state: PAP wait while waiting, PAP liveness once
    /// established.
    pub pap_deadline: Instant,
    pub recv_state: RecvState,
    pub held: Option<HeldPacket>,
}

impl TrackedSource {
    pub(crate) fn info(&self) -> RemoteSourceInfo {
        RemoteSourceInfo {
            handle: self.handle,
            cid: self.cid,
            name: self.name.clone(),
        }
    }
}

/// One delivered packet (live view or a withheld copy).
pub(crate) struct PacketEvent<'a> {
    pub start_code: u8,
    pub priority: u8,
    pub preview: bool,
    pub values: Cow<'a, [u8]>,
}

impl PacketEvent<'_> {
    fn from_held(held: HeldPacket) -> PacketEvent<'static> {
        PacketEvent {
            start_code: held.start_code,
            priority: held.priority,
            preview: held.preview,
            values: Cow::Owned(held.values),
        }
    }
}

impl<'a> PacketEvent<'a> {
    fn from_view(view: &DataView<'a>) -> Self {
        Self {
            start_code: view.start_code,
            priority: view.priority,
            preview: view.preview,
            values: Cow::Borrowed(view.slots),
        }
    }
}

/// The callback target of a receiver, cloned out so notes can be delivered
/// after the lock drops.
pub(crate) enum ClientNotify {
    Raw(Arc<dyn ReceiverNotify>),
    Merge(Arc<dyn MergeReceiverNotify>),
}

impl SacnReceiver {
    pub(crate) fn client_notify(&self) -> ClientNotify {
        match &self.client {
            ReceiverClient::Raw(notify) => ClientNotify::Raw(Arc::clone(notify)),
            ReceiverClient::Merge(client) => ClientNotify::Merge(Arc::clone(&client.notify)),
        }
    }
}

/// A pending application notification, assembled under the lock and
/// delivered after it is released.
pub(crate) enum Note<'a> {
    UniverseData {
        notify: Arc<dyn ReceiverNotify>,
        receiver: ReceiverHandle,
        addr: SocketAddr,
        source: RemoteSourceInfo,
        universe: u16,
        event: PacketEvent<'a>,
        is_sampling: bool,
    },
    NonDmx {
        notify: Arc<dyn MergeReceiverNotify>,
        receiver: ReceiverHandle,
        addr: SocketAddr,
        source: RemoteSourceInfo,
        universe: u16,
        event: PacketEvent<'a>,
        is_sampling: bool,
    },
    MergedData {
        notify: Arc<dyn MergeReceiverNotify>,
        receiver: ReceiverHandle,
        data: MergedData,
    },
    SourcesLost {
        notify: ClientNotify,
        receiver: ReceiverHandle,
        universe: u16,
        lost: Vec<LostSource>,
    },
    SamplingStarted {
        notify: ClientNotify,
        receiver: ReceiverHandle,
        universe: u16,
    },
    SamplingEnded {
        notify: ClientNotify,
        receiver: ReceiverHandle,
        universe: u16,
    },
    PapLost {
        notify: ClientNotify,
        receiver: ReceiverHandle,
        universe: u16,
        source: RemoteSourceInfo,
    },
    LimitExceeded {
        notify: ClientNotify,
        receiver: ReceiverHandle,
        universe: u16,
    },
    SourceDetectorUpdated {
        notify: Arc<dyn crate::source_detector::SourceDetectorNotify>,
        handle: RemoteSourceHandle,
        cid: SourceCid,
        name: String,
        universes: Vec<u16>,
    },
    SourceDetectorExpired {
        notify: Arc<dyn crate::source_detector::SourceDetectorNotify>,
        handle: RemoteSourceHandle,
        cid: SourceCid,
        name: String,
    },
    SourceDetectorLimitExceeded {
        notify: Arc<dyn crate::source_detector::SourceDetectorNotify>,
    },
}

/// Invoke the application callbacks for a batch of notes. Runs with no
/// locks held, on the receive thread that owns the receiver.
pub(crate) fn deliver_notes(notes: Vec<Note<'_>>) {
    for note in notes {
        match note {
            Note::UniverseData {
                notify,
                receiver,
                addr,
                source,
                universe,
                event,
                is_sampling,
            } => {
                let data = UniverseData {
                    universe_id: universe,
                    priority: event.priority,
                    preview: event.preview,
                    is_sampling,
                    start_code: event.start_code,
                    slot_range: UniverseSubrange {
                        start_address: 1,
                        address_count: event.values.len() as u16,
                    },
                    values: &event.values,
                };
                notify.universe_data(receiver, addr, &source, &data);
            }
            Note::NonDmx {
                notify,
                receiver,
                addr,
                source,
                universe,
                event,
                is_sampling,
            } => {
                let data = UniverseData {
                    universe_id: universe,
                    priority: event.priority,
                    preview: event.preview,
                    is_sampling,
                    start_code: event.start_code,
                    slot_range: UniverseSubrange {
                        start_address: 1,
                        address_count: event.values.len() as u16,
                    },
                    values: &event.values,
                };
                notify.universe_non_dmx(MergeReceiverHandle(receiver.0), addr, &source, &data);
            }
            Note::MergedData {
                notify,
                receiver,
                data,
            } => notify.merged_data(MergeReceiverHandle(receiver.0), &data),
            Note::SourcesLost {
                notify,
                receiver,
                universe,
                lost,
            } => match notify {
                ClientNotify::Raw(n) => n.sources_lost(receiver, universe, &lost),
                ClientNotify::Merge(n) => {
                    n.sources_lost(MergeReceiverHandle(receiver.0), universe, &lost);
                }
            },
            Note::SamplingStarted {
                notify,
                receiver,
                universe,
            } => match notify {
                ClientNotify::Raw(n) => n.sampling_period_started(receiver, universe),
                ClientNotify::Merge(n) => {
                    n.sampling_period_started(MergeReceiverHandle(receiver.0), universe);
                }
            },
            Note::SamplingEnded {
                notify,
                receiver,
                universe,
            } => match notify {
                ClientNotify::Raw(n) => n.sampling_period_ended(receiver, universe),
                ClientNotify::Merge(n) => {
                    n.sampling_period_ended(MergeReceiverHandle(receiver.0), universe);
                }
            },
            Note::PapLost {
                notify,
                receiver,
                universe,
                source,
            } => match notify {
                ClientNotify::Raw(n) => n.source_pap_lost(receiver, universe, &source),
                ClientNotify::Merge(n) => {
                    n.source_pap_lost(MergeReceiverHandle(receiver.0), universe, &source);
                }
            },
            Note::LimitExceeded {
                notify,
                receiver,
                universe,
            } => match notify {
                ClientNotify::Raw(n) => n.source_limit_exceeded(receiver, universe),
                ClientNotify::Merge(n) => {
                    n.source_limit_exceeded(MergeReceiverHandle(receiver.0), universe);
                }
            },
            Note::SourceDetectorUpdated {
                notify,
                handle,
                cid,
                name,
                universes,
            } => notify.source_updated(handle, &cid, &name, &universes),
            Note::SourceDetectorExpired {
                notify,
                handle,
                cid,
                name,
            } => notify.source_expired(handle, &cid, &name),
            Note::SourceDetectorLimitExceeded { notify } => notify.limit_exceeded(),
        }
    }
}

// ============================================================================
// Packet dispatch
// ============================================================================

/// Process one accepted-from-the-wire data-family packet for the receiver
/// that owns `universe`.
pub(crate) fn handle_data_packet<'a>(
    engine: &mut Engine,
    receiver_handle: i32,
    view: &DataView<'a>,
    meta: RecvMeta,
    now: Instant,
    notes: &mut Vec<Note<'a>>,
) {
    let Engine {
        receivers,
        registry,
        ..
    } = engine;
    let Some(receiver) = receivers.get_mut(&receiver_handle) else {
        return;
    };
    process_for_receiver(receiver, registry, view, meta, now, notes);
}

pub(crate) fn process_for_receiver<'a>(
    receiver: &mut SacnReceiver,
    registry: &mut RemoteSourceRegistry,
    view: &DataView<'a>,
    meta: RecvMeta,
    now: Instant,
    notes: &mut Vec<Note<'a>>,
) {
    if view.preview && receiver.filter_preview {
        return;
    }

    let known = registry
        .lookup_handle(&view.cid)
        .filter(|h| receiver.sources.contains_key(h));

    match known {
        Some(handle) => handle_known_source(receiver, registry, handle, view, meta, now, notes),
        None => handle_new_source(receiver, registry, view, meta, now, notes),
    }
}

fn handle_new_source<'a>(
    receiver: &mut SacnReceiver,
    registry: &mut RemoteSourceRegistry,
    view: &DataView<'a>,
    meta: RecvMeta,
    now: Instant,
    notes: &mut Vec<Note<'a>>,
) {
    // A terminated stream from a source we never tracked is nothing.
    if view.terminated {
        return;
    }

    let at_capacity = receiver
        .source_count_max
        .is_some_and(|max| receiver.sources.len() >= max);
    if at_capacity {
        note_limit_exceeded(receiver, notes);
        return;
    }

    let handle = match registry.acquire(&view.cid) {
        Ok(handle) => handle,
        Err(_) => {
            note_limit_exceeded(receiver, notes);
            return;
        }
    };

    let sampling = receiver.netint_in_sampling(meta.ifindex);
    let mut source = TrackedSource {
        handle,
        cid: view.cid,
        name: view.source_name.to_string(),
        addr: meta.src,
        seq: view.sequence,
        terminated: false,
        dmx_received_since_last_tick: true,
        sampling,
        packet_deadline: now + SOURCE_LOSS_TIMEOUT,
        pap_deadline: now + WAIT_FOR_PRIORITY,
        recv_state: RecvState::WaitingForPap,
        held: None,
    };

    let mut deliver_now = false;
    if view.start_code == STARTCODE_PRIORITY {
        // Wait for levels before anything is announced; the PAP is kept so
        // it can be notified first once levels arrive.
        source.recv_state = RecvState::WaitingForDmx;
        source.pap_deadline = now + if sampling { SOURCE_LOSS_TIMEOUT } else { WAIT_FOR_PRIORITY };
        source.held = Some(HeldPacket::from_view(view));
    } else if sampling {
        // No PAP wait inside the sampling period.
        source.recv_state = RecvState::HaveDmxOnly;
        deliver_now = true;
    } else if view.start_code == STARTCODE_DMX {
        source.held = Some(HeldPacket::from_view(view));
    }
    // Alternate start codes outside sampling start the same PAP wait as DMX
    // and are not delivered until the source is established.

    log::debug!(
        "[RECV] universe {} new source {} ({}) state={:?}",
        receiver.universe,
        view.cid,
        handle,
        source.recv_state
    );
    receiver.sources.insert(handle, source);

    if deliver_now {
        deliver_packet(
            receiver,
            registry,
            handle,
            PacketEvent::from_view(view),
            notes,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_known_source<'a>(
    receiver: &mut SacnReceiver,
    registry: &mut RemoteSourceRegistry,
    handle: RemoteSourceHandle,
    view: &DataView<'a>,
    meta: RecvMeta,
    now: Instant,
    notes: &mut Vec<Note<'a>>,
) {
    // Decide everything that needs the tracked source first, then deliver.
    let mut events: Vec<PacketEvent<'a>> = Vec::new();
    {
        let Some(source) = receiver.sources.get_mut(&handle) else {
            return;
        };

        // Out-of-order packets are dropped but still prove liveness.
        let delta = view.sequence.wrapping_sub(source.seq);
        if !(1..=127).contains(&delta) {
            source.packet_deadline = now + SOURCE_LOSS_TIMEOUT;
            return;
        }

        source.seq = view.sequence;
        source.packet_deadline = now + SOURCE_LOSS_TIMEOUT;
        source.dmx_received_since_last_tick = true;
        source.addr = meta.src;
        if source.name != view.source_name {
            source.name.clear();
            source.name.push_str(view.source_name);
        }

        if view.terminated {
            source.terminated = true;
            return;
        }

        match view.start_code {
            STARTCODE_DMX => match source.recv_state {
                RecvState::WaitingForDmx => {
                    // Levels arrived: notify the withheld PAP first.
                    if let Some(held) = source.held.take() {
                        events.push(PacketEvent::from_held(held));
                    }
                    source.recv_state = RecvState::HaveDmxAndPap;
                    source.pap_deadline = now + SOURCE_LOSS_TIMEOUT;
                    events.push(PacketEvent::from_view(view));
                }
                RecvState::WaitingForPap => {
                    // Still in the PAP wait: keep only the newest levels.
                    source.held = Some(HeldPacket::from_view(view));
                }
                RecvState::HaveDmxOnly | RecvState::HaveDmxAndPap => {
                    events.push(PacketEvent::from_view(view));
                }
            },
            STARTCODE_PRIORITY => match source.recv_state {
                RecvState::WaitingForDmx => {
                    source.held = Some(HeldPacket::from_view(view));
                }
                RecvState::WaitingForPap => {
                    // PAP resolves the wait; it precedes the withheld data.
                    source.recv_state = RecvState::HaveDmxAndPap;
                    source.pap_deadline = now + SOURCE_LOSS_TIMEOUT;
                    events.push(PacketEvent::from_view(view));
                    if let Some(held) = source.held.take() {
                        events.push(PacketEvent::from_held(held));
                    }
                }
                RecvState::HaveDmxOnly => {
                    source.recv_state = RecvState::HaveDmxAndPap;
                    source.pap_deadline = now + SOURCE_LOSS_TIMEOUT;
                    events.push(PacketEvent::from_view(view));
                }
                RecvState::HaveDmxAndPap => {
                    source.pap_deadline = now + SOURCE_LOSS_TIMEOUT;
                    events.push(PacketEvent::from_view(view));
                }
            },
            _ => {
                // Alternate start codes flow only once the source is
                // established.
                if matches!(
                    source.recv_state,
                    RecvState::HaveDmxOnly | RecvState::HaveDmxAndPap
                ) {
                    events.push(PacketEvent::from_view(view));
                }
            }
        }
    }

    for event in events {
        deliver_packet(receiver, registry, handle, event, notes);
    }
}

/// Route one packet event to the receiver's client (raw callback or merge
/// pipeline).
pub(crate) fn deliver_packet<'a>(
    receiver: &mut SacnReceiver,
    registry: &mut RemoteSourceRegistry,
    handle: RemoteSourceHandle,
    event: PacketEvent<'a>,
    notes: &mut Vec<Note<'a>>,
) {
    let Some(source) = receiver.sources.get(&handle) else {
        return;
    };
    let info = source.info();
    let addr = source.addr;
    let is_sampling = source.sampling;
    let receiver_handle = receiver.handle;
    let universe = receiver.universe;

    match &mut receiver.client {
        ReceiverClient::Raw(notify) => notes.push(Note::UniverseData {
            notify: Arc::clone(notify),
            receiver: receiver_handle,
            addr,
            source: info,
            universe,
            event,
            is_sampling,
        }),
        ReceiverClient::Merge(client) => merge_receiver::process_packet(
            client,
            registry,
            receiver_handle,
            universe,
            &info,
            addr,
            event,
            is_sampling,
            notes,
        ),
    }
}

fn note_limit_exceeded(receiver: &mut SacnReceiver, notes: &mut Vec<Note<'_>>) {
    if receiver.suppress_limit_exceeded {
        return;
    }
    receiver.suppress_limit_exceeded = true;
    log::debug!(
        "[RECV] universe {} source limit exceeded",
        receiver.universe
    );
    notes.push(Note::LimitExceeded {
        notify: receiver.client_notify(),
        receiver: receiver.handle,
        universe: receiver.universe,
    });
}

// ============================================================================
// Periodic tick
// ============================================================================

/// Advance all timers for the receivers owned by `thread_id`: source
/// liveness, PAP waits and liveness, termination sets, the sampling
/// deadline, and limit-notification suppression.
pub(crate) fn periodic_tick(
    engine: &mut Engine,
    thread_id: usize,
    now: Instant,
    notes: &mut Vec<Note<'static>>,
) {
    let handles: Vec<i32> = engine.threads[thread_id].receivers.clone();
    let expired_wait = engine.expired_wait;

    for receiver_handle in handles {
        let Engine {
            receivers,
            registry,
            ..
        } = &mut *engine;
        let Some(receiver) = receivers.get_mut(&receiver_handle) else {
            continue;
        };
        tick_receiver(receiver, registry, expired_wait, now, notes);
    }

    crate::source_detector::tick(engine, now, notes);
}

pub(crate) fn tick_receiver(
    receiver: &mut SacnReceiver,
    registry: &mut RemoteSourceRegistry,
    expired_wait: std::time::Duration,
    now: Instant,
    notes: &mut Vec<Note<'static>>,
) {
    if receiver.sampling_started_pending {
        receiver.sampling_started_pending = false;
        notes.push(Note::SamplingStarted {
            notify: receiver.client_notify(),
            receiver: receiver.handle,
            universe: receiver.universe,
        });
    }

    // Sweep the tracked sources once, deciding every timer-driven action.
    let mut silent_removals = Vec::new();
    let mut pap_wait_resolved = Vec::new();
    let mut pap_lost = Vec::new();
    let mut offline_handles = Vec::new();
    let mut online = Vec::new();

    for (&handle, source) in &mut receiver.sources {
        if source.terminated || source.packet_deadline <= now {
            offline_handles.push(handle);
            continue;
        }
        match source.recv_state {
            RecvState::WaitingForDmx if source.pap_deadline <= now => {
                // Never announced; forget it quietly.
                silent_removals.push(handle);
                continue;
            }
            RecvState::WaitingForPap if source.pap_deadline <= now => {
                source.recv_state = RecvState::HaveDmxOnly;
                if let Some(held) = source.held.take() {
                    pap_wait_resolved.push((handle, held));
                }
            }
            RecvState::HaveDmxAndPap if source.pap_deadline <= now => {
                source.recv_state = RecvState::HaveDmxOnly;
                pap_lost.push(handle);
            }
            _ => {}
        }
        if source.dmx_received_since_last_tick {
            source.dmx_received_since_last_tick = false;
            online.push(source.cid);
        }
    }

    for handle in silent_removals {
        if let Some(source) = receiver.sources.remove(&handle) {
            log::debug!(
                "[RECV] universe {} source {} never sent levels, dropped",
                receiver.universe,
                source.cid
            );
            registry.release(handle);
        }
    }

    // The PAP wait ran out: the withheld levels finally flow.
    for (handle, held) in pap_wait_resolved {
        deliver_packet(
            receiver,
            registry,
            handle,
            PacketEvent::from_held(held),
            notes,
        );
    }

    for handle in pap_lost {
        let Some(source) = receiver.sources.get(&handle) else {
            continue;
        };
        let info = source.info();
        let is_sampling = source.sampling;
        log::debug!(
            "[RECV] universe {} source {} stopped sending PAP",
            receiver.universe,
            info.cid
        );
        if let ReceiverClient::Merge(client) = &mut receiver.client {
            merge_receiver::on_pap_lost(
                client,
                receiver.handle,
                receiver.universe,
                handle,
                is_sampling,
                notes,
            );
        }
        notes.push(Note::PapLost {
            notify: receiver.client_notify(),
            receiver: receiver.handle,
            universe: receiver.universe,
            source: info,
        });
    }

    // Liveness bookkeeping: revived sources leave the termination sets,
    // newly silent or terminated ones join them.
    receiver.source_loss.mark_online(&online);

    let mut offline = Vec::new();
    for handle in offline_handles {
        if let Some(source) = receiver.sources.remove(&handle) {
            offline.push(LostSource {
                handle,
                cid: source.cid,
                name: source.name,
                terminated: source.terminated,
            });
            registry.release(handle);
        }
    }
    receiver.source_loss.mark_offline(offline, expired_wait, now);

    for lost in receiver.source_loss.take_expired(now) {
        log::debug!(
            "[RECV] universe {} lost {} source(s)",
            receiver.universe,
            lost.len()
        );
        if let ReceiverClient::Merge(client) = &mut receiver.client {
            merge_receiver::on_sources_lost(
                client,
                registry,
                receiver.handle,
                receiver.universe,
                &lost,
                notes,
            );
        }
        notes.push(Note::SourcesLost {
            notify: receiver.client_notify(),
            receiver: receiver.handle,
            universe: receiver.universe,
            lost,
        });
    }

    // Sampling deadline.
    if receiver.sampling && receiver.sample_deadline <= now {
        receiver.sampling = false;
        for source in receiver.sources.values_mut() {
            source.sampling = false;
        }
        if let ReceiverClient::Merge(client) = &mut receiver.client {
            merge_receiver::on_sampling_ended(client, receiver.handle, receiver.universe, notes);
        }
        notes.push(Note::SamplingEnded {
            notify: receiver.client_notify(),
            receiver: receiver.handle,
            universe: receiver.universe,
        });
        log::debug!("[RECV] universe {} sampling period ended", receiver.universe);

        if !receiver.pending_netints.is_empty() {
            let next = std::mem::take(&mut receiver.pending_netints);
            receiver.begin_sampling(next, now);
        }
    }

    // One limit notification per excursion above the cap.
    if receiver.suppress_limit_exceeded {
        let below = receiver
            .source_count_max
            .map_or(true, |max| receiver.sources.len() < max);
        if below {
            receiver.suppress_limit_exceeded = false;
        }
    }
}
