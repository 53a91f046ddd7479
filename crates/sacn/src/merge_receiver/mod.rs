// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The merge receiver: a receiver and a [`DmxMerger`] composed under the
//! sampling-period rules.
//!
//! Every tracked source gets a merger source keyed by its remote-source
//! handle. Outside the sampling period each accepted 0x00 or 0xDD packet
//! feeds the merger and emits one *merged-data* notification; during
//! sampling the merge runs silently and a single notification fires when
//! the period ends. Non-DMX start codes bypass the merger entirely.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{IpSupport, STARTCODE_DMX, STARTCODE_PRIORITY};
use crate::engine::{self, Engine};
use crate::error::{Error, Result};
use crate::merge::DmxMerger;
use crate::receiver::state::{Note, PacketEvent};
use crate::receiver::{
    self, LostSource, ReceiverClient, ReceiverConfig, ReceiverHandle, RemoteSourceInfo,
    UniverseData, UniverseSubrange,
};
use crate::remote_source::{RemoteSourceHandle, RemoteSourceRegistry, SourceCid};
use crate::transport::{McastInterface, NetintId};

/// Handle to a live merge receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MergeReceiverHandle(pub(crate) i32);

impl std::fmt::Display for MergeReceiverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for creating a merge receiver.
///
/// Preview data is always filtered: preview packets never reach a merger.
#[derive(Debug, Clone)]
pub struct MergeReceiverConfig {
    /// Universe number on which to listen.
    pub universe_id: u16,
    /// The footprint within the universe to monitor.
    pub footprint: UniverseSubrange,
    /// Maximum number of sources to track and merge (`None` = unlimited).
    pub source_count_max: Option<usize>,
    /// Feed received per-address priorities into the merger. When false,
    /// 0xDD packets are ignored and only universe priorities arbitrate.
    pub use_pap: bool,
    /// What IP networking to use.
    pub ip_supported: IpSupport,
}

impl MergeReceiverConfig {
    #[must_use]
    pub fn new(universe_id: u16) -> Self {
        Self {
            universe_id,
            footprint: UniverseSubrange::full(),
            source_count_max: None,
            use_pap: true,
            ip_supported: IpSupport::default(),
        }
    }
}

/// One merged output frame, captured at notification time.
#[derive(Debug, Clone)]
pub struct MergedData {
    pub universe_id: u16,
    /// The configured footprint.
    pub slot_range: UniverseSubrange,
    /// Merged levels, one octet per slot in `slot_range`.
    pub levels: Vec<u8>,
    /// Winning priority per slot (0 = unsourced).
    pub priorities: Vec<u8>,
    /// Winning source handle per slot
    /// ([`crate::remote_source::REMOTE_SOURCE_INVALID`] = unsourced).
    pub owners: Vec<RemoteSourceHandle>,
    /// Sources currently represented in the merged output. Sources still
    /// inside a sampling period are not listed.
    pub active_sources: Vec<RemoteSourceHandle>,
}

/// Information about a source tracked by a merge receiver.
#[derive(Debug, Clone)]
pub struct MergeReceiverSource {
    pub handle: RemoteSourceHandle,
    pub cid: SourceCid,
    pub name: String,
    /// Where the most recent packet came from.
    pub addr: SocketAddr,
    pub universe_priority: u8,
    /// A 0x00 packet has been merged from this source.
    pub levels_active: bool,
    /// A 0xDD packet has been merged from this source.
    pub per_address_priorities_active: bool,
}

/// Merge receiver event callbacks. Same threading rules as
/// [`crate::receiver::ReceiverNotify`].
pub trait MergeReceiverNotify: Send + Sync {
    /// A new packet was merged (or sources were removed) and this is the
    /// resulting output frame.
    fn merged_data(&self, receiver: MergeReceiverHandle, data: &MergedData);

    /// An established source sent a start code other than 0x00/0xDD; the
    /// raw payload is forwarded without touching the merger.
    fn universe_non_dmx(
        &self,
        _receiver: MergeReceiverHandle,
        _source_addr: SocketAddr,
        _source: &RemoteSourceInfo,
        _data: &UniverseData<'_>,
    ) {
    }

    fn sources_lost(
        &self,
        _receiver: MergeReceiverHandle,
        _universe: u16,
        _lost: &[LostSource],
    ) {
    }

    fn sampling_period_started(&self, _receiver: MergeReceiverHandle, _universe: u16) {}

    fn sampling_period_ended(&self, _receiver: MergeReceiverHandle, _universe: u16) {}

    fn source_pap_lost(
        &self,
        _receiver: MergeReceiverHandle,
        _universe: u16,
        _source: &RemoteSourceInfo,
    ) {
    }

    fn source_limit_exceeded(&self, _receiver: MergeReceiverHandle, _universe: u16) {}
}

// ============================================================================
// Engine-side state
// ============================================================================

/// Per-source bookkeeping on the merge side.
pub(crate) struct MergeSourceState {
    pub cid: SourceCid,
    pub name: String,
    pub addr: SocketAddr,
    pub universe_priority: u8,
    /// Arrived during a sampling period and is still gated by it.
    pub sampling: bool,
    pub levels_active: bool,
    pub pap_active: bool,
}

/// The merge half of a receiver: merger, per-source state, settings.
pub(crate) struct MergeClient {
    pub notify: Arc<dyn MergeReceiverNotify>,
    pub merger: DmxMerger,
    pub sources: BTreeMap<RemoteSourceHandle, MergeSourceState>,
    pub use_pap: bool,
    pub source_count_max: Option<usize>,
}

impl MergeClient {
    fn new(
        notify: Arc<dyn MergeReceiverNotify>,
        use_pap: bool,
        source_count_max: Option<usize>,
    ) -> Self {
        Self {
            notify,
            merger: DmxMerger::new(source_count_max),
            sources: BTreeMap::new(),
            use_pap,
            source_count_max,
        }
    }

    /// Drop all sources and start over with a fresh merger (universe
    /// change).
    pub(crate) fn reset(&mut self, registry: &mut RemoteSourceRegistry) {
        for &handle in self.sources.keys() {
            registry.release(handle);
        }
        self.sources.clear();
        self.merger = DmxMerger::new(self.source_count_max);
    }
}

fn build_merged(client: &MergeClient, universe: u16) -> MergedData {
    MergedData {
        universe_id: universe,
        slot_range: UniverseSubrange::full(),
        levels: client.merger.levels().to_vec(),
        priorities: client.merger.priorities().to_vec(),
        owners: client.merger.owners().to_vec(),
        active_sources: client
            .sources
            .iter()
            .filter(|(_, s)| !s.sampling)
            .map(|(&handle, _)| handle)
            .collect(),
    }
}

/// Feed one delivered packet into the merge pipeline.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_packet<'a>(
    client: &mut MergeClient,
    registry: &mut RemoteSourceRegistry,
    receiver_handle: ReceiverHandle,
    universe: u16,
    source: &RemoteSourceInfo,
    addr: SocketAddr,
    event: PacketEvent<'a>,
    is_sampling: bool,
    notes: &mut Vec<Note<'a>>,
) {
    if !client.sources.contains_key(&source.handle) {
        // Take the merge side's own reference so the handle stays stable
        // until the loss notification is out.
        if registry.acquire(&source.cid).is_err() {
            return;
        }
        client.sources.insert(
            source.handle,
            MergeSourceState {
                cid: source.cid,
                name: source.name.clone(),
                addr,
                universe_priority: event.priority,
                sampling: is_sampling,
                levels_active: false,
                pap_active: false,
            },
        );
        if client.merger.add_source_with_handle(source.handle).is_err() {
            log::debug!(
                "[MERGERECV] universe {} could not add merger source {}",
                universe,
                source.handle
            );
        }
    }

    let Some(state) = client.sources.get_mut(&source.handle) else {
        return;
    };
    if state.name != source.name {
        state.name.clear();
        state.name.push_str(&source.name);
    }
    state.addr = addr;
    state.universe_priority = event.priority;
    let gated = state.sampling;

    match event.start_code {
        STARTCODE_DMX => {
            if event.values.is_empty() {
                return;
            }
            state.levels_active = true;
            let _ = client
                .merger
                .update_universe_priority(source.handle, event.priority);
            let _ = client.merger.update_levels(source.handle, &event.values);
        }
        STARTCODE_PRIORITY => {
            if !client.use_pap || event.values.is_empty() {
                return;
            }
            state.pap_active = true;
            let _ = client.merger.update_pap(source.handle, &event.values);
        }
        _ => {
            notes.push(Note::NonDmx {
                notify: Arc::clone(&client.notify),
                receiver: receiver_handle,
                addr,
                source: source.clone(),
                universe,
                event,
                is_sampling,
            });
            return;
        }
    }

    if !gated {
        notes.push(Note::MergedData {
            notify: Arc::clone(&client.notify),
            receiver: receiver_handle,
            data: build_merged(client, universe),
        });
    }
}

/// A source's PAP timed out: revert it to universe priority and publish the
/// recalculated frame.
pub(crate) fn on_pap_lost(
    client: &mut MergeClient,
    receiver_handle: ReceiverHandle,
    universe: u16,
    handle: RemoteSourceHandle,
    _is_sampling: bool,
    notes: &mut Vec<Note<'static>>,
) {
    let Some(state) = client.sources.get_mut(&handle) else {
        return;
    };
    let gated = state.sampling;
    if !client.use_pap || !state.pap_active {
        return;
    }
    state.pap_active = false;
    let _ = client.merger.remove_pap(handle);
    if !gated {
        notes.push(Note::MergedData {
            notify: Arc::clone(&client.notify),
            receiver: receiver_handle,
            data: build_merged(client, universe),
        });
    }
}

/// Sources went offline: pull them out of the merger before the
/// application hears about the loss.
pub(crate) fn on_sources_lost(
    client: &mut MergeClient,
    registry: &mut RemoteSourceRegistry,
    receiver_handle: ReceiverHandle,
    universe: u16,
    lost: &[LostSource],
    notes: &mut Vec<Note<'static>>,
) {
    let mut removed_active = false;
    for entry in lost {
        if let Some(state) = client.sources.remove(&entry.handle) {
            removed_active |= !state.sampling;
            let _ = client.merger.remove_source(entry.handle);
            registry.release(entry.handle);
        }
    }
    if removed_active {
        notes.push(Note::MergedData {
            notify: Arc::clone(&client.notify),
            receiver: receiver_handle,
            data: build_merged(client, universe),
        });
    }
}

/// The sampling period ended: everything gathered during it becomes
/// visible in one shot.
pub(crate) fn on_sampling_ended(
    client: &mut MergeClient,
    receiver_handle: ReceiverHandle,
    universe: u16,
    notes: &mut Vec<Note<'static>>,
) {
    let mut had_sampling_sources = false;
    for state in client.sources.values_mut() {
        had_sampling_sources |= state.sampling;
        state.sampling = false;
    }
    if had_sampling_sources {
        notes.push(Note::MergedData {
            notify: Arc::clone(&client.notify),
            receiver: receiver_handle,
            data: build_merged(client, universe),
        });
    }
}

// ============================================================================
// Public API
// ============================================================================

fn check_merge(engine: &Engine, handle: MergeReceiverHandle) -> Result<()> {
    match engine.receivers.get(&handle.0) {
        Some(r) if matches!(r.client, ReceiverClient::Merge(_)) => {
            engine.check_thread(r.thread_id)
        }
        _ => Err(Error::NotFound),
    }
}

/// Create a merge receiver and begin listening on its universe.
pub fn create(
    config: &MergeReceiverConfig,
    notify: Arc<dyn MergeReceiverNotify>,
    netints: Option<&mut [McastInterface]>,
) -> Result<MergeReceiverHandle> {
    let receiver_config = ReceiverConfig {
        universe_id: config.universe_id,
        footprint: config.footprint,
        source_count_max: config.source_count_max,
        // Preview data never reaches a merger.
        filter_preview_data: true,
        ip_supported: config.ip_supported,
    };
    let client = ReceiverClient::Merge(MergeClient::new(
        notify,
        config.use_pap,
        config.source_count_max,
    ));
    engine::with_engine(|engine| {
        receiver::create_internal(engine, &receiver_config, client, netints)
    })
    .map(|handle| MergeReceiverHandle(handle.0))
}

/// Destroy a merge receiver and release its merger and sources.
pub fn destroy(handle: MergeReceiverHandle) -> Result<()> {
    engine::with_engine(|engine| {
        check_merge(engine, handle)?;
        receiver::destroy_internal(engine, ReceiverHandle(handle.0))
    })
}

/// The universe this merge receiver is listening to.
pub fn get_universe(handle: MergeReceiverHandle) -> Result<u16> {
    engine::with_engine(|engine| {
        check_merge(engine, handle)?;
        Ok(engine.receivers[&handle.0].universe)
    })
}

/// The footprint this merge receiver is monitoring.
pub fn get_footprint(handle: MergeReceiverHandle) -> Result<UniverseSubrange> {
    engine::with_engine(|engine| {
        check_merge(engine, handle)?;
        Ok(engine.receivers[&handle.0].footprint)
    })
}

/// Switch to a different universe; the merger starts over and a sampling
/// period begins.
pub fn change_universe(handle: MergeReceiverHandle, new_universe: u16) -> Result<()> {
    engine::with_engine(|engine| check_merge(engine, handle))?;
    receiver::change_universe(ReceiverHandle(handle.0), new_universe)
}

/// Change the footprint. Declared but not implemented: only the full
/// universe is accepted.
pub fn change_footprint(
    handle: MergeReceiverHandle,
    new_footprint: &UniverseSubrange,
) -> Result<()> {
    engine::with_engine(|engine| check_merge(engine, handle))?;
    receiver::change_footprint(ReceiverHandle(handle.0), new_footprint)
}

/// Change universe and footprint together.
pub fn change_universe_and_footprint(
    handle: MergeReceiverHandle,
    new_universe: u16,
    new_footprint: &UniverseSubrange,
) -> Result<()> {
    engine::with_engine(|engine| check_merge(engine, handle))?;
    receiver::change_universe_and_footprint(ReceiverHandle(handle.0), new_universe, new_footprint)
}

/// Re-enumerate system interfaces and rebuild sockets for every receiver
/// and merge receiver in the module.
pub fn reset_networking(netints: Option<&mut [McastInterface]>) -> Result<()> {
    receiver::reset_networking(netints)
}

/// The interfaces this merge receiver is currently using.
pub fn get_network_interfaces(handle: MergeReceiverHandle) -> Result<Vec<NetintId>> {
    engine::with_engine(|engine| {
        check_merge(engine, handle)?;
        let receiver = engine.receivers.get(&handle.0).ok_or(Error::NotFound)?;
        Ok(receiver.netints.iter().map(|n| n.id).collect())
    })
}

/// Snapshot of one source tracked by the merge receiver.
pub fn get_source(
    handle: MergeReceiverHandle,
    source: crate::remote_source::RemoteSourceHandle,
) -> Result<MergeReceiverSource> {
    engine::with_engine(|engine| {
        let receiver = engine.receivers.get(&handle.0).ok_or(Error::NotFound)?;
        let ReceiverClient::Merge(client) = &receiver.client else {
            return Err(Error::NotFound);
        };
        let state = client.sources.get(&source).ok_or(Error::NotFound)?;
        Ok(MergeReceiverSource {
            handle: source,
            cid: state.cid,
            name: state.name.clone(),
            addr: state.addr,
            universe_priority: state.universe_priority,
            levels_active: state.levels_active,
            per_address_priorities_active: state.pap_active,
        })
    })
}
