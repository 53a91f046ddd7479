// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The sACN receiver API: listen on one universe, track its sources, and
//! get notified about data, loss, and sampling events.
//!
//! A receiver is identified by a [`ReceiverHandle`] and pinned to one
//! background receive thread for its lifetime; all callbacks for a receiver
//! are serialized on that thread with the engine lock released.

pub(crate) mod source_loss;
pub(crate) mod state;
pub(crate) mod thread;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{self, IpSupport, DMX_ADDRESS_COUNT, SAMPLE_TIME};
use crate::engine::{self, Engine};
use crate::error::{Error, Result};
use crate::merge_receiver::MergeClient;
use crate::remote_source::{RemoteSourceHandle, SourceCid};
use crate::transport::{McastInterface, NetintId, SysNetint};

/// Handle to a live receiver (or merge receiver; they share one space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReceiverHandle(pub(crate) i32);

impl std::fmt::Display for ReceiverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A range of addresses within a universe.
///
/// Custom footprints are declared in the API but not implemented: anything
/// other than the full universe is rejected with [`Error::NotImplemented`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniverseSubrange {
    /// First address in the range, 1-based.
    pub start_address: u16,
    /// Number of addresses in the range.
    pub address_count: u16,
}

impl UniverseSubrange {
    /// The full universe, 1..=512.
    #[must_use]
    pub fn full() -> Self {
        Self {
            start_address: 1,
            address_count: DMX_ADDRESS_COUNT as u16,
        }
    }

    fn is_valid(&self) -> bool {
        self.start_address >= 1
            && self.address_count >= 1
            && (self.start_address as usize + self.address_count as usize - 1)
                <= DMX_ADDRESS_COUNT
    }

    fn is_full(&self) -> bool {
        *self == Self::full()
    }
}

impl Default for UniverseSubrange {
    fn default() -> Self {
        Self::full()
    }
}

/// Configuration for creating a receiver.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Universe number on which to listen.
    pub universe_id: u16,
    /// The footprint within the universe to monitor.
    pub footprint: UniverseSubrange,
    /// Maximum number of sources to track (`None` = unlimited).
    pub source_count_max: Option<usize>,
    /// Drop packets carrying the Preview_Data option.
    pub filter_preview_data: bool,
    /// What IP networking to use.
    pub ip_supported: IpSupport,
}

impl ReceiverConfig {
    #[must_use]
    pub fn new(universe_id: u16) -> Self {
        Self {
            universe_id,
            footprint: UniverseSubrange::full(),
            source_count_max: None,
            filter_preview_data: false,
            ip_supported: IpSupport::default(),
        }
    }
}

/// Information about a remote source being tracked by a receiver.
#[derive(Debug, Clone)]
pub struct RemoteSourceInfo {
    pub handle: RemoteSourceHandle,
    pub cid: SourceCid,
    pub name: String,
}

/// A source that was lost, with how it was lost.
#[derive(Debug, Clone)]
pub struct LostSource {
    pub handle: RemoteSourceHandle,
    pub cid: SourceCid,
    pub name: String,
    /// True iff the loss came from the Stream_Terminated option bit rather
    /// than a timeout.
    pub terminated: bool,
}

/// Newly received universe data within the configured footprint.
#[derive(Debug)]
pub struct UniverseData<'a> {
    pub universe_id: u16,
    /// Universe priority of the sACN data (0-200).
    pub priority: u8,
    /// Whether the Preview_Data bit is set.
    pub preview: bool,
    /// True if this data was received during the sampling period.
    pub is_sampling: bool,
    pub start_code: u8,
    /// Slots represented by `values`.
    pub slot_range: UniverseSubrange,
    pub values: &'a [u8],
}

/// Receiver event callbacks.
///
/// Invoked on the receiver's receive thread with no engine locks held;
/// calling back into the API from a callback is allowed. Implementations
/// should return quickly since they gate packet processing for every
/// universe on the same thread.
pub trait ReceiverNotify: Send + Sync {
    /// New universe data within the footprint. Not called for packets with
    /// the Stream_Terminated bit, or for filtered preview packets.
    ///
    /// For a new source, 0xDD notifications precede 0x00 notifications;
    /// the 0x00 data is withheld until the source's per-address priority is
    /// known or the priority wait expires.
    fn universe_data(
        &self,
        receiver: ReceiverHandle,
        source_addr: SocketAddr,
        source: &RemoteSourceInfo,
        data: &UniverseData<'_>,
    );

    /// One or more sources went offline together (timeout or termination).
    fn sources_lost(&self, receiver: ReceiverHandle, universe: u16, lost: &[LostSource]);

    fn sampling_period_started(&self, _receiver: ReceiverHandle, _universe: u16) {}

    fn sampling_period_ended(&self, _receiver: ReceiverHandle, _universe: u16) {}

    /// A source stopped sending per-address priority (timeout only).
    fn source_pap_lost(
        &self,
        _receiver: ReceiverHandle,
        _universe: u16,
        _source: &RemoteSourceInfo,
    ) {
    }

    /// More sources than `source_count_max` are sending on the universe.
    /// Rate-limited to once per excursion above the limit.
    fn source_limit_exceeded(&self, _receiver: ReceiverHandle, _universe: u16) {}
}

// ============================================================================
// Internal receiver state
// ============================================================================

/// What sits behind a receiver handle: a raw receiver delivering packets
/// as-is, or a merge receiver feeding a per-instance merger.
pub(crate) enum ReceiverClient {
    Raw(Arc<dyn ReceiverNotify>),
    Merge(MergeClient),
}

/// Engine-side state of one receiver.
pub(crate) struct SacnReceiver {
    pub handle: ReceiverHandle,
    pub thread_id: usize,
    pub universe: u16,
    pub footprint: UniverseSubrange,
    pub filter_preview: bool,
    pub source_count_max: Option<usize>,
    pub ip_supported: IpSupport,
    pub netints: Vec<SysNetint>,
    pub socket_tokens: Vec<usize>,
    pub sources: std::collections::BTreeMap<RemoteSourceHandle, state::TrackedSource>,
    pub source_loss: source_loss::SourceLossTracker,
    pub sampling: bool,
    pub sample_deadline: Instant,
    /// Interface indexes included in the current sampling period.
    pub sampling_netints: BTreeSet<u32>,
    /// Interfaces added mid-period; they get the next period.
    pub pending_netints: BTreeSet<u32>,
    /// Deliver sampling_period_started at the next tick.
    pub sampling_started_pending: bool,
    pub suppress_limit_exceeded: bool,
    pub client: ReceiverClient,
}

impl SacnReceiver {
    /// Begin a sampling period covering `netints`, to be announced at the
    /// next periodic tick.
    pub(crate) fn begin_sampling(&mut self, netints: BTreeSet<u32>, now: Instant) {
        self.sampling = true;
        self.sample_deadline = now + SAMPLE_TIME;
        self.sampling_netints = netints;
        self.sampling_started_pending = true;
    }

    /// Whether a packet arriving on `ifindex` falls inside the current
    /// sampling period. Index 0 means the platform could not report the
    /// interface; treat it as sampled.
    pub(crate) fn netint_in_sampling(&self, ifindex: u32) -> bool {
        self.sampling && (ifindex == 0 || self.sampling_netints.contains(&ifindex))
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Create a receiver and begin listening on its universe.
///
/// The sampling period starts immediately; merged/raw traffic semantics
/// during sampling are described on the callback traits. With an explicit
/// interface list, per-interface statuses are filled in and the call
/// succeeds if any interface is usable.
pub fn create(
    config: &ReceiverConfig,
    notify: Arc<dyn ReceiverNotify>,
    netints: Option<&mut [McastInterface]>,
) -> Result<ReceiverHandle> {
    engine::with_engine(|engine| {
        create_internal(engine, config, ReceiverClient::Raw(notify), netints)
    })
}

/// Destroy a receiver, leaving its multicast groups and releasing its
/// sources. Queued work for the receiver is dropped; a callback already in
/// flight on the receive thread may still complete, after which no more
/// fire.
pub fn destroy(handle: ReceiverHandle) -> Result<()> {
    engine::with_engine(|engine| destroy_internal(engine, handle))
}

/// The universe this receiver is listening to.
pub fn get_universe(handle: ReceiverHandle) -> Result<u16> {
    engine::with_engine(|engine| {
        let receiver = engine.receivers.get(&handle.0).ok_or(Error::NotFound)?;
        engine.check_thread(receiver.thread_id)?;
        Ok(receiver.universe)
    })
}

/// The footprint this receiver is monitoring.
pub fn get_footprint(handle: ReceiverHandle) -> Result<UniverseSubrange> {
    engine::with_engine(|engine| {
        let receiver = engine.receivers.get(&handle.0).ok_or(Error::NotFound)?;
        engine.check_thread(receiver.thread_id)?;
        Ok(receiver.footprint)
    })
}

/// Switch the receiver to a different universe. Tracked sources are
/// cleared and a new sampling period begins.
pub fn change_universe(handle: ReceiverHandle, new_universe: u16) -> Result<()> {
    engine::with_engine(|engine| change_universe_internal(engine, handle, new_universe))
}

/// Change the receiver's footprint. Declared but not implemented: only the
/// full universe is accepted.
pub fn change_footprint(handle: ReceiverHandle, new_footprint: &UniverseSubrange) -> Result<()> {
    engine::with_engine(|engine| {
        let receiver = engine.receivers.get(&handle.0).ok_or(Error::NotFound)?;
        engine.check_thread(receiver.thread_id)?;
        validate_footprint(new_footprint)
    })
}

/// Change universe and footprint together. The footprint half is subject
/// to the same not-implemented restriction as [`change_footprint`].
pub fn change_universe_and_footprint(
    handle: ReceiverHandle,
    new_universe: u16,
    new_footprint: &UniverseSubrange,
) -> Result<()> {
    engine::with_engine(|engine| {
        validate_footprint(new_footprint)?;
        change_universe_internal(engine, handle, new_universe)
    })
}

/// Re-enumerate system interfaces and rebuild every receiver's sockets.
///
/// Used when the application detects that the network interfaces changed.
/// Each receiver gets a sampling period on the interfaces that are new to
/// it; established sources keep flowing meanwhile.
pub fn reset_networking(netints: Option<&mut [McastInterface]>) -> Result<()> {
    engine::with_engine(|engine| reset_networking_internal(engine, netints))
}

/// The interfaces a receiver is currently using.
pub fn get_network_interfaces(handle: ReceiverHandle) -> Result<Vec<NetintId>> {
    engine::with_engine(|engine| {
        let receiver = engine.receivers.get(&handle.0).ok_or(Error::NotFound)?;
        Ok(receiver.netints.iter().map(|n| n.id).collect())
    })
}

/// Set the wait after a source-loss condition before *sources-lost* fires.
/// Applies to termination sets created after the call.
pub fn set_expired_wait(wait: Duration) -> Result<()> {
    engine::with_engine(|engine| {
        engine.expired_wait = wait;
        Ok(())
    })
}

/// The current expired-notification wait.
pub fn get_expired_wait() -> Result<Duration> {
    engine::with_engine(|engine| Ok(engine.expired_wait))
}

// ============================================================================
// Shared internals (also used by the merge receiver)
// ============================================================================

fn validate_footprint(footprint: &UniverseSubrange) -> Result<()> {
    if !footprint.is_valid() {
        return Err(Error::Invalid("footprint"));
    }
    if !footprint.is_full() {
        // TODO: custom footprints need per-receiver slot windowing in the
        // dispatch path and the merger.
        return Err(Error::NotImplemented);
    }
    Ok(())
}

pub(crate) fn create_internal(
    engine: &mut Engine,
    config: &ReceiverConfig,
    client: ReceiverClient,
    netints: Option<&mut [McastInterface]>,
) -> Result<ReceiverHandle> {
    if !config::universe_is_valid(config.universe_id) {
        return Err(Error::Invalid("universe_id"));
    }
    validate_footprint(&config.footprint)?;
    if engine.by_universe.contains_key(&config.universe_id) {
        return Err(Error::Exists);
    }

    let selected = crate::transport::select_netints(&engine.sys_netints, netints)?;

    let handle = engine.alloc_receiver_handle();
    let thread_id = engine.assign_thread()?;

    let socket_tokens = engine.threads[thread_id].pool.subscribe_all(
        config.ip_supported,
        config.universe_id,
        &selected,
    )?;
    if socket_tokens.is_empty() {
        return Err(Error::NoNetints);
    }

    let now = Instant::now();
    let mut receiver = SacnReceiver {
        handle: ReceiverHandle(handle),
        thread_id,
        universe: config.universe_id,
        footprint: config.footprint,
        filter_preview: config.filter_preview_data,
        source_count_max: config.source_count_max,
        ip_supported: config.ip_supported,
        netints: selected,
        socket_tokens,
        sources: std::collections::BTreeMap::new(),
        source_loss: source_loss::SourceLossTracker::new(),
        sampling: false,
        sample_deadline: now,
        sampling_netints: BTreeSet::new(),
        pending_netints: BTreeSet::new(),
        sampling_started_pending: false,
        suppress_limit_exceeded: false,
        client,
    };
    let all_netints: BTreeSet<u32> = receiver.netints.iter().map(|n| n.id.index).collect();
    receiver.begin_sampling(all_netints, now);

    engine.threads[thread_id].receivers.push(handle);
    engine.by_universe.insert(config.universe_id, handle);
    engine.receivers.insert(handle, receiver);
    engine.start_thread(thread_id);

    log::debug!(
        "[RECV] created receiver {} universe={} thread={}",
        handle,
        config.universe_id,
        thread_id
    );
    Ok(ReceiverHandle(handle))
}

pub(crate) fn destroy_internal(engine: &mut Engine, handle: ReceiverHandle) -> Result<()> {
    let mut receiver = engine.receivers.remove(&handle.0).ok_or(Error::NotFound)?;

    // Release every live tracked source and any merge-side references.
    for (source_handle, _) in std::mem::take(&mut receiver.sources) {
        engine.registry.release(source_handle);
    }
    if let ReceiverClient::Merge(client) = &mut receiver.client {
        for (&source_handle, _) in &client.sources {
            engine.registry.release(source_handle);
        }
    }

    let thread = &mut engine.threads[receiver.thread_id];
    for &token in &receiver.socket_tokens {
        thread
            .pool
            .unsubscribe_universe(token, receiver.universe, &receiver.netints);
    }
    thread.receivers.retain(|&h| h != handle.0);
    engine.by_universe.remove(&receiver.universe);

    log::debug!("[RECV] destroyed receiver {}", handle);
    Ok(())
}

fn change_universe_internal(
    engine: &mut Engine,
    handle: ReceiverHandle,
    new_universe: u16,
) -> Result<()> {
    if !config::universe_is_valid(new_universe) {
        return Err(Error::Invalid("new_universe"));
    }
    {
        let receiver = engine.receivers.get(&handle.0).ok_or(Error::NotFound)?;
        engine.check_thread(receiver.thread_id)?;
        if let Some(&owner) = engine.by_universe.get(&new_universe) {
            if owner != handle.0 {
                return Err(Error::Exists);
            }
            return Ok(()); // already listening there
        }
    }

    // Move the socket subscriptions over first.
    let (thread_id, old_universe, tokens, netints) = {
        let receiver = engine.receivers.get(&handle.0).ok_or(Error::NotFound)?;
        (
            receiver.thread_id,
            receiver.universe,
            receiver.socket_tokens.clone(),
            receiver.netints.clone(),
        )
    };
    let receiver_ip = engine
        .receivers
        .get(&handle.0)
        .map(|r| r.ip_supported)
        .unwrap_or_default();
    let pool = &mut engine.threads[thread_id].pool;
    for &token in &tokens {
        pool.unsubscribe_universe(token, old_universe, &netints);
    }
    let new_tokens = pool.subscribe_all(receiver_ip, new_universe, &netints)?;

    engine.by_universe.remove(&old_universe);
    engine.by_universe.insert(new_universe, handle.0);

    let registry = &mut engine.registry;
    let receiver = match engine.receivers.get_mut(&handle.0) {
        Some(r) => r,
        None => return Err(Error::NotFound),
    };
    receiver.universe = new_universe;
    receiver.socket_tokens = new_tokens;

    // Drop all per-universe state and start over with a sampling period.
    for (source_handle, _) in std::mem::take(&mut receiver.sources) {
        registry.release(source_handle);
    }
    receiver.source_loss.clear();
    receiver.suppress_limit_exceeded = false;
    if let ReceiverClient::Merge(client) = &mut receiver.client {
        client.reset(registry);
    }
    let all_netints: BTreeSet<u32> = receiver.netints.iter().map(|n| n.id.index).collect();
    receiver.pending_netints.clear();
    receiver.begin_sampling(all_netints, Instant::now());

    log::debug!(
        "[RECV] receiver {} changed universe {} -> {}",
        handle,
        old_universe,
        new_universe
    );
    Ok(())
}

fn reset_networking_internal(
    engine: &mut Engine,
    netints: Option<&mut [McastInterface]>,
) -> Result<()> {
    engine.sys_netints = crate::transport::discover_netints();
    let selected = crate::transport::select_netints(&engine.sys_netints, netints)?;

    // Tear down every socket; each receiver resubscribes below.
    for thread in &mut engine.threads {
        thread.pool.close_all();
    }

    let handles: Vec<i32> = engine.receivers.keys().copied().collect();
    let now = Instant::now();
    for handle in handles {
        let (thread_id, universe, ip_supported, previous): (usize, u16, IpSupport, BTreeSet<u32>) = {
            let receiver = match engine.receivers.get(&handle) {
                Some(r) => r,
                None => continue,
            };
            (
                receiver.thread_id,
                receiver.universe,
                receiver.ip_supported,
                receiver.netints.iter().map(|n| n.id.index).collect(),
            )
        };

        let new_tokens =
            engine.threads[thread_id]
                .pool
                .subscribe_all(ip_supported, universe, &selected)?;

        let receiver = match engine.receivers.get_mut(&handle) {
            Some(r) => r,
            None => continue,
        };
        receiver.netints = selected.clone();
        receiver.socket_tokens = new_tokens;

        let current: BTreeSet<u32> = receiver.netints.iter().map(|n| n.id.index).collect();
        let added: BTreeSet<u32> = current.difference(&previous).copied().collect();
        if receiver.sampling {
            // Mid-period: the newcomers get the next period.
            receiver.pending_netints.extend(added);
        } else {
            receiver.begin_sampling(if added.is_empty() { current } else { added }, now);
        }
    }

    log::debug!("[RECV] networking reset, {} interfaces", engine.sys_netints.len());
    Ok(())
}

