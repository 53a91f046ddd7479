// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The source detector: reassembles paged universe-discovery
//! advertisements into per-source universe lists.
//!
//! Sources advertise the universes they transmit every 10 seconds, split
//! into pages of up to 512 universes. Pages must arrive in order 0..=last
//! with a consistent last-page value; anything else restarts assembly at
//! page 0. A source that misses two advertisement intervals expires.
//!
//! The detector is a module singleton, like the C library it follows.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{IpSupport, DISCOVERY_UNIVERSE, UNIVERSE_DISCOVERY_SOURCE_TIMEOUT};
use crate::engine::{self, Engine};
use crate::error::{Error, Result};
use crate::protocol::DiscoveryView;
use crate::receiver::state::Note;
use crate::remote_source::{RemoteSourceHandle, SourceCid};
use crate::transport::{McastInterface, NetintId, SysNetint};

/// Configuration for the source detector.
#[derive(Debug, Clone, Default)]
pub struct SourceDetectorConfig {
    /// Maximum number of sources to track (`None` = unlimited).
    pub source_count_max: Option<usize>,
    /// Maximum universes remembered per source (`None` = unlimited).
    pub universes_per_source_max: Option<usize>,
    /// What IP networking to use.
    pub ip_supported: IpSupport,
}

/// Source detector callbacks, delivered on the owning receive thread with
/// no locks held.
pub trait SourceDetectorNotify: Send + Sync {
    /// A source appeared or its advertised universe list changed. The list
    /// is ascending.
    fn source_updated(
        &self,
        handle: RemoteSourceHandle,
        cid: &SourceCid,
        name: &str,
        sourced_universes: &[u16],
    );

    /// A source stopped advertising and timed out.
    fn source_expired(&self, handle: RemoteSourceHandle, cid: &SourceCid, name: &str);

    /// The tracked source or universe capacity was hit. Rate-limited to
    /// once per excursion.
    fn limit_exceeded(&self) {}
}

/// One source being reassembled.
pub(crate) struct DiscoveredSource {
    pub handle: RemoteSourceHandle,
    pub name: String,
    /// Last completed advertisement.
    pub universes: Vec<u16>,
    /// Assembly in progress.
    pending: Vec<u16>,
    next_page: u8,
    last_page: u8,
    announced: bool,
    pub expires_at: Instant,
}

/// Engine-side state of the detector singleton.
pub(crate) struct DetectorState {
    pub notify: Arc<dyn SourceDetectorNotify>,
    pub sources: BTreeMap<SourceCid, DiscoveredSource>,
    pub source_count_max: Option<usize>,
    pub universes_per_source_max: Option<usize>,
    pub ip_supported: IpSupport,
    pub netints: Vec<SysNetint>,
    pub socket_tokens: Vec<usize>,
    pub thread_id: usize,
    pub suppress_limit_exceeded: bool,
}

// ============================================================================
// Public API
// ============================================================================

/// Create the source detector singleton and start listening on the
/// discovery universe.
pub fn create(
    config: &SourceDetectorConfig,
    notify: Arc<dyn SourceDetectorNotify>,
    netints: Option<&mut [McastInterface]>,
) -> Result<()> {
    engine::with_engine(|engine| {
        if engine.source_detector.is_some() {
            return Err(Error::Exists);
        }

        let selected = crate::transport::select_netints(&engine.sys_netints, netints)?;
        let thread_id = engine.assign_thread()?;

        let socket_tokens = engine.threads[thread_id].pool.subscribe_all(
            config.ip_supported,
            DISCOVERY_UNIVERSE,
            &selected,
        )?;
        if socket_tokens.is_empty() {
            return Err(Error::NoNetints);
        }

        engine.source_detector = Some(DetectorState {
            notify,
            sources: BTreeMap::new(),
            source_count_max: config.source_count_max,
            universes_per_source_max: config.universes_per_source_max,
            ip_supported: config.ip_supported,
            netints: selected,
            socket_tokens,
            thread_id,
            suppress_limit_exceeded: false,
        });
        engine.start_thread(thread_id);
        log::debug!("[DETECTOR] created on thread {}", thread_id);
        Ok(())
    })
}

/// Destroy the source detector and drop every discovered source.
pub fn destroy() -> Result<()> {
    engine::with_engine(|engine| {
        let Some(detector) = engine.source_detector.take() else {
            return Err(Error::NotFound);
        };
        let pool = &mut engine.threads[detector.thread_id].pool;
        for &token in &detector.socket_tokens {
            pool.unsubscribe_universe(token, DISCOVERY_UNIVERSE, &detector.netints);
        }
        for source in detector.sources.values() {
            engine.registry.release(source.handle);
        }
        log::debug!("[DETECTOR] destroyed");
        Ok(())
    })
}

/// Rebuild the detector's sockets after an interface change. Discovered
/// sources persist; sources on removed interfaces will expire.
pub fn reset_networking(netints: Option<&mut [McastInterface]>) -> Result<()> {
    engine::with_engine(|engine| {
        let selected = crate::transport::select_netints(&engine.sys_netints, netints)?;
        let Some(detector) = engine.source_detector.as_mut() else {
            return Err(Error::NotFound);
        };

        let thread_id = detector.thread_id;
        let ip_supported = detector.ip_supported;
        let old_tokens = std::mem::take(&mut detector.socket_tokens);
        let old_netints = std::mem::replace(&mut detector.netints, selected.clone());

        let pool = &mut engine.threads[thread_id].pool;
        for token in old_tokens {
            pool.unsubscribe_universe(token, DISCOVERY_UNIVERSE, &old_netints);
        }
        let new_tokens = pool.subscribe_all(ip_supported, DISCOVERY_UNIVERSE, &selected)?;
        if new_tokens.is_empty() {
            return Err(Error::NoNetints);
        }
        if let Some(detector) = engine.source_detector.as_mut() {
            detector.socket_tokens = new_tokens;
        }
        Ok(())
    })
}

/// The interfaces the detector is currently using.
pub fn get_network_interfaces() -> Result<Vec<NetintId>> {
    engine::with_engine(|engine| {
        let detector = engine.source_detector.as_ref().ok_or(Error::NotFound)?;
        Ok(detector.netints.iter().map(|n| n.id).collect())
    })
}

// ============================================================================
// Engine-side processing
// ============================================================================

/// Process one discovery page. Runs under the engine lock.
pub(crate) fn handle_discovery_page(
    engine: &mut Engine,
    view: &DiscoveryView<'_>,
    now: Instant,
    notes: &mut Vec<Note<'_>>,
) {
    let Engine {
        source_detector,
        registry,
        ..
    } = engine;
    let Some(detector) = source_detector.as_mut() else {
        return;
    };

    if !detector.sources.contains_key(&view.cid) {
        let at_capacity = detector
            .source_count_max
            .is_some_and(|max| detector.sources.len() >= max);
        if at_capacity {
            note_limit_exceeded(detector, notes);
            return;
        }
        let Ok(handle) = registry.acquire(&view.cid) else {
            note_limit_exceeded(detector, notes);
            return;
        };
        detector.sources.insert(
            view.cid,
            DiscoveredSource {
                handle,
                name: view.source_name.to_string(),
                universes: Vec::new(),
                pending: Vec::new(),
                next_page: 0,
                last_page: 0,
                announced: false,
                expires_at: now + UNIVERSE_DISCOVERY_SOURCE_TIMEOUT,
            },
        );
        log::debug!("[DETECTOR] new source {} '{}'", view.cid, view.source_name);
    }

    let Some(source) = detector.sources.get_mut(&view.cid) else {
        return;
    };
    source.expires_at = now + UNIVERSE_DISCOVERY_SOURCE_TIMEOUT;
    if source.name != view.source_name {
        source.name.clear();
        source.name.push_str(view.source_name);
    }

    // Page zero always restarts assembly; anything out of order or with a
    // shifting page count throws the partial list away.
    if view.page == 0 {
        source.pending.clear();
        source.next_page = 0;
        source.last_page = view.last_page;
    }
    if view.page != source.next_page || view.last_page != source.last_page {
        log::debug!(
            "[DETECTOR] source {} page {}/{} out of order (expected {})",
            view.cid,
            view.page,
            view.last_page,
            source.next_page
        );
        source.pending.clear();
        source.next_page = 0;
        return;
    }

    source.pending.extend(view.universes());
    if let Some(max) = detector.universes_per_source_max {
        if source.pending.len() > max {
            source.pending.truncate(max);
            note_limit_exceeded(detector, notes);
        }
    }

    let Some(source) = detector.sources.get_mut(&view.cid) else {
        return;
    };
    if view.page == view.last_page {
        let completed = std::mem::take(&mut source.pending);
        source.next_page = 0;
        if completed != source.universes || !source.announced {
            source.universes = completed;
            source.announced = true;
            notes.push(Note::SourceDetectorUpdated {
                notify: Arc::clone(&detector.notify),
                handle: source.handle,
                cid: view.cid,
                name: source.name.clone(),
                universes: source.universes.clone(),
            });
        }
    } else {
        source.next_page += 1;
    }
}

/// Expire silent sources. Runs from the periodic tick under the lock.
pub(crate) fn tick(engine: &mut Engine, now: Instant, notes: &mut Vec<Note<'static>>) {
    let Engine {
        source_detector,
        registry,
        ..
    } = engine;
    let Some(detector) = source_detector.as_mut() else {
        return;
    };

    let expired: Vec<SourceCid> = detector
        .sources
        .iter()
        .filter(|(_, s)| s.expires_at <= now)
        .map(|(cid, _)| *cid)
        .collect();
    for cid in expired {
        if let Some(source) = detector.sources.remove(&cid) {
            log::debug!("[DETECTOR] source {} '{}' expired", cid, source.name);
            registry.release(source.handle);
            notes.push(Note::SourceDetectorExpired {
                notify: Arc::clone(&detector.notify),
                handle: source.handle,
                cid,
                name: source.name,
            });
        }
    }

    if detector.suppress_limit_exceeded {
        let below = detector
            .source_count_max
            .map_or(true, |max| detector.sources.len() < max);
        if below {
            detector.suppress_limit_exceeded = false;
        }
    }
}

fn note_limit_exceeded(detector: &mut DetectorState, notes: &mut Vec<Note<'_>>) {
    if detector.suppress_limit_exceeded {
        return;
    }
    detector.suppress_limit_exceeded = true;
    notes.push(Note::SourceDetectorLimitExceeded {
        notify: Arc::clone(&detector.notify),
    });
}
