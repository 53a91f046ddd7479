// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Source-loss tracking: grouping offline sources into termination sets.
//!
//! Coordinated simultaneous termination must not produce a spray of
//! individual notifications (and the level jumps that come with them), so
//! sources that go offline within a short window of each other are held in
//! one termination set and reported as a single loss event when the set's
//! grace timer expires.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::receiver::LostSource;
use crate::remote_source::{RemoteSourceHandle, SourceCid};

/// One group of sources that went offline close together.
struct TerminationSet {
    sources: BTreeMap<RemoteSourceHandle, LostSource>,
    deadline: Instant,
}

/// Per-receiver list of termination sets.
///
/// Invariant: a source appears in at most one set, and never in a set while
/// it is still live in the receiver's tracked-source map.
#[derive(Default)]
pub(crate) struct SourceLossTracker {
    sets: Vec<TerminationSet>,
}

impl SourceLossTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add newly offline sources. They join the first set whose grace timer
    /// is still running; otherwise a new set opens with `expired_wait` on
    /// the clock. Sets sharing a CID are merged afterwards.
    pub(crate) fn mark_offline(
        &mut self,
        offline: Vec<LostSource>,
        expired_wait: Duration,
        now: Instant,
    ) {
        if offline.is_empty() {
            return;
        }

        let open = self.sets.iter_mut().find(|set| set.deadline > now);
        match open {
            Some(set) => {
                for source in offline {
                    set.sources.entry(source.handle).or_insert(source);
                }
            }
            None => {
                let mut sources = BTreeMap::new();
                for source in offline {
                    sources.insert(source.handle, source);
                }
                self.sets.push(TerminationSet {
                    sources,
                    deadline: now + expired_wait,
                });
            }
        }

        self.merge_overlapping();
    }

    /// Remove the given sources from any set they are in (they came back
    /// online). Empty sets are dropped.
    pub(crate) fn mark_online(&mut self, online: &[SourceCid]) {
        if online.is_empty() {
            return;
        }
        for set in &mut self.sets {
            set.sources.retain(|_, s| !online.contains(&s.cid));
        }
        self.sets.retain(|set| !set.sources.is_empty());
    }

    /// Drain every set whose grace timer has expired. Each returned group
    /// is one *sources-lost* event.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Vec<LostSource>> {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.sets.len() {
            if self.sets[index].deadline <= now {
                let set = self.sets.remove(index);
                expired.push(set.sources.into_values().collect());
            } else {
                index += 1;
            }
        }
        expired
    }

    pub(crate) fn clear(&mut self) {
        self.sets.clear();
    }

    /// True if the source is waiting in some set.
    pub(crate) fn contains(&self, cid: &SourceCid) -> bool {
        self.sets
            .iter()
            .any(|set| set.sources.values().any(|s| &s.cid == cid))
    }

    /// Collapse sets that share a CID, keeping the earliest deadline so a
    /// merge never extends a loss report.
    fn merge_overlapping(&mut self) {
        let mut index = 0;
        while index < self.sets.len() {
            let mut other = index + 1;
            while other < self.sets.len() {
                let overlap = self.sets[other].sources.values().any(|s| {
                    self.sets[index]
                        .sources
                        .values()
                        .any(|t| t.cid == s.cid)
                });
                if overlap {
                    let absorbed = self.sets.remove(other);
                    let target = &mut self.sets[index];
                    target.deadline = target.deadline.min(absorbed.deadline);
                    for (handle, source) in absorbed.sources {
                        target.sources.entry(handle).or_insert(source);
                    }
                } else {
                    other += 1;
                }
            }
            index += 1;
        }
    }
}
