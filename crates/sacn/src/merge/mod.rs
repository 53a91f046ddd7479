// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Highest-takes-precedence DMX merger with per-address priority.
//!
//! A [`DmxMerger`] combines any number of sources into one 512-slot output
//! frame. For each slot, every source contributes either its per-address
//! priority (PAP), its universe priority converted to a slot priority
//! (0 maps to 1), or nothing if the slot is beyond the source's valid level
//! count. The source with the highest slot priority wins; ties go to the
//! highest level.
//!
//! Mutations do the minimum work to keep the outputs consistent: a level
//! change on a non-winning slot is a single compare, and full per-slot
//! rescans happen only when the current winner's contribution shrinks.
//! Steady-state updates never allocate.

use std::collections::BTreeMap;

use crate::config::{DMX_ADDRESS_COUNT, MAX_PRIORITY};
use crate::error::{Error, Result};
use crate::remote_source::{RemoteSourceHandle, REMOTE_SOURCE_INVALID};

/// State the merger tracks for one source.
///
/// Returned read-only by [`DmxMerger::get_source`]; the borrow is valid
/// until the next mutation on the merger.
pub struct MergerSource {
    id: RemoteSourceHandle,
    levels: Box<[u8; DMX_ADDRESS_COUNT]>,
    valid_level_count: usize,
    universe_priority: u8,
    address_priority: Box<[u8; DMX_ADDRESS_COUNT]>,
    using_universe_priority: bool,
    /// Length of the last PAP buffer, used only to detect no-op updates.
    pap_count: usize,
    /// True until the first universe-priority update, so an explicit
    /// priority of 0 is not mistaken for "unchanged".
    universe_priority_uninitialized: bool,
}

impl MergerSource {
    fn new(id: RemoteSourceHandle) -> Self {
        Self {
            id,
            levels: Box::new([0; DMX_ADDRESS_COUNT]),
            valid_level_count: 0,
            universe_priority: 0,
            address_priority: Box::new([0; DMX_ADDRESS_COUNT]),
            using_universe_priority: true,
            pap_count: 0,
            universe_priority_uninitialized: true,
        }
    }

    /// The source id (also written into the owners output).
    #[must_use]
    pub fn id(&self) -> RemoteSourceHandle {
        self.id
    }

    /// The source's current level buffer. Slots at or beyond
    /// [`valid_level_count`](Self::valid_level_count) are zero.
    #[must_use]
    pub fn levels(&self) -> &[u8; DMX_ADDRESS_COUNT] {
        &self.levels
    }

    /// How many leading slots of this source carry valid levels.
    #[must_use]
    pub fn valid_level_count(&self) -> usize {
        self.valid_level_count
    }

    #[must_use]
    pub fn universe_priority(&self) -> u8 {
        self.universe_priority
    }

    /// The per-slot priorities currently in effect for this source (actual
    /// PAP, or the converted universe priority when no PAP is active).
    #[must_use]
    pub fn address_priorities(&self) -> &[u8; DMX_ADDRESS_COUNT] {
        &self.address_priority
    }

    /// True iff no PAP is active and the universe priority is being
    /// broadcast to every slot.
    #[must_use]
    pub fn using_universe_priority(&self) -> bool {
        self.using_universe_priority
    }

    /// Slot priority this source contributes at `slot`: 0 beyond the valid
    /// level count.
    #[inline]
    fn slot_priority(&self, slot: usize) -> u8 {
        if slot < self.valid_level_count {
            self.address_priority[slot]
        } else {
            0
        }
    }
}

/// Merged output buffers. Owned by the merger; exposed as read-only slices.
struct Outputs {
    levels: Box<[u8; DMX_ADDRESS_COUNT]>,
    priorities: Box<[u8; DMX_ADDRESS_COUNT]>,
    owners: Box<[RemoteSourceHandle; DMX_ADDRESS_COUNT]>,
    universe_priority: u8,
    pap_active: bool,
}

impl Outputs {
    fn new() -> Self {
        Self {
            levels: Box::new([0; DMX_ADDRESS_COUNT]),
            priorities: Box::new([0; DMX_ADDRESS_COUNT]),
            owners: Box::new([REMOTE_SOURCE_INVALID; DMX_ADDRESS_COUNT]),
            universe_priority: 0,
            pap_active: false,
        }
    }
}

/// HTP-with-priority merger for one universe.
pub struct DmxMerger {
    sources: BTreeMap<RemoteSourceHandle, MergerSource>,
    outputs: Outputs,
    source_count_max: Option<usize>,
    next_handle: RemoteSourceHandle,
}

impl DmxMerger {
    /// Create a merger. `source_count_max` caps [`add_source`]
    /// (`None` = unlimited).
    ///
    /// [`add_source`]: Self::add_source
    #[must_use]
    pub fn new(source_count_max: Option<usize>) -> Self {
        Self {
            sources: BTreeMap::new(),
            outputs: Outputs::new(),
            source_count_max,
            next_handle: 0,
        }
    }

    // ===== Outputs =====

    /// Merged levels, one octet per slot. Unsourced slots read 0.
    #[must_use]
    pub fn levels(&self) -> &[u8; DMX_ADDRESS_COUNT] {
        &self.outputs.levels
    }

    /// Winning priority per slot. 0 means no source contributes there.
    #[must_use]
    pub fn priorities(&self) -> &[u8; DMX_ADDRESS_COUNT] {
        &self.outputs.priorities
    }

    /// Winning source per slot, [`REMOTE_SOURCE_INVALID`] when unsourced.
    #[must_use]
    pub fn owners(&self) -> &[RemoteSourceHandle; DMX_ADDRESS_COUNT] {
        &self.outputs.owners
    }

    /// Highest universe priority among the sources.
    #[must_use]
    pub fn universe_priority(&self) -> u8 {
        self.outputs.universe_priority
    }

    /// True iff any source has per-address priorities active.
    #[must_use]
    pub fn pap_active(&self) -> bool {
        self.outputs.pap_active
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    // ===== Source management =====

    /// Add a source, returning its id. The id is the handle for all update
    /// calls and the value written into the owners output.
    pub fn add_source(&mut self) -> Result<RemoteSourceHandle> {
        self.check_capacity()?;

        let mut candidate = self.next_handle;
        while candidate == REMOTE_SOURCE_INVALID || self.sources.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        self.next_handle = candidate.wrapping_add(1);

        self.sources.insert(candidate, MergerSource::new(candidate));
        Ok(candidate)
    }

    /// Add a source under a caller-chosen id. Used by the merge receiver so
    /// merger ids equal remote-source handles.
    pub fn add_source_with_handle(&mut self, id: RemoteSourceHandle) -> Result<()> {
        if id == REMOTE_SOURCE_INVALID {
            return Err(Error::Invalid("source id"));
        }
        if self.sources.contains_key(&id) {
            return Err(Error::Exists);
        }
        self.check_capacity()?;
        self.sources.insert(id, MergerSource::new(id));
        Ok(())
    }

    fn check_capacity(&self) -> Result<()> {
        if let Some(max) = self.source_count_max {
            if self.sources.len() >= max {
                return Err(Error::NoMem);
            }
        }
        Ok(())
    }

    /// Remove a source and recalculate the slots it owned.
    ///
    /// Equivalent to lowering the source's contribution at every slot to
    /// none before freeing it.
    pub fn remove_source(&mut self, source: RemoteSourceHandle) -> Result<()> {
        let state = self.sources.get_mut(&source).ok_or(Error::NotFound)?;

        // Merge with unsourced priorities so the outputs release every slot
        // this source owned.
        state.address_priority.fill(0);
        let pap_was_active = !state.using_universe_priority;
        state.using_universe_priority = true;
        let removed_universe_priority = state.universe_priority;

        for slot in 0..DMX_ADDRESS_COUNT {
            Self::merge_new_priority(&mut self.outputs, &self.sources, source, slot);
        }

        // Refresh the aggregate outputs if the removed source defined them.
        if self.outputs.pap_active && pap_was_active {
            self.outputs.pap_active = self
                .sources
                .values()
                .any(|s| !s.using_universe_priority);
        }
        if removed_universe_priority >= self.outputs.universe_priority {
            self.outputs.universe_priority = self
                .sources
                .values()
                .filter(|s| s.id != source)
                .map(|s| s.universe_priority)
                .max()
                .unwrap_or(0);
        }

        self.sources.remove(&source);
        Ok(())
    }

    /// Read-only view of a source's data, or `None` if the id is unknown.
    #[must_use]
    pub fn get_source(&self, source: RemoteSourceHandle) -> Option<&MergerSource> {
        self.sources.get(&source)
    }

    // ===== Updates =====

    /// Replace a source's levels `[0, new_levels.len())` and recalculate.
    ///
    /// The valid level count becomes `new_levels.len()`; slots the source
    /// previously covered beyond that are released. Stored priorities for
    /// newly covered slots take effect immediately.
    pub fn update_levels(
        &mut self,
        source: RemoteSourceHandle,
        new_levels: &[u8],
    ) -> Result<()> {
        if new_levels.is_empty() || new_levels.len() > DMX_ADDRESS_COUNT {
            return Err(Error::Invalid("new_levels length"));
        }
        let state = self.sources.get_mut(&source).ok_or(Error::NotFound)?;

        let old_count = state.valid_level_count;
        let new_count = new_levels.len();
        state.valid_level_count = new_count;

        if new_count == old_count && state.levels[..new_count] == *new_levels {
            return Ok(());
        }

        state.levels[..new_count].copy_from_slice(new_levels);
        if old_count > new_count {
            state.levels[new_count..old_count].fill(0);
        }

        if self.sources.len() == 1 {
            self.update_levels_single_source(source, old_count, new_count);
        } else {
            self.update_levels_multi_source(source, old_count, new_count);
        }
        Ok(())
    }

    /// Replace a source's per-address priorities `[0, pap.len())` and
    /// recalculate over the current valid level count.
    ///
    /// Slots at or beyond `pap.len()` get a PAP of 0 (unsourced by this
    /// source). Activates PAP for the source; [`remove_pap`](Self::remove_pap)
    /// reverts to the universe priority.
    pub fn update_pap(&mut self, source: RemoteSourceHandle, pap: &[u8]) -> Result<()> {
        if pap.is_empty() || pap.len() > DMX_ADDRESS_COUNT {
            return Err(Error::Invalid("pap length"));
        }
        let single_source = self.sources.len() == 1;
        let state = self.sources.get_mut(&source).ok_or(Error::NotFound)?;

        let old_count = state.pap_count;
        let new_count = pap.len();
        state.pap_count = new_count;

        if new_count == old_count && state.address_priority[..new_count] == *pap {
            return Ok(());
        }

        state.using_universe_priority = false;
        self.outputs.pap_active = true;

        state.address_priority[..new_count].copy_from_slice(pap);
        if old_count > new_count {
            state.address_priority[new_count..old_count].fill(0);
        }
        let valid = state.valid_level_count;

        if single_source {
            self.update_pap_single_source(source);
        } else {
            for slot in 0..valid {
                Self::merge_new_priority(&mut self.outputs, &self.sources, source, slot);
            }
        }
        Ok(())
    }

    /// Update a source's universe priority and recalculate if needed.
    ///
    /// With PAP active only the scalar changes (it is the fallback for
    /// [`remove_pap`](Self::remove_pap) and feeds the aggregate output).
    /// Without PAP the priority is converted to slot priorities (0 maps
    /// to 1) and remerged.
    pub fn update_universe_priority(
        &mut self,
        source: RemoteSourceHandle,
        priority: u8,
    ) -> Result<()> {
        if priority > MAX_PRIORITY {
            return Err(Error::Invalid("universe priority"));
        }
        let single_source = self.sources.len() == 1;
        let state = self.sources.get_mut(&source).ok_or(Error::NotFound)?;

        if priority == state.universe_priority && !state.universe_priority_uninitialized {
            return Ok(());
        }
        state.universe_priority_uninitialized = false;

        let was_max = state.universe_priority >= self.outputs.universe_priority;
        state.universe_priority = priority;

        if state.using_universe_priority {
            state.pap_count = DMX_ADDRESS_COUNT;
            let pap = if priority == 0 { 1 } else { priority };
            state.address_priority.fill(pap);
            let valid = state.valid_level_count;

            if single_source {
                self.update_universe_priority_single_source(source, pap);
            } else {
                for slot in 0..valid {
                    Self::merge_new_priority(&mut self.outputs, &self.sources, source, slot);
                }
            }
        }

        if single_source || priority >= self.outputs.universe_priority {
            self.outputs.universe_priority = priority;
        } else if was_max {
            // This source used to define the output but may not anymore.
            self.outputs.universe_priority = self
                .sources
                .values()
                .map(|s| s.universe_priority)
                .max()
                .unwrap_or(0);
        }
        Ok(())
    }

    /// Deactivate PAP for a source; slot priorities revert to the converted
    /// universe priority and the affected slots remerge.
    pub fn remove_pap(&mut self, source: RemoteSourceHandle) -> Result<()> {
        let state = self.sources.get_mut(&source).ok_or(Error::NotFound)?;

        let pap_was_active = !state.using_universe_priority;
        state.using_universe_priority = true;

        let converted = if state.universe_priority == 0 {
            1
        } else {
            state.universe_priority
        };
        state.address_priority.fill(converted);

        let valid = state.valid_level_count;
        for slot in 0..valid {
            Self::merge_new_priority(&mut self.outputs, &self.sources, source, slot);
        }

        if pap_was_active {
            self.outputs.pap_active = self
                .sources
                .values()
                .any(|s| !s.using_universe_priority);
        }
        Ok(())
    }

    // ===== Single-source fast paths =====

    /// One source: copying beats merging. Levels land directly in the
    /// outputs wherever the source has a slot priority.
    fn update_levels_single_source(
        &mut self,
        source: RemoteSourceHandle,
        old_count: usize,
        new_count: usize,
    ) {
        let Some(state) = self.sources.get(&source) else {
            return;
        };

        for slot in 0..new_count {
            if state.address_priority[slot] > 0 {
                self.outputs.levels[slot] = state.levels[slot];
            }
        }

        // Count grew: stored priorities become effective on the new slots.
        for slot in old_count..new_count {
            if state.address_priority[slot] > 0 {
                self.outputs.priorities[slot] = state.address_priority[slot];
                self.outputs.owners[slot] = state.id;
            }
        }

        // Count shrank: release the lost slots.
        if old_count > new_count {
            self.outputs.levels[new_count..old_count].fill(0);
            self.outputs.priorities[new_count..old_count].fill(0);
            self.outputs.owners[new_count..old_count].fill(REMOTE_SOURCE_INVALID);
        }
    }

    fn update_levels_multi_source(
        &mut self,
        source: RemoteSourceHandle,
        old_count: usize,
        new_count: usize,
    ) {
        if new_count > old_count {
            for slot in 0..old_count {
                Self::merge_new_level(&mut self.outputs, &self.sources, source, slot);
            }
            // Priorities were stored in source state but not yet merged.
            for slot in old_count..new_count {
                Self::merge_new_priority(&mut self.outputs, &self.sources, source, slot);
            }
        } else {
            for slot in 0..new_count {
                Self::merge_new_level(&mut self.outputs, &self.sources, source, slot);
            }
            // Causes slots to be released due to the reduced level count.
            for slot in new_count..old_count {
                Self::merge_new_priority(&mut self.outputs, &self.sources, source, slot);
            }
        }
    }

    /// One source: copy the PAP through and fix levels/owners to match.
    fn update_pap_single_source(&mut self, source: RemoteSourceHandle) {
        let Some(state) = self.sources.get(&source) else {
            return;
        };
        let valid = state.valid_level_count;

        self.outputs.priorities[..valid].copy_from_slice(&state.address_priority[..valid]);
        for slot in 0..valid {
            if state.address_priority[slot] == 0 {
                self.outputs.levels[slot] = 0;
                self.outputs.owners[slot] = REMOTE_SOURCE_INVALID;
            } else {
                self.outputs.levels[slot] = state.levels[slot];
                self.outputs.owners[slot] = state.id;
            }
        }
    }

    /// One source: broadcast the converted universe priority.
    fn update_universe_priority_single_source(&mut self, source: RemoteSourceHandle, pap: u8) {
        let Some(state) = self.sources.get(&source) else {
            return;
        };
        let valid = state.valid_level_count;

        self.outputs.priorities[..valid].fill(pap);
        self.outputs.owners[..valid].fill(state.id);
        self.outputs.levels[..valid].copy_from_slice(&state.levels[..valid]);
    }

    // ===== Per-slot merge steps =====

    /// Merge a source's new level on one slot. Assumes its priority there
    /// has not changed since the last merge.
    fn merge_new_level(
        outputs: &mut Outputs,
        sources: &BTreeMap<RemoteSourceHandle, MergerSource>,
        source: RemoteSourceHandle,
        slot: usize,
    ) {
        let Some(state) = sources.get(&source) else {
            return;
        };

        // HTP applies only when the source shares the winning priority.
        if state.address_priority[slot] == 0
            || state.address_priority[slot] != outputs.priorities[slot]
        {
            return;
        }

        if state.levels[slot] > outputs.levels[slot] {
            outputs.levels[slot] = state.levels[slot];
            outputs.owners[slot] = state.id;
        } else if outputs.owners[slot] == state.id && state.levels[slot] < outputs.levels[slot] {
            // The winner's level dropped; someone else may beat it now.
            Self::recalculate_winning_level(outputs, sources, source, slot);
        }
    }

    /// Merge a source's new priority on one slot. Assumes its level there
    /// has not changed since the last merge.
    fn merge_new_priority(
        outputs: &mut Outputs,
        sources: &BTreeMap<RemoteSourceHandle, MergerSource>,
        source: RemoteSourceHandle,
        slot: usize,
    ) {
        let Some(state) = sources.get(&source) else {
            return;
        };
        let source_pap = state.slot_priority(slot);

        if source_pap > outputs.priorities[slot] {
            outputs.levels[slot] = state.levels[slot];
            outputs.owners[slot] = state.id;
            outputs.priorities[slot] = source_pap;
        } else if outputs.owners[slot] != state.id {
            // Not the owner: a tie still wins with a higher level.
            if source_pap > 0
                && source_pap == outputs.priorities[slot]
                && state.levels[slot] > outputs.levels[slot]
            {
                outputs.levels[slot] = state.levels[slot];
                outputs.owners[slot] = state.id;
            }
        } else if source_pap < outputs.priorities[slot] {
            // The owner's priority dropped; rescan the slot.
            Self::recalculate_winning_priority(outputs, sources, source, slot);
        }
    }

    /// Full rescan of one slot's level among sources tied at the winning
    /// priority. Assumes priorities are unchanged.
    fn recalculate_winning_level(
        outputs: &mut Outputs,
        sources: &BTreeMap<RemoteSourceHandle, MergerSource>,
        source: RemoteSourceHandle,
        slot: usize,
    ) {
        let Some(state) = sources.get(&source) else {
            return;
        };

        // Start with this source as the owner.
        outputs.levels[slot] = state.levels[slot];

        for candidate in sources.values() {
            if candidate.id == source {
                continue;
            }
            // Levels beyond a candidate's valid count are zero, so no
            // priority clamp is needed here.
            if candidate.address_priority[slot] == outputs.priorities[slot]
                && candidate.levels[slot] > outputs.levels[slot]
            {
                outputs.levels[slot] = candidate.levels[slot];
                outputs.owners[slot] = candidate.id;
            }
        }
    }

    /// Full rescan of one slot's priority (and level on ties). Assumes
    /// levels are unchanged.
    fn recalculate_winning_priority(
        outputs: &mut Outputs,
        sources: &BTreeMap<RemoteSourceHandle, MergerSource>,
        source: RemoteSourceHandle,
        slot: usize,
    ) {
        let Some(state) = sources.get(&source) else {
            return;
        };

        // Start with this source as the owner.
        outputs.priorities[slot] = state.slot_priority(slot);

        // When unsourced, the slot reads level 0 with no owner.
        if outputs.priorities[slot] == 0 {
            outputs.levels[slot] = 0;
            outputs.owners[slot] = REMOTE_SOURCE_INVALID;
        }

        for candidate in sources.values() {
            if candidate.id == source {
                continue;
            }
            let candidate_pap = candidate.slot_priority(slot);
            if candidate_pap > outputs.priorities[slot]
                || (candidate_pap > 0
                    && candidate_pap == outputs.priorities[slot]
                    && candidate.levels[slot] > outputs.levels[slot])
            {
                outputs.levels[slot] = candidate.levels[slot];
                outputs.owners[slot] = candidate.id;
                outputs.priorities[slot] = candidate_pap;
            }
        }
    }
}

#[cfg(test)]
mod tests;
