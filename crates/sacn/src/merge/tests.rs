// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::*;

/// Brute-force oracle: recompute the winner of every slot from the source
/// states and compare against the incrementally maintained outputs.
///
/// When several sources tie on both priority and level, any of them is a
/// legal owner, so the owner check accepts the whole argmax set.
fn assert_outputs_consistent(merger: &DmxMerger) {
    for slot in 0..DMX_ADDRESS_COUNT {
        let mut best_priority = 0u8;
        let mut best_level = 0u8;
        for state in merger.sources.values() {
            let pap = state.slot_priority(slot);
            if pap == 0 {
                continue;
            }
            if pap > best_priority || (pap == best_priority && state.levels[slot] > best_level) {
                best_priority = pap;
                best_level = state.levels[slot];
            }
        }

        assert_eq!(
            merger.priorities()[slot],
            best_priority,
            "slot {} priority",
            slot
        );
        if best_priority == 0 {
            assert_eq!(merger.levels()[slot], 0, "slot {} unsourced level", slot);
            assert_eq!(
                merger.owners()[slot],
                REMOTE_SOURCE_INVALID,
                "slot {} unsourced owner",
                slot
            );
        } else {
            assert_eq!(merger.levels()[slot], best_level, "slot {} level", slot);
            let owner = merger.owners()[slot];
            let owner_state = merger
                .sources
                .get(&owner)
                .unwrap_or_else(|| panic!("slot {} owned by unknown source {}", slot, owner));
            assert_eq!(
                owner_state.slot_priority(slot),
                best_priority,
                "slot {} owner priority",
                slot
            );
            assert_eq!(
                owner_state.levels[slot],
                best_level,
                "slot {} owner level",
                slot
            );
        }
    }

    // Aggregates.
    let expected_pap = merger.sources.values().any(|s| !s.using_universe_priority);
    assert_eq!(merger.pap_active(), expected_pap, "pap_active aggregate");
    let expected_up = merger
        .sources
        .values()
        .map(|s| s.universe_priority)
        .max()
        .unwrap_or(0);
    assert_eq!(
        merger.universe_priority(),
        expected_up,
        "universe_priority aggregate"
    );
}

fn levels_with(first: &[u8]) -> Vec<u8> {
    let mut v = vec![0u8; DMX_ADDRESS_COUNT];
    v[..first.len()].copy_from_slice(first);
    v
}

// ===== Multi-source arbitration =====

#[test]
fn test_htp_tie_on_equal_pap() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    let b = merger.add_source().unwrap();

    merger.update_pap(a, &[100u8; 512]).unwrap();
    merger.update_pap(b, &[100u8; 512]).unwrap();
    merger.update_levels(a, &levels_with(&[255, 0])).unwrap();
    merger.update_levels(b, &levels_with(&[128, 255])).unwrap();

    assert_eq!(merger.levels()[0], 255);
    assert_eq!(merger.levels()[1], 255);
    assert_eq!(merger.levels()[2], 0);
    assert_eq!(merger.owners()[0], a);
    assert_eq!(merger.owners()[1], b);
    assert_eq!(merger.priorities()[0], 100);
    assert_eq!(merger.priorities()[1], 100);
    assert_outputs_consistent(&merger);
}

#[test]
fn test_priority_override() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    let b = merger.add_source().unwrap();

    merger.update_pap(a, &[100u8; 512]).unwrap();
    merger.update_pap(b, &[100u8; 512]).unwrap();
    merger.update_levels(a, &levels_with(&[255, 0])).unwrap();
    merger.update_levels(b, &levels_with(&[128, 255])).unwrap();

    // B raises its priority on slot 0 only.
    let mut pap = [100u8; 512];
    pap[0] = 150;
    merger.update_pap(b, &pap).unwrap();

    assert_eq!(merger.levels()[0], 128);
    assert_eq!(merger.owners()[0], b);
    assert_eq!(merger.priorities()[0], 150);
    // Slot 1 unchanged.
    assert_eq!(merger.levels()[1], 255);
    assert_eq!(merger.owners()[1], b);
    assert_eq!(merger.priorities()[1], 100);
    assert_outputs_consistent(&merger);
}

#[test]
fn test_universe_priority_zero_converts_to_one() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    let b = merger.add_source().unwrap();
    let c = merger.add_source().unwrap();

    merger.update_pap(a, &[100u8; 512]).unwrap();
    merger.update_pap(b, &[100u8; 512]).unwrap();
    merger.update_levels(a, &levels_with(&[255, 0])).unwrap();
    merger.update_levels(b, &levels_with(&[128, 255])).unwrap();

    merger.update_universe_priority(c, 0).unwrap();
    merger.update_levels(c, &[200u8; 512]).unwrap();

    // Internal per-slot priority is 1, not 0.
    let c_state = merger.get_source(c).unwrap();
    assert!(c_state.address_priorities().iter().all(|&p| p == 1));
    assert!(c_state.using_universe_priority());

    // C loses every slot someone else sources, wins the rest.
    assert_eq!(merger.owners()[0], a);
    assert_eq!(merger.owners()[1], b);
    for slot in 2..512 {
        assert_eq!(merger.owners()[slot], c, "slot {}", slot);
        assert_eq!(merger.levels()[slot], 200);
        assert_eq!(merger.priorities()[slot], 1);
    }
    assert_outputs_consistent(&merger);
}

// ===== Round-trip and idempotence =====

#[test]
fn test_update_levels_idempotent() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    let b = merger.add_source().unwrap();
    merger.update_universe_priority(a, 100).unwrap();
    merger.update_universe_priority(b, 100).unwrap();
    merger.update_levels(b, &[7u8; 512]).unwrap();

    let payload = levels_with(&[1, 2, 3, 200, 200]);
    merger.update_levels(a, &payload).unwrap();
    let snapshot_levels = *merger.levels();
    let snapshot_owners = *merger.owners();
    let snapshot_priorities = *merger.priorities();

    merger.update_levels(a, &payload).unwrap();
    assert_eq!(*merger.levels(), snapshot_levels);
    assert_eq!(*merger.owners(), snapshot_owners);
    assert_eq!(*merger.priorities(), snapshot_priorities);
    assert_outputs_consistent(&merger);
}

#[test]
fn test_pap_then_remove_pap_restores_universe_priority_state() {
    // Twin mergers: one never sees PAP, the other sets and removes it.
    let mut reference = DmxMerger::new(None);
    let mut merger = DmxMerger::new(None);
    for m in [&mut reference, &mut merger] {
        m.add_source_with_handle(10).unwrap();
        m.add_source_with_handle(20).unwrap();
        m.update_universe_priority(10, 80).unwrap();
        m.update_universe_priority(20, 90).unwrap();
        m.update_levels(10, &[64u8; 512]).unwrap();
        m.update_levels(20, &levels_with(&[32, 200])).unwrap();
    }

    let mut pap = [120u8; 512];
    pap[1] = 0;
    merger.update_pap(10, &pap).unwrap();
    assert!(merger.pap_active());
    merger.remove_pap(10).unwrap();
    assert!(!merger.pap_active());

    assert_eq!(merger.levels(), reference.levels());
    assert_eq!(merger.priorities(), reference.priorities());
    assert_eq!(merger.owners(), reference.owners());
    assert_eq!(merger.universe_priority(), reference.universe_priority());
    assert_outputs_consistent(&merger);
}

#[test]
fn test_add_then_remove_source_is_noop_on_outputs() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    merger.update_universe_priority(a, 100).unwrap();
    merger.update_levels(a, &[10u8; 512]).unwrap();

    let snapshot_levels = *merger.levels();
    let snapshot_owners = *merger.owners();

    let b = merger.add_source().unwrap();
    merger.remove_source(b).unwrap();

    assert_eq!(*merger.levels(), snapshot_levels);
    assert_eq!(*merger.owners(), snapshot_owners);
    assert_outputs_consistent(&merger);
}

// ===== Boundaries =====

#[test]
fn test_zero_length_updates_rejected() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    assert!(matches!(
        merger.update_levels(a, &[]),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(merger.update_pap(a, &[]), Err(Error::Invalid(_))));

    let oversized = [0u8; 513];
    assert!(matches!(
        merger.update_levels(a, &oversized),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        merger.update_pap(a, &oversized),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn test_full_universe_accepted() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    merger.update_pap(a, &[255u8; 512]).unwrap();
    merger.update_levels(a, &[255u8; 512]).unwrap();
    assert!(merger.levels().iter().all(|&l| l == 255));
    assert!(merger.priorities().iter().all(|&p| p == 255));
    assert_outputs_consistent(&merger);
}

#[test]
fn test_unknown_source_is_not_found() {
    let mut merger = DmxMerger::new(None);
    assert!(matches!(
        merger.update_levels(3, &[0u8; 1]),
        Err(Error::NotFound)
    ));
    assert!(matches!(merger.remove_source(3), Err(Error::NotFound)));
    assert!(matches!(merger.remove_pap(3), Err(Error::NotFound)));
    assert!(merger.get_source(3).is_none());
}

#[test]
fn test_source_cap() {
    let mut merger = DmxMerger::new(Some(2));
    merger.add_source().unwrap();
    merger.add_source().unwrap();
    assert!(matches!(merger.add_source(), Err(Error::NoMem)));
}

#[test]
fn test_invalid_universe_priority_rejected() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    assert!(matches!(
        merger.update_universe_priority(a, 201),
        Err(Error::Invalid(_))
    ));
    merger.update_universe_priority(a, 200).unwrap();
}

// ===== Single-source fast paths =====

#[test]
fn test_levels_without_priority_stay_dark() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    merger.update_levels(a, &[255u8; 512]).unwrap();

    // No priority yet: the level is saved but not merged.
    assert!(merger.levels().iter().all(|&l| l == 0));
    assert!(merger.owners().iter().all(|&o| o == REMOTE_SOURCE_INVALID));

    // The universe priority arrives and the stored levels light up.
    merger.update_universe_priority(a, 100).unwrap();
    assert!(merger.levels().iter().all(|&l| l == 255));
    assert!(merger.owners().iter().all(|&o| o == a));
    assert!(merger.priorities().iter().all(|&p| p == 100));
    assert_outputs_consistent(&merger);
}

#[test]
fn test_single_source_pap_zero_releases_slot() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    merger.update_levels(a, &[200u8; 512]).unwrap();
    let mut pap = [50u8; 512];
    pap[3] = 0;
    merger.update_pap(a, &pap).unwrap();

    assert_eq!(merger.levels()[2], 200);
    assert_eq!(merger.levels()[3], 0);
    assert_eq!(merger.owners()[3], REMOTE_SOURCE_INVALID);
    assert_eq!(merger.priorities()[3], 0);
    assert_outputs_consistent(&merger);
}

#[test]
fn test_level_count_shrink_releases_slots() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    merger.update_universe_priority(a, 100).unwrap();
    merger.update_levels(a, &[9u8; 512]).unwrap();
    merger.update_levels(a, &[9u8; 100]).unwrap();

    for slot in 0..100 {
        assert_eq!(merger.owners()[slot], a);
    }
    for slot in 100..512 {
        assert_eq!(merger.owners()[slot], REMOTE_SOURCE_INVALID, "slot {}", slot);
        assert_eq!(merger.levels()[slot], 0);
        assert_eq!(merger.priorities()[slot], 0);
    }
    assert_outputs_consistent(&merger);
}

// ===== Winner recalculation =====

#[test]
fn test_winner_level_decrease_rescans_slot() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    let b = merger.add_source().unwrap();
    merger.update_universe_priority(a, 100).unwrap();
    merger.update_universe_priority(b, 100).unwrap();
    merger.update_levels(a, &levels_with(&[200])).unwrap();
    merger.update_levels(b, &levels_with(&[100])).unwrap();
    assert_eq!(merger.owners()[0], a);

    merger.update_levels(a, &levels_with(&[50])).unwrap();
    assert_eq!(merger.owners()[0], b);
    assert_eq!(merger.levels()[0], 100);
    assert_outputs_consistent(&merger);
}

#[test]
fn test_removing_winner_promotes_runner_up() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    let b = merger.add_source().unwrap();
    merger.update_universe_priority(a, 150).unwrap();
    merger.update_universe_priority(b, 100).unwrap();
    merger.update_levels(a, &[200u8; 512]).unwrap();
    merger.update_levels(b, &[90u8; 512]).unwrap();
    assert!(merger.owners().iter().all(|&o| o == a));
    assert_eq!(merger.universe_priority(), 150);

    merger.remove_source(a).unwrap();
    assert!(merger.owners().iter().all(|&o| o == b));
    assert!(merger.levels().iter().all(|&l| l == 90));
    assert!(merger.priorities().iter().all(|&p| p == 100));
    assert_eq!(merger.universe_priority(), 100);
    assert_outputs_consistent(&merger);

    merger.remove_source(b).unwrap();
    assert!(merger.levels().iter().all(|&l| l == 0));
    assert!(merger.owners().iter().all(|&o| o == REMOTE_SOURCE_INVALID));
    assert_eq!(merger.universe_priority(), 0);
}

#[test]
fn test_winner_priority_decrease_rescans_slot() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    let b = merger.add_source().unwrap();
    merger.update_pap(a, &[150u8; 512]).unwrap();
    merger.update_pap(b, &[100u8; 512]).unwrap();
    merger.update_levels(a, &levels_with(&[10])).unwrap();
    merger.update_levels(b, &levels_with(&[90])).unwrap();
    assert_eq!(merger.owners()[0], a);

    // A drops below B on slot 0.
    let mut pap = [150u8; 512];
    pap[0] = 50;
    merger.update_pap(a, &pap).unwrap();
    assert_eq!(merger.owners()[0], b);
    assert_eq!(merger.priorities()[0], 100);
    assert_eq!(merger.levels()[0], 90);
    assert_outputs_consistent(&merger);
}

#[test]
fn test_pap_active_follows_sources() {
    let mut merger = DmxMerger::new(None);
    let a = merger.add_source().unwrap();
    let b = merger.add_source().unwrap();
    assert!(!merger.pap_active());

    merger.update_pap(a, &[10u8; 512]).unwrap();
    merger.update_pap(b, &[20u8; 512]).unwrap();
    assert!(merger.pap_active());

    merger.remove_pap(a).unwrap();
    assert!(merger.pap_active());
    merger.remove_pap(b).unwrap();
    assert!(!merger.pap_active());

    merger.update_pap(a, &[10u8; 512]).unwrap();
    assert!(merger.pap_active());
    merger.remove_source(a).unwrap();
    assert!(!merger.pap_active());
}

// ===== Randomized consistency =====

#[test]
fn test_random_operations_keep_outputs_consistent() {
    let mut rng = fastrand::Rng::with_seed(0xE131);
    let mut merger = DmxMerger::new(None);
    let mut live: Vec<RemoteSourceHandle> = Vec::new();

    for step in 0..400 {
        match rng.u8(0..10) {
            0 if live.len() < 4 => {
                live.push(merger.add_source().unwrap());
            }
            1 if !live.is_empty() => {
                let idx = rng.usize(0..live.len());
                let handle = live.swap_remove(idx);
                merger.remove_source(handle).unwrap();
            }
            2..=4 if !live.is_empty() => {
                let handle = live[rng.usize(0..live.len())];
                let count = rng.usize(1..=DMX_ADDRESS_COUNT);
                let buf: Vec<u8> = (0..count).map(|_| rng.u8(..)).collect();
                merger.update_levels(handle, &buf).unwrap();
            }
            5..=6 if !live.is_empty() => {
                let handle = live[rng.usize(0..live.len())];
                let count = rng.usize(1..=DMX_ADDRESS_COUNT);
                let buf: Vec<u8> = (0..count).map(|_| rng.u8(..)).collect();
                merger.update_pap(handle, &buf).unwrap();
            }
            7..=8 if !live.is_empty() => {
                let handle = live[rng.usize(0..live.len())];
                merger
                    .update_universe_priority(handle, rng.u8(0..=MAX_PRIORITY))
                    .unwrap();
            }
            9 if !live.is_empty() => {
                let handle = live[rng.usize(0..live.len())];
                merger.remove_pap(handle).unwrap();
            }
            _ => {}
        }
        assert_outputs_consistent(&merger);
        let _ = step;
    }
}
