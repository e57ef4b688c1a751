//! Allocator tree properties over arbitrary target sets: units add up,
//! capacity is fully assigned, and selections converge to the unit shares.

use std::collections::HashMap;

use proptest::prelude::*;
use quanta::Clock;

use mprtp_control::allocator::{AllocatorTree, PathStatus};
use mprtp_control::{Packet, SubflowId, SubflowState};

fn targets() -> impl Strategy<Value = Vec<(SubflowId, u64)>> {
    prop::collection::hash_map(0u16..64, 1u64..10_000_000, 1..12)
        .prop_map(|m| m.into_iter().collect())
}

fn packet() -> Packet {
    Packet {
        sequence: 0,
        payload_size: 1000,
        is_keyframe: false,
    }
}

fn run(tree: &mut AllocatorTree, packets: usize) -> HashMap<SubflowId, usize> {
    run_with(tree, packets, |_| true)
}

fn run_with(
    tree: &mut AllocatorTree,
    packets: usize,
    eligible: impl Fn(SubflowId) -> bool + Copy,
) -> HashMap<SubflowId, usize> {
    let (clock, _mock) = Clock::mock();
    let now = clock.now();
    let status = move |id| {
        eligible(id).then_some(PathStatus {
            state: SubflowState::NonCongested,
            pacing_time: now,
        })
    };
    let mut counts = HashMap::new();
    for _ in 0..packets {
        let sel = tree
            .select(&packet(), now, SubflowState::NonCongested, status)
            .unwrap();
        tree.approve(&sel, 1000);
        *counts.entry(sel.subflow).or_insert(0) += 1;
    }
    counts
}

proptest! {
    #[test]
    fn units_and_capacity_add_up(targets in targets(), depth in 1u8..=7) {
        let tree = AllocatorTree::build(&targets, depth);
        let units_total = 1u32 << depth;
        let total: u64 = targets.iter().map(|&(_, t)| t).sum();

        prop_assert_eq!(tree.total(), total);
        prop_assert_eq!(tree.unassigned(), 0);
        let units: u32 = tree.members().map(|id| tree.units_of(id)).sum();
        prop_assert_eq!(units, units_total);
        let capacity: u64 = tree.members().map(|id| tree.capacity_of(id)).sum();
        prop_assert_eq!(capacity, total);
        prop_assert!(tree.node_count() < 2 * units_total as usize);
    }

    #[test]
    fn units_track_shares(targets in targets(), depth in 1u8..=7) {
        let tree = AllocatorTree::build(&targets, depth);
        let units_total = (1u32 << depth) as f64;
        let total: u64 = targets.iter().map(|&(_, t)| t).sum();
        let largest = targets
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|&(id, _)| id)
            .unwrap();
        for &(id, target) in &targets {
            let ideal = target as f64 * units_total / total as f64;
            let units = tree.units_of(id) as f64;
            if id == largest {
                prop_assert!(units + 1.0 > ideal);
            } else {
                // Floor of the ideal share.
                prop_assert!(units <= ideal + 1e-6, "id {} units {} ideal {}", id, units, ideal);
                prop_assert!(ideal - units < 1.0 + 1e-6, "id {} units {}", id, units);
            }
        }
    }

    #[test]
    fn selection_converges_to_unit_shares(targets in targets(), depth in 1u8..=7) {
        let mut tree = AllocatorTree::build(&targets, depth);
        let packets = 4000;
        let counts = run(&mut tree, packets);
        let units_total = (1u32 << depth) as f64;
        for id in tree.members() {
            let share = *counts.get(&id).unwrap_or(&0) as f64 / packets as f64;
            let expected = tree.units_of(id) as f64 / units_total;
            prop_assert!(
                (share - expected).abs() < 0.02,
                "id {} share {} expected {}",
                id,
                share,
                expected
            );
        }
        // Subflows without units never get picked.
        for (id, _) in &targets {
            if tree.units_of(*id) == 0 {
                prop_assert!(!counts.contains_key(id));
            }
        }
    }
}

#[test]
fn three_to_one_ratio() {
    let mut tree = AllocatorTree::build(&[(1, 3_000_000), (2, 1_000_000)], 7);
    let counts = run(&mut tree, 1000);
    assert_eq!(counts[&1], 750);
    assert_eq!(counts[&2], 250);
}

#[test]
fn ineligible_subflow_is_routed_around() {
    let mut tree = AllocatorTree::build(&[(1, 700_000), (2, 200_000), (3, 100_000)], 6);
    let counts = run_with(&mut tree, 500, |id| id != 2);
    assert!(!counts.contains_key(&2));
    assert_eq!(counts.values().sum::<usize>(), 500);
    assert!(counts[&1] > counts[&3]);
}
