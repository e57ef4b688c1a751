//! # Bandwidth Allocator
//!
//! A complete binary tree of depth `d` splits the total target bitrate into
//! `2^d` units. Each subflow owns a contiguous run of leaves proportional to
//! its share of the total:
//!
//! ```text
//!                     root (total, 8 units)
//!                  ┌──────────┴──────────┐
//!              4 units                 4 units
//!            ┌────┴────┐            ┌────┴────┐
//!          [ A ]     [ A ]        [ B ]   ┌───┴───┐
//!                                       [ B ]   [ C ]
//! ```
//!
//! Selection walks from the root, picking the eligible child that has been
//! sent the fewest bytes so far. Byte counts along the chosen path grow on
//! approval, so over time each subtree carries traffic in proportion to its
//! capacity, and each subflow its share of the units.
//!
//! The tree is rebuilt wholesale when targets drift or membership changes;
//! between rebuilds the shape is fixed and byte counters only grow.

use quanta::Instant;

use crate::config::{AllocatorConfig, MAX_TREE_DEPTH};
use crate::state::SubflowState;
use crate::SubflowId;

/// Outgoing media packet as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Packet {
    pub sequence: u16,
    pub payload_size: usize,
    pub is_keyframe: bool,
}

/// What the allocator needs to know about a subflow at selection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStatus {
    pub state: SubflowState,
    /// Earliest time the subflow may send again.
    pub pacing_time: Instant,
}

/// Result of a selection, consumed by [`AllocatorTree::approve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub subflow: SubflowId,
    leaf: usize,
}

// ─── Tree ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct AllocatorNode {
    /// Bits per second this subtree stands for.
    capacity: u64,
    /// Capacity not yet owned by any subflow.
    remaining: u64,
    units: u32,
    free_units: u32,
    sent_bytes: u64,
    /// Bit `i` set when slot `i` owns a leaf below.
    members: u128,
    /// Slot owning this leaf.
    slot: Option<usize>,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

impl AllocatorNode {
    fn new(capacity: u64, units: u32, parent: Option<usize>) -> Self {
        Self {
            capacity,
            remaining: capacity,
            units,
            free_units: units,
            sent_bytes: 0,
            members: 0,
            slot: None,
            parent,
            left: None,
            right: None,
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TreeSlot {
    id: SubflowId,
    units: u32,
}

/// One immutable-shape allocation epoch.
#[derive(Debug, Clone, Default)]
pub struct AllocatorTree {
    nodes: Vec<AllocatorNode>,
    slots: Vec<TreeSlot>,
    /// Targets the tree was built from, sorted by id.
    snapshot: Vec<(SubflowId, u64)>,
    depth: u8,
}

impl AllocatorTree {
    /// Build from `(id, target)` pairs. Subflows with a zero target, or
    /// whose share is below one unit, get no leaves.
    pub fn build(targets: &[(SubflowId, u64)], depth: u8) -> Self {
        let depth = depth.clamp(1, MAX_TREE_DEPTH);
        let snapshot = normalize(targets);

        let total: u64 = snapshot.iter().map(|&(_, t)| t).fold(0u64, u64::saturating_add);
        let mut tree = Self {
            nodes: Vec::new(),
            slots: Vec::new(),
            snapshot,
            depth,
        };
        if total == 0 {
            return tree;
        }

        let units_total = 1u32 << depth;
        for &(id, target) in &tree.snapshot {
            let units = (target as u128 * units_total as u128 / total as u128) as u32;
            if units > 0 {
                tree.slots.push(TreeSlot { id, units });
            }
        }
        // The rounding remainder goes to the largest target; lowest id wins ties.
        let assigned: u32 = tree.slots.iter().map(|s| s.units).sum();
        let largest = tree
            .snapshot
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|&(id, _)| id);
        if let Some(largest) = largest {
            match tree.slots.iter_mut().find(|s| s.id == largest) {
                Some(slot) => slot.units += units_total - assigned,
                None => tree.slots.push(TreeSlot {
                    id: largest,
                    units: units_total - assigned,
                }),
            }
        }
        tree.slots.sort_unstable_by_key(|s| s.id);

        tree.nodes.push(AllocatorNode::new(total, units_total, None));
        for slot in 0..tree.slots.len() {
            let mut need = tree.slots[slot].units;
            tree.insert(0, slot, &mut need);
            debug_assert_eq!(need, 0);
        }
        tree
    }

    /// Greedy leftmost insertion: take an empty leaf whose units fit the
    /// residual need, otherwise split and try left then right.
    fn insert(&mut self, node: usize, slot: usize, need: &mut u32) {
        if *need == 0 || self.nodes[node].free_units == 0 {
            return;
        }
        let n = &self.nodes[node];
        if n.is_leaf() {
            if n.slot.is_none() && *need >= n.units {
                *need -= n.units;
                self.assign(node, slot);
                return;
            }
            if n.units == 1 {
                return;
            }
            self.split(node);
        }
        if let Some(left) = self.nodes[node].left {
            self.insert(left, slot, need);
        }
        if let Some(right) = self.nodes[node].right {
            self.insert(right, slot, need);
        }
    }

    fn split(&mut self, node: usize) {
        let capacity = self.nodes[node].capacity;
        let units = self.nodes[node].units / 2;
        let left = self.nodes.len();
        self.nodes.push(AllocatorNode::new(capacity / 2, units, Some(node)));
        self.nodes.push(AllocatorNode::new(capacity - capacity / 2, units, Some(node)));
        self.nodes[node].left = Some(left);
        self.nodes[node].right = Some(left + 1);
    }

    fn assign(&mut self, leaf: usize, slot: usize) {
        let capacity = self.nodes[leaf].capacity;
        let units = self.nodes[leaf].units;
        self.nodes[leaf].slot = Some(slot);
        let mut cursor = Some(leaf);
        while let Some(i) = cursor {
            let n = &mut self.nodes[i];
            n.members |= 1u128 << slot;
            n.remaining -= capacity;
            n.free_units -= units;
            cursor = n.parent;
        }
    }

    /// Pick a subflow for `packet`. `status` reports each subflow's pacing
    /// time and state; subflows it does not know are ineligible.
    pub fn select<F>(
        &self,
        packet: &Packet,
        now: Instant,
        keyframe_min_state: SubflowState,
        status: F,
    ) -> Option<Selection>
    where
        F: Fn(SubflowId) -> Option<PathStatus>,
    {
        let root = self.nodes.first()?;

        let mut paced = 0u128;
        let mut healthy = 0u128;
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(st) = status(slot.id) else { continue };
            if !st.state.is_active() || now < st.pacing_time {
                continue;
            }
            paced |= 1u128 << i;
            if st.state >= keyframe_min_state {
                healthy |= 1u128 << i;
            }
        }
        // Keyframes go to a healthy path when there is one.
        let eligible = if packet.is_keyframe && healthy != 0 { healthy } else { paced };
        if root.members & eligible == 0 {
            return None;
        }

        let mut node = 0;
        while let (Some(l), Some(r)) = (self.nodes[node].left, self.nodes[node].right) {
            let left_ok = self.nodes[l].members & eligible != 0;
            let right_ok = self.nodes[r].members & eligible != 0;
            node = match (left_ok, right_ok) {
                (true, true) if self.nodes[l].sent_bytes <= self.nodes[r].sent_bytes => l,
                (true, true) => r,
                (true, false) => l,
                (false, true) => r,
                (false, false) => return None,
            };
        }
        let slot = self.nodes[node].slot?;
        Some(Selection {
            subflow: self.slots[slot].id,
            leaf: node,
        })
    }

    /// Charge `bytes` to every node from the selected leaf up to the root.
    pub fn approve(&mut self, selection: &Selection, bytes: u64) {
        let mut cursor = Some(selection.leaf);
        while let Some(i) = cursor {
            let Some(n) = self.nodes.get_mut(i) else { return };
            n.sent_bytes = n.sent_bytes.saturating_add(bytes);
            cursor = n.parent;
        }
    }

    /// Whether `targets` moved far enough from the snapshot to warrant a
    /// rebuild: membership changed, or any target drifted by more than
    /// `min(ratio · snapshot, abs)`.
    pub fn needs_rebuild(&self, targets: &[(SubflowId, u64)], ratio: f64, abs: u64) -> bool {
        let current = normalize(targets);
        if current.len() != self.snapshot.len() {
            return true;
        }
        current.iter().zip(&self.snapshot).any(|(&(id, t), &(sid, s))| {
            if id != sid {
                return true;
            }
            let margin = ((s as f64 * ratio) as u64).min(abs);
            t.abs_diff(s) > margin
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Total capacity in bits per second.
    pub fn total(&self) -> u64 {
        self.nodes.first().map_or(0, |n| n.capacity)
    }

    /// Capacity nobody owns; zero for any non-empty tree.
    pub fn unassigned(&self) -> u64 {
        self.nodes.first().map_or(0, |n| n.remaining)
    }

    /// Leaves' worth of units owned by `id`.
    pub fn units_of(&self, id: SubflowId) -> u32 {
        self.slots.iter().find(|s| s.id == id).map_or(0, |s| s.units)
    }

    /// Capacity of the leaves owned by `id`.
    pub fn capacity_of(&self, id: SubflowId) -> u64 {
        let Some(slot) = self.slots.iter().position(|s| s.id == id) else {
            return 0;
        };
        self.nodes
            .iter()
            .filter(|n| n.slot == Some(slot))
            .map(|n| n.capacity)
            .sum()
    }

    /// Subflows holding at least one leaf, by id.
    pub fn members(&self) -> impl Iterator<Item = SubflowId> + '_ {
        self.slots.iter().map(|s| s.id)
    }

    pub fn snapshot(&self) -> &[(SubflowId, u64)] {
        &self.snapshot
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for (i, n) in self.nodes.iter().enumerate() {
            if let (Some(l), Some(r)) = (n.left, n.right) {
                let (l, r) = (&self.nodes[l], &self.nodes[r]);
                assert_eq!(l.capacity + r.capacity, n.capacity, "capacity split at {}", i);
                assert_eq!(l.members | r.members, n.members, "membership at {}", i);
                assert!(l.sent_bytes + r.sent_bytes <= n.sent_bytes);
            }
            if let Some(slot) = n.slot {
                assert!(n.is_leaf());
                let mut cursor = n.parent;
                while let Some(p) = cursor {
                    assert!(self.nodes[p].members & (1u128 << slot) != 0);
                    cursor = self.nodes[p].parent;
                }
            }
        }
    }
}

/// Positive targets only, sorted by id, first entry wins on duplicates.
fn normalize(targets: &[(SubflowId, u64)]) -> Vec<(SubflowId, u64)> {
    let mut out: Vec<(SubflowId, u64)> = targets.iter().copied().filter(|&(_, t)| t > 0).collect();
    out.sort_by_key(|&(id, _)| id);
    out.dedup_by_key(|&mut (id, _)| id);
    out
}

// ─── Allocator ──────────────────────────────────────────────────────────────

/// The current tree plus the policy for when to replace it.
#[derive(Debug, Clone)]
pub struct BandwidthAllocator {
    config: AllocatorConfig,
    tree: AllocatorTree,
    rebuilds: u64,
}

impl BandwidthAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        let depth = config.depth;
        Self {
            config,
            tree: AllocatorTree::build(&[], depth),
            rebuilds: 0,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn tree(&self) -> &AllocatorTree {
        &self.tree
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Replace the tree unconditionally.
    pub fn rebuild(&mut self, targets: &[(SubflowId, u64)]) {
        self.tree = AllocatorTree::build(targets, self.config.depth);
        self.rebuilds += 1;
    }

    /// Rebuild if targets drifted past the margin. Returns whether it did.
    pub fn refresh(&mut self, targets: &[(SubflowId, u64)]) -> bool {
        if !self
            .tree
            .needs_rebuild(
                targets,
                self.config.rebuild_margin_ratio,
                self.config.rebuild_margin_abs,
            )
        {
            return false;
        }
        self.rebuild(targets);
        true
    }

    pub fn select<F>(&self, packet: &Packet, now: Instant, status: F) -> Option<Selection>
    where
        F: Fn(SubflowId) -> Option<PathStatus>,
    {
        self.tree.select(packet, now, self.config.keyframe_min_state, status)
    }

    pub fn approve(&mut self, selection: &Selection, bytes: u64) {
        self.tree.approve(selection, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;
    use std::collections::HashMap;
    use std::time::Duration;

    fn packet(size: usize) -> Packet {
        Packet {
            sequence: 0,
            payload_size: size,
            is_keyframe: false,
        }
    }

    fn all_ready(now: Instant) -> impl Fn(SubflowId) -> Option<PathStatus> {
        move |_| {
            Some(PathStatus {
                state: SubflowState::NonCongested,
                pacing_time: now,
            })
        }
    }

    fn run(tree: &mut AllocatorTree, now: Instant, packets: usize) -> HashMap<SubflowId, u64> {
        let mut sent = HashMap::new();
        for _ in 0..packets {
            let sel = tree
                .select(&packet(1000), now, SubflowState::NonCongested, all_ready(now))
                .unwrap();
            tree.approve(&sel, 1000);
            *sent.entry(sel.subflow).or_insert(0) += 1000;
        }
        sent
    }

    #[test]
    fn empty_tree_selects_nothing() {
        let (clock, _mock) = Clock::mock();
        let tree = AllocatorTree::build(&[], 7);
        assert!(tree.is_empty());
        assert!(tree
            .select(&packet(100), clock.now(), SubflowState::NonCongested, all_ready(clock.now()))
            .is_none());
        let zeros = AllocatorTree::build(&[(1, 0), (2, 0)], 7);
        assert!(zeros.is_empty());
    }

    #[test]
    fn units_follow_shares() {
        let tree = AllocatorTree::build(&[(1, 3_000_000), (2, 1_000_000)], 7);
        assert_eq!(tree.units_of(1), 96);
        assert_eq!(tree.units_of(2), 32);
        assert_eq!(tree.total(), 4_000_000);
        assert_eq!(tree.unassigned(), 0);
        assert_eq!(tree.capacity_of(1) + tree.capacity_of(2), 4_000_000);
        tree.check_invariants();
    }

    #[test]
    fn remainder_goes_to_largest_target() {
        let tree = AllocatorTree::build(&[(1, 1_000_000), (2, 1_000_000), (3, 1_000_001)], 3);
        // 8 units: floor shares 2/2/2, remainder 2 to subflow 3.
        assert_eq!(tree.units_of(1), 2);
        assert_eq!(tree.units_of(2), 2);
        assert_eq!(tree.units_of(3), 4);
        tree.check_invariants();
    }

    #[test]
    fn tiny_share_loses_all_units() {
        let tree = AllocatorTree::build(&[(1, 10_000_000), (2, 1_000)], 7);
        assert_eq!(tree.units_of(2), 0);
        assert_eq!(tree.units_of(1), 128);
        assert_eq!(tree.members().collect::<Vec<_>>(), vec![1]);
        assert_eq!(tree.unassigned(), 0);
    }

    #[test]
    fn single_subflow_owns_root() {
        let (clock, _mock) = Clock::mock();
        let mut tree = AllocatorTree::build(&[(9, 500_000)], 7);
        assert_eq!(tree.node_count(), 1);
        let sent = run(&mut tree, clock.now(), 10);
        assert_eq!(sent[&9], 10_000);
    }

    #[test]
    fn selection_matches_shares() {
        let (clock, _mock) = Clock::mock();
        let mut tree = AllocatorTree::build(&[(1, 600_000), (2, 300_000), (3, 100_000)], 7);
        let sent = run(&mut tree, clock.now(), 10_000);
        let total: u64 = sent.values().sum();
        for (id, target) in [(1u16, 0.6), (2, 0.3), (3, 0.1)] {
            let share = sent[&id] as f64 / total as f64;
            let units = tree.units_of(id) as f64 / 128.0;
            assert!((share - units).abs() < 0.01, "subflow {} share {} units {}", id, share, units);
            assert!((share - target).abs() < 0.02);
        }
        tree.check_invariants();
    }

    #[test]
    fn ineligible_subflow_is_skipped() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let tree = AllocatorTree::build(&[(1, 500_000), (2, 500_000)], 7);
        let status = move |id: SubflowId| {
            Some(PathStatus {
                state: SubflowState::NonCongested,
                pacing_time: if id == 1 { now + Duration::from_millis(5) } else { now },
            })
        };
        for _ in 0..10 {
            let sel = tree.select(&packet(100), now, SubflowState::NonCongested, status).unwrap();
            assert_eq!(sel.subflow, 2);
        }
        let none_ready = move |_| {
            Some(PathStatus {
                state: SubflowState::NonCongested,
                pacing_time: now + Duration::from_millis(5),
            })
        };
        assert!(tree.select(&packet(100), now, SubflowState::NonCongested, none_ready).is_none());
    }

    #[test]
    fn passive_and_unknown_subflows_are_ineligible() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let tree = AllocatorTree::build(&[(1, 500_000), (2, 500_000)], 4);
        let status = move |id: SubflowId| match id {
            1 => Some(PathStatus {
                state: SubflowState::Passive,
                pacing_time: now,
            }),
            _ => None,
        };
        assert!(tree.select(&packet(100), now, SubflowState::NonCongested, status).is_none());
    }

    #[test]
    fn keyframes_prefer_healthy_paths() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let tree = AllocatorTree::build(&[(1, 900_000), (2, 100_000)], 7);
        let status = move |id: SubflowId| {
            Some(PathStatus {
                state: if id == 1 { SubflowState::Congested } else { SubflowState::NonCongested },
                pacing_time: now,
            })
        };
        let keyframe = Packet {
            is_keyframe: true,
            ..packet(1200)
        };
        for _ in 0..5 {
            let sel = tree.select(&keyframe, now, SubflowState::NonCongested, status).unwrap();
            assert_eq!(sel.subflow, 2);
        }
        // No healthy path: fall back to whatever may send.
        let all_congested = move |_| {
            Some(PathStatus {
                state: SubflowState::Congested,
                pacing_time: now,
            })
        };
        assert!(tree.select(&keyframe, now, SubflowState::NonCongested, all_congested).is_some());
    }

    #[test]
    fn rebuild_margin() {
        let tree = AllocatorTree::build(&[(1, 1_000_000), (2, 2_000_000)], 7);
        // margin for 1 Mbps: min(50 kbps, 50 kbps)
        assert!(!tree.needs_rebuild(&[(1, 1_050_000), (2, 2_000_000)], 0.05, 50_000));
        assert!(tree.needs_rebuild(&[(1, 1_050_001), (2, 2_000_000)], 0.05, 50_000));
        // margin for 2 Mbps is capped at 50 kbps
        assert!(tree.needs_rebuild(&[(1, 1_000_000), (2, 2_060_000)], 0.05, 50_000));
        // membership change
        assert!(tree.needs_rebuild(&[(1, 1_000_000)], 0.05, 50_000));
        assert!(tree.needs_rebuild(&[(1, 1_000_000), (3, 2_000_000)], 0.05, 50_000));
        assert!(tree.needs_rebuild(&[(1, 1_000_000), (2, 0)], 0.05, 50_000));
    }

    #[test]
    fn allocator_counts_rebuilds() {
        let mut alloc = BandwidthAllocator::new(AllocatorConfig::default());
        assert!(alloc.tree().is_empty());
        assert!(alloc.refresh(&[(1, 1_000_000)]));
        assert!(!alloc.refresh(&[(1, 1_010_000)]));
        assert!(alloc.refresh(&[(1, 500_000)]));
        assert_eq!(alloc.rebuilds(), 2);
        assert_eq!(alloc.tree().snapshot(), &[(1, 500_000)]);
    }
}
