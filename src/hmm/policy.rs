//! Per-block memory policy ranges.
//!
//! A block's policy tree holds non-overlapping, page aligned nodes inside the
//! block. Addresses no node covers use [`Policy::DEFAULT`]. Nodes are split
//! when a policy call's boundary falls inside one and are never merged back.

use crate::gpu::{ProcessorId, ProcessorMask};
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadDuplication {
    #[default]
    Unset,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub preferred_location: Option<ProcessorId>,
    /// NUMA node for a CPU preferred location; `None` is "any node".
    pub preferred_cpu_nid: Option<i32>,
    pub accessed_by: ProcessorMask,
    /// Stored and reported, but has no effect on placement.
    pub read_duplication: ReadDuplication,
}

impl Policy {
    pub const DEFAULT: Self = Self {
        preferred_location: None,
        preferred_cpu_nid: None,
        accessed_by: ProcessorMask::empty(),
        read_duplication: ReadDuplication::Unset,
    };

    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Policy over the inclusive range `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyNode {
    pub start: u64,
    pub end: u64,
    pub policy: Policy,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyTree {
    // Start address -> node
    nodes: BTreeMap<u64, PolicyNode>,
}

impl PolicyTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&PolicyNode> {
        self.nodes
            .range(..=addr)
            .next_back()
            .map(|(_, node)| node)
            .filter(|node| addr <= node.end)
    }

    /// The policy in effect at `addr`.
    #[must_use]
    pub fn policy_at(&self, addr: u64) -> &Policy {
        self.find(addr).map_or(&Policy::DEFAULT, |node| &node.policy)
    }

    /// The largest uncovered interval containing `addr`, clamped to `[lo, hi]`.
    /// `None` if a node covers `addr`.
    #[must_use]
    pub fn find_hole(&self, addr: u64, lo: u64, hi: u64) -> Option<(u64, u64)> {
        if self.find(addr).is_some() {
            return None;
        }
        let start = self
            .nodes
            .range(..addr)
            .next_back()
            .map_or(lo, |(_, prev)| lo.max(prev.end + 1));
        let end = self
            .nodes
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map_or(hi, |(&next, _)| hi.min(next - 1));
        Some((start, end))
    }

    /// Nodes overlapping `[lo, hi]` in ascending order.
    pub fn iter_range(&self, lo: u64, hi: u64) -> impl Iterator<Item = &PolicyNode> {
        let first = self.find(lo).map_or(lo, |node| node.start);
        self.nodes
            .range(first..=hi.max(first))
            .map(|(_, node)| node)
            .filter(move |node| node.start <= hi && node.end >= lo)
    }

    // Make `at` a node boundary if a node straddles it.
    fn split_at(&mut self, at: u64) {
        let Some(node) = self.find(at).filter(|node| node.start < at) else {
            return;
        };
        let start = node.start;
        if let Some(node) = self.nodes.get_mut(&start) {
            let upper = PolicyNode {
                start: at,
                end: node.end,
                policy: node.policy,
            };
            node.end = at - 1;
            self.nodes.insert(at, upper);
        }
    }

    /// Move every node at or above `at` into a new tree, splitting one that
    /// straddles it.
    #[must_use]
    pub fn split_off(&mut self, at: u64) -> Self {
        self.split_at(at);
        Self {
            nodes: self.nodes.split_off(&at),
        }
    }

    /// Return `[start, end]` to the default policy.
    pub fn clear_range(&mut self, start: u64, end: u64) {
        self.split_at(start);
        if let Some(after) = end.checked_add(1) {
            self.split_at(after);
        }
        let doomed: Vec<u64> = self.iter_range(start, end).map(|node| node.start).collect();
        for key in doomed {
            self.nodes.remove(&key);
        }
    }

    /// Apply `update` to the policy of every address in `[start, end]`.
    ///
    /// Splits nodes at the boundaries and fills holes with default nodes
    /// first. Nodes left holding the default policy are removed.
    pub fn update_range(&mut self, start: u64, end: u64, mut update: impl FnMut(&mut Policy)) {
        self.split_at(start);
        if let Some(after) = end.checked_add(1) {
            self.split_at(after);
        }

        let covered: Vec<(u64, u64)> = self
            .iter_range(start, end)
            .map(|node| (node.start, node.end))
            .collect();
        let mut cursor = Some(start);
        let mut holes = Vec::new();
        for (node_start, node_end) in covered {
            if let Some(c) = cursor.filter(|&c| c < node_start) {
                holes.push((c, node_start - 1));
            }
            cursor = node_end.checked_add(1);
        }
        if let Some(c) = cursor.filter(|&c| c <= end) {
            holes.push((c, end));
        }
        for (hole_start, hole_end) in holes {
            self.nodes.insert(
                hole_start,
                PolicyNode {
                    start: hole_start,
                    end: hole_end,
                    policy: Policy::DEFAULT,
                },
            );
        }

        for (_, node) in self.nodes.range_mut(start..=end) {
            update(&mut node.policy);
        }
        self.nodes
            .retain(|&key, node| key < start || key > end || !node.policy.is_default());
    }
}
