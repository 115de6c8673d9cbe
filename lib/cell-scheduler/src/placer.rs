// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Topology-aware placement of a gang of pods onto the leaves of one chain.
//!
//! Given how many pods want how many GPUs each, the placer packs every pod's
//! GPUs under a single cell and keeps the pods of the group as close together
//! as the current occupancy allows. Cells whose priority is at or above the
//! request's are held by workloads the request cannot displace and are
//! ineligible. The heuristic is deterministic given input ordering: candidate
//! hosts are scanned best-fit in list order, and pods with larger GPU counts
//! place first.

use std::collections::{BTreeMap, HashSet};

use crate::cell::{CellLevel, CellPriority, ChainCellList, PcId, PhysicalCells, VcId, VirtualCells};
use crate::protocols::NodeName;

/// Leaf cells chosen for a group: GPU count -> pods -> level-1 cells.
pub(crate) type GroupLeaves<C> = BTreeMap<i32, Vec<Vec<C>>>;

/// The placer's view of one cell tree. Implemented for both arenas so the
/// intra-VC scheduler and the opportunistic path share the algorithm.
pub(crate) trait PlacerView {
    type Id: Copy + PartialEq + Eq + std::hash::Hash;

    fn level(&self, id: Self::Id) -> CellLevel;
    fn priority(&self, id: Self::Id) -> CellPriority;
    fn children(&self, id: Self::Id) -> &[Self::Id];
    /// Whether every node under this cell is in the suggested set. Virtual
    /// cells have no node placement and always qualify.
    fn all_nodes_suggested(&self, id: Self::Id, suggested: &HashSet<NodeName>) -> bool;
}

pub(crate) struct PhysicalView<'a> {
    pub cells: &'a PhysicalCells,
}

impl PlacerView for PhysicalView<'_> {
    type Id = PcId;

    fn level(&self, id: PcId) -> CellLevel {
        self.cells[id].level
    }
    fn priority(&self, id: PcId) -> CellPriority {
        self.cells[id].priority
    }
    fn children(&self, id: PcId) -> &[PcId] {
        &self.cells[id].children
    }
    fn all_nodes_suggested(&self, id: PcId, suggested: &HashSet<NodeName>) -> bool {
        self.cells[id].nodes.iter().all(|n| suggested.contains(n))
    }
}

pub(crate) struct VirtualView<'a> {
    pub cells: &'a VirtualCells,
}

impl PlacerView for VirtualView<'_> {
    type Id = VcId;

    fn level(&self, id: VcId) -> CellLevel {
        self.cells[id].level
    }
    fn priority(&self, id: VcId) -> CellPriority {
        self.cells[id].priority
    }
    fn children(&self, id: VcId) -> &[VcId] {
        &self.cells[id].children
    }
    fn all_nodes_suggested(&self, _id: VcId, _suggested: &HashSet<NodeName>) -> bool {
        true
    }
}

/// Place `pod_counts` (GPU count -> number of pods) onto the chain list.
/// Returns the chosen leaves per pod, or `None` when the gang does not fit.
pub(crate) fn place<V: PlacerView>(
    view: &V,
    list: &ChainCellList<V::Id>,
    pod_counts: &BTreeMap<i32, i32>,
    threshold: CellPriority,
    suggested: &HashSet<NodeName>,
) -> Option<GroupLeaves<V::Id>> {
    let mut taken: HashSet<V::Id> = HashSet::new();
    let mut placement: GroupLeaves<V::Id> = BTreeMap::new();
    // Larger pods first: they have the fewest viable hosts.
    for (&gpu_count, &pod_count) in pod_counts.iter().rev() {
        if gpu_count <= 0 || pod_count <= 0 {
            tracing::warn!(gpu_count, pod_count, "ignoring degenerate member in placement request");
            continue;
        }
        for _ in 0..pod_count {
            let leaves = place_one_pod(view, list, gpu_count as usize, threshold, suggested, &taken)?;
            for &leaf in &leaves {
                taken.insert(leaf);
            }
            placement.entry(gpu_count).or_default().push(leaves);
        }
    }
    // Pods of one count were placed largest-first overall, but slot order
    // within a count follows insertion order, which is what callers index by.
    Some(placement)
}

/// Find a host cell for one pod and take `gpu_count` leaves from it.
///
/// Hosts are tried from the lowest level that can fit the pod upward; at each
/// level a pass over fully-suggested candidates precedes the general pass, and
/// within a pass the host with the fewest eligible free leaves wins (ties by
/// list position).
fn place_one_pod<V: PlacerView>(
    view: &V,
    list: &ChainCellList<V::Id>,
    gpu_count: usize,
    threshold: CellPriority,
    suggested: &HashSet<NodeName>,
    taken: &HashSet<V::Id>,
) -> Option<Vec<V::Id>> {
    for level in 1..=list.top_level() {
        for suggested_only in [true, false] {
            let mut best: Option<(usize, V::Id)> = None;
            for &cell in list.at(level) {
                if suggested_only && !view.all_nodes_suggested(cell, suggested) {
                    continue;
                }
                let available = free_leaves(view, cell, threshold, taken);
                if available >= gpu_count
                    && best.map_or(true, |(fewest, _)| available < fewest)
                {
                    best = Some((available, cell));
                }
            }
            if let Some((_, host)) = best {
                let mut leaves = Vec::with_capacity(gpu_count);
                collect_leaves(view, host, threshold, taken, gpu_count, &mut leaves);
                assert_eq!(
                    leaves.len(),
                    gpu_count,
                    "host cell reported enough free leaves but packing fell short"
                );
                return Some(leaves);
            }
        }
    }
    None
}

/// Number of eligible free leaves under a cell: level-1 descendants below the
/// priority threshold and not taken by an earlier pod of this request.
fn free_leaves<V: PlacerView>(
    view: &V,
    cell: V::Id,
    threshold: CellPriority,
    taken: &HashSet<V::Id>,
) -> usize {
    if view.level(cell) == 1 {
        let eligible = view.priority(cell) < threshold && !taken.contains(&cell);
        return usize::from(eligible);
    }
    view.children(cell)
        .iter()
        .map(|&c| free_leaves(view, c, threshold, taken))
        .sum()
}

/// Gather `need` eligible leaves under `host`, descending into emptier-last
/// children so partially used subcells fill up before pristine ones split.
fn collect_leaves<V: PlacerView>(
    view: &V,
    host: V::Id,
    threshold: CellPriority,
    taken: &HashSet<V::Id>,
    need: usize,
    out: &mut Vec<V::Id>,
) {
    if out.len() == need {
        return;
    }
    if view.level(host) == 1 {
        if view.priority(host) < threshold && !taken.contains(&host) {
            out.push(host);
        }
        return;
    }
    let mut children: Vec<(usize, V::Id)> = view
        .children(host)
        .iter()
        .map(|&c| (free_leaves(view, c, threshold, taken), c))
        .filter(|&(available, _)| available > 0)
        .collect();
    // Stable: ties keep child order.
    children.sort_by_key(|&(available, _)| available);
    for (_, child) in children {
        collect_leaves(view, child, threshold, taken, need, out);
        if out.len() == need {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::cell::PhysicalCell;

    /// Two nodes of four GPUs each (level 2 over level 1), one chain.
    fn two_node_chain() -> (PhysicalCells, ChainCellList<PcId>, Vec<PcId>, Vec<PcId>) {
        let mut cells = PhysicalCells::default();
        let mut list = ChainCellList::new(2);
        let mut nodes = Vec::new();
        let mut leaves = Vec::new();
        for (n, node) in ["n1", "n2"].iter().enumerate() {
            let mut node_leaves = Vec::new();
            for g in 0..4 {
                let leaf = cells.push(PhysicalCell {
                    name: format!("ch/L1/{}", n * 4 + g),
                    chain: "ch".to_string(),
                    level: 1,
                    parent: None,
                    children: vec![],
                    nodes: vec![node.to_string()],
                    gpu_indices: vec![g as i32],
                    bound: None,
                    split: false,
                    reserved: false,
                    priority: CellPriority::FREE,
                    used_gpus: HashMap::new(),
                    group: None,
                });
                node_leaves.push(leaf);
                list.push(1, leaf);
            }
            let node_cell = cells.push(PhysicalCell {
                name: format!("ch/L2/{n}"),
                chain: "ch".to_string(),
                level: 2,
                parent: None,
                children: node_leaves.clone(),
                nodes: vec![node.to_string()],
                gpu_indices: vec![0, 1, 2, 3],
                bound: None,
                split: false,
                reserved: false,
                priority: CellPriority::FREE,
                used_gpus: HashMap::new(),
                group: None,
            });
            for &l in &node_leaves {
                cells[l].parent = Some(node_cell);
            }
            list.push(2, node_cell);
            nodes.push(node_cell);
            leaves.extend(node_leaves);
        }
        (cells, list, nodes, leaves)
    }

    fn counts(pairs: &[(i32, i32)]) -> BTreeMap<i32, i32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn pod_gpus_stay_under_one_cell() {
        let (cells, list, nodes, _leaves) = two_node_chain();
        let view = PhysicalView { cells: &cells };

        let placement = place(
            &view,
            &list,
            &counts(&[(4, 2)]),
            CellPriority::OPPORTUNISTIC,
            &HashSet::new(),
        )
        .expect("two 4-GPU pods fit on two nodes");
        let pods = &placement[&4];
        assert_eq!(pods.len(), 2);
        let mut hosts = Vec::new();
        for pod in pods {
            assert_eq!(pod.len(), 4);
            let parent = cells[pod[0]].parent.expect("leaves have a node parent");
            assert!(
                pod.iter().all(|&l| cells[l].parent == Some(parent)),
                "a pod's GPUs must come from a single node cell"
            );
            hosts.push(parent);
        }
        assert_ne!(hosts[0], hosts[1], "4-GPU pods cannot share a 4-GPU node");
        assert!(nodes.contains(&hosts[0]) && nodes.contains(&hosts[1]));
    }

    #[test]
    fn busy_leaves_above_threshold_are_ineligible() {
        let (mut cells, list, _nodes, leaves) = two_node_chain();
        // Fill node n1 entirely with guaranteed workloads.
        for &l in &leaves[..4] {
            crate::cell::set_priority(&mut cells, l, CellPriority(100));
        }
        let view = PhysicalView { cells: &cells };

        let placement = place(
            &view,
            &list,
            &counts(&[(4, 1)]),
            CellPriority::OPPORTUNISTIC,
            &HashSet::new(),
        )
        .expect("n2 is still free");
        assert!(
            placement[&4][0].iter().all(|&l| leaves[4..].contains(&l)),
            "the pod must land on the free node"
        );

        let too_many = place(
            &view,
            &list,
            &counts(&[(4, 2)]),
            CellPriority::OPPORTUNISTIC,
            &HashSet::new(),
        );
        assert!(too_many.is_none(), "only one free node remains");
    }

    #[test]
    fn preemption_threshold_admits_lower_priority_leaves() {
        let (mut cells, list, _nodes, leaves) = two_node_chain();
        for &l in &leaves[..4] {
            crate::cell::set_priority(&mut cells, l, CellPriority(10));
        }
        let view = PhysicalView { cells: &cells };

        let placement = place(&view, &list, &counts(&[(4, 2)]), CellPriority(200), &HashSet::new())
            .expect("a priority-200 request may displace priority-10 leaves");
        assert_eq!(placement[&4].len(), 2);
    }

    #[test]
    fn partially_used_cells_fill_before_pristine_ones() {
        let (cells, list, nodes, leaves) = two_node_chain();
        let view = PhysicalView { cells: &cells };

        // 2-GPU pod followed by another 2-GPU pod: both pack onto n1.
        let placement = place(
            &view,
            &list,
            &counts(&[(2, 2)]),
            CellPriority::OPPORTUNISTIC,
            &HashSet::new(),
        )
        .unwrap();
        let all: Vec<PcId> = placement[&2].iter().flatten().copied().collect();
        assert_eq!(all.len(), 4);
        assert!(
            all.iter().all(|&l| cells[l].parent == Some(nodes[0])),
            "both pods should pack onto the first node, leaving the second pristine"
        );
        assert!(all.contains(&leaves[0]));
    }

    #[test]
    fn suggested_nodes_win_within_a_level() {
        let (cells, list, nodes, _leaves) = two_node_chain();
        let view = PhysicalView { cells: &cells };
        let suggested: HashSet<NodeName> = ["n2".to_string()].into_iter().collect();

        let placement = place(
            &view,
            &list,
            &counts(&[(4, 1)]),
            CellPriority::OPPORTUNISTIC,
            &suggested,
        )
        .unwrap();
        assert!(
            placement[&4][0].iter().all(|&l| cells[l].parent == Some(nodes[1])),
            "the fully-suggested node is preferred"
        );
    }

    #[test]
    fn mixed_gpu_counts_place_larger_pods_first() {
        let (cells, list, _nodes, _leaves) = two_node_chain();
        let view = PhysicalView { cells: &cells };

        let placement = place(
            &view,
            &list,
            &counts(&[(1, 2), (3, 2)]),
            CellPriority::OPPORTUNISTIC,
            &HashSet::new(),
        )
        .expect("3+1 per node fits exactly");
        assert_eq!(placement[&3].len(), 2);
        assert_eq!(placement[&1].len(), 2);
        let mut seen = HashSet::new();
        for &leaf in placement.values().flatten().flatten() {
            assert!(seen.insert(leaf), "no leaf may be assigned twice");
        }
    }
}
