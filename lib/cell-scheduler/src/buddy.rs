// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buddy allocation over the per-chain free lists of physical cells.
//!
//! The authoritative free list of a chain contains exactly the cells with no
//! bound virtual descendant whose parent is split or absent. Allocation for a
//! schedule call runs on a scratch copy and splits higher cells on paper;
//! only confirmation mutates the authoritative list through
//! [`remove_from_free_list`] / [`add_to_free_list`].

use std::collections::{HashMap, HashSet};

use crate::cell::{CellLevel, CellPriority, ChainCellList, PcId, PhysicalCells, ScheduleOverlay};
use crate::protocols::NodeName;

/// Allocate a free cell at `level` from a scratch free list, splitting a
/// higher-level cell when the level is empty. The scratch list is one-off, so
/// the chosen cell is not removed from it; candidates already pre-bound by
/// this schedule call are filtered by the overlay instead.
pub(crate) fn allocate(
    cells: &PhysicalCells,
    free: &mut ChainCellList<PcId>,
    level: CellLevel,
    suggested: &HashSet<NodeName>,
    overlay: &ScheduleOverlay,
) -> Option<PcId> {
    if free.at(level).is_empty() && level < free.top_level() {
        if let Some(higher) = allocate(cells, free, level + 1, suggested, overlay) {
            let children = cells[higher].children.clone();
            for child in children {
                free.push(level, child);
            }
        }
    }
    if free.at(level).is_empty() {
        return None;
    }
    fewest_opportunistic(cells, free.at(level), suggested, overlay)
}

/// Select, among candidates with no bound or pre-bound virtual cell, the one
/// with the fewest opportunistic GPUs in use. A candidate whose nodes all lie
/// in the suggested set wins over one that merely has the overall minimum.
pub(crate) fn fewest_opportunistic(
    cells: &PhysicalCells,
    candidates: &[PcId],
    suggested: &HashSet<NodeName>,
    overlay: &ScheduleOverlay,
) -> Option<PcId> {
    let mut fewest: Option<(i32, PcId)> = None;
    let mut fewest_suggested: Option<(i32, PcId)> = None;
    for &pc in candidates {
        if overlay.virtual_of(cells, pc).is_some() {
            continue;
        }
        let opportunistic = overlay.opportunistic_used(cells, pc);
        if fewest.map_or(true, |(best, _)| opportunistic < best) {
            fewest = Some((opportunistic, pc));
        }
        let all_nodes_suggested = cells[pc].nodes.iter().all(|n| suggested.contains(n));
        if all_nodes_suggested
            && fewest_suggested.map_or(true, |(best, _)| opportunistic < best)
        {
            fewest_suggested = Some((opportunistic, pc));
        }
    }
    match (fewest_suggested, fewest) {
        (Some((_, pc)), _) => {
            tracing::debug!(cell = %cells[pc].name, "selected cell within suggested nodes");
            Some(pc)
        }
        (None, Some((_, pc))) => {
            tracing::debug!(cell = %cells[pc].name, "selected cell outside suggested nodes");
            Some(pc)
        }
        (None, None) => None,
    }
}

/// Remove a cell from the authoritative free list, splitting its ancestors as
/// needed: when a child leaves the list, its not-yet-split parent promotes all
/// children into the list and is marked split.
pub(crate) fn remove_from_free_list(
    cells: &mut PhysicalCells,
    free: &mut ChainCellList<PcId>,
    pc: PcId,
) {
    let mut c = pc;
    loop {
        let level = cells[c].level;
        let mut terminate = false;
        match cells[c].parent {
            Some(parent) => {
                if cells[parent].split {
                    terminate = true;
                } else {
                    let children = cells[parent].children.clone();
                    for child in children {
                        free.push(level, child);
                    }
                    cells[parent].split = true;
                }
            }
            None => terminate = true,
        }
        free.remove(level, c);
        if terminate {
            break;
        }
        c = cells[c].parent.expect("non-terminating walk must have a parent");
    }
}

/// Return a released cell to the authoritative free list, merging buddies
/// upward: when all of a parent's children are unbound, the siblings leave
/// the list and the (now unsplit) parent continues the walk.
pub(crate) fn add_to_free_list(
    cells: &mut PhysicalCells,
    free: &mut ChainCellList<PcId>,
    pc: PcId,
) {
    let mut c = pc;
    loop {
        let level = cells[c].level;
        let mut terminate = false;
        match cells[c].parent {
            Some(parent) => {
                let all_buddies_free = cells[parent]
                    .children
                    .iter()
                    .all(|&b| cells[b].bound.is_none());
                if !all_buddies_free {
                    terminate = true;
                } else {
                    let children = cells[parent].children.clone();
                    for buddy in children {
                        if buddy != c {
                            free.remove(level, buddy);
                        }
                    }
                    cells[parent].split = false;
                }
            }
            None => terminate = true,
        }
        if terminate {
            free.push(level, c);
            break;
        }
        c = cells[c].parent.expect("non-terminating walk must have a parent");
    }
}

/// Build the scratch free list for one buddy allocation: a copy of the
/// authoritative list plus the cells effectively freed by groups recorded for
/// lazy preemption in this call, re-normalized so fully reunited buddies read
/// as their parent.
pub(crate) fn scratch_free_list(
    cells: &PhysicalCells,
    authoritative: &ChainCellList<PcId>,
    chain: &str,
    overlay: &ScheduleOverlay,
) -> ChainCellList<PcId> {
    let mut scratch = authoritative.clone();
    if overlay.freed_roots.is_empty() {
        return scratch;
    }
    let mut appended = false;
    for &root in &overlay.freed_roots {
        if cells[root].chain == chain {
            scratch.push(cells[root].level, root);
            appended = true;
        }
    }
    if appended {
        normalize(cells, &mut scratch);
    }
    scratch
}

/// Replace any complete sibling set in the list with its parent, repeatedly.
/// The authoritative list is kept normalized by the merge walk, so this only
/// does work when vacated cells were appended.
fn normalize(cells: &PhysicalCells, free: &mut ChainCellList<PcId>) {
    loop {
        let mut merged = false;
        for level in 1..free.top_level() {
            let mut present_children: HashMap<PcId, usize> = HashMap::new();
            for &pc in free.at(level) {
                if let Some(parent) = cells[pc].parent {
                    *present_children.entry(parent).or_insert(0) += 1;
                }
            }
            let mut complete: Vec<PcId> = present_children
                .into_iter()
                .filter(|&(parent, count)| count == cells[parent].children.len())
                .map(|(parent, _)| parent)
                .collect();
            // HashMap iteration order must not leak into the list order.
            complete.sort_by_key(|p| p.0);
            for parent in complete {
                for &child in &cells[parent].children {
                    free.remove(cells[child].level, child);
                }
                free.push(cells[parent].level, parent);
                merged = true;
            }
        }
        if !merged {
            break;
        }
    }
}

/// Whether the given priority keeps a cell eligible as a mapping target:
/// anything above opportunistic is held by a workload the virtual-cluster
/// quota should have excluded.
pub(crate) fn mappable(priority: CellPriority) -> bool {
    priority <= CellPriority::OPPORTUNISTIC
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use crate::cell::PhysicalCell;

    /// One chain: a level-3 cell over two level-2 cells of two GPUs each,
    /// spanning nodes n1 and n2.
    fn rack_tree() -> (PhysicalCells, ChainCellList<PcId>, PcId, Vec<PcId>, Vec<PcId>) {
        let mut cells = PhysicalCells::default();
        let mut leaves = Vec::new();
        let mut mids = Vec::new();
        for (m, node) in ["n1", "n2"].iter().enumerate() {
            let mut mid_leaves = Vec::new();
            for g in 0..2 {
                mid_leaves.push(cells.push(PhysicalCell {
                    name: format!("ch/L1/{}", m * 2 + g),
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
                    used_gpus: StdHashMap::new(),
                    group: None,
                }));
            }
            let mid = cells.push(PhysicalCell {
                name: format!("ch/L2/{m}"),
                chain: "ch".to_string(),
                level: 2,
                parent: None,
                children: mid_leaves.clone(),
                nodes: vec![node.to_string()],
                gpu_indices: vec![0, 1],
                bound: None,
                split: false,
                reserved: false,
                priority: CellPriority::FREE,
                used_gpus: StdHashMap::new(),
                group: None,
            });
            for &l in &mid_leaves {
                cells[l].parent = Some(mid);
            }
            mids.push(mid);
            leaves.extend(mid_leaves);
        }
        let root = cells.push(PhysicalCell {
            name: "ch/L3/0".to_string(),
            chain: "ch".to_string(),
            level: 3,
            parent: None,
            children: mids.clone(),
            nodes: vec!["n1".to_string(), "n2".to_string()],
            gpu_indices: vec![0, 1, 0, 1],
            bound: None,
            split: false,
            reserved: false,
            priority: CellPriority::FREE,
            used_gpus: StdHashMap::new(),
            group: None,
        });
        for &m in &mids {
            cells[m].parent = Some(root);
        }
        let mut free = ChainCellList::new(3);
        free.push(3, root);
        (cells, free, root, mids, leaves)
    }

    #[test]
    fn allocate_splits_down_to_requested_level() {
        let (cells, free, _root, mids, _leaves) = rack_tree();
        let mut scratch = free.clone();
        let overlay = ScheduleOverlay::default();

        let got = allocate(&cells, &mut scratch, 2, &HashSet::new(), &overlay)
            .expect("a level-2 cell must be allocatable by splitting the root");
        assert!(mids.contains(&got));
        assert_eq!(
            scratch.at(2).len(),
            2,
            "the root's children are pushed to level 2 on paper"
        );
        assert!(free.at(2).is_empty(), "authoritative list must stay untouched");
    }

    #[test]
    fn allocate_prefers_suggested_nodes() {
        let (cells, free, _root, mids, _leaves) = rack_tree();
        let mut scratch = free.clone();
        let overlay = ScheduleOverlay::default();
        let suggested: HashSet<NodeName> = ["n2".to_string()].into_iter().collect();

        let got = allocate(&cells, &mut scratch, 2, &suggested, &overlay).unwrap();
        assert_eq!(got, mids[1], "the cell entirely on suggested nodes wins");
    }

    #[test]
    fn remove_then_add_restores_the_free_list() {
        let (mut cells, mut free, root, mids, _leaves) = rack_tree();

        remove_from_free_list(&mut cells, &mut free, mids[0]);
        assert!(cells[root].split);
        assert_eq!(free.at(3).len(), 0);
        assert_eq!(free.at(2), &[mids[1]], "the sibling is promoted into the list");

        add_to_free_list(&mut cells, &mut free, mids[0]);
        assert!(!cells[root].split, "reuniting all buddies unsplits the parent");
        assert_eq!(free.at(3), &[root]);
        assert!(free.at(2).is_empty());
    }

    #[test]
    fn add_without_merge_keeps_sibling_split() {
        let (mut cells, mut free, root, mids, leaves) = rack_tree();

        remove_from_free_list(&mut cells, &mut free, mids[0]);
        // A still-bound buddy blocks the merge walk.
        cells[mids[1]].bound = Some(crate::cell::VcId(0));
        add_to_free_list(&mut cells, &mut free, mids[0]);
        assert!(cells[root].split);
        assert_eq!(free.at(2).len(), 2);
        assert!(free.contains(2, mids[0]));
        assert!(leaves.iter().all(|&l| !free.contains(1, l)));
    }

    #[test]
    fn scratch_list_reunites_freed_roots() {
        let (mut cells, mut free, root, mids, _leaves) = rack_tree();

        // Both level-2 cells allocated out of the list, then vacated this call.
        remove_from_free_list(&mut cells, &mut free, mids[0]);
        remove_from_free_list(&mut cells, &mut free, mids[1]);
        let mut overlay = ScheduleOverlay::default();
        overlay.vacated_groups.insert("g".to_string());
        overlay.freed_roots.extend([mids[0], mids[1]]);

        let scratch = scratch_free_list(&cells, &free, "ch", &overlay);
        assert_eq!(
            scratch.at(3),
            &[root],
            "freed buddies normalize back to their parent in the scratch list"
        );
        assert!(scratch.at(2).is_empty());
    }

    #[test]
    fn fewest_opportunistic_skips_bound_cells_and_breaks_ties_in_order() {
        let (mut cells, _free, _root, mids, _leaves) = rack_tree();
        let overlay = ScheduleOverlay::default();

        cells[mids[0]].bound = Some(crate::cell::VcId(0));
        let got = fewest_opportunistic(&cells, &[mids[0], mids[1]], &HashSet::new(), &overlay);
        assert_eq!(got, Some(mids[1]));

        cells[mids[0]].bound = None;
        let got = fewest_opportunistic(&cells, &[mids[0], mids[1]], &HashSet::new(), &overlay);
        assert_eq!(got, Some(mids[0]), "ties break by list position");
    }
}
