// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cell model for the hierarchical cluster topology.
//!
//! The cluster is a forest of cells per chain: level 1 is a single GPU, higher
//! levels group lower-level cells (socket, node, rack, ...). Physical cells own
//! concrete node/GPU addresses; virtual cells are the accounting units a
//! virtual cluster's quota is made of. The two trees are linked by a dynamic,
//! bidirectional binding which is a decoration, not ownership: cells live in
//! arenas and refer to each other by id.

use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::protocols::{CellChain, GpuIndex, NodeName, VirtualClusterName};

/// Levels are 1-based; level 1 is a single GPU.
pub type CellLevel = u32;

pub const LOWEST_LEVEL: CellLevel = 1;

/// Workload priority attached to cells.
///
/// `FREE` is a sentinel for unused cells. Opportunistic pods sit below
/// `MIN_GUARANTEED` and never consume virtual-cluster quota; guaranteed pods
/// occupy the `MIN_GUARANTEED..=MAX_GUARANTEED` range and may preempt
/// strictly lower priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPriority(pub i32);

impl CellPriority {
    pub const FREE: CellPriority = CellPriority(-2);
    pub const OPPORTUNISTIC: CellPriority = CellPriority(-1);
    pub const MIN_GUARANTEED: CellPriority = CellPriority(0);
    pub const MAX_GUARANTEED: CellPriority = CellPriority(1000);

    /// Convert a pod priority from the scheduling spec. Anything negative is
    /// opportunistic; guaranteed priorities are capped at the maximum.
    pub fn from_pod(priority: i32) -> Self {
        if priority < Self::MIN_GUARANTEED.0 {
            Self::OPPORTUNISTIC
        } else {
            CellPriority(priority.min(Self::MAX_GUARANTEED.0))
        }
    }

    pub fn is_guaranteed(self) -> bool {
        self >= Self::MIN_GUARANTEED
    }
}

impl std::fmt::Display for CellPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::FREE => write!(f, "free"),
            Self::OPPORTUNISTIC => write!(f, "opportunistic"),
            p => write!(f, "{}", p.0),
        }
    }
}

/// Arena index of a physical cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PcId(pub u32);

/// Arena index of a virtual cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct VcId(pub u32);

/// A cell of the physical cluster.
#[derive(Debug)]
pub(crate) struct PhysicalCell {
    pub name: String,
    pub chain: CellChain,
    pub level: CellLevel,
    pub parent: Option<PcId>,
    pub children: Vec<PcId>,
    /// Node names covered by this cell's leaves, deduplicated in leaf order.
    pub nodes: Vec<NodeName>,
    /// GPU indices of the leaves, in leaf order. A level-1 cell has exactly one.
    pub gpu_indices: Vec<GpuIndex>,
    /// Currently bound virtual cell, if any.
    pub bound: Option<VcId>,
    /// Whether this cell has been split in the buddy free list.
    pub split: bool,
    /// Reserved cells carry a static binding created at startup that release
    /// never tears down.
    pub reserved: bool,
    pub priority: CellPriority,
    pub used_gpus: HashMap<CellPriority, i32>,
    /// Name of the affinity group holding this cell (level-1 cells only).
    pub group: Option<String>,
}

/// A cell of a virtual cluster.
#[derive(Debug)]
pub(crate) struct VirtualCell {
    pub name: String,
    pub vc: VirtualClusterName,
    pub chain: CellChain,
    pub level: CellLevel,
    pub parent: Option<VcId>,
    pub children: Vec<VcId>,
    /// The nearest ancestor (possibly this cell) that the VC's quota allocates
    /// as one indivisible unit; only those participate in buddy allocation.
    pub pre_assigned: VcId,
    /// Currently bound physical cell, if any.
    pub bound: Option<PcId>,
    pub priority: CellPriority,
    pub used_gpus: HashMap<CellPriority, i32>,
}

/// Arena of physical cells, indexed by [`PcId`].
#[derive(Debug, Default)]
pub(crate) struct PhysicalCells {
    cells: Vec<PhysicalCell>,
}

impl PhysicalCells {
    pub fn push(&mut self, cell: PhysicalCell) -> PcId {
        let id = PcId(self.cells.len() as u32);
        self.cells.push(cell);
        id
    }

    /// Every cell id, for the test-only consistency audits.
    #[cfg(test)]
    pub fn ids(&self) -> impl Iterator<Item = PcId> + '_ {
        (0..self.cells.len() as u32).map(PcId)
    }
}

impl Index<PcId> for PhysicalCells {
    type Output = PhysicalCell;
    fn index(&self, id: PcId) -> &PhysicalCell {
        &self.cells[id.0 as usize]
    }
}

impl IndexMut<PcId> for PhysicalCells {
    fn index_mut(&mut self, id: PcId) -> &mut PhysicalCell {
        &mut self.cells[id.0 as usize]
    }
}

/// Arena of virtual cells, indexed by [`VcId`].
#[derive(Debug, Default)]
pub(crate) struct VirtualCells {
    cells: Vec<VirtualCell>,
}

impl VirtualCells {
    pub fn push(&mut self, cell: VirtualCell) -> VcId {
        let id = VcId(self.cells.len() as u32);
        self.cells.push(cell);
        id
    }

    /// Every cell id, for the test-only consistency audits.
    #[cfg(test)]
    pub fn ids(&self) -> impl Iterator<Item = VcId> + '_ {
        (0..self.cells.len() as u32).map(VcId)
    }
}

impl Index<VcId> for VirtualCells {
    type Output = VirtualCell;
    fn index(&self, id: VcId) -> &VirtualCell {
        &self.cells[id.0 as usize]
    }
}

impl IndexMut<VcId> for VirtualCells {
    fn index_mut(&mut self, id: VcId) -> &mut VirtualCell {
        &mut self.cells[id.0 as usize]
    }
}

/// The operations shared by the two cell trees. Kept minimal so the bubbling
/// helpers below are written once; everything binding-related stays on the
/// concrete types.
pub(crate) trait CellTreeOps {
    type Id: Copy + PartialEq;

    fn parent(&self, id: Self::Id) -> Option<Self::Id>;
    fn child_ids(&self, id: Self::Id) -> &[Self::Id];
    fn priority(&self, id: Self::Id) -> CellPriority;
    fn set_priority_raw(&mut self, id: Self::Id, priority: CellPriority);
    fn add_used_gpus(&mut self, id: Self::Id, priority: CellPriority, delta: i32);
}

impl CellTreeOps for PhysicalCells {
    type Id = PcId;

    fn parent(&self, id: PcId) -> Option<PcId> {
        self[id].parent
    }
    fn child_ids(&self, id: PcId) -> &[PcId] {
        &self[id].children
    }
    fn priority(&self, id: PcId) -> CellPriority {
        self[id].priority
    }
    fn set_priority_raw(&mut self, id: PcId, priority: CellPriority) {
        self[id].priority = priority;
    }
    fn add_used_gpus(&mut self, id: PcId, priority: CellPriority, delta: i32) {
        let used = &mut self[id].used_gpus;
        let count = used.entry(priority).or_insert(0);
        *count += delta;
        if *count == 0 {
            used.remove(&priority);
        }
    }
}

impl CellTreeOps for VirtualCells {
    type Id = VcId;

    fn parent(&self, id: VcId) -> Option<VcId> {
        self[id].parent
    }
    fn child_ids(&self, id: VcId) -> &[VcId] {
        &self[id].children
    }
    fn priority(&self, id: VcId) -> CellPriority {
        self[id].priority
    }
    fn set_priority_raw(&mut self, id: VcId, priority: CellPriority) {
        self[id].priority = priority;
    }
    fn add_used_gpus(&mut self, id: VcId, priority: CellPriority, delta: i32) {
        let used = &mut self[id].used_gpus;
        let count = used.entry(priority).or_insert(0);
        *count += delta;
        if *count == 0 {
            used.remove(&priority);
        }
    }
}

/// Set a cell's priority and bubble it to ancestors: a parent's priority is
/// always the max over its children, or the old value if it still dominates.
pub(crate) fn set_priority<T: CellTreeOps>(tree: &mut T, id: T::Id, priority: CellPriority) {
    let original = tree.priority(id);
    tree.set_priority_raw(id, priority);
    if let Some(parent) = tree.parent(id) {
        if priority > tree.priority(parent) {
            set_priority(tree, parent, priority);
        } else if original == tree.priority(parent) && priority < original {
            let max_child = tree
                .child_ids(parent)
                .iter()
                .map(|&c| tree.priority(c))
                .max()
                .unwrap_or(CellPriority::FREE);
            set_priority(tree, parent, max_child);
        }
    }
}

/// Bubble a used-GPU delta at a priority from a cell to all of its ancestors.
pub(crate) fn update_used_gpus<T: CellTreeOps>(
    tree: &mut T,
    id: T::Id,
    priority: CellPriority,
    increase: bool,
) {
    let delta = if increase { 1 } else { -1 };
    let mut current = Some(id);
    while let Some(c) = current {
        tree.add_used_gpus(c, priority, delta);
        current = tree.parent(c);
    }
}

/// Bind a virtual cell to a physical cell, propagating to parents until a
/// parent is already bound or either tree runs out of ancestors.
pub(crate) fn bind_cell(
    physical: &mut PhysicalCells,
    virtual_cells: &mut VirtualCells,
    mut pc: PcId,
    mut vc: VcId,
) {
    while virtual_cells[vc].bound.is_none() {
        virtual_cells[vc].bound = Some(pc);
        physical[pc].bound = Some(vc);
        tracing::debug!(
            virtual_cell = %virtual_cells[vc].name,
            physical_cell = %physical[pc].name,
            "cells bound"
        );
        match (virtual_cells[vc].parent, physical[pc].parent) {
            (Some(vp), Some(pp)) => {
                vc = vp;
                pc = pp;
            }
            _ => break,
        }
    }
}

/// Unbind the virtual cell bound to `pc`, walking upward while no sibling
/// still holds a binding. The walk stops at reserved physical cells, whose
/// static binding survives release.
pub(crate) fn unbind_cell(
    physical: &mut PhysicalCells,
    virtual_cells: &mut VirtualCells,
    pc: PcId,
) {
    let Some(mut bound_virtual) = physical[pc].bound else {
        return;
    };
    loop {
        let bound_physical = virtual_cells[bound_virtual]
            .bound
            .expect("bound virtual cell must reference a physical cell");
        if physical[bound_physical].reserved {
            break;
        }
        tracing::debug!(
            virtual_cell = %virtual_cells[bound_virtual].name,
            physical_cell = %physical[bound_physical].name,
            "cells unbound"
        );
        physical[bound_physical].bound = None;
        virtual_cells[bound_virtual].bound = None;
        let Some(parent) = virtual_cells[bound_virtual].parent else {
            break;
        };
        let any_sibling_bound = virtual_cells[parent]
            .children
            .iter()
            .any(|&c| virtual_cells[c].bound.is_some());
        if any_sibling_bound {
            break;
        }
        bound_virtual = parent;
    }
}

/// Per-level container of cells of one chain. Level 1 is stored at index 0.
///
/// Cloning yields a scratch copy sharing the cells themselves (they are ids),
/// which is how the mapping phase builds throwaway free lists.
#[derive(Debug, Clone)]
pub(crate) struct ChainCellList<C> {
    levels: Vec<Vec<C>>,
}

impl<C: Copy + PartialEq> ChainCellList<C> {
    pub fn new(top_level: CellLevel) -> Self {
        assert!(top_level >= LOWEST_LEVEL, "chain must have at least one level");
        Self {
            levels: vec![Vec::new(); top_level as usize],
        }
    }

    pub fn top_level(&self) -> CellLevel {
        self.levels.len() as CellLevel
    }

    pub fn at(&self, level: CellLevel) -> &[C] {
        &self.levels[(level - 1) as usize]
    }

    pub fn push(&mut self, level: CellLevel, cell: C) {
        self.levels[(level - 1) as usize].push(cell);
    }

    /// Remove a cell by identity. A missing cell means the free list has been
    /// corrupted, which is unrecoverable.
    pub fn remove(&mut self, level: CellLevel, cell: C) {
        let cells = &mut self.levels[(level - 1) as usize];
        let position = cells
            .iter()
            .position(|&c| c == cell)
            .expect("cell not present at its level in the chain cell list");
        cells.remove(position);
    }

    #[cfg(test)]
    pub fn contains(&self, level: CellLevel, cell: C) -> bool {
        self.at(level).contains(&cell)
    }
}

/// Call-scoped overlay over the authoritative cell state, dropped at the end
/// of every `schedule` call.
///
/// It carries the pre-bindings created while mapping virtual cells to
/// physical cells, plus the bindings of groups recorded for lazy preemption,
/// which the mapping must treat as already vacated without mutating the
/// authoritative trees.
#[derive(Debug, Default)]
pub(crate) struct ScheduleOverlay {
    pre_v2p: HashMap<VcId, PcId>,
    pre_p2v: HashMap<PcId, VcId>,
    /// Names of groups recorded for lazy preemption during this call.
    pub vacated_groups: std::collections::HashSet<String>,
    /// Bindings of the vacated groups, ignored when reading cell state.
    pub vacated_virtual: std::collections::HashSet<VcId>,
    pub vacated_physical: std::collections::HashSet<PcId>,
    /// Physical cells whose pre-assigned binding the vacate released; they are
    /// appended to scratch free lists before buddy allocation.
    pub freed_roots: Vec<PcId>,
}

impl ScheduleOverlay {
    pub fn pre_bind(&mut self, vc: VcId, pc: PcId) {
        self.pre_v2p.insert(vc, pc);
        self.pre_p2v.insert(pc, vc);
    }

    /// Effective physical counterpart of a virtual cell: its authoritative
    /// binding unless vacated, else its pre-binding.
    pub fn physical_of(&self, virtual_cells: &VirtualCells, vc: VcId) -> Option<PcId> {
        if let Some(pc) = virtual_cells[vc].bound {
            if !self.vacated_virtual.contains(&vc) {
                return Some(pc);
            }
        }
        self.pre_v2p.get(&vc).copied()
    }

    /// Effective virtual counterpart of a physical cell.
    pub fn virtual_of(&self, physical: &PhysicalCells, pc: PcId) -> Option<VcId> {
        if let Some(vc) = physical[pc].bound {
            if !self.vacated_physical.contains(&pc) {
                return Some(vc);
            }
        }
        self.pre_p2v.get(&pc).copied()
    }

    /// Effective priority of a physical cell: leaves held by a vacated group
    /// read as opportunistic, and interior cells as the max over children.
    pub fn effective_priority(&self, physical: &PhysicalCells, pc: PcId) -> CellPriority {
        if self.vacated_groups.is_empty() {
            return physical[pc].priority;
        }
        if physical[pc].children.is_empty() {
            return match &physical[pc].group {
                Some(group) if self.vacated_groups.contains(group) => CellPriority::OPPORTUNISTIC,
                _ => physical[pc].priority,
            };
        }
        physical[pc]
            .children
            .iter()
            .map(|&c| self.effective_priority(physical, c))
            .max()
            .unwrap_or(CellPriority::FREE)
    }

    /// Effective opportunistic used-GPU count: GPUs of vacated groups count as
    /// opportunistic so allocation steers away from them.
    pub fn opportunistic_used(&self, physical: &PhysicalCells, pc: PcId) -> i32 {
        if self.vacated_groups.is_empty() {
            return physical[pc]
                .used_gpus
                .get(&CellPriority::OPPORTUNISTIC)
                .copied()
                .unwrap_or(0);
        }
        if physical[pc].children.is_empty() {
            return match &physical[pc].group {
                Some(group)
                    if self.vacated_groups.contains(group)
                        && physical[pc].priority != CellPriority::FREE =>
                {
                    1
                }
                _ => physical[pc]
                    .used_gpus
                    .get(&CellPriority::OPPORTUNISTIC)
                    .copied()
                    .unwrap_or(0),
            };
        }
        physical[pc]
            .children
            .iter()
            .map(|&c| self.opportunistic_used(physical, c))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::opportunistic(-1, false)]
    #[case::deeply_negative(-5, false)]
    #[case::lowest_guaranteed(0, true)]
    #[case::highest_guaranteed(1000, true)]
    #[case::above_the_cap(4096, true)]
    fn pod_priorities_map_into_the_cell_range(#[case] pod_priority: i32, #[case] guaranteed: bool) {
        let priority = CellPriority::from_pod(pod_priority);
        assert_eq!(priority.is_guaranteed(), guaranteed);
        assert!(priority >= CellPriority::OPPORTUNISTIC);
        assert!(priority <= CellPriority::MAX_GUARANTEED);
    }

    /// Build a tiny physical tree: one level-2 cell over two GPUs on one node.
    fn two_gpu_tree() -> (PhysicalCells, PcId, Vec<PcId>) {
        let mut cells = PhysicalCells::default();
        let mut leaves = Vec::new();
        for i in 0..2 {
            leaves.push(cells.push(PhysicalCell {
                name: format!("ch/L1/{i}"),
                chain: "ch".to_string(),
                level: 1,
                parent: None,
                children: vec![],
                nodes: vec!["n1".to_string()],
                gpu_indices: vec![i],
                bound: None,
                split: false,
                reserved: false,
                priority: CellPriority::FREE,
                used_gpus: HashMap::new(),
                group: None,
            }));
        }
        let root = cells.push(PhysicalCell {
            name: "ch/L2/0".to_string(),
            chain: "ch".to_string(),
            level: 2,
            parent: None,
            children: leaves.clone(),
            nodes: vec!["n1".to_string()],
            gpu_indices: vec![0, 1],
            bound: None,
            split: false,
            reserved: false,
            priority: CellPriority::FREE,
            used_gpus: HashMap::new(),
            group: None,
        });
        for &leaf in &leaves {
            cells[leaf].parent = Some(root);
        }
        (cells, root, leaves)
    }

    #[test]
    fn priority_bubbles_up_and_recomputes_down() {
        let (mut cells, root, leaves) = two_gpu_tree();

        set_priority(&mut cells, leaves[0], CellPriority(100));
        assert_eq!(cells[root].priority, CellPriority(100), "parent takes child max");

        set_priority(&mut cells, leaves[1], CellPriority(50));
        assert_eq!(cells[root].priority, CellPriority(100), "lower sibling leaves max intact");

        set_priority(&mut cells, leaves[0], CellPriority::FREE);
        assert_eq!(
            cells[root].priority,
            CellPriority(50),
            "parent recomputes to remaining max when the dominating child drops"
        );

        set_priority(&mut cells, leaves[1], CellPriority::FREE);
        assert_eq!(cells[root].priority, CellPriority::FREE);
    }

    #[test]
    fn used_gpus_bubble_to_ancestors() {
        let (mut cells, root, leaves) = two_gpu_tree();
        let p = CellPriority(10);

        update_used_gpus(&mut cells, leaves[0], p, true);
        update_used_gpus(&mut cells, leaves[1], p, true);
        assert_eq!(cells[root].used_gpus.get(&p), Some(&2));

        update_used_gpus(&mut cells, leaves[0], p, false);
        assert_eq!(cells[root].used_gpus.get(&p), Some(&1));
        assert_eq!(cells[leaves[0]].used_gpus.get(&p), None, "zero entries are pruned");
    }

    #[test]
    fn chain_cell_list_removal_is_by_identity() {
        let mut list: ChainCellList<PcId> = ChainCellList::new(2);
        list.push(1, PcId(0));
        list.push(1, PcId(1));
        list.remove(1, PcId(0));
        assert_eq!(list.at(1), &[PcId(1)]);
        assert!(!list.contains(1, PcId(0)));
        assert!(list.contains(1, PcId(1)));
    }

    #[test]
    #[should_panic(expected = "not present")]
    fn chain_cell_list_remove_missing_panics() {
        let mut list: ChainCellList<PcId> = ChainCellList::new(1);
        list.remove(1, PcId(3));
    }
}
