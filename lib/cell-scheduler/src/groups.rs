// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registry of affinity groups that currently hold cells.
//!
//! A group is created when its first pod is committed, fills its slots as
//! pods bind, and is removed when the last slot empties. Placements hold cell
//! ids; the virtual placement is absent for opportunistic groups and dropped
//! on lazy preemption.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use crate::cell::{PcId, VcId};
use crate::protocols::{
    AffinityGroupMemberSnapshot, AffinityGroupSnapshot, AffinityGroupSpec, LazyPreemptionStatus,
    NodeName, PodBindInfo,
};

/// Placements indexed GPU count -> pod slot -> GPU slot.
pub(crate) type PhysicalPlacement = BTreeMap<i32, Vec<Vec<Option<PcId>>>>;
pub(crate) type VirtualPlacement = BTreeMap<i32, Vec<Vec<Option<VcId>>>>;

/// A pod occupying a slot of an affinity group.
#[derive(Debug, Clone)]
pub(crate) struct SlotPod {
    pub name: String,
    pub node: NodeName,
    pub bind_info: PodBindInfo,
}

#[derive(Debug)]
pub(crate) struct AffinityGroup {
    pub name: String,
    pub gang_release_enable: bool,
    pub lazy_preemption_enable: bool,
    pub lazy_preemption_status: Option<LazyPreemptionStatus>,
    /// Configured number of pods per GPU count, members merged.
    pub total_pod_counts: BTreeMap<i32, i32>,
    /// Bound pods per GPU count; `None` marks an empty slot.
    pub allocated_pods: BTreeMap<i32, Vec<Option<SlotPod>>>,
    pub physical_placement: PhysicalPlacement,
    pub virtual_placement: Option<VirtualPlacement>,
}

impl AffinityGroup {
    pub fn new(spec: &AffinityGroupSpec, gang_release_enable: bool, lazy_preemption_enable: bool) -> Self {
        let mut total_pod_counts: BTreeMap<i32, i32> = BTreeMap::new();
        for member in &spec.members {
            *total_pod_counts.entry(member.gpu_number).or_insert(0) += member.pod_number;
        }
        let mut allocated_pods = BTreeMap::new();
        let mut physical_placement: PhysicalPlacement = BTreeMap::new();
        let mut virtual_placement: VirtualPlacement = BTreeMap::new();
        for (&gpu_number, &pod_number) in &total_pod_counts {
            let pods = pod_number.max(0) as usize;
            let gpus = gpu_number.max(0) as usize;
            allocated_pods.insert(gpu_number, vec![None; pods]);
            physical_placement.insert(gpu_number, vec![vec![None; gpus]; pods]);
            virtual_placement.insert(gpu_number, vec![vec![None; gpus]; pods]);
        }
        Self {
            name: spec.name.clone(),
            gang_release_enable,
            lazy_preemption_enable,
            lazy_preemption_status: None,
            total_pod_counts,
            allocated_pods,
            physical_placement,
            virtual_placement: Some(virtual_placement),
        }
    }

    /// Index of the first empty slot for the given GPU count.
    pub fn first_empty_slot(&self, gpu_number: i32) -> Option<usize> {
        self.allocated_pods
            .get(&gpu_number)?
            .iter()
            .position(Option::is_none)
    }

    pub fn all_pods_released(&self) -> bool {
        self.allocated_pods
            .values()
            .all(|slots| slots.iter().all(Option::is_none))
    }

    pub fn snapshot(&self) -> AffinityGroupSnapshot {
        let members = self
            .allocated_pods
            .iter()
            .map(|(&gpu_number, slots)| AffinityGroupMemberSnapshot {
                gpu_number,
                pod_names: slots
                    .iter()
                    .map(|slot| slot.as_ref().map(|p| p.name.clone()))
                    .collect(),
                pod_placements: slots
                    .iter()
                    .enumerate()
                    .map(|(pod_index, slot)| {
                        slot.as_ref().and_then(|pod| {
                            pod.bind_info
                                .affinity_group_bind_info
                                .iter()
                                .find(|member| {
                                    member
                                        .pod_placements
                                        .first()
                                        .map(|p| p.physical_gpu_indices.len() as i32)
                                        == Some(gpu_number)
                                })
                                .and_then(|member| member.pod_placements.get(pod_index).cloned())
                        })
                    })
                    .collect(),
            })
            .collect();
        AffinityGroupSnapshot {
            name: self.name.clone(),
            gang_release_enable: self.gang_release_enable,
            lazy_preemption_enable: self.lazy_preemption_enable,
            lazy_preemption_status: self.lazy_preemption_status.clone(),
            members,
        }
    }
}

/// All affinity groups that have been allocated cells, indexed by name.
#[derive(Debug, Default)]
pub(crate) struct GroupRegistry {
    groups: HashMap<String, AffinityGroup>,
}

impl GroupRegistry {
    pub fn get(&self, name: &str) -> Option<&AffinityGroup> {
        self.groups.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut AffinityGroup> {
        self.groups.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn insert(&mut self, group: AffinityGroup) {
        self.groups.insert(group.name.clone(), group);
    }

    pub fn remove(&mut self, name: &str) -> Option<AffinityGroup> {
        self.groups.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AffinityGroup> {
        self.groups.values()
    }

    /// Drop and return a group's virtual placement, the first half of lazy
    /// preemption. Returns `None` when the group is unknown or already has no
    /// virtual placement.
    pub fn take_virtual_placement(&mut self, name: &str) -> Option<VirtualPlacement> {
        self.groups.get_mut(name)?.virtual_placement.take()
    }

    /// Record who lazily preempted a group and when.
    pub fn mark_lazy_preempted(&mut self, name: &str, preemptor: &str) {
        if let Some(group) = self.groups.get_mut(name) {
            group.lazy_preemption_status = Some(LazyPreemptionStatus {
                preemptor: preemptor.to_string(),
                preemption_time: SystemTime::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::AffinityGroupMemberSpec;

    fn spec() -> AffinityGroupSpec {
        AffinityGroupSpec {
            name: "g1".to_string(),
            members: vec![
                AffinityGroupMemberSpec { gpu_number: 2, pod_number: 2 },
                AffinityGroupMemberSpec { gpu_number: 2, pod_number: 1 },
                AffinityGroupMemberSpec { gpu_number: 4, pod_number: 1 },
            ],
        }
    }

    #[test]
    fn members_with_equal_gpu_count_merge() {
        let group = AffinityGroup::new(&spec(), false, false);
        assert_eq!(group.total_pod_counts[&2], 3);
        assert_eq!(group.allocated_pods[&2].len(), 3);
        assert_eq!(group.physical_placement[&4][0].len(), 4);
    }

    #[test]
    fn slot_tracking() {
        let mut group = AffinityGroup::new(&spec(), false, false);
        assert_eq!(group.first_empty_slot(2), Some(0));
        assert!(group.all_pods_released());

        group.allocated_pods.get_mut(&2).unwrap()[0] = Some(SlotPod {
            name: "p1".to_string(),
            node: "n1".to_string(),
            bind_info: PodBindInfo {
                node: "n1".to_string(),
                gpu_isolation: vec![0, 1],
                cell_chain: "ch".to_string(),
                affinity_group_bind_info: vec![],
            },
        });
        assert_eq!(group.first_empty_slot(2), Some(1));
        assert_eq!(group.first_empty_slot(8), None, "unknown GPU count has no slots");
        assert!(!group.all_pods_released());
    }

    #[test]
    fn lazy_preemption_bookkeeping() {
        let mut registry = GroupRegistry::default();
        registry.insert(AffinityGroup::new(&spec(), false, true));

        let taken = registry.take_virtual_placement("g1");
        assert!(taken.is_some());
        assert!(registry.take_virtual_placement("g1").is_none(), "second take is empty");

        registry.mark_lazy_preempted("g1", "g2");
        let status = registry.get("g1").unwrap().lazy_preemption_status.as_ref();
        assert_eq!(status.unwrap().preemptor, "g2");
    }
}
