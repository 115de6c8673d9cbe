// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The core scheduler: a single lock-fused aggregate that accepts scheduling
//! requests, maps virtual-cluster placements onto physical cells, and commits
//! or releases resources as pods bind and terminate.
//!
//! `schedule` is free of authoritative side effects: everything it learns
//! while mapping lives in a call-scoped overlay that dies with the call. Only
//! `add_allocated_pod` and `delete_allocated_pod` mutate the trees, the free
//! lists, and the group registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::time::SystemTime;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::buddy;
use crate::cell::{
    bind_cell, set_priority, unbind_cell, update_used_gpus, CellLevel, CellPriority,
    ChainCellList, PcId, PhysicalCell, PhysicalCells, ScheduleOverlay, VcId, VirtualCell,
    VirtualCells, LOWEST_LEVEL,
};
use crate::config::{ClusterConfig, PhysicalCellConfig};
use crate::errors::{Result, SchedulerError};
use crate::groups::{
    AffinityGroup, GroupRegistry, PhysicalPlacement, SlotPod, VirtualPlacement,
};
use crate::placer::{self, GroupLeaves, PhysicalView};
use crate::protocols::{
    AffinityGroupSnapshot, AllocatedPod, CellChain, CellTypeName, LazyPreemptionStatus, NodeName,
    PodPlacementInfo, PodRequest, PodScheduleResult, PodSchedulingSpec, ReservationId,
    VirtualClusterName,
};
use crate::result::{self, ResultContext};
use crate::vc::IntraVcScheduler;

/// The hierarchical GPU cluster scheduler.
///
/// All mutating operations serialize on the internal write lock; the snapshot
/// getters take the read lock. There are no suspension points while the lock
/// is held.
pub struct Scheduler {
    inner: RwLock<Core>,
}

impl Scheduler {
    /// Build the scheduler from the parsed cluster configuration.
    ///
    /// Panics when the configuration is inconsistent: unknown chains in VC
    /// quotas, quotas that do not fit the physical cells, malformed cell
    /// hierarchies or reservation paths. A misconfigured scheduler must not
    /// start.
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            inner: RwLock::new(Core::new(config)),
        }
    }

    /// Decide where a pod should run: a bind instruction, a list of pods to
    /// preempt first, or a reason to wait. Does not commit any resources.
    pub fn schedule(
        &self,
        pod: &PodRequest,
        suggested_nodes: &[NodeName],
    ) -> Result<PodScheduleResult> {
        self.inner
            .write()
            .expect("scheduler lock poisoned")
            .schedule(pod, suggested_nodes)
    }

    /// Commit the resources of a pod the orchestrator has bound.
    pub fn add_allocated_pod(&self, pod: &AllocatedPod) -> Result<()> {
        self.inner
            .write()
            .expect("scheduler lock poisoned")
            .add_allocated_pod(pod)
    }

    /// Release the resources of a deleted pod (or of its whole group, when
    /// the group gang-releases).
    pub fn delete_allocated_pod(&self, pod: &AllocatedPod) -> Result<()> {
        self.inner
            .write()
            .expect("scheduler lock poisoned")
            .delete_allocated_pod(pod)
    }

    /// Snapshot of one registered affinity group.
    pub fn affinity_group(&self, name: &str) -> Result<AffinityGroupSnapshot> {
        self.inner
            .read()
            .expect("scheduler lock poisoned")
            .affinity_group(name)
    }

    /// Snapshots of all registered affinity groups, ordered by name.
    pub fn affinity_groups(&self) -> Vec<AffinityGroupSnapshot> {
        self.inner
            .read()
            .expect("scheduler lock poisoned")
            .affinity_groups()
    }
}

/// A request being scheduled: one affinity group, members merged by GPU count.
#[derive(Debug, Clone)]
struct SchedulingRequest {
    vc: VirtualClusterName,
    chain: CellChain,
    reservation_id: Option<ReservationId>,
    priority: CellPriority,
    pod_counts: BTreeMap<i32, i32>,
}

pub(crate) struct Core {
    physical: PhysicalCells,
    virtual_cells: VirtualCells,
    /// Scheduler per virtual cluster.
    vc_schedulers: HashMap<VirtualClusterName, IntraVcScheduler>,
    /// Chains in configuration order; all chain iteration follows it.
    chain_order: Vec<CellChain>,
    /// Every physical cell of each chain, all levels.
    full_cells: HashMap<CellChain, ChainCellList<PcId>>,
    /// Free physical cells of each chain, maintained by the buddy allocator.
    free_cells: HashMap<CellChain, ChainCellList<PcId>>,
    /// GPU type -> chains carrying it, in configuration order.
    chains_by_gpu_type: HashMap<String, Vec<CellChain>>,
    /// Chain -> level -> cell type name.
    cell_types: HashMap<CellChain, HashMap<CellLevel, CellTypeName>>,
    /// Number of children of a cell at each level of a chain (levels >= 2).
    arity: HashMap<CellChain, Vec<usize>>,
    /// VC -> reservation id -> reserved physical cell.
    reserved_physical: HashMap<VirtualClusterName, HashMap<ReservationId, PcId>>,
    groups: GroupRegistry,
    rng: StdRng,
}

impl Core {
    fn new(config: &ClusterConfig) -> Self {
        let mut core = Core {
            physical: PhysicalCells::default(),
            virtual_cells: VirtualCells::default(),
            vc_schedulers: HashMap::new(),
            chain_order: Vec::new(),
            full_cells: HashMap::new(),
            free_cells: HashMap::new(),
            chains_by_gpu_type: HashMap::new(),
            cell_types: HashMap::new(),
            arity: HashMap::new(),
            reserved_physical: HashMap::new(),
            groups: GroupRegistry::default(),
            rng: match config.random_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            },
        };
        core.build_chains(config);
        core.build_virtual_clusters(config);
        core.validate_initial_assignment(config);
        core.init_free_cells();
        core.init_reservations(config);
        core
    }

    fn build_chains(&mut self, config: &ClusterConfig) {
        for chain_config in &config.chains {
            let chain = &chain_config.name;
            assert!(
                !self.full_cells.contains_key(chain),
                "chain {chain} configured more than once"
            );
            assert!(
                !chain_config.top_cells.is_empty(),
                "chain {chain} has no cells"
            );
            let top_level = chain_config.top_cells[0].level();
            for cell in &chain_config.top_cells {
                assert_eq!(
                    cell.level(),
                    top_level,
                    "chain {chain} mixes top cells of different depths"
                );
            }
            assert_eq!(
                chain_config.level_types.len() as CellLevel,
                top_level,
                "chain {chain} declares {} level types but its cells have {top_level} levels",
                chain_config.level_types.len()
            );

            let mut list = ChainCellList::new(top_level);
            let mut ordinals = vec![0u32; top_level as usize];
            for cell_config in &chain_config.top_cells {
                build_physical_cell(
                    &mut self.physical,
                    &mut list,
                    &mut ordinals,
                    chain,
                    cell_config,
                );
            }

            // A chain is homogeneous: cells at one level all have the same
            // number of children, which the virtual trees mirror.
            let mut arity = vec![0usize; (top_level + 1) as usize];
            for level in 2..=top_level {
                let cells_at_level = list.at(level);
                let expected = self.physical[cells_at_level[0]].children.len();
                for &cell in cells_at_level {
                    assert_eq!(
                        self.physical[cell].children.len(),
                        expected,
                        "chain {chain} is not homogeneous at level {level}"
                    );
                }
                arity[level as usize] = expected;
            }

            self.cell_types.insert(
                chain.clone(),
                chain_config
                    .level_types
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (i as CellLevel + 1, t.clone()))
                    .collect(),
            );
            self.chains_by_gpu_type
                .entry(chain_config.gpu_type.clone())
                .or_default()
                .push(chain.clone());
            self.chain_order.push(chain.clone());
            self.arity.insert(chain.clone(), arity);
            self.full_cells.insert(chain.clone(), list);
        }
    }

    fn build_virtual_clusters(&mut self, config: &ClusterConfig) {
        for vc_config in &config.virtual_clusters {
            let vc = &vc_config.name;
            assert!(
                !self.vc_schedulers.contains_key(vc),
                "virtual cluster {vc} configured more than once"
            );
            let mut scheduler = IntraVcScheduler::new(vc.clone());
            let mut ordinals: HashMap<CellChain, Vec<u32>> = HashMap::new();

            for quota in &vc_config.quotas {
                let chain = &quota.chain;
                let Some(full) = self.full_cells.get(chain) else {
                    panic!("chain {chain} in virtual cluster {vc} does not exist in the physical cluster");
                };
                let top_level = full.top_level();
                assert!(
                    quota.level >= LOWEST_LEVEL && quota.level <= top_level,
                    "virtual cluster {vc} requests level {} cells on chain {chain} which has {top_level} levels",
                    quota.level
                );
                let arity = self.arity[chain].clone();
                let list = scheduler
                    .non_reserved
                    .entry(chain.clone())
                    .or_insert_with(|| ChainCellList::new(top_level));
                let chain_ordinals = ordinals
                    .entry(chain.clone())
                    .or_insert_with(|| vec![0; top_level as usize]);
                for _ in 0..quota.count {
                    build_virtual_subtree(
                        &mut self.virtual_cells,
                        list,
                        chain_ordinals,
                        vc,
                        chain,
                        quota.level,
                        &arity,
                    );
                }
            }

            let mut reserved_cells: HashMap<ReservationId, PcId> = HashMap::new();
            for reservation in &vc_config.reservations {
                let chain = &reservation.chain;
                let Some(full) = self.full_cells.get(chain) else {
                    panic!("chain {chain} in reservation {} does not exist in the physical cluster", reservation.id);
                };
                assert!(
                    !scheduler.reserved.contains_key(&reservation.id),
                    "reservation {} configured more than once in virtual cluster {vc}",
                    reservation.id
                );
                let pc = resolve_cell_path(&self.physical, full, &reservation.cell_path)
                    .unwrap_or_else(|| {
                        panic!("reservation {} has an invalid cell path", reservation.id)
                    });
                assert!(
                    !self.physical[pc].reserved,
                    "cell {} reserved more than once",
                    self.physical[pc].name
                );
                self.physical[pc].reserved = true;
                let level = self.physical[pc].level;
                let arity = self.arity[chain].clone();
                let mut list = ChainCellList::new(level);
                let chain_ordinals = ordinals
                    .entry(chain.clone())
                    .or_insert_with(|| vec![0; full.top_level() as usize]);
                build_virtual_subtree(
                    &mut self.virtual_cells,
                    &mut list,
                    chain_ordinals,
                    vc,
                    chain,
                    level,
                    &arity,
                );
                scheduler.reserved.insert(reservation.id.clone(), list);
                reserved_cells.insert(reservation.id.clone(), pc);
            }

            self.reserved_physical.insert(vc.clone(), reserved_cells);
            self.vc_schedulers.insert(vc.clone(), scheduler);
        }
    }

    /// The initial cell assignment of all VCs (quotas plus reservations) must
    /// fit the physical cells of each chain, accounting for the splits that
    /// higher-level assignments force on lower levels.
    fn validate_initial_assignment(&self, config: &ClusterConfig) {
        let mut total_quota: HashMap<CellChain, HashMap<CellLevel, i32>> = HashMap::new();
        for vc_config in &config.virtual_clusters {
            for quota in &vc_config.quotas {
                *total_quota
                    .entry(quota.chain.clone())
                    .or_default()
                    .entry(quota.level)
                    .or_insert(0) += quota.count;
            }
            for reservation in &vc_config.reservations {
                let pc = self.reserved_physical[&vc_config.name][&reservation.id];
                *total_quota
                    .entry(reservation.chain.clone())
                    .or_default()
                    .entry(self.physical[pc].level)
                    .or_insert(0) += 1;
            }
        }
        for (chain, chain_quota) in &total_quota {
            let full = &self.full_cells[chain];
            let top_level = full.top_level();
            let mut available = full.at(top_level).len() as i32;
            for level in (LOWEST_LEVEL..=top_level).rev() {
                let needed = chain_quota.get(&level).copied().unwrap_or(0);
                let left = available - needed;
                assert!(
                    left >= 0,
                    "insufficient physical cells at chain {chain} level {level}: {needed} needed, {available} available"
                );
                if level > LOWEST_LEVEL {
                    available = left * self.arity[chain][level as usize] as i32;
                }
            }
        }
    }

    /// The free list of a chain starts as its top-level cells.
    fn init_free_cells(&mut self) {
        for (chain, full) in &self.full_cells {
            let top_level = full.top_level();
            let mut free = ChainCellList::new(top_level);
            for &cell in full.at(top_level) {
                free.push(top_level, cell);
            }
            self.free_cells.insert(chain.clone(), free);
        }
    }

    /// Reservations are static bindings: the reserved physical cell leaves
    /// the free list for good and is pinned to the reservation's virtual
    /// cell. Release never unwinds past it.
    fn init_reservations(&mut self, config: &ClusterConfig) {
        for vc_config in &config.virtual_clusters {
            for reservation in &vc_config.reservations {
                let pc = self.reserved_physical[&vc_config.name][&reservation.id];
                let chain = self.physical[pc].chain.clone();
                buddy::remove_from_free_list(
                    &mut self.physical,
                    self.free_cells
                        .get_mut(&chain)
                        .expect("reserved chain must have a free list"),
                    pc,
                );
                let list = &self.vc_schedulers[&vc_config.name].reserved[&reservation.id];
                let root = list.at(list.top_level())[0];
                self.virtual_cells[root].bound = Some(pc);
                self.physical[pc].bound = Some(root);
                tracing::info!(
                    virtual_cell = %self.virtual_cells[root].name,
                    physical_cell = %self.physical[pc].name,
                    "cells bound (reservation)"
                );
            }
        }
    }

    fn schedule(
        &mut self,
        pod: &PodRequest,
        suggested_nodes: &[NodeName],
    ) -> Result<PodScheduleResult> {
        let spec = &pod.spec;
        let priority = CellPriority::from_pod(spec.priority);
        let suggested: HashSet<NodeName> = suggested_nodes.iter().cloned().collect();
        tracing::info!(pod = %pod.name, group = %spec.affinity_group.name, "scheduling pod");

        let mut current_pod_index = 0usize;
        let group_exists = self.groups.contains(&spec.affinity_group.name);
        let (physical_placement, virtual_placement) = if group_exists {
            let group = self
                .groups
                .get(&spec.affinity_group.name)
                .expect("group existence was just checked");
            tracing::info!(pod = %pod.name, group = %group.name, "pod from existing affinity group");
            let Some(slot) = group.first_empty_slot(spec.gpu_number) else {
                return Err(SchedulerError::PodCountExceeded {
                    gpu_number: spec.gpu_number,
                    pod_number: group
                        .total_pod_counts
                        .get(&spec.gpu_number)
                        .copied()
                        .unwrap_or(0),
                    group: group.name.clone(),
                });
            };
            current_pod_index = slot;
            (
                Some(group.physical_placement.clone()),
                group.virtual_placement.clone(),
            )
        } else {
            tracing::info!(
                pod = %pod.name,
                group = %spec.affinity_group.name,
                "scheduling new affinity group"
            );
            self.schedule_new_group(spec, priority, &suggested)?
        };

        let context = ResultContext {
            physical: &self.physical,
            virtual_cells: &self.virtual_cells,
            cell_types: &self.cell_types,
            groups: &self.groups,
            suggested: &suggested,
        };
        Ok(result::generate_pod_schedule_result(
            &context,
            physical_placement.as_ref(),
            virtual_placement.as_ref(),
            priority,
            spec.gpu_number,
            current_pod_index,
            self.groups.get(&spec.affinity_group.name),
            &spec.affinity_group.name,
            &spec.virtual_cluster,
            &pod.name,
            &mut self.rng,
        ))
    }

    /// Place a group seen for the first time: validate the request, pick a
    /// chain, and run either the guaranteed (intra-VC plus mapping) or the
    /// opportunistic path. No authoritative state changes.
    fn schedule_new_group(
        &self,
        spec: &PodSchedulingSpec,
        priority: CellPriority,
        suggested: &HashSet<NodeName>,
    ) -> Result<(Option<PhysicalPlacement>, Option<VirtualPlacement>)> {
        let mut pod_counts: BTreeMap<i32, i32> = BTreeMap::new();
        for member in &spec.affinity_group.members {
            *pod_counts.entry(member.gpu_number).or_insert(0) += member.pod_number;
        }
        let mut request = SchedulingRequest {
            vc: spec.virtual_cluster.clone(),
            chain: CellChain::new(),
            reservation_id: spec.reservation_id.clone(),
            priority,
            pod_counts,
        };
        self.validate_scheduling_request(&request)?;

        let placement = if let Some(reservation_id) = request.reservation_id.clone() {
            tracing::info!(reservation = %reservation_id, "using reservation");
            let pc = self.reserved_physical[&request.vc][&reservation_id];
            request.chain = self.physical[pc].chain.clone();
            self.process_scheduling_request(&request, suggested)
        } else {
            self.schedule_for_gpu_type(&mut request, spec.gpu_type.as_deref(), suggested)?
        };
        match &placement {
            Some(_) => {
                tracing::info!(group = %spec.affinity_group.name, "succeeded in scheduling group")
            }
            None => tracing::info!(group = %spec.affinity_group.name, "failed to schedule group"),
        }
        Ok(match placement {
            Some((physical, virtual_placement)) => (Some(physical), virtual_placement),
            None => (None, None),
        })
    }

    fn validate_scheduling_request(&self, request: &SchedulingRequest) -> Result<()> {
        let Some(vc_scheduler) = self.vc_schedulers.get(&request.vc) else {
            return Err(SchedulerError::VirtualClusterNotFound(request.vc.clone()));
        };
        if let Some(reservation_id) = &request.reservation_id {
            if !vc_scheduler.reserved.contains_key(reservation_id) {
                return Err(SchedulerError::ReservationNotFound {
                    vc: request.vc.clone(),
                    reservation: reservation_id.clone(),
                });
            }
            if !request.priority.is_guaranteed() {
                return Err(SchedulerError::OpportunisticReservation(
                    reservation_id.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Try chains carrying the requested GPU type (or all chains when no type
    /// is given) in configuration order; the first success wins.
    fn schedule_for_gpu_type(
        &self,
        request: &mut SchedulingRequest,
        gpu_type: Option<&str>,
        suggested: &HashSet<NodeName>,
    ) -> Result<Option<(PhysicalPlacement, Option<VirtualPlacement>)>> {
        if let Some(gpu_type) = gpu_type {
            let Some(chains) = self.chains_by_gpu_type.get(gpu_type) else {
                return Err(SchedulerError::GpuTypeNotFound(gpu_type.to_string()));
            };
            let mut vc_has_type = false;
            for chain in chains {
                if self.vc_schedulers[&request.vc]
                    .non_reserved
                    .contains_key(chain)
                {
                    vc_has_type = true;
                }
                request.chain = chain.clone();
                if let Some(placement) = self.process_scheduling_request(request, suggested) {
                    return Ok(Some(placement));
                }
            }
            if request.priority.is_guaranteed() && !vc_has_type {
                return Err(SchedulerError::GpuTypeNotInVc {
                    gpu_type: gpu_type.to_string(),
                    vc: request.vc.clone(),
                });
            }
            Ok(None)
        } else {
            for chain in &self.chain_order {
                request.chain = chain.clone();
                if let Some(placement) = self.process_scheduling_request(request, suggested) {
                    return Ok(Some(placement));
                }
            }
            Ok(None)
        }
    }

    fn process_scheduling_request(
        &self,
        request: &SchedulingRequest,
        suggested: &HashSet<NodeName>,
    ) -> Option<(PhysicalPlacement, Option<VirtualPlacement>)> {
        if request.priority.is_guaranteed() {
            self.schedule_guaranteed_group(request, suggested)
                .map(|(physical, virtual_placement)| (physical, Some(virtual_placement)))
        } else {
            self.schedule_opportunistic_group(request, suggested)
                .map(|physical| (physical, None))
        }
    }

    /// Schedule a guaranteed group in its VC, then map the virtual placement
    /// onto physical cells: reuse existing (or pre-) bindings of the
    /// pre-assigned ancestors, buddy-allocate fresh ones from a scratch free
    /// list, and descend with the fewest-opportunistic rule. A group found
    /// bound to the chosen virtual cells at a lower priority with lazy
    /// preemption enabled is recorded as vacated in the overlay; the actual
    /// preemption runs when the placement is committed.
    fn schedule_guaranteed_group(
        &self,
        request: &SchedulingRequest,
        suggested: &HashSet<NodeName>,
    ) -> Option<(PhysicalPlacement, VirtualPlacement)> {
        let vc_scheduler = self
            .vc_schedulers
            .get(&request.vc)
            .expect("request was validated against a known VC");
        let virtual_leaves: GroupLeaves<VcId> = vc_scheduler.schedule(
            &self.virtual_cells,
            &request.chain,
            request.reservation_id.as_ref(),
            &request.pod_counts,
            request.priority,
            suggested,
        )?;

        let mut overlay = ScheduleOverlay::default();
        let mut physical_placement: PhysicalPlacement = BTreeMap::new();
        for (&gpu_number, pods) in &virtual_leaves {
            let mut pod_cells = Vec::with_capacity(pods.len());
            for pod_gpus in pods {
                let mut gpu_cells = Vec::with_capacity(pod_gpus.len());
                for &virtual_gpu in pod_gpus {
                    if let Some(bound) = self.virtual_cells[virtual_gpu].bound {
                        if !overlay.vacated_virtual.contains(&virtual_gpu) {
                            if let Some(victim) = self.physical[bound].group.clone() {
                                let lazy_enabled = self
                                    .groups
                                    .get(&victim)
                                    .is_some_and(|g| g.lazy_preemption_enable);
                                if lazy_enabled {
                                    self.record_lazy_preemption(&mut overlay, &victim);
                                }
                            }
                        }
                    }
                    let preassigned = self.virtual_cells[virtual_gpu].pre_assigned;
                    if overlay
                        .physical_of(&self.virtual_cells, preassigned)
                        .is_none()
                    {
                        let level = self.virtual_cells[preassigned].level;
                        let authoritative = self
                            .free_cells
                            .get(&request.chain)
                            .expect("every chain has a free list");
                        let mut scratch = buddy::scratch_free_list(
                            &self.physical,
                            authoritative,
                            &request.chain,
                            &overlay,
                        );
                        let Some(pc) =
                            buddy::allocate(&self.physical, &mut scratch, level, suggested, &overlay)
                        else {
                            panic!(
                                "VC safety broken: cannot find a physical cell for virtual cell {}",
                                self.virtual_cells[preassigned].name
                            );
                        };
                        overlay.pre_bind(preassigned, pc);
                    }
                    let physical_gpu =
                        self.map_non_preassigned_to_physical(virtual_gpu, suggested, &mut overlay);
                    gpu_cells.push(Some(physical_gpu));
                }
                pod_cells.push(gpu_cells);
            }
            physical_placement.insert(gpu_number, pod_cells);
        }
        // The overlay, and with it every pre-binding, dies here.
        let virtual_placement: VirtualPlacement = virtual_leaves
            .into_iter()
            .map(|(gpu_number, pods)| {
                (
                    gpu_number,
                    pods.into_iter()
                        .map(|pod| pod.into_iter().map(Some).collect())
                        .collect(),
                )
            })
            .collect();
        Some((physical_placement, virtual_placement))
    }

    /// Record a group for lazy preemption: mark every binding it holds as
    /// vacated in the overlay, walking upward exactly as release would, so the
    /// rest of the mapping sees the state the commit will produce.
    fn record_lazy_preemption(&self, overlay: &mut ScheduleOverlay, victim: &str) {
        if !overlay.vacated_groups.insert(victim.to_string()) {
            return;
        }
        tracing::debug!(group = victim, "recording group for lazy preemption");
        let Some(victim_group) = self.groups.get(victim) else {
            return;
        };
        let Some(virtual_placement) = &victim_group.virtual_placement else {
            return;
        };
        for pods in virtual_placement.values() {
            for pod in pods {
                for &leaf in pod.iter().flatten() {
                    if self.virtual_cells[leaf].bound.is_none() {
                        continue;
                    }
                    let mut cell = leaf;
                    loop {
                        let bound = self.virtual_cells[cell]
                            .bound
                            .expect("virtually placed cell must be bound");
                        if self.physical[bound].reserved {
                            break;
                        }
                        overlay.vacated_virtual.insert(cell);
                        overlay.vacated_physical.insert(bound);
                        if cell == self.virtual_cells[cell].pre_assigned {
                            overlay.freed_roots.push(bound);
                            break;
                        }
                        let Some(parent) = self.virtual_cells[cell].parent else {
                            break;
                        };
                        let sibling_still_bound = self.virtual_cells[parent]
                            .children
                            .iter()
                            .any(|&c| {
                                self.virtual_cells[c].bound.is_some()
                                    && !overlay.vacated_virtual.contains(&c)
                            });
                        if sibling_still_bound {
                            break;
                        }
                        cell = parent;
                    }
                }
            }
        }
    }

    /// Map a virtual cell inside a pre-assigned subtree to a physical cell of
    /// the bound subtree, memoized through the overlay's pre-bindings.
    fn map_non_preassigned_to_physical(
        &self,
        virtual_cell: VcId,
        suggested: &HashSet<NodeName>,
        overlay: &mut ScheduleOverlay,
    ) -> PcId {
        if let Some(pc) = overlay.physical_of(&self.virtual_cells, virtual_cell) {
            return pc;
        }
        let parent = self.virtual_cells[virtual_cell]
            .parent
            .expect("cell below its pre-assigned ancestor must have a parent");
        let parent_physical = self.map_non_preassigned_to_physical(parent, suggested, overlay);
        let chosen = buddy::fewest_opportunistic(
            &self.physical,
            &self.physical[parent_physical].children,
            suggested,
            overlay,
        );
        match chosen {
            Some(pc) if buddy::mappable(overlay.effective_priority(&self.physical, pc)) => {
                overlay.pre_bind(virtual_cell, pc);
                pc
            }
            _ => panic!(
                "VC safety broken: cannot find a physical cell for virtual cell {}",
                self.virtual_cells[virtual_cell].name
            ),
        }
    }

    /// Opportunistic groups place directly on the chain's physical cells,
    /// below every non-free priority. They never touch VC quota.
    fn schedule_opportunistic_group(
        &self,
        request: &SchedulingRequest,
        suggested: &HashSet<NodeName>,
    ) -> Option<PhysicalPlacement> {
        let list = self.full_cells.get(&request.chain)?;
        let placement = placer::place(
            &PhysicalView {
                cells: &self.physical,
            },
            list,
            &request.pod_counts,
            CellPriority::OPPORTUNISTIC,
            suggested,
        );
        match placement {
            Some(leaves) => {
                tracing::info!(
                    chain = %request.chain,
                    pod_counts = ?request.pod_counts,
                    "placed opportunistic request in the physical cluster"
                );
                Some(
                    leaves
                        .into_iter()
                        .map(|(gpu_number, pods)| {
                            (
                                gpu_number,
                                pods.into_iter()
                                    .map(|pod| pod.into_iter().map(Some).collect())
                                    .collect(),
                            )
                        })
                        .collect(),
                )
            }
            None => {
                tracing::info!(
                    chain = %request.chain,
                    pod_counts = ?request.pod_counts,
                    "insufficient capacity in the physical cluster for opportunistic request"
                );
                None
            }
        }
    }

    fn add_allocated_pod(&mut self, pod: &AllocatedPod) -> Result<()> {
        let spec = &pod.spec;
        let info = &pod.bind_info;
        let priority = CellPriority::from_pod(spec.priority);
        let group_name = spec.affinity_group.name.clone();
        tracing::info!(
            pod = %pod.name,
            node = %info.node,
            gpus = ?info.gpu_isolation,
            group = %group_name,
            "adding allocated pod"
        );

        let pod_index = if self.groups.contains(&group_name) {
            match self.readd_allocated_pod(pod, priority) {
                Some(index) => index,
                None => return Ok(()),
            }
        } else {
            self.create_allocated_group(pod, priority);
            match find_bind_info_slot(info, spec.gpu_number) {
                Some(index) => index,
                None => {
                    tracing::warn!(
                        pod = %pod.name,
                        "pod placement not found in its own bind info; using the first slot"
                    );
                    0
                }
            }
        };

        let group = self
            .groups
            .get_mut(&group_name)
            .expect("group must exist after the add path");
        let slots = group
            .allocated_pods
            .get_mut(&spec.gpu_number)
            .expect("bind info GPU count not declared by the affinity group");
        slots[pod_index] = Some(SlotPod {
            name: pod.name.clone(),
            node: info.node.clone(),
            bind_info: info.clone(),
        });
        Ok(())
    }

    /// Create the registry entry for a group whose first pod is binding, and
    /// confirm the entire placement agreement recorded in the bind info.
    fn create_allocated_group(&mut self, pod: &AllocatedPod, priority: CellPriority) {
        let spec = &pod.spec;
        let info = &pod.bind_info;
        let mut new_group = AffinityGroup::new(
            &spec.affinity_group,
            spec.gang_release_enable,
            spec.lazy_preemption_enable,
        );
        let mut should_lazy_preempt = false;

        for member in &info.affinity_group_bind_info {
            let Some(first) = member.pod_placements.first() else {
                continue;
            };
            let gpu_number = first.physical_gpu_indices.len() as i32;
            for (pod_index, placement) in member.pod_placements.iter().enumerate() {
                for gpu_index in 0..placement.physical_gpu_indices.len() {
                    let (physical_gpu, virtual_gpu, lazy_preempt) = self.find_allocated_gpu(
                        gpu_index,
                        placement,
                        &info.cell_chain,
                        &placement.physical_node,
                        should_lazy_preempt,
                        spec,
                        new_group.virtual_placement.is_some(),
                        &pod.name,
                    );
                    let Some(physical_gpu) = physical_gpu else {
                        break;
                    };
                    new_group
                        .physical_placement
                        .get_mut(&gpu_number)
                        .expect("bind info GPU count not declared by the affinity group")
                        [pod_index][gpu_index] = Some(physical_gpu);
                    match lazy_preempt {
                        None => {
                            // The placement carries no quota accounting: the
                            // group is opportunistic.
                            new_group.virtual_placement = None;
                        }
                        Some(lazy) => {
                            if let Some(virtual_gpu) = virtual_gpu {
                                if let Some(virtual_placement) = &mut new_group.virtual_placement {
                                    virtual_placement
                                        .get_mut(&gpu_number)
                                        .expect("bind info GPU count not declared by the affinity group")
                                        [pod_index][gpu_index] = Some(virtual_gpu);
                                }
                                if let Some(victim) =
                                    self.conflicting_group(virtual_gpu, physical_gpu)
                                {
                                    if victim != new_group.name {
                                        self.lazy_preempt_group(&victim, &new_group.name);
                                    }
                                }
                            } else {
                                should_lazy_preempt = should_lazy_preempt || lazy;
                            }
                        }
                    }
                    self.confirm_allocated_gpu(physical_gpu, virtual_gpu, priority, &new_group.name);
                }
            }
        }

        if should_lazy_preempt {
            // The group's own quota accounting could not be reconstructed:
            // it keeps its physical cells as an opportunistic workload.
            if let Some(virtual_placement) = new_group.virtual_placement.take() {
                self.vacate_virtual_placement(&virtual_placement, &new_group.name);
            }
            new_group.lazy_preemption_status = Some(LazyPreemptionStatus {
                preemptor: new_group.name.clone(),
                preemption_time: SystemTime::now(),
            });
            tracing::info!(group = %new_group.name, "group re-added without a virtual placement; downgraded to opportunistic");
        }
        tracing::info!(pod = %pod.name, group = %new_group.name, "new affinity group created");
        self.groups.insert(new_group);
    }

    /// Confirm a pod of an existing group. When the pod was previously added
    /// and deleted, its cells carry no group anymore and the confirmation is
    /// re-executed. Returns the pod's slot, or `None` when the bind info no
    /// longer matches anything.
    fn readd_allocated_pod(&mut self, pod: &AllocatedPod, priority: CellPriority) -> Option<usize> {
        let spec = &pod.spec;
        let info = &pod.bind_info;
        let group_name = &spec.affinity_group.name;
        for member in &info.affinity_group_bind_info {
            let Some(first) = member.pod_placements.first() else {
                continue;
            };
            if first.physical_gpu_indices.len() as i32 != spec.gpu_number {
                continue;
            }
            let first_gpu = info.gpu_isolation.first().copied().unwrap_or(-1);
            let Some(pod_index) = find_pod_index(&member.pod_placements, &info.node, first_gpu)
            else {
                tracing::error!(
                    pod = %pod.name,
                    group = %group_name,
                    node = %info.node,
                    gpus = ?info.gpu_isolation,
                    "pod placement not found in its group"
                );
                return None;
            };
            let placement = member.pod_placements[pod_index].clone();
            for gpu_index in 0..placement.physical_gpu_indices.len() {
                let has_virtual = self
                    .groups
                    .get(group_name)
                    .is_some_and(|g| g.virtual_placement.is_some());
                let (physical_gpu, virtual_gpu, _) = self.find_allocated_gpu(
                    gpu_index,
                    &placement,
                    &info.cell_chain,
                    &info.node,
                    false,
                    spec,
                    has_virtual,
                    &pod.name,
                );
                let Some(physical_gpu) = physical_gpu else {
                    break;
                };
                if self.physical[physical_gpu].group.is_none() {
                    if let Some(virtual_gpu) = virtual_gpu {
                        if let Some(victim) = self.conflicting_group(virtual_gpu, physical_gpu) {
                            if victim != *group_name {
                                self.lazy_preempt_group(&victim, group_name);
                            }
                        }
                    }
                    self.confirm_allocated_gpu(physical_gpu, virtual_gpu, priority, group_name);
                }
            }
            return Some(pod_index);
        }
        tracing::error!(
            pod = %pod.name,
            group = %group_name,
            "no bind info entry matches the pod's GPU count"
        );
        None
    }

    fn delete_allocated_pod(&mut self, pod: &AllocatedPod) -> Result<()> {
        let spec = &pod.spec;
        let info = &pod.bind_info;
        let group_name = spec.affinity_group.name.clone();
        tracing::info!(
            pod = %pod.name,
            node = %info.node,
            gpus = ?info.gpu_isolation,
            group = %group_name,
            "deleting allocated pod"
        );
        if !self.groups.contains(&group_name) {
            tracing::error!(group = %group_name, "group not found when deleting pod");
            return Ok(());
        }

        let mut pod_index = None;
        for member in &info.affinity_group_bind_info {
            let Some(first) = member.pod_placements.first() else {
                continue;
            };
            if first.physical_gpu_indices.len() as i32 == spec.gpu_number {
                let first_gpu = info.gpu_isolation.first().copied().unwrap_or(-1);
                match find_pod_index(&member.pod_placements, &info.node, first_gpu) {
                    Some(index) => pod_index = Some(index),
                    None => {
                        tracing::error!(
                            pod = %pod.name,
                            group = %group_name,
                            node = %info.node,
                            gpus = ?info.gpu_isolation,
                            "pod placement not found in its group"
                        );
                        return Ok(());
                    }
                }
            }
        }
        let Some(pod_index) = pod_index else {
            tracing::error!(
                pod = %pod.name,
                group = %group_name,
                "no bind info entry matches the pod's GPU count"
            );
            return Ok(());
        };

        let group = self
            .groups
            .get_mut(&group_name)
            .expect("group existence was just checked");
        group
            .allocated_pods
            .get_mut(&spec.gpu_number)
            .expect("bind info GPU count not declared by the affinity group")[pod_index] = None;
        let gang_release = group.gang_release_enable;

        if !gang_release {
            tracing::info!(
                group = %group_name,
                "gang release not enabled; releasing resources for this pod"
            );
            let gpus: Vec<PcId> = group.physical_placement[&spec.gpu_number][pod_index]
                .iter()
                .flatten()
                .copied()
                .collect();
            for gpu in gpus {
                self.confirm_released_gpu(gpu, &group_name);
            }
        }

        let all_released = self
            .groups
            .get(&group_name)
            .expect("group still registered")
            .all_pods_released();
        if all_released {
            if gang_release {
                tracing::info!(
                    group = %group_name,
                    "gang release enabled; releasing resources for all pods"
                );
                let gpus: Vec<PcId> = self.groups.get(&group_name).expect("group still registered")
                    .physical_placement
                    .values()
                    .flatten()
                    .flatten()
                    .flatten()
                    .copied()
                    .collect();
                for gpu in gpus {
                    self.confirm_released_gpu(gpu, &group_name);
                }
            }
            self.groups.remove(&group_name);
            tracing::info!(group = %group_name, "all pods complete; affinity group deleted");
        }
        Ok(())
    }

    /// Create the cell bindings for a committed GPU, remove a freshly bound
    /// pre-assigned cell from the free list, and raise priorities and used
    /// counts. A GPU without a virtual counterpart is accounted as
    /// opportunistic.
    fn confirm_allocated_gpu(
        &mut self,
        physical_gpu: PcId,
        virtual_gpu: Option<VcId>,
        priority: CellPriority,
        group_name: &str,
    ) {
        let mut physical_priority = priority;
        match virtual_gpu {
            Some(virtual_gpu) => {
                let preassigned = self.virtual_cells[virtual_gpu].pre_assigned;
                let preassigned_newly_bound = self.virtual_cells[preassigned].bound.is_none();
                bind_cell(
                    &mut self.physical,
                    &mut self.virtual_cells,
                    physical_gpu,
                    virtual_gpu,
                );
                if preassigned_newly_bound {
                    let preassigned_physical = self.virtual_cells[preassigned]
                        .bound
                        .expect("pre-assigned cell must be bound after binding its descendant");
                    let chain = self.physical[preassigned_physical].chain.clone();
                    buddy::remove_from_free_list(
                        &mut self.physical,
                        self.free_cells
                            .get_mut(&chain)
                            .expect("every chain has a free list"),
                        preassigned_physical,
                    );
                }
                set_priority(&mut self.virtual_cells, virtual_gpu, priority);
                update_used_gpus(&mut self.virtual_cells, virtual_gpu, priority, true);
            }
            None => physical_priority = CellPriority::OPPORTUNISTIC,
        }
        set_priority(&mut self.physical, physical_gpu, physical_priority);
        update_used_gpus(&mut self.physical, physical_gpu, physical_priority, true);
        self.physical[physical_gpu].group = Some(group_name.to_string());
    }

    /// Destroy the cell bindings of a released GPU, return a fully emptied
    /// pre-assigned cell to the free list, and reset priorities and counts.
    fn confirm_released_gpu(&mut self, physical_gpu: PcId, group_name: &str) {
        if let Some(virtual_gpu) = self.physical[physical_gpu].bound {
            let preassigned = self.virtual_cells[virtual_gpu].pre_assigned;
            let preassigned_physical = self.virtual_cells[preassigned].bound;
            unbind_cell(&mut self.physical, &mut self.virtual_cells, physical_gpu);
            if self.virtual_cells[preassigned].bound.is_none() {
                let released = preassigned_physical
                    .expect("pre-assigned cell was bound before its subtree released");
                let chain = self.physical[released].chain.clone();
                buddy::add_to_free_list(
                    &mut self.physical,
                    self.free_cells
                        .get_mut(&chain)
                        .expect("every chain has a free list"),
                    released,
                );
            }
            let virtual_priority = self.virtual_cells[virtual_gpu].priority;
            update_used_gpus(&mut self.virtual_cells, virtual_gpu, virtual_priority, false);
            set_priority(&mut self.virtual_cells, virtual_gpu, CellPriority::FREE);
        }
        let physical_priority = self.physical[physical_gpu].priority;
        update_used_gpus(&mut self.physical, physical_gpu, physical_priority, false);
        set_priority(&mut self.physical, physical_gpu, CellPriority::FREE);
        if self.physical[physical_gpu].group.as_deref() == Some(group_name) {
            self.physical[physical_gpu].group = None;
        }
    }

    /// Find the group whose binding stands in the way of committing
    /// `virtual_gpu` against `physical_gpu`: the cell itself, or an ancestor
    /// within its pre-assigned subtree, bound onto a different physical
    /// subtree. A binding onto an ancestor of `physical_gpu` is the normal
    /// sharing of a pre-assigned cell and conflicts with nothing.
    fn conflicting_group(&self, virtual_gpu: VcId, physical_gpu: PcId) -> Option<String> {
        let mut cell = virtual_gpu;
        loop {
            if let Some(bound) = self.virtual_cells[cell].bound {
                if self.is_ancestor_or_self(bound, physical_gpu) {
                    return None;
                }
                return self.group_on_physical_subtree(bound);
            }
            if cell == self.virtual_cells[cell].pre_assigned {
                return None;
            }
            cell = self.virtual_cells[cell].parent?;
        }
    }

    fn is_ancestor_or_self(&self, ancestor: PcId, cell: PcId) -> bool {
        let mut current = Some(cell);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.physical[c].parent;
        }
        false
    }

    /// The affinity group holding any level-1 cell under the given physical
    /// cell.
    fn group_on_physical_subtree(&self, cell: PcId) -> Option<String> {
        if let Some(group) = &self.physical[cell].group {
            return Some(group.clone());
        }
        self.physical[cell]
            .children
            .iter()
            .find_map(|&child| self.group_on_physical_subtree(child))
    }

    /// Remove a group from its VC: it keeps its physical GPUs but loses its
    /// virtual placement and is reclassified as opportunistic, observable
    /// through its lazy-preemption status.
    fn lazy_preempt_group(&mut self, victim: &str, preemptor: &str) {
        let Some(virtual_placement) = self.groups.take_virtual_placement(victim) else {
            return;
        };
        self.vacate_virtual_placement(&virtual_placement, victim);
        self.groups.mark_lazy_preempted(victim, preemptor);
        tracing::info!(
            group = %victim,
            %preemptor,
            "affinity group lazily preempted from its VC"
        );
    }

    fn vacate_virtual_placement(&mut self, placement: &VirtualPlacement, group_name: &str) {
        for pods in placement.values() {
            for pod in pods {
                for &virtual_gpu in pod.iter().flatten() {
                    if let Some(physical_gpu) = self.virtual_cells[virtual_gpu].bound {
                        self.confirm_released_gpu(physical_gpu, group_name);
                        self.confirm_allocated_gpu(
                            physical_gpu,
                            None,
                            CellPriority::OPPORTUNISTIC,
                            group_name,
                        );
                    }
                }
            }
        }
    }

    /// Locate the physical and virtual cells for one GPU of an allocated pod.
    ///
    /// The third return value mirrors the confirm path's decision: `None`
    /// means the placement carries no quota accounting (opportunistic group);
    /// `Some(true)` means the group's virtual placement could not be
    /// reconstructed and it should be lazily preempted.
    #[allow(clippy::too_many_arguments)]
    fn find_allocated_gpu(
        &self,
        index: usize,
        placement: &PodPlacementInfo,
        chain: &CellChain,
        node: &NodeName,
        lazy_preempted: bool,
        spec: &PodSchedulingSpec,
        group_has_virtual: bool,
        pod_name: &str,
    ) -> (Option<PcId>, Option<VcId>, Option<bool>) {
        let priority = CellPriority::from_pod(spec.priority);
        let gpu_index = placement.physical_gpu_indices[index];
        let Some(physical_gpu) = self.find_physical_gpu(chain, node, gpu_index) else {
            tracing::warn!(
                pod = %pod_name,
                gpu = gpu_index,
                %node,
                "cannot find GPU on node: not in the cluster; pod ignored"
            );
            return (None, None, Some(false));
        };
        if placement.preassigned_cell_types.is_empty() {
            tracing::warn!(
                pod = %pod_name,
                "cannot find virtual cell: pre-assigned cell types missing from bind info"
            );
            return (Some(physical_gpu), None, Some(true));
        }
        if group_has_virtual && !lazy_preempted {
            let Some(preassigned_type) = placement
                .preassigned_cell_types
                .get(index)
                .cloned()
                .flatten()
            else {
                return (Some(physical_gpu), None, None);
            };
            match self.locate_virtual_cell(physical_gpu, &preassigned_type, spec, priority) {
                Ok(virtual_gpu) => (Some(physical_gpu), Some(virtual_gpu), Some(false)),
                Err(message) => {
                    tracing::warn!(pod = %pod_name, %message, "cannot find virtual cell");
                    (Some(physical_gpu), None, Some(true))
                }
            }
        } else {
            (Some(physical_gpu), None, Some(false))
        }
    }

    /// Find the virtual cell a committed physical GPU should be accounted
    /// against, mapping it through the VC's cell list at the level named by
    /// the pre-assigned cell type.
    fn locate_virtual_cell(
        &self,
        physical_gpu: PcId,
        preassigned_type: &CellTypeName,
        spec: &PodSchedulingSpec,
        priority: CellPriority,
    ) -> std::result::Result<VcId, String> {
        let chain = &self.physical[physical_gpu].chain;
        let types = &self.cell_types[chain];
        let mut preassigned_level = None;
        for level in LOWEST_LEVEL..=types.len() as CellLevel {
            if types.get(&level) == Some(preassigned_type) {
                preassigned_level = Some(level);
            }
        }
        let preassigned_level = preassigned_level.ok_or_else(|| {
            format!("pre-assigned cell type {preassigned_type} not found in chain {chain}")
        })?;
        let vc_scheduler = self
            .vc_schedulers
            .get(&spec.virtual_cluster)
            .ok_or_else(|| format!("VC {} not found", spec.virtual_cluster))?;
        let (list, scope) = match &spec.reservation_id {
            Some(reservation_id) => (
                vc_scheduler.reserved.get(reservation_id),
                reservation_id.as_str(),
            ),
            None => (vc_scheduler.non_reserved.get(chain), chain.as_str()),
        };
        let list = list.ok_or_else(|| {
            format!("VC {} has no cell for {scope}", spec.virtual_cluster)
        })?;
        self.map_non_preassigned_to_virtual(physical_gpu, list, preassigned_level, priority)
    }

    /// Inverse of the physical mapping: walk the physical cell up to the
    /// pre-assigned level and descend the virtual tree picking the lowest
    /// eligible priorities.
    fn map_non_preassigned_to_virtual(
        &self,
        physical_cell: PcId,
        list: &ChainCellList<VcId>,
        preassigned_level: CellLevel,
        priority: CellPriority,
    ) -> std::result::Result<VcId, String> {
        if let Some(virtual_cell) = self.physical[physical_cell].bound {
            return Ok(virtual_cell);
        }
        if self.physical[physical_cell].level == preassigned_level {
            return lowest_priority_cell(&self.virtual_cells, list.at(preassigned_level), priority)
                .ok_or_else(|| {
                    format!(
                        "insufficient quota in the VC at the pre-assigned level ({preassigned_level})"
                    )
                });
        }
        let Some(parent) = self.physical[physical_cell].parent else {
            return Err(format!(
                "physical and virtual cell hierarchies do not match \
                 (cannot reach the pre-assigned level {preassigned_level} in physical)"
            ));
        };
        let parent_virtual =
            self.map_non_preassigned_to_virtual(parent, list, preassigned_level, priority)?;
        Ok(lowest_priority_cell(
            &self.virtual_cells,
            &self.virtual_cells[parent_virtual].children,
            priority,
        )
        .expect("a virtual cell below the request priority must have an eligible child"))
    }

    /// Find a level-1 physical cell by node and GPU index, searching the
    /// given chain first and falling back to every other chain: after a
    /// reconfiguration the GPU may have moved.
    fn find_physical_gpu(
        &self,
        chain: &CellChain,
        node: &NodeName,
        gpu_index: i32,
    ) -> Option<PcId> {
        if let Some(cell) = self.find_physical_gpu_in_chain(chain, node, gpu_index) {
            return Some(cell);
        }
        for other in &self.chain_order {
            if other != chain {
                if let Some(cell) = self.find_physical_gpu_in_chain(other, node, gpu_index) {
                    tracing::warn!(
                        gpu = gpu_index,
                        %node,
                        from_chain = %chain,
                        to_chain = %other,
                        "GPU has moved to another chain"
                    );
                    return Some(cell);
                }
            }
        }
        None
    }

    fn find_physical_gpu_in_chain(
        &self,
        chain: &CellChain,
        node: &NodeName,
        gpu_index: i32,
    ) -> Option<PcId> {
        let list = self.full_cells.get(chain)?;
        list.at(LOWEST_LEVEL)
            .iter()
            .copied()
            .find(|&cell| {
                let cell = &self.physical[cell];
                cell.nodes.iter().any(|n| n == node)
                    && (gpu_index < 0 || cell.gpu_indices.contains(&gpu_index))
            })
    }

    fn affinity_group(&self, name: &str) -> Result<AffinityGroupSnapshot> {
        self.groups
            .get(name)
            .map(AffinityGroup::snapshot)
            .ok_or_else(|| SchedulerError::AffinityGroupNotFound(name.to_string()))
    }

    fn affinity_groups(&self) -> Vec<AffinityGroupSnapshot> {
        let mut snapshots: Vec<AffinityGroupSnapshot> =
            self.groups.iter().map(AffinityGroup::snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

/// Pick the free cell, or failing that the lowest-priority cell strictly
/// below the given priority.
fn lowest_priority_cell(
    cells: &VirtualCells,
    candidates: &[VcId],
    priority: CellPriority,
) -> Option<VcId> {
    let mut best: Option<(CellPriority, VcId)> = None;
    for &candidate in candidates {
        let p = cells[candidate].priority;
        if p == CellPriority::FREE {
            return Some(candidate);
        }
        if p < priority && best.map_or(true, |(lowest, _)| p < lowest) {
            best = Some((p, candidate));
        }
    }
    best.map(|(_, cell)| cell)
}

/// Index of the pod whose recorded placement covers (node, gpu).
fn find_pod_index(placements: &[PodPlacementInfo], node: &NodeName, gpu: i32) -> Option<usize> {
    placements.iter().position(|placement| {
        placement.physical_node == *node && placement.physical_gpu_indices.contains(&gpu)
    })
}

/// Find the slot of the pod within its own bind info, by GPU count and then
/// placement identity.
fn find_bind_info_slot(info: &crate::protocols::PodBindInfo, gpu_number: i32) -> Option<usize> {
    let first_gpu = info.gpu_isolation.first().copied()?;
    for member in &info.affinity_group_bind_info {
        let Some(first) = member.pod_placements.first() else {
            continue;
        };
        if first.physical_gpu_indices.len() as i32 == gpu_number {
            return find_pod_index(&member.pod_placements, &info.node, first_gpu);
        }
    }
    None
}

/// Build one physical cell (and its subtree) from configuration, appending
/// every cell to the chain's full list at its level.
fn build_physical_cell(
    arena: &mut PhysicalCells,
    list: &mut ChainCellList<PcId>,
    ordinals: &mut [u32],
    chain: &CellChain,
    config: &PhysicalCellConfig,
) -> PcId {
    match config {
        PhysicalCellConfig::Leaf { node, gpu_index } => {
            let ordinal = ordinals[0];
            ordinals[0] += 1;
            let id = arena.push(PhysicalCell {
                name: format!("{chain}/L1/{ordinal}"),
                chain: chain.clone(),
                level: 1,
                parent: None,
                children: vec![],
                nodes: vec![node.clone()],
                gpu_indices: vec![*gpu_index],
                bound: None,
                split: false,
                reserved: false,
                priority: CellPriority::FREE,
                used_gpus: HashMap::new(),
                group: None,
            });
            list.push(1, id);
            id
        }
        PhysicalCellConfig::Internal { cells } => {
            assert!(!cells.is_empty(), "internal cell in chain {chain} has no children");
            let children: Vec<PcId> = cells
                .iter()
                .map(|child| build_physical_cell(arena, list, ordinals, chain, child))
                .collect();
            let level = arena[children[0]].level + 1;
            let mut nodes: Vec<NodeName> = Vec::new();
            let mut gpu_indices = Vec::new();
            for &child in &children {
                assert_eq!(
                    arena[child].level + 1,
                    level,
                    "chain {chain} mixes cell depths under one parent"
                );
                for n in &arena[child].nodes {
                    if !nodes.contains(n) {
                        nodes.push(n.clone());
                    }
                }
                gpu_indices.extend(arena[child].gpu_indices.iter().copied());
            }
            let ordinal = ordinals[(level - 1) as usize];
            ordinals[(level - 1) as usize] += 1;
            let id = arena.push(PhysicalCell {
                name: format!("{chain}/L{level}/{ordinal}"),
                chain: chain.clone(),
                level,
                parent: None,
                children: children.clone(),
                nodes,
                gpu_indices,
                bound: None,
                split: false,
                reserved: false,
                priority: CellPriority::FREE,
                used_gpus: HashMap::new(),
                group: None,
            });
            for child in children {
                arena[child].parent = Some(id);
            }
            list.push(level, id);
            id
        }
    }
}

/// Build one virtual quota subtree of the given level, mirroring the chain's
/// arity down to single GPUs. Every cell lands in the target list at its
/// level and points at the subtree root as its pre-assigned cell.
fn build_virtual_subtree(
    arena: &mut VirtualCells,
    list: &mut ChainCellList<VcId>,
    ordinals: &mut [u32],
    vc: &VirtualClusterName,
    chain: &CellChain,
    level: CellLevel,
    arity: &[usize],
) -> VcId {
    let root = build_virtual_cell(arena, list, ordinals, vc, chain, level, arity);
    assign_pre_assigned(arena, root, root);
    root
}

fn build_virtual_cell(
    arena: &mut VirtualCells,
    list: &mut ChainCellList<VcId>,
    ordinals: &mut [u32],
    vc: &VirtualClusterName,
    chain: &CellChain,
    level: CellLevel,
    arity: &[usize],
) -> VcId {
    let ordinal = ordinals[(level - 1) as usize];
    ordinals[(level - 1) as usize] += 1;
    let id = arena.push(VirtualCell {
        name: format!("{vc}/{chain}/L{level}/{ordinal}"),
        vc: vc.clone(),
        chain: chain.clone(),
        level,
        parent: None,
        children: vec![],
        pre_assigned: VcId(0),
        bound: None,
        priority: CellPriority::FREE,
        used_gpus: HashMap::new(),
    });
    arena[id].pre_assigned = id;
    if level > LOWEST_LEVEL {
        let children: Vec<VcId> = (0..arity[level as usize])
            .map(|_| build_virtual_cell(arena, list, ordinals, vc, chain, level - 1, arity))
            .collect();
        for &child in &children {
            arena[child].parent = Some(id);
        }
        arena[id].children = children;
    }
    list.push(level, id);
    id
}

fn assign_pre_assigned(arena: &mut VirtualCells, cell: VcId, root: VcId) {
    arena[cell].pre_assigned = root;
    let children = arena[cell].children.clone();
    for child in children {
        assign_pre_assigned(arena, child, root);
    }
}

/// Resolve a reservation's cell path: the first element indexes the chain's
/// top cells, each further element indexes children.
fn resolve_cell_path(
    arena: &PhysicalCells,
    full: &ChainCellList<PcId>,
    path: &[usize],
) -> Option<PcId> {
    let (&first, rest) = path.split_first()?;
    let mut cell = *full.at(full.top_level()).get(first)?;
    for &index in rest {
        cell = *arena[cell].children.get(index)?;
    }
    Some(cell)
}
