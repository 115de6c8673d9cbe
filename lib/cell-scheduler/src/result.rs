// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Projection of internal placements into the boundary result shape: a bind
//! instruction, a preemption victim list, or a wait reason.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::Rng;

use crate::cell::{CellLevel, CellPriority, PhysicalCells, VirtualCells};
use crate::groups::{AffinityGroup, GroupRegistry, PhysicalPlacement, VirtualPlacement};
use crate::protocols::{
    AffinityGroupMemberBindInfo, CellChain, CellTypeName, GpuIndex, NodeName, PodBindInfo,
    PodPlacementInfo, PodPreemptInfo, PodScheduleResult, PodWaitInfo,
};

pub(crate) struct ResultContext<'a> {
    pub physical: &'a PhysicalCells,
    pub virtual_cells: &'a VirtualCells,
    pub cell_types: &'a HashMap<CellChain, HashMap<CellLevel, CellTypeName>>,
    pub groups: &'a GroupRegistry,
    pub suggested: &'a HashSet<NodeName>,
}

/// Turn a (possibly absent) placement into the pod's schedule result.
#[allow(clippy::too_many_arguments)]
pub(crate) fn generate_pod_schedule_result(
    ctx: &ResultContext<'_>,
    physical_placement: Option<&PhysicalPlacement>,
    virtual_placement: Option<&VirtualPlacement>,
    priority: CellPriority,
    current_gpu_number: i32,
    current_pod_index: usize,
    group: Option<&AffinityGroup>,
    group_name: &str,
    vc: &str,
    pod_name: &str,
    rng: &mut StdRng,
) -> PodScheduleResult {
    if let Some(placement) = physical_placement {
        let (victims, nodes_with_victims) =
            collect_preemption_victims(ctx, placement, priority, group_name);
        if !victims.is_empty() {
            // Victims are collected on one random node per attempt, as the
            // orchestrator preempts a single node at a time; the randomness
            // spreads concurrent preemptors across nodes.
            let node = &nodes_with_victims[rng.random_range(0..nodes_with_victims.len())];
            let victim_pods = victims[node].clone();
            tracing::info!(
                pod = %pod_name,
                %node,
                victims = ?victim_pods,
                "need to preempt pods"
            );
            return PodScheduleResult::Preempt(PodPreemptInfo { victim_pods });
        }
    }

    // The selected node is determined only after preemption is ruled out:
    // victims could otherwise push the selected node out of the suggested set.
    let Some(placement) = physical_placement else {
        let reason = if priority.is_guaranteed() {
            format!("insufficient quota in VC {vc}")
        } else {
            "insufficient capacity in physical cluster".to_string()
        };
        return PodScheduleResult::Wait(PodWaitInfo { reason });
    };

    let (bind_info, selected_node, selected_gpu_indices, chain) = generate_affinity_group_bind_info(
        ctx,
        placement,
        virtual_placement,
        current_gpu_number,
        current_pod_index,
        group,
        group_name,
    );
    let Some(node) = selected_node else {
        let reason = if priority.is_guaranteed() {
            format!("cannot find a K8s candidate node within VC {vc}'s quota")
        } else {
            "cannot find a K8s candidate node within physical cluster".to_string()
        };
        return PodScheduleResult::Wait(PodWaitInfo { reason });
    };
    tracing::info!(
        pod = %pod_name,
        %node,
        gpus = ?selected_gpu_indices,
        "pod scheduled"
    );
    PodScheduleResult::Bind(PodBindInfo {
        node,
        gpu_isolation: selected_gpu_indices,
        cell_chain: chain,
        affinity_group_bind_info: bind_info,
    })
}

/// Collect preemption victims of the proposed placement: pods of any group
/// holding one of its cells at a lower priority. The whole victim group is
/// collected, as groups are gang-scheduled; pods are keyed by their node.
fn collect_preemption_victims(
    ctx: &ResultContext<'_>,
    placement: &PhysicalPlacement,
    priority: CellPriority,
    group_name: &str,
) -> (HashMap<NodeName, Vec<String>>, Vec<NodeName>) {
    let mut victims: HashMap<NodeName, Vec<String>> = HashMap::new();
    let mut nodes_with_victims: Vec<NodeName> = Vec::new();
    for pods in placement.values() {
        for pod in pods {
            for &gpu in pod.iter().flatten() {
                let Some(victim_name) = &ctx.physical[gpu].group else {
                    continue;
                };
                if victim_name == group_name {
                    // The group may be rescheduling onto resources it
                    // partially released; that is not a preemption.
                    continue;
                }
                if ctx.physical[gpu].priority >= priority {
                    panic!(
                        "resources previously allocated ({}) have been allocated to another \
                         non-preemptible group {victim_name}; pod should wait",
                        ctx.physical[gpu].name
                    );
                }
                let victim_group = ctx
                    .groups
                    .get(victim_name)
                    .expect("cell references an affinity group missing from the registry");
                for slots in victim_group.allocated_pods.values() {
                    for pod in slots.iter().flatten() {
                        let node_victims = victims.entry(pod.node.clone()).or_insert_with(|| {
                            nodes_with_victims.push(pod.node.clone());
                            Vec::new()
                        });
                        if !node_victims.contains(&pod.name) {
                            node_victims.push(pod.name.clone());
                        }
                    }
                }
            }
        }
    }
    (victims, nodes_with_victims)
}

/// Project the group's placements into bind-info entries and find the current
/// pod's node and GPUs. The node is reported only if it is in the suggested
/// set; for pods of an already-allocated group the agreement stands and the
/// check is skipped.
fn generate_affinity_group_bind_info(
    ctx: &ResultContext<'_>,
    placement: &PhysicalPlacement,
    virtual_placement: Option<&VirtualPlacement>,
    current_gpu_number: i32,
    current_pod_index: usize,
    group: Option<&AffinityGroup>,
    group_name: &str,
) -> (
    Vec<AffinityGroupMemberBindInfo>,
    Option<NodeName>,
    Vec<GpuIndex>,
    CellChain,
) {
    let mut bind_info = Vec::with_capacity(placement.len());
    let mut selected_node = None;
    let mut selected_gpu_indices = Vec::new();
    let mut chain = CellChain::new();
    for (&pod_gpu_number, pod_placements) in placement {
        let gpus_per_pod = pod_gpu_number.max(0) as usize;
        let mut member = AffinityGroupMemberBindInfo {
            pod_placements: vec![PodPlacementInfo::default(); pod_placements.len()],
        };
        for (pod_index, pod_gpus) in pod_placements.iter().enumerate() {
            let placement_info = &mut member.pod_placements[pod_index];
            placement_info.physical_gpu_indices = vec![0; gpus_per_pod];
            placement_info.preassigned_cell_types = vec![None; gpus_per_pod];
            for gpu_index in 0..gpus_per_pod {
                match pod_gpus.get(gpu_index).copied().flatten() {
                    None => {
                        // The cell disappeared in a reconfiguration; insist on
                        // the prior agreement recorded by sibling pods.
                        let Some(group) = group else {
                            panic!(
                                "first pod in group {group_name} was allocated invalid resource"
                            );
                        };
                        let (recovered, recovered_chain) =
                            retrieve_missing_pod_placement(group, pod_gpu_number, pod_index);
                        tracing::warn!(
                            node = %recovered.physical_node,
                            gpus = ?recovered.physical_gpu_indices,
                            "pod placement no longer valid; retrieved from bind info of sibling pods"
                        );
                        *placement_info = recovered;
                        chain = recovered_chain;
                        break;
                    }
                    Some(pc) => {
                        let cell = &ctx.physical[pc];
                        // A placed cell is a single GPU: its first node and
                        // GPU index are its address.
                        if placement_info.physical_node.is_empty() {
                            placement_info.physical_node = cell.nodes[0].clone();
                        }
                        placement_info.physical_gpu_indices[gpu_index] = cell.gpu_indices[0];
                        if let Some(virtual_placement) = virtual_placement {
                            let vc_cell = virtual_placement
                                .get(&pod_gpu_number)
                                .and_then(|pods| pods.get(pod_index))
                                .and_then(|gpus| gpus.get(gpu_index).copied().flatten())
                                .expect("virtual placement missing for a guaranteed GPU");
                            let preassigned = ctx.virtual_cells[vc_cell].pre_assigned;
                            let level = ctx.virtual_cells[preassigned].level;
                            let type_name = ctx
                                .cell_types
                                .get(&ctx.virtual_cells[vc_cell].chain)
                                .and_then(|types| types.get(&level))
                                .cloned()
                                .expect("chain level missing from the cell type map");
                            placement_info.preassigned_cell_types[gpu_index] = Some(type_name);
                        }
                    }
                }
            }
        }
        if pod_gpu_number == current_gpu_number {
            let current = &member.pod_placements[current_pod_index];
            if group.is_some() || ctx.suggested.contains(&current.physical_node) {
                selected_node = Some(current.physical_node.clone());
                selected_gpu_indices = current.physical_gpu_indices.clone();
                if let Some(pc) = placement
                    .get(&current_gpu_number)
                    .and_then(|pods| pods.get(current_pod_index))
                    .and_then(|gpus| gpus.first().copied().flatten())
                {
                    chain = ctx.physical[pc].chain.clone();
                }
            }
        }
        bind_info.push(member);
    }
    (bind_info, selected_node, selected_gpu_indices, chain)
}

/// Recover a pod's placement from the bind info of any sibling pod still in
/// the group, for cells erased by a reconfiguration.
fn retrieve_missing_pod_placement(
    group: &AffinityGroup,
    gpu_number: i32,
    pod_index: usize,
) -> (PodPlacementInfo, CellChain) {
    for slots in group.allocated_pods.values() {
        for pod in slots.iter().flatten() {
            for member in &pod.bind_info.affinity_group_bind_info {
                let member_gpu_number = member
                    .pod_placements
                    .first()
                    .map(|p| p.physical_gpu_indices.len() as i32);
                if member_gpu_number == Some(gpu_number) {
                    return (
                        member.pod_placements[pod_index].clone(),
                        pod.bind_info.cell_chain.clone(),
                    );
                }
            }
        }
    }
    panic!(
        "no allocated pod found in allocated group {} when retrieving placement for pod {} \
         with GPU number {}",
        group.name, pod_index, gpu_number
    );
}
