// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boundary data shapes exchanged with the host orchestrator.
//!
//! These types mirror what the orchestrator extracts from pod annotations on
//! the way in ([`PodSchedulingSpec`], [`PodBindInfo`]) and what the scheduler
//! emits on the way out ([`PodScheduleResult`]). They carry no behavior.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub type VirtualClusterName = String;
pub type ReservationId = String;
pub type CellChain = String;
pub type CellTypeName = String;
pub type NodeName = String;
pub type GpuIndex = i32;

/// One member class of an affinity group: `pod_number` pods, each requesting
/// `gpu_number` GPUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroupMemberSpec {
    pub gpu_number: i32,
    pub pod_number: i32,
}

/// The gang-scheduling unit a pod belongs to. Members with the same GPU count
/// are merged when the scheduler builds its request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroupSpec {
    pub name: String,
    pub members: Vec<AffinityGroupMemberSpec>,
}

/// Scheduling constraints extracted from a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSchedulingSpec {
    pub virtual_cluster: VirtualClusterName,
    pub priority: i32,
    #[serde(default)]
    pub reservation_id: Option<ReservationId>,
    #[serde(default)]
    pub gpu_type: Option<String>,
    pub gpu_number: i32,
    pub affinity_group: AffinityGroupSpec,
    #[serde(default)]
    pub gang_release_enable: bool,
    #[serde(default)]
    pub lazy_preemption_enable: bool,
}

/// Where one pod of an affinity group landed.
///
/// `preassigned_cell_types` names, per GPU, the cell type of the quota unit
/// the GPU was accounted against; `None` for opportunistic placements.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodPlacementInfo {
    pub physical_node: NodeName,
    pub physical_gpu_indices: Vec<GpuIndex>,
    #[serde(default)]
    pub preassigned_cell_types: Vec<Option<CellTypeName>>,
}

/// Placements of all pods of one member class (one GPU count) of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroupMemberBindInfo {
    pub pod_placements: Vec<PodPlacementInfo>,
}

/// The full binding decision for a pod, also replayed back to the scheduler
/// on `add_allocated_pod` / `delete_allocated_pod`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodBindInfo {
    pub node: NodeName,
    pub gpu_isolation: Vec<GpuIndex>,
    pub cell_chain: CellChain,
    pub affinity_group_bind_info: Vec<AffinityGroupMemberBindInfo>,
}

/// Pods that must be evicted before the requesting pod can be placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodPreemptInfo {
    /// Names of the victim pods, all on a single node.
    pub victim_pods: Vec<String>,
}

/// The pod cannot be placed right now; the orchestrator should retry later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodWaitInfo {
    pub reason: String,
}

/// Outcome of a `schedule` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodScheduleResult {
    Bind(PodBindInfo),
    Preempt(PodPreemptInfo),
    Wait(PodWaitInfo),
}

impl PodScheduleResult {
    pub fn as_bind(&self) -> Option<&PodBindInfo> {
        match self {
            Self::Bind(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_preempt(&self) -> Option<&PodPreemptInfo> {
        match self {
            Self::Preempt(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_wait(&self) -> Option<&PodWaitInfo> {
        match self {
            Self::Wait(info) => Some(info),
            _ => None,
        }
    }
}

/// A pod being scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRequest {
    pub name: String,
    pub spec: PodSchedulingSpec,
}

/// A pod whose binding the orchestrator has committed (or is deleting),
/// together with the bind info the scheduler previously emitted for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPod {
    pub name: String,
    pub spec: PodSchedulingSpec,
    pub bind_info: PodBindInfo,
}

/// Recorded when a group loses its virtual placement to a higher-priority
/// group without being evicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyPreemptionStatus {
    pub preemptor: String,
    pub preemption_time: SystemTime,
}

/// Read-only snapshot of one member class of a registered affinity group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroupMemberSnapshot {
    pub gpu_number: i32,
    /// One entry per pod slot; `None` for slots not yet bound.
    pub pod_names: Vec<Option<String>>,
    /// One entry per pod slot mirroring `pod_names`.
    pub pod_placements: Vec<Option<PodPlacementInfo>>,
}

/// Read-only snapshot of a registered affinity group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroupSnapshot {
    pub name: String,
    pub gang_release_enable: bool,
    pub lazy_preemption_enable: bool,
    pub lazy_preemption_status: Option<LazyPreemptionStatus>,
    pub members: Vec<AffinityGroupMemberSnapshot>,
}
