// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios driven through the public scheduler API only.

use cell_scheduler::config::{
    CellQuota, ChainConfig, ClusterConfig, PhysicalCellConfig, VirtualClusterConfig,
};
use cell_scheduler::{
    AffinityGroupMemberSpec, AffinityGroupSpec, AllocatedPod, PodRequest, PodScheduleResult,
    PodSchedulingSpec, Scheduler, SchedulerError,
};

fn node_cell(node: &str, gpus: i32) -> PhysicalCellConfig {
    PhysicalCellConfig::Internal {
        cells: (0..gpus)
            .map(|g| PhysicalCellConfig::Leaf {
                node: node.to_string(),
                gpu_index: g,
            })
            .collect(),
    }
}

/// One chain of two 4-GPU nodes; VC "prod" owns both node-level cells.
fn cluster() -> ClusterConfig {
    ClusterConfig {
        chains: vec![ChainConfig {
            name: "A100-NVLINK".to_string(),
            gpu_type: "A100".to_string(),
            level_types: vec!["GPU".to_string(), "NODE".to_string()],
            top_cells: vec![node_cell("node-1", 4), node_cell("node-2", 4)],
        }],
        virtual_clusters: vec![VirtualClusterConfig {
            name: "prod".to_string(),
            quotas: vec![CellQuota {
                chain: "A100-NVLINK".to_string(),
                level: 2,
                count: 2,
            }],
            reservations: vec![],
        }],
        random_seed: Some(42),
    }
}

fn spec(
    vc: &str,
    priority: i32,
    gpu_number: i32,
    group: &str,
    members: &[(i32, i32)],
) -> PodSchedulingSpec {
    PodSchedulingSpec {
        virtual_cluster: vc.to_string(),
        priority,
        reservation_id: None,
        gpu_type: None,
        gpu_number,
        affinity_group: AffinityGroupSpec {
            name: group.to_string(),
            members: members
                .iter()
                .map(|&(gpu_number, pod_number)| AffinityGroupMemberSpec {
                    gpu_number,
                    pod_number,
                })
                .collect(),
        },
        gang_release_enable: false,
        lazy_preemption_enable: false,
    }
}

fn all_nodes() -> Vec<String> {
    vec!["node-1".to_string(), "node-2".to_string()]
}

/// Schedule, require a bind, and commit.
fn bind(scheduler: &Scheduler, name: &str, pod_spec: &PodSchedulingSpec) -> AllocatedPod {
    let request = PodRequest {
        name: name.to_string(),
        spec: pod_spec.clone(),
    };
    let result = scheduler.schedule(&request, &all_nodes()).expect("schedule must succeed");
    let PodScheduleResult::Bind(bind_info) = result else {
        panic!("expected a bind for {name}, got {result:?}");
    };
    let allocated = AllocatedPod {
        name: name.to_string(),
        spec: pod_spec.clone(),
        bind_info,
    };
    scheduler.add_allocated_pod(&allocated).expect("add must succeed");
    allocated
}

#[test]
fn pods_bind_and_groups_are_observable() {
    let scheduler = Scheduler::new(&cluster());
    let pod_spec = spec("prod", 100, 2, "trainer", &[(2, 2)]);
    let pod1 = bind(&scheduler, "trainer-0", &pod_spec);
    let pod2 = bind(&scheduler, "trainer-1", &pod_spec);

    assert_eq!(pod1.bind_info.cell_chain, "A100-NVLINK");
    assert_eq!(pod1.bind_info.gpu_isolation.len(), 2);
    assert_ne!(
        (&pod1.bind_info.node, &pod1.bind_info.gpu_isolation),
        (&pod2.bind_info.node, &pod2.bind_info.gpu_isolation),
        "the two pods must not share GPUs"
    );

    let snapshot = scheduler.affinity_group("trainer").expect("group must be registered");
    assert_eq!(snapshot.name, "trainer");
    let member = &snapshot.members[0];
    assert_eq!(member.gpu_number, 2);
    assert_eq!(member.pod_names.iter().flatten().count(), 2);
    assert!(snapshot.lazy_preemption_status.is_none());

    let all = scheduler.affinity_groups();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "trainer");
}

#[test]
fn guaranteed_pods_preempt_lower_priority_gangs() {
    let scheduler = Scheduler::new(&cluster());
    let low = spec("prod", 10, 4, "batch", &[(4, 2)]);
    let batch0 = bind(&scheduler, "batch-0", &low);
    let batch1 = bind(&scheduler, "batch-1", &low);

    // The cluster is full; a higher-priority gang must preempt.
    let high = spec("prod", 500, 4, "urgent", &[(4, 1)]);
    let request = PodRequest {
        name: "urgent-0".to_string(),
        spec: high.clone(),
    };
    let result = scheduler.schedule(&request, &all_nodes()).unwrap();
    let PodScheduleResult::Preempt(preempt) = result else {
        panic!("expected preemption, got {result:?}");
    };
    // Victims are preempted one node per attempt; with one batch pod per
    // node exactly one of them is named.
    assert_eq!(preempt.victim_pods.len(), 1);
    assert!(
        preempt.victim_pods[0].starts_with("batch-"),
        "the victim must come from the lower-priority gang"
    );

    // After eviction the high-priority pod binds on the freed cells.
    scheduler.delete_allocated_pod(&batch0).unwrap();
    scheduler.delete_allocated_pod(&batch1).unwrap();
    assert!(matches!(
        scheduler.affinity_group("batch").unwrap_err(),
        SchedulerError::AffinityGroupNotFound(_)
    ));
    let urgent = bind(&scheduler, "urgent-0", &high);
    assert_eq!(urgent.bind_info.gpu_isolation.len(), 4);
}

#[test]
fn lazy_preemption_is_observable_through_snapshots() {
    // VC quota of a single node-level cell forces the quota conflict while
    // the second physical node keeps the victim's GPUs safe.
    let mut config = cluster();
    config.virtual_clusters[0].quotas[0].count = 1;
    let scheduler = Scheduler::new(&config);

    let mut low = spec("prod", 10, 4, "batch", &[(4, 1)]);
    low.lazy_preemption_enable = true;
    let batch = bind(&scheduler, "batch-0", &low);

    let high = spec("prod", 500, 4, "urgent", &[(4, 1)]);
    let urgent = bind(&scheduler, "urgent-0", &high);
    assert_ne!(
        urgent.bind_info.node, batch.bind_info.node,
        "the preemptor places on fresh cells; the victim is not evicted"
    );

    let victim = scheduler.affinity_group("batch").unwrap();
    let status = victim
        .lazy_preemption_status
        .expect("the lazy preemption decision must be observable");
    assert_eq!(status.preemptor, "urgent");

    // The victim still runs: its pod slot is intact.
    assert_eq!(victim.members[0].pod_names.iter().flatten().count(), 1);
}

#[test]
fn gang_release_holds_resources_until_the_last_delete() {
    let mut config = cluster();
    config.virtual_clusters[0].quotas[0].count = 1;
    let scheduler = Scheduler::new(&config);

    let mut gang = spec("prod", 100, 1, "gang", &[(1, 3)]);
    gang.gang_release_enable = true;
    let pod1 = bind(&scheduler, "gang-0", &gang);
    let pod2 = bind(&scheduler, "gang-1", &gang);
    let pod3 = bind(&scheduler, "gang-2", &gang);

    scheduler.delete_allocated_pod(&pod1).unwrap();
    scheduler.delete_allocated_pod(&pod2).unwrap();

    // Nothing was released: an equal-priority group cannot take the cells.
    let contender = spec("prod", 100, 2, "contender", &[(2, 1)]);
    let request = PodRequest {
        name: "contender-0".to_string(),
        spec: contender.clone(),
    };
    let result = scheduler.schedule(&request, &all_nodes()).unwrap();
    assert!(
        matches!(result, PodScheduleResult::Wait(_)),
        "gang-held cells must not be partially released: {result:?}"
    );

    scheduler.delete_allocated_pod(&pod3).unwrap();
    assert!(scheduler.affinity_group("gang").is_err(), "the group is gone");
    let rebound = bind(&scheduler, "contender-0", &contender);
    assert_eq!(rebound.bind_info.gpu_isolation.len(), 2);
}

#[test]
fn wait_reasons_surface_to_the_caller() {
    let scheduler = Scheduler::new(&cluster());
    let oversized = PodRequest {
        name: "big-0".to_string(),
        spec: spec("prod", 100, 4, "big", &[(4, 3)]),
    };
    let result = scheduler.schedule(&oversized, &all_nodes()).unwrap();
    let PodScheduleResult::Wait(wait) = result else {
        panic!("three 4-GPU pods cannot fit a two-node quota");
    };
    assert_eq!(wait.reason, "insufficient quota in VC prod");
}

#[test]
fn schedule_results_round_trip_through_serde() {
    let scheduler = Scheduler::new(&cluster());
    let request = PodRequest {
        name: "trainer-0".to_string(),
        spec: spec("prod", 100, 2, "trainer", &[(2, 1)]),
    };
    let result = scheduler.schedule(&request, &all_nodes()).unwrap();
    let encoded = serde_json::to_string(&result).expect("results must serialize");
    let decoded: PodScheduleResult = serde_json::from_str(&encoded).expect("results must deserialize");
    assert_eq!(result, decoded);

    let snapshot_request = serde_json::to_string(&request).unwrap();
    let decoded_request: PodRequest = serde_json::from_str(&snapshot_request).unwrap();
    assert_eq!(request, decoded_request);
}
