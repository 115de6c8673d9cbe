// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Errors surfaced to the orchestrator.
//!
//! Only malformed requests are errors. Placement failures are `Wait` results,
//! stale bind info is recovered with a warning, and broken internal invariants
//! (VC safety, free-list corruption, the priority law) panic: they indicate
//! bugs that would otherwise silently corrupt placements.

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("virtual cluster {0} does not exist")]
    VirtualClusterNotFound(String),

    #[error("virtual cluster {vc} does not have reservation {reservation}")]
    ReservationNotFound { vc: String, reservation: String },

    #[error("opportunistic pod not supported to use reservation {0}")]
    OpportunisticReservation(String),

    #[error("pod requesting GPU type {0} which the whole cluster does not have")]
    GpuTypeNotFound(String),

    #[error("pod requesting GPU type {gpu_type} which virtual cluster {vc} does not have")]
    GpuTypeNotInVc { gpu_type: String, vc: String },

    #[error(
        "requesting more pods than the configured number for {gpu_number} GPUs \
         ({pod_number} pods) in affinity group {group}"
    )]
    PodCountExceeded {
        gpu_number: i32,
        pod_number: i32,
        group: String,
    },

    #[error("affinity group {0} does not exist since it is not allocated")]
    AffinityGroupNotFound(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
