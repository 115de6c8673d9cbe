// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster configuration consumed at startup.
//!
//! An external collaborator parses the deployment's configuration file into
//! these structures; the scheduler constructor turns them into cell trees and
//! validates that the virtual-cluster quotas fit the physical cluster.

use serde::{Deserialize, Serialize};

use crate::cell::CellLevel;
use crate::protocols::{
    CellChain, CellTypeName, GpuIndex, NodeName, ReservationId, VirtualClusterName,
};

/// Everything the scheduler needs to know at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub chains: Vec<ChainConfig>,
    pub virtual_clusters: Vec<VirtualClusterConfig>,
    /// Seed for the preemption victim-node choice; random when absent.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

/// One homogeneous topology layout: a GPU model plus its wiring, modeled as a
/// forest of cells of uniform depth and arity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: CellChain,
    pub gpu_type: String,
    /// Cell type name per level; index 0 names level 1 (the GPU itself).
    pub level_types: Vec<CellTypeName>,
    pub top_cells: Vec<PhysicalCellConfig>,
}

/// Recursive description of a physical cell: either a single GPU or a group
/// of lower-level cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhysicalCellConfig {
    Leaf {
        node: NodeName,
        gpu_index: GpuIndex,
    },
    Internal {
        cells: Vec<PhysicalCellConfig>,
    },
}

impl PhysicalCellConfig {
    /// Depth of this subtree; a leaf is level 1.
    pub fn level(&self) -> CellLevel {
        match self {
            Self::Leaf { .. } => 1,
            Self::Internal { cells } => {
                1 + cells.iter().map(Self::level).max().unwrap_or(0)
            }
        }
    }
}

/// A virtual cluster: per-chain per-level cell quotas plus reservations of
/// specific physical cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualClusterConfig {
    pub name: VirtualClusterName,
    #[serde(default)]
    pub quotas: Vec<CellQuota>,
    #[serde(default)]
    pub reservations: Vec<ReservationConfig>,
}

/// `count` cells of `level` on `chain`, each owned by the VC as one
/// indivisible unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellQuota {
    pub chain: CellChain,
    pub level: CellLevel,
    pub count: i32,
}

/// A reservation pins a specific physical cell to a VC. `cell_path` addresses
/// the cell within the chain: the first element indexes `top_cells`, each
/// further element indexes children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    pub id: ReservationId,
    pub chain: CellChain,
    pub cell_path: Vec<usize>,
}
