// SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Intra-VC scheduling: placement of guaranteed pods onto one virtual
//! cluster's cells.
//!
//! A VC owns a non-reserved chain cell list per chain (its general quota) and
//! one list per reservation. Requests carrying a reservation id place within
//! that reservation only; the rest place within the non-reserved list of the
//! request's chain. Opportunistic requests never reach this component.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cell::{CellPriority, ChainCellList, VcId, VirtualCells};
use crate::placer::{self, GroupLeaves, VirtualView};
use crate::protocols::{CellChain, NodeName, ReservationId, VirtualClusterName};

#[derive(Debug)]
pub(crate) struct IntraVcScheduler {
    pub vc: VirtualClusterName,
    pub non_reserved: HashMap<CellChain, ChainCellList<VcId>>,
    pub reserved: HashMap<ReservationId, ChainCellList<VcId>>,
}

impl IntraVcScheduler {
    pub fn new(vc: VirtualClusterName) -> Self {
        Self {
            vc,
            non_reserved: HashMap::new(),
            reserved: HashMap::new(),
        }
    }

    /// Place a guaranteed request among this VC's cells whose priorities are
    /// below the request's. Returns leaf virtual cells per pod, or `None`
    /// when the quota cannot fit the gang.
    pub fn schedule(
        &self,
        cells: &VirtualCells,
        chain: &CellChain,
        reservation_id: Option<&ReservationId>,
        pod_counts: &BTreeMap<i32, i32>,
        priority: CellPriority,
        suggested: &HashSet<NodeName>,
    ) -> Option<GroupLeaves<VcId>> {
        debug_assert!(
            priority.is_guaranteed(),
            "opportunistic requests must not reach the VC scheduler"
        );
        let list = match reservation_id {
            Some(rid) => self.reserved.get(rid)?,
            None => self.non_reserved.get(chain)?,
        };
        let placement = placer::place(&VirtualView { cells }, list, pod_counts, priority, suggested);
        match &placement {
            Some(_) => tracing::debug!(
                vc = %self.vc,
                %chain,
                reservation = reservation_id.map(String::as_str).unwrap_or(""),
                "placed request within VC quota"
            ),
            None => tracing::debug!(
                vc = %self.vc,
                %chain,
                ?pod_counts,
                %priority,
                "insufficient quota in VC for request"
            ),
        }
        placement
    }
}
