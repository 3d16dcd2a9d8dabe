// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The refcounted device next-hop table: one physical egress per unique
//! (vrf, next-hop) descriptor, shared by every route and ECMP group that
//! forwards through it.

use std::collections::HashMap;
use std::net::IpAddr;

use ahash::RandomState;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hw::device::{DeviceError, EgressId, EgressProgram, SwitchDevice};
use crate::hw::warmboot::WarmBootCache;
use crate::mpls::LabelStack;
use crate::nexthop::NextHop;
use crate::types::{InterfaceId, RouterId};

/// The identity of a device next-hop: what makes two egresses shareable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EgressDesc {
    pub vrf: RouterId,
    pub addr: IpAddr,
    pub ifindex: InterfaceId,
    pub labels: LabelStack,
}

impl EgressDesc {
    /// Build a descriptor from a resolved next-hop. Returns `None` for an
    /// unresolved hop, which must never reach the hardware layer.
    #[must_use]
    pub fn from_hop(vrf: RouterId, hop: &NextHop) -> Option<Self> {
        Some(Self {
            vrf,
            addr: hop.addr,
            ifindex: hop.ifindex?,
            labels: hop.labels.clone(),
        })
    }

    /// The program for this egress given neighbor state: punt to CPU until
    /// the neighbor resolves.
    #[must_use]
    pub fn program(&self, neighbor_resolved: bool) -> EgressProgram {
        if neighbor_resolved {
            EgressProgram::Forward {
                addr: self.addr,
                ifindex: self.ifindex,
                labels: self.labels.clone(),
            }
        } else {
            EgressProgram::Punt
        }
    }
}

#[derive(Debug)]
pub struct HwNextHop {
    pub egress_id: EgressId,
    pub resolved: bool,
    refcount: usize,
}

/// Descriptor-keyed table of device next-hops.
#[derive(Default)]
pub struct HwNextHopTable {
    by_desc: HashMap<EgressDesc, HwNextHop, RandomState>,
}

impl HwNextHopTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_desc.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_desc.is_empty()
    }

    #[must_use]
    pub fn get(&self, desc: &EgressDesc) -> Option<&HwNextHop> {
        self.by_desc.get(desc)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EgressDesc, &HwNextHop)> {
        self.by_desc.iter()
    }

    /// Take a reference on the egress for `desc`, creating it (or adopting
    /// it from the warm-boot cache) on first use.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn reference_or_emplace(
        &mut self,
        device: &mut dyn SwitchDevice,
        warmboot: &mut WarmBootCache,
        desc: EgressDesc,
        neighbor_resolved: bool,
    ) -> Result<EgressId, DeviceError> {
        if let Some(existing) = self.by_desc.get_mut(&desc) {
            existing.refcount += 1;
            return Ok(existing.egress_id);
        }

        let program = desc.program(neighbor_resolved);
        let egress_id = match warmboot.claim_egress(&desc) {
            Some((id, cached_resolved)) => {
                if cached_resolved != neighbor_resolved {
                    device.update_egress(id, &program)?;
                }
                debug!("adopted warm-boot egress {id} for {}", desc.addr);
                id
            }
            None => device.create_egress(&program)?,
        };
        self.by_desc.insert(
            desc,
            HwNextHop {
                egress_id,
                resolved: neighbor_resolved,
                refcount: 1,
            },
        );
        Ok(egress_id)
    }

    /// Drop one reference; the device egress is destroyed when the last
    /// reference goes away. Returns whether it was destroyed.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn release(
        &mut self,
        device: &mut dyn SwitchDevice,
        desc: &EgressDesc,
    ) -> Result<bool, DeviceError> {
        let Some(existing) = self.by_desc.get_mut(desc) else {
            return Err(DeviceError::Rejected(format!(
                "release of unknown next-hop {}",
                desc.addr
            )));
        };
        existing.refcount -= 1;
        if existing.refcount > 0 {
            return Ok(false);
        }
        let egress_id = existing.egress_id;
        self.by_desc.remove(desc);
        device.destroy_egress(egress_id)?;
        Ok(true)
    }

    /// A neighbor became reachable or unreachable: reprogram every matching
    /// egress in place (its id never changes) and report the affected ids.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn neighbor_changed(
        &mut self,
        device: &mut dyn SwitchDevice,
        addr: IpAddr,
        ifindex: InterfaceId,
        resolved: bool,
    ) -> Result<Vec<EgressId>, DeviceError> {
        let mut affected = Vec::new();
        for (desc, nh) in &mut self.by_desc {
            if desc.addr != addr || desc.ifindex != ifindex || nh.resolved == resolved {
                continue;
            }
            device.update_egress(nh.egress_id, &desc.program(resolved))?;
            nh.resolved = resolved;
            affected.push(nh.egress_id);
        }
        Ok(affected)
    }
}
