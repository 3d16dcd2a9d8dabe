// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Warm-boot reconciliation: the dump written at graceful exit, and the
//! cache of pre-existing device objects that programming claims during the
//! first FIB sync. Whatever stays unclaimed after the sync is deleted.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use ahash::RandomState;
use lpm::prefix::Prefix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::hw::device::{DeviceError, EgressId, SwitchDevice};
use crate::hw::ecmp::EcmpKey;
use crate::hw::nexthops::EgressDesc;
use crate::mpls::Label;
use crate::state::SwitchState;
use crate::types::{InterfaceId, RouterId};

/// Everything persisted at graceful exit: the applied switch state plus the
/// hardware tables needed to re-adopt device objects.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WarmBootDump {
    pub switch_state: SwitchState,
    pub routes: Vec<WbRoute>,
    pub host_routes: Vec<WbHostRoute>,
    pub egresses: Vec<WbEgress>,
    pub ecmp_groups: Vec<WbEcmpGroup>,
    pub labels: Vec<WbLabel>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WbRoute {
    pub vrf: RouterId,
    pub prefix: Prefix,
    pub egress_id: EgressId,
    pub ecmp: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WbHostRoute {
    pub vrf: RouterId,
    pub addr: IpAddr,
    pub egress_id: EgressId,
    pub ecmp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WbEgress {
    pub id: EgressId,
    pub desc: EgressDesc,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WbEcmpGroup {
    pub id: EgressId,
    pub members: Vec<EgressId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WbLabel {
    pub label: Label,
    pub egress_id: EgressId,
    pub ecmp: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CachedRoute {
    pub egress_id: EgressId,
    pub ecmp: bool,
}

/// Lookup tables over the warm-boot dump. Claimed entries are removed;
/// [`WarmBootCache::flush_unclaimed`] deletes the rest from the device.
#[derive(Default)]
pub struct WarmBootCache {
    routes: HashMap<(RouterId, Prefix), CachedRoute, RandomState>,
    host_routes: HashMap<(RouterId, IpAddr), CachedRoute, RandomState>,
    egresses: HashMap<EgressDesc, (EgressId, bool), RandomState>,
    ecmp_groups: HashMap<EcmpKey, EgressId, RandomState>,
    /// Membership of still-unclaimed groups, for pre-sync path fixups.
    ecmp_by_id: BTreeMap<EgressId, Vec<EgressId>>,
    labels: HashMap<Label, CachedRoute, RandomState>,
}

impl WarmBootCache {
    /// An empty cache, for cold boots.
    #[must_use]
    pub fn cold() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_dump(dump: &WarmBootDump) -> Self {
        let mut cache = Self::default();
        for r in &dump.routes {
            cache.routes.insert(
                (r.vrf, r.prefix),
                CachedRoute {
                    egress_id: r.egress_id,
                    ecmp: r.ecmp,
                },
            );
        }
        for r in &dump.host_routes {
            cache.host_routes.insert(
                (r.vrf, r.addr),
                CachedRoute {
                    egress_id: r.egress_id,
                    ecmp: r.ecmp,
                },
            );
        }
        for e in &dump.egresses {
            cache.egresses.insert(e.desc.clone(), (e.id, e.resolved));
        }
        for g in &dump.ecmp_groups {
            let mut members = g.members.clone();
            members.sort_unstable();
            cache.ecmp_groups.insert(members.clone(), g.id);
            cache.ecmp_by_id.insert(g.id, members);
        }
        for l in &dump.labels {
            cache.labels.insert(
                l.label,
                CachedRoute {
                    egress_id: l.egress_id,
                    ecmp: l.ecmp,
                },
            );
        }
        info!(
            "warm-boot cache loaded: {} routes, {} host routes, {} egresses, {} ECMP groups, {} labels",
            cache.routes.len(),
            cache.host_routes.len(),
            cache.egresses.len(),
            cache.ecmp_groups.len(),
            cache.labels.len()
        );
        cache
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
            && self.host_routes.is_empty()
            && self.egresses.is_empty()
            && self.ecmp_groups.is_empty()
            && self.labels.is_empty()
    }

    pub fn claim_route(&mut self, vrf: RouterId, prefix: Prefix) -> Option<CachedRoute> {
        self.routes.remove(&(vrf, prefix))
    }

    pub fn claim_host_route(&mut self, vrf: RouterId, addr: IpAddr) -> Option<CachedRoute> {
        self.host_routes.remove(&(vrf, addr))
    }

    pub fn claim_egress(&mut self, desc: &EgressDesc) -> Option<(EgressId, bool)> {
        self.egresses.remove(desc)
    }

    pub fn claim_ecmp_group(&mut self, key: &EcmpKey) -> Option<EgressId> {
        let id = self.ecmp_groups.remove(key)?;
        self.ecmp_by_id.remove(&id);
        Some(id)
    }

    pub fn claim_label(&mut self, label: Label) -> Option<CachedRoute> {
        self.labels.remove(&label)
    }

    /// Egress ids of cached (unclaimed) next-hops for a neighbor.
    #[must_use]
    pub fn egress_ids_for(&self, addr: IpAddr, ifindex: InterfaceId) -> Vec<EgressId> {
        self.egresses
            .iter()
            .filter(|(desc, _)| desc.addr == addr && desc.ifindex == ifindex)
            .map(|(_, (id, _))| *id)
            .collect()
    }

    /// Pre-FIB-sync convergence: shrink still-unclaimed cached groups when
    /// a member egress becomes unreachable.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn ecmp_path_unreachable(
        &mut self,
        device: &mut dyn SwitchDevice,
        member: EgressId,
    ) -> Result<(), DeviceError> {
        for (id, members) in &mut self.ecmp_by_id {
            if members.contains(&member) {
                device.ecmp_del_path(*id, member)?;
            }
        }
        Ok(())
    }

    /// Pre-FIB-sync convergence: expand still-unclaimed cached groups when
    /// a member egress becomes reachable.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn ecmp_path_reachable(
        &mut self,
        device: &mut dyn SwitchDevice,
        member: EgressId,
    ) -> Result<(), DeviceError> {
        for (id, members) in &self.ecmp_by_id {
            let copies = members.iter().filter(|m| **m == member).count();
            if copies > 0 {
                device.ecmp_add_path(*id, member, copies)?;
            }
        }
        Ok(())
    }

    /// Delete every unclaimed object from the device, routes before groups
    /// before egresses so nothing is destroyed while referenced.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn flush_unclaimed(&mut self, device: &mut dyn SwitchDevice) -> Result<(), DeviceError> {
        for (vrf, prefix) in std::mem::take(&mut self.routes).into_keys() {
            debug!("warm boot: deleting unclaimed route {prefix} in vrf {vrf}");
            device.delete_route(vrf, prefix)?;
        }
        for (vrf, addr) in std::mem::take(&mut self.host_routes).into_keys() {
            debug!("warm boot: deleting unclaimed host route {addr} in vrf {vrf}");
            device.delete_host_route(vrf, addr)?;
        }
        for label in std::mem::take(&mut self.labels).into_keys() {
            debug!("warm boot: deleting unclaimed label entry {label}");
            device.delete_label_entry(label)?;
        }
        for id in std::mem::take(&mut self.ecmp_groups).into_values() {
            debug!("warm boot: destroying unclaimed ECMP group {id}");
            device.destroy_ecmp_group(id)?;
        }
        self.ecmp_by_id.clear();
        for (id, _) in std::mem::take(&mut self.egresses).into_values() {
            debug!("warm boot: destroying unclaimed egress {id}");
            device.destroy_egress(id)?;
        }
        Ok(())
    }
}
