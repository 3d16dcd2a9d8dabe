// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The hardware switch manager: mirrors the FIB into device objects with
//! sharing and reference counting, applies snapshot deltas transactionally,
//! and absorbs neighbor-resolution changes without route re-programs.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use ahash::RandomState;
use tracing::{debug, error, info};

use crate::errors::AgentError;
use crate::state::SwitchState;
use crate::state::diff::{LabelOp, RouteOp, StateDelta};
use crate::state::fib::{FibRoute, LabelFibEntry};
use crate::types::{InterfaceId, RouterId};

pub mod device;
pub mod ecmp;
pub mod nexthops;
pub mod routes;
pub mod warmboot;

use device::SwitchDevice;
use ecmp::EcmpGroupTable;
use nexthops::HwNextHopTable;
use routes::{HwLabelTable, HwRouteTable};
use warmboot::{WarmBootCache, WarmBootDump, WbEcmpGroup, WbEgress, WbHostRoute, WbLabel, WbRoute};

/// Inverse operations journaled while a delta is applied, replayed in
/// reverse if the device rejects a later operation.
enum UndoOp {
    UnprogramRoute(RouterId, lpm::prefix::Prefix),
    ProgramRoute(RouterId, Arc<FibRoute>),
    UnprogramLabel(crate::mpls::Label),
    ProgramLabel(Arc<LabelFibEntry>),
}

pub struct HwSwitch {
    device: Box<dyn SwitchDevice>,
    nexthops: HwNextHopTable,
    ecmp: EcmpGroupTable,
    routes: HwRouteTable,
    labels: HwLabelTable,
    warmboot: WarmBootCache,
    neighbors: HashSet<(InterfaceId, IpAddr), RandomState>,
    fib_synced: bool,
}

impl HwSwitch {
    #[must_use]
    pub fn new(device: Box<dyn SwitchDevice>, warmboot: WarmBootCache) -> Self {
        Self {
            device,
            nexthops: HwNextHopTable::new(),
            ecmp: EcmpGroupTable::new(),
            routes: HwRouteTable::default(),
            labels: HwLabelTable::default(),
            warmboot,
            neighbors: HashSet::default(),
            fib_synced: false,
        }
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
    #[must_use]
    pub fn nexthop_count(&self) -> usize {
        self.nexthops.len()
    }
    #[must_use]
    pub fn ecmp_group_count(&self) -> usize {
        self.ecmp.len()
    }
    #[must_use]
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }
    #[must_use]
    pub fn fib_synced(&self) -> bool {
        self.fib_synced
    }

    fn program_route(&mut self, vrf: RouterId, route: &FibRoute) -> Result<(), AgentError> {
        self.routes
            .program(
                &mut *self.device,
                &mut self.nexthops,
                &mut self.ecmp,
                &mut self.warmboot,
                &self.neighbors,
                vrf,
                route,
            )
            .map_err(AgentError::from)
    }

    fn unprogram_route(
        &mut self,
        vrf: RouterId,
        prefix: lpm::prefix::Prefix,
    ) -> Result<(), AgentError> {
        self.routes
            .unprogram(
                &mut *self.device,
                &mut self.nexthops,
                &mut self.ecmp,
                vrf,
                prefix,
            )
            .map_err(AgentError::from)
    }

    fn program_label(&mut self, entry: &LabelFibEntry) -> Result<(), AgentError> {
        self.labels
            .program(
                &mut *self.device,
                &mut self.nexthops,
                &mut self.ecmp,
                &mut self.warmboot,
                &self.neighbors,
                entry,
            )
            .map_err(AgentError::from)
    }

    fn unprogram_label(&mut self, label: crate::mpls::Label) -> Result<(), AgentError> {
        self.labels
            .unprogram(
                &mut *self.device,
                &mut self.nexthops,
                &mut self.ecmp,
                label,
            )
            .map_err(AgentError::from)
    }

    fn apply_undo(&mut self, undo: UndoOp) -> Result<(), AgentError> {
        match undo {
            UndoOp::UnprogramRoute(vrf, prefix) => self.unprogram_route(vrf, prefix),
            UndoOp::ProgramRoute(vrf, route) => self.program_route(vrf, &route),
            UndoOp::UnprogramLabel(label) => self.unprogram_label(label),
            UndoOp::ProgramLabel(entry) => self.program_label(&entry),
        }
    }

    fn rollback(&mut self, journal: Vec<UndoOp>) {
        for undo in journal.into_iter().rev() {
            if let Err(e) = self.apply_undo(undo) {
                /* a transaction that can neither complete nor revert leaves
                the device in an unknown state; continuing would corrupt it */
                error!("rollback failed: {e}");
                panic!("hardware transaction rollback failed: {e}");
            }
        }
    }

    /// Apply a snapshot delta to the device. All-or-nothing: on failure the
    /// operations already applied are reverted and the error is surfaced;
    /// the caller must not publish the candidate snapshot.
    ///
    /// # Errors
    /// `HwProgrammingFailed` when the device rejects an operation.
    pub fn apply_delta(&mut self, delta: &StateDelta) -> Result<(), AgentError> {
        let mut journal: Vec<UndoOp> = Vec::with_capacity(delta.len());

        for op in &delta.routes {
            let result = match op {
                RouteOp::Add { vrf, route } => self
                    .program_route(*vrf, route)
                    .map(|()| UndoOp::UnprogramRoute(*vrf, route.prefix)),
                RouteOp::Replace { vrf, route, old } => self
                    .program_route(*vrf, route)
                    .map(|()| UndoOp::ProgramRoute(*vrf, Arc::clone(old))),
                RouteOp::Remove { vrf, old } => self
                    .unprogram_route(*vrf, old.prefix)
                    .map(|()| UndoOp::ProgramRoute(*vrf, Arc::clone(old))),
            };
            match result {
                Ok(undo) => journal.push(undo),
                Err(e) => {
                    error!("device rejected route operation: {e}; rolling back");
                    self.rollback(journal);
                    return Err(e);
                }
            }
        }

        for op in &delta.labels {
            let result = match op {
                LabelOp::Add(entry) => self
                    .program_label(entry)
                    .map(|()| UndoOp::UnprogramLabel(entry.label)),
                LabelOp::Replace { entry, old } => self
                    .program_label(entry)
                    .map(|()| UndoOp::ProgramLabel(Arc::clone(old))),
                LabelOp::Remove(old) => self
                    .unprogram_label(old.label)
                    .map(|()| UndoOp::ProgramLabel(Arc::clone(old))),
            };
            match result {
                Ok(undo) => journal.push(undo),
                Err(e) => {
                    error!("device rejected label operation: {e}; rolling back");
                    self.rollback(journal);
                    return Err(e);
                }
            }
        }

        debug!("applied {} hardware operations", delta.len());
        Ok(())
    }

    /// The neighbor for (ifindex, addr) resolved: reprogram matching
    /// egresses in place and expand affected ECMP groups, both the live
    /// ones and any still sitting in the warm-boot cache.
    ///
    /// # Errors
    /// `HwProgrammingFailed` when the device rejects an operation.
    pub fn neighbor_resolved(
        &mut self,
        addr: IpAddr,
        ifindex: InterfaceId,
    ) -> Result<(), AgentError> {
        self.neighbors.insert((ifindex, addr));
        let mut affected = self
            .nexthops
            .neighbor_changed(&mut *self.device, addr, ifindex, true)?;
        affected.extend(self.warmboot.egress_ids_for(addr, ifindex));
        for id in affected {
            self.ecmp.path_reachable(&mut *self.device, id)?;
            self.warmboot.ecmp_path_reachable(&mut *self.device, id)?;
        }
        Ok(())
    }

    /// The neighbor for (ifindex, addr) went away: shrink affected ECMP
    /// groups and punt matching egresses to the CPU.
    ///
    /// # Errors
    /// `HwProgrammingFailed` when the device rejects an operation.
    pub fn neighbor_unresolved(
        &mut self,
        addr: IpAddr,
        ifindex: InterfaceId,
    ) -> Result<(), AgentError> {
        self.neighbors.remove(&(ifindex, addr));
        let mut affected = self
            .nexthops
            .neighbor_changed(&mut *self.device, addr, ifindex, false)?;
        affected.extend(self.warmboot.egress_ids_for(addr, ifindex));
        for id in affected {
            self.ecmp.path_unreachable(&mut *self.device, id)?;
            self.warmboot.ecmp_path_unreachable(&mut *self.device, id)?;
        }
        Ok(())
    }

    /// Latch the first full FIB sync: whatever warm-boot state was never
    /// claimed is now stale and is deleted from the device.
    ///
    /// # Errors
    /// `HwProgrammingFailed` when the device rejects a deletion.
    pub fn mark_fib_synced(&mut self) -> Result<(), AgentError> {
        if self.fib_synced {
            return Ok(());
        }
        self.fib_synced = true;
        if !self.warmboot.is_empty() {
            info!("first FIB sync complete, flushing unclaimed warm-boot state");
            self.warmboot.flush_unclaimed(&mut *self.device)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn warmboot_cache_empty(&self) -> bool {
        self.warmboot.is_empty()
    }

    /// Build the warm-boot dump for a graceful exit.
    #[must_use]
    pub fn dump(&self, applied: &SwitchState) -> WarmBootDump {
        let mut dump = WarmBootDump {
            switch_state: applied.clone(),
            ..WarmBootDump::default()
        };
        for ((vrf, prefix), record) in self.routes.iter() {
            if record.host_entry {
                dump.host_routes.push(WbHostRoute {
                    vrf: *vrf,
                    addr: prefix.as_address(),
                    egress_id: record.egress_id,
                    ecmp: record.ecmp,
                });
            } else {
                dump.routes.push(WbRoute {
                    vrf: *vrf,
                    prefix: *prefix,
                    egress_id: record.egress_id,
                    ecmp: record.ecmp,
                });
            }
        }
        for (desc, nh) in self.nexthops.iter() {
            dump.egresses.push(WbEgress {
                id: nh.egress_id,
                desc: desc.clone(),
                resolved: nh.resolved,
            });
        }
        for (key, group) in self.ecmp.iter() {
            dump.ecmp_groups.push(WbEcmpGroup {
                id: group.egress_id,
                members: key.clone(),
            });
        }
        for (label, record) in self.labels.iter() {
            dump.labels.push(WbLabel {
                label: *label,
                egress_id: record.egress_id,
                ecmp: record.ecmp,
            });
        }
        dump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::device::{EgressProgram, SoftSwitch};
    use crate::hw::nexthops::EgressDesc;
    use crate::hw::warmboot::{WbEgress, WbRoute};
    use crate::mpls::LabelStack;
    use crate::nexthop::{NextHop, NextHopEntry};
    use crate::state::diff::{RouteOp, StateDelta};
    use crate::types::AdminDistance;
    use lpm::prefix::Prefix;
    use std::collections::BTreeMap;

    fn fib_route_via(prefix: (&str, u8), addr: &str, ifindex: u32) -> Arc<FibRoute> {
        let prefix = Prefix::expect_from(prefix);
        Arc::new(FibRoute {
            prefix,
            entries: BTreeMap::new(),
            forward: NextHopEntry::forward(
                AdminDistance::EBGP,
                [NextHop::attached(addr.parse().unwrap(), ifindex)],
            ),
        })
    }

    fn add_op(route: &Arc<FibRoute>) -> RouteOp {
        RouteOp::Add {
            vrf: 0,
            route: Arc::clone(route),
        }
    }

    #[test]
    fn test_unclaimed_warm_boot_state_is_flushed() {
        /* a previous life programmed two routes over two egresses */
        let mut device = SoftSwitch::new();
        let kept_desc = EgressDesc {
            vrf: 0,
            addr: "10.0.0.1".parse().unwrap(),
            ifindex: 1,
            labels: LabelStack::new(),
        };
        let kept_egress = device.create_egress(&kept_desc.program(true)).unwrap();
        let stale_desc = EgressDesc {
            vrf: 0,
            addr: "10.0.0.9".parse().unwrap(),
            ifindex: 3,
            labels: LabelStack::new(),
        };
        let stale_egress = device.create_egress(&stale_desc.program(true)).unwrap();
        let kept = Prefix::expect_from(("10.1.0.0", 16));
        let stale = Prefix::expect_from(("10.2.0.0", 16));
        device.write_route(0, kept, kept_egress, false, false).unwrap();
        device.write_route(0, stale, stale_egress, false, false).unwrap();

        let dump = WarmBootDump {
            routes: vec![
                WbRoute { vrf: 0, prefix: kept, egress_id: kept_egress, ecmp: false },
                WbRoute { vrf: 0, prefix: stale, egress_id: stale_egress, ecmp: false },
            ],
            egresses: vec![
                WbEgress { id: kept_egress, desc: kept_desc, resolved: true },
                WbEgress { id: stale_egress, desc: stale_desc, resolved: true },
            ],
            ..WarmBootDump::default()
        };

        let mut hw = HwSwitch::new(Box::new(device.clone()), WarmBootCache::from_dump(&dump));
        hw.neighbors.insert((1, "10.0.0.1".parse().unwrap()));

        /* re-program only the kept route: everything it needs is claimed
        without a single device write */
        let ops_before = device.write_ops();
        hw.apply_delta(&StateDelta {
            routes: vec![add_op(&fib_route_via(("10.1.0.0", 16), "10.0.0.1", 1))],
            labels: vec![],
        })
        .unwrap();
        assert_eq!(device.write_ops(), ops_before);

        /* first sync done: the stale route and its egress are deleted */
        hw.mark_fib_synced().unwrap();
        assert!(hw.warmboot_cache_empty());
        assert_eq!(device.route_count(), 1);
        assert!(device.get_route(0, stale).is_none());
        assert_eq!(device.egress_count(), 3); /* drop + cpu + kept */
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let device = SoftSwitch::new();
        let mut hw = HwSwitch::new(Box::new(device.clone()), WarmBootCache::cold());
        hw.neighbors.insert((1, "10.0.0.1".parse().unwrap()));

        let first = Arc::new(FibRoute {
            prefix: Prefix::expect_from(("10.1.0.0", 16)),
            entries: BTreeMap::new(),
            forward: NextHopEntry::drop(AdminDistance::STATIC_ROUTE),
        });
        let second = fib_route_via(("10.2.0.0", 16), "10.0.0.1", 1);

        /* first add is one route write; the second is an egress create
        followed by a route write. Fail that route write. */
        device.fail_write_after(2);
        let err = hw
            .apply_delta(&StateDelta {
                routes: vec![add_op(&first), add_op(&second)],
                labels: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::HwProgrammingFailed(_)));

        /* no partial state survives: tables and device are clean */
        assert_eq!(hw.route_count(), 0);
        assert_eq!(hw.nexthop_count(), 0);
        assert_eq!(device.route_count(), 0);
        assert_eq!(device.egress_count(), 2);
    }

    #[test]
    fn test_neighbor_flap_reprograms_egress_in_place() {
        let device = SoftSwitch::new();
        let mut hw = HwSwitch::new(Box::new(device.clone()), WarmBootCache::cold());

        /* neighbor not resolved yet: egress punts to CPU */
        let route = fib_route_via(("10.1.0.0", 16), "10.0.0.1", 1);
        hw.apply_delta(&StateDelta {
            routes: vec![add_op(&route)],
            labels: vec![],
        })
        .unwrap();
        let (egress, _) = device.get_route(0, route.prefix).unwrap();
        assert_eq!(device.get_egress(egress), Some(EgressProgram::Punt));

        /* resolution reprograms in place without changing the id */
        hw.neighbor_resolved("10.0.0.1".parse().unwrap(), 1).unwrap();
        assert_eq!(device.get_route(0, route.prefix).unwrap().0, egress);
        assert!(matches!(
            device.get_egress(egress),
            Some(EgressProgram::Forward { .. })
        ));

        hw.neighbor_unresolved("10.0.0.1".parse().unwrap(), 1).unwrap();
        assert_eq!(device.get_egress(egress), Some(EgressProgram::Punt));
    }
}
