// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Device route and label-entry programming: binding FIB entries to egress
//! objects, with the host-route fast path and equivalent-write suppression.

use std::collections::HashMap;

use ahash::RandomState;
use lpm::prefix::Prefix;
use tracing::{debug, warn};

use crate::hw::device::{DeviceError, EgressId, SwitchDevice};
use crate::hw::ecmp::{EcmpGroupTable, EcmpKey, make_key};
use crate::hw::nexthops::{EgressDesc, HwNextHopTable};
use crate::hw::warmboot::WarmBootCache;
use crate::mpls::Label;
use crate::nexthop::{NextHop, NextHopEntry, RouteAction};
use crate::state::fib::{FibRoute, LabelFibEntry};
use crate::types::{InterfaceId, RouterId};

/// Cap on per-path copies after weight normalization.
const MAX_PATH_COPIES: usize = 64;

/// What a programmed entry references, kept so releasing is exact.
#[derive(Debug)]
pub(crate) enum EgressRef {
    /// The device's canonical drop or to-CPU egress; not refcounted.
    Fixed(EgressId),
    Single(EgressDesc, EgressId),
    Group(EcmpKey, Vec<EgressDesc>, EgressId),
}

impl EgressRef {
    fn egress_id(&self) -> EgressId {
        match self {
            EgressRef::Fixed(id) | EgressRef::Single(_, id) | EgressRef::Group(_, _, id) => *id,
        }
    }
    fn is_ecmp(&self) -> bool {
        matches!(self, EgressRef::Group(..))
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Scale weights down by their gcd so equal-weight sets use one path copy
/// per member.
fn path_copies(hops: &[&NextHop]) -> Vec<usize> {
    let divisor = hops.iter().fold(0, |acc, h| gcd(acc, h.weight.max(1)));
    hops.iter()
        .map(|h| {
            let copies = (h.weight.max(1) / divisor.max(1)) as usize;
            if copies > MAX_PATH_COPIES {
                warn!(
                    "next-hop {} weight produces {copies} path copies, capping at {MAX_PATH_COPIES}",
                    h.addr
                );
                MAX_PATH_COPIES
            } else {
                copies
            }
        })
        .collect()
}

fn neighbor_resolved(
    neighbors: &std::collections::HashSet<(InterfaceId, std::net::IpAddr), RandomState>,
    desc: &EgressDesc,
) -> bool {
    neighbors.contains(&(desc.ifindex, desc.addr))
}

/// Take references on everything a forward entry needs: one egress per
/// member descriptor and, for multi-path sets, the shared ECMP group.
pub(crate) fn build_egress_ref(
    device: &mut dyn SwitchDevice,
    nexthops: &mut HwNextHopTable,
    ecmp: &mut EcmpGroupTable,
    warmboot: &mut WarmBootCache,
    neighbors: &std::collections::HashSet<(InterfaceId, std::net::IpAddr), RandomState>,
    vrf: RouterId,
    forward: &NextHopEntry,
) -> Result<EgressRef, DeviceError> {
    let hops: Vec<&NextHop> = match &forward.action {
        RouteAction::Drop => return Ok(EgressRef::Fixed(device.drop_egress())),
        RouteAction::ToCpu => return Ok(EgressRef::Fixed(device.cpu_egress())),
        RouteAction::Forward(set) => set.iter().collect(),
    };

    let copies = path_copies(&hops);
    let mut descs: Vec<EgressDesc> = Vec::with_capacity(hops.len());
    let mut members: Vec<EgressId> = Vec::new();
    for (hop, copies) in hops.iter().zip(copies) {
        let Some(desc) = EgressDesc::from_hop(vrf, hop) else {
            /* the validator rejects unresolved hops before they get here */
            release_descs(device, nexthops, &descs);
            return Err(DeviceError::Rejected(format!(
                "unresolved next-hop {} reached the hardware layer",
                hop.addr
            )));
        };
        let resolved = neighbor_resolved(neighbors, &desc);
        match nexthops.reference_or_emplace(device, warmboot, desc.clone(), resolved) {
            Ok(id) => {
                descs.push(desc);
                members.extend(std::iter::repeat_n(id, copies));
            }
            Err(e) => {
                release_descs(device, nexthops, &descs);
                return Err(e);
            }
        }
    }

    if members.len() > 1 {
        let key = make_key(members);
        match ecmp.reference_or_emplace(device, warmboot, key.clone()) {
            Ok(id) => Ok(EgressRef::Group(key, descs, id)),
            Err(e) => {
                release_descs(device, nexthops, &descs);
                Err(e)
            }
        }
    } else {
        let id = members
            .first()
            .copied()
            .ok_or_else(|| DeviceError::Rejected("empty next-hop set".to_string()))?;
        let desc = descs.pop().unwrap_or_else(|| unreachable!());
        Ok(EgressRef::Single(desc, id))
    }
}

fn release_descs(device: &mut dyn SwitchDevice, nexthops: &mut HwNextHopTable, descs: &[EgressDesc]) {
    for desc in descs {
        if let Err(e) = nexthops.release(device, desc) {
            warn!("failed to release next-hop during cleanup: {e}");
        }
    }
}

/// Drop the references an entry held. The ECMP group goes first since it
/// holds the member egresses.
pub(crate) fn release_egress_ref(
    device: &mut dyn SwitchDevice,
    nexthops: &mut HwNextHopTable,
    ecmp: &mut EcmpGroupTable,
    eref: EgressRef,
) -> Result<(), DeviceError> {
    match eref {
        EgressRef::Fixed(_) => Ok(()),
        EgressRef::Single(desc, _) => nexthops.release(device, &desc).map(|_| ()),
        EgressRef::Group(key, descs, _) => {
            ecmp.release(device, &key)?;
            for desc in &descs {
                nexthops.release(device, desc)?;
            }
            Ok(())
        }
    }
}

#[derive(Debug)]
pub(crate) struct HwRoute {
    pub egress_id: EgressId,
    pub ecmp: bool,
    pub host_entry: bool,
    eref: EgressRef,
}

/// Device mirror of the unicast FIB, keyed by (vrf, prefix).
#[derive(Default)]
pub struct HwRouteTable {
    routes: HashMap<(RouterId, Prefix), HwRoute, RandomState>,
}

impl HwRouteTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&(RouterId, Prefix), &HwRoute)> {
        self.routes.iter()
    }

    /// Program a FIB route, reusing warm-boot state on first touch and
    /// suppressing equivalent re-programs.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn program(
        &mut self,
        device: &mut dyn SwitchDevice,
        nexthops: &mut HwNextHopTable,
        ecmp: &mut EcmpGroupTable,
        warmboot: &mut WarmBootCache,
        neighbors: &std::collections::HashSet<(InterfaceId, std::net::IpAddr), RandomState>,
        vrf: RouterId,
        route: &FibRoute,
    ) -> Result<(), DeviceError> {
        let eref = build_egress_ref(device, nexthops, ecmp, warmboot, neighbors, vrf, &route.forward)?;
        let egress_id = eref.egress_id();
        let is_ecmp = eref.is_ecmp();
        let prefix = route.prefix;
        let addr = prefix.as_address();
        let want_host = prefix.is_host() && device.supports_host_route_table();

        let outcome: Result<(), DeviceError> = if let Some(existing) = self.routes.get(&(vrf, prefix))
        {
            if existing.egress_id == egress_id
                && existing.ecmp == is_ecmp
                && existing.host_entry == want_host
            {
                debug!("route {prefix} in vrf {vrf} unchanged, skipping program");
                release_egress_ref(device, nexthops, ecmp, eref)?;
                return Ok(());
            }
            if want_host == existing.host_entry {
                if want_host {
                    device.write_host_route(vrf, addr, egress_id, is_ecmp, true)
                } else {
                    device.write_route(vrf, prefix, egress_id, is_ecmp, true)
                }
            } else if want_host {
                /* form change: add the new entry, then drop the old one */
                device
                    .write_host_route(vrf, addr, egress_id, is_ecmp, false)
                    .and_then(|()| device.delete_route(vrf, prefix))
            } else {
                device
                    .write_route(vrf, prefix, egress_id, is_ecmp, false)
                    .and_then(|()| device.delete_host_route(vrf, addr))
            }
        } else if want_host {
            let cached = warmboot.claim_host_route(vrf, addr);
            let cached_lpm = warmboot.claim_route(vrf, prefix);
            let write = match cached {
                Some(rec) if rec.egress_id == egress_id && rec.ecmp == is_ecmp => Ok(()),
                Some(_) => device.write_host_route(vrf, addr, egress_id, is_ecmp, true),
                None => device.write_host_route(vrf, addr, egress_id, is_ecmp, false),
            };
            write.and_then(|()| {
                if cached_lpm.is_some() {
                    device.delete_route(vrf, prefix)
                } else {
                    Ok(())
                }
            })
        } else {
            let cached = warmboot.claim_route(vrf, prefix);
            let cached_host = if prefix.is_host() {
                warmboot.claim_host_route(vrf, addr)
            } else {
                None
            };
            let write = match cached {
                Some(rec) if rec.egress_id == egress_id && rec.ecmp == is_ecmp => Ok(()),
                Some(_) => device.write_route(vrf, prefix, egress_id, is_ecmp, true),
                None => device.write_route(vrf, prefix, egress_id, is_ecmp, false),
            };
            write.and_then(|()| {
                if cached_host.is_some() {
                    device.delete_host_route(vrf, addr)
                } else {
                    Ok(())
                }
            })
        };

        if let Err(e) = outcome {
            if let Err(release_err) = release_egress_ref(device, nexthops, ecmp, eref) {
                warn!("failed to release egress after program error: {release_err}");
            }
            return Err(e);
        }

        let record = HwRoute {
            egress_id,
            ecmp: is_ecmp,
            host_entry: want_host,
            eref,
        };
        if let Some(old) = self.routes.insert((vrf, prefix), record) {
            release_egress_ref(device, nexthops, ecmp, old.eref)?;
        }
        Ok(())
    }

    /// Remove a programmed route and release everything it referenced.
    pub(crate) fn unprogram(
        &mut self,
        device: &mut dyn SwitchDevice,
        nexthops: &mut HwNextHopTable,
        ecmp: &mut EcmpGroupTable,
        vrf: RouterId,
        prefix: Prefix,
    ) -> Result<(), DeviceError> {
        let host_entry = self
            .routes
            .get(&(vrf, prefix))
            .map(|rec| rec.host_entry)
            .ok_or_else(|| {
                DeviceError::Rejected(format!("unprogram of absent route {prefix} in vrf {vrf}"))
            })?;
        if host_entry {
            device.delete_host_route(vrf, prefix.as_address())?;
        } else {
            device.delete_route(vrf, prefix)?;
        }
        let record = self
            .routes
            .remove(&(vrf, prefix))
            .unwrap_or_else(|| unreachable!());
        release_egress_ref(device, nexthops, ecmp, record.eref)
    }
}

/// Device mirror of the MPLS FIB.
#[derive(Default)]
pub struct HwLabelTable {
    entries: HashMap<Label, HwRoute, RandomState>,
}

impl HwLabelTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Label, &HwRoute)> {
        self.entries.iter()
    }

    pub(crate) fn program(
        &mut self,
        device: &mut dyn SwitchDevice,
        nexthops: &mut HwNextHopTable,
        ecmp: &mut EcmpGroupTable,
        warmboot: &mut WarmBootCache,
        neighbors: &std::collections::HashSet<(InterfaceId, std::net::IpAddr), RandomState>,
        entry: &LabelFibEntry,
    ) -> Result<(), DeviceError> {
        let eref = build_egress_ref(
            device,
            nexthops,
            ecmp,
            warmboot,
            neighbors,
            crate::types::DEFAULT_VRF,
            &entry.forward,
        )?;
        let egress_id = eref.egress_id();
        let is_ecmp = eref.is_ecmp();
        let label = entry.label;

        let outcome = if let Some(existing) = self.entries.get(&label) {
            if existing.egress_id == egress_id && existing.ecmp == is_ecmp {
                debug!("label entry {label} unchanged, skipping program");
                release_egress_ref(device, nexthops, ecmp, eref)?;
                return Ok(());
            }
            device.write_label_entry(label, egress_id, is_ecmp, true)
        } else {
            match warmboot.claim_label(label) {
                Some(rec) if rec.egress_id == egress_id && rec.ecmp == is_ecmp => Ok(()),
                Some(_) => device.write_label_entry(label, egress_id, is_ecmp, true),
                None => device.write_label_entry(label, egress_id, is_ecmp, false),
            }
        };

        if let Err(e) = outcome {
            if let Err(release_err) = release_egress_ref(device, nexthops, ecmp, eref) {
                warn!("failed to release egress after label program error: {release_err}");
            }
            return Err(e);
        }

        let record = HwRoute {
            egress_id,
            ecmp: is_ecmp,
            host_entry: false,
            eref,
        };
        if let Some(old) = self.entries.insert(label, record) {
            release_egress_ref(device, nexthops, ecmp, old.eref)?;
        }
        Ok(())
    }

    pub(crate) fn unprogram(
        &mut self,
        device: &mut dyn SwitchDevice,
        nexthops: &mut HwNextHopTable,
        ecmp: &mut EcmpGroupTable,
        label: Label,
    ) -> Result<(), DeviceError> {
        if !self.entries.contains_key(&label) {
            return Err(DeviceError::Rejected(format!(
                "unprogram of absent label entry {label}"
            )));
        }
        device.delete_label_entry(label)?;
        let record = self
            .entries
            .remove(&label)
            .unwrap_or_else(|| unreachable!());
        release_egress_ref(device, nexthops, ecmp, record.eref)
    }
}
