// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The MPLS label RIB: per-label client submissions, resolved through the
//! default VRF's unicast tables.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use lpm::prefix::Prefix;

use crate::mpls::Label;
use crate::rib::resolver::flatten_entry;
use crate::rib::route::{RibRoute, TieBreak};
use crate::rib::vrf::VrfRib;

/// Label routes have the same per-client shape as unicast routes, so each
/// label entry reuses the unicast route node.
#[derive(Default)]
pub struct LabelRib {
    entries: BTreeMap<Label, RibRoute>,
    /// Reverse dependency index, like the VRF one: looked-up address ->
    /// labels whose resolution used it.
    addr_deps: BTreeMap<IpAddr, BTreeSet<Label>>,
    lookups: BTreeMap<Label, BTreeSet<IpAddr>>,
}

impl LabelRib {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, label: Label) -> Option<&RibRoute> {
        self.entries.get(&label)
    }

    pub fn get_mut(&mut self, label: Label) -> Option<&mut RibRoute> {
        self.entries.get_mut(&label)
    }

    pub fn insert(&mut self, label: Label, route: RibRoute) -> Option<RibRoute> {
        self.entries.insert(label, route)
    }

    pub fn remove(&mut self, label: Label) -> Option<RibRoute> {
        self.clear_lookups(label);
        self.entries.remove(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Label, &RibRoute)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn labels(&self) -> Vec<Label> {
        self.entries.keys().copied().collect()
    }

    fn set_lookups(&mut self, label: Label, addrs: BTreeSet<IpAddr>) {
        self.clear_lookups(label);
        for addr in &addrs {
            self.addr_deps.entry(*addr).or_default().insert(label);
        }
        if !addrs.is_empty() {
            self.lookups.insert(label, addrs);
        }
    }

    fn clear_lookups(&mut self, label: Label) {
        if let Some(addrs) = self.lookups.remove(&label) {
            for addr in addrs {
                if let Some(deps) = self.addr_deps.get_mut(&addr) {
                    deps.remove(&label);
                    if deps.is_empty() {
                        self.addr_deps.remove(&addr);
                    }
                }
            }
        }
    }

    /// Labels whose resolution can be altered by the changed unicast
    /// prefixes of the default VRF.
    #[must_use]
    pub fn dependents_of(&self, changed: &BTreeSet<Prefix>) -> BTreeSet<Label> {
        let mut out = BTreeSet::new();
        for (addr, deps) in &self.addr_deps {
            if changed.iter().any(|p| p.covers_addr(addr)) {
                out.extend(deps.iter().copied());
            }
        }
        out
    }
}

/// Re-resolve dirty labels plus those affected by unicast changes in the
/// default VRF.
pub(crate) fn resolve_labels(
    labels: &mut LabelRib,
    vrf0: &VrfRib,
    dirty: &BTreeSet<Label>,
    changed_prefixes: &BTreeSet<Prefix>,
    tie: TieBreak,
) {
    let mut work = dirty.clone();
    work.extend(labels.dependents_of(changed_prefixes));

    let mut results = Vec::new();
    for label in &work {
        let Some(route) = labels.get(*label) else {
            continue;
        };
        let Some((_, best)) = route.best(tie) else {
            unreachable!("label {label} with empty client map survived the updater");
        };
        let best = best.clone();
        let (forward, lookups) = flatten_entry(vrf0, None, &best, tie);
        results.push((*label, forward, lookups));
    }

    for (label, forward, lookups) in results {
        labels.set_lookups(label, lookups);
        if let Some(route) = labels.get_mut(label) {
            route.forward = forward;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpls::LabelStack;
    use crate::nexthop::{NextHop, NextHopEntry};
    use crate::types::{AdminDistance, ClientId};

    fn label(v: u32) -> Label {
        Label::try_new(v).expect("bad label")
    }

    #[test]
    fn test_label_resolution_through_vrf0() {
        let mut vrf0 = VrfRib::new("default", 0);
        let mut connected = RibRoute::from_client(
            ClientId::INTERFACE_ROUTE,
            NextHopEntry::forward(
                AdminDistance::DIRECTLY_CONNECTED,
                [NextHop::attached("10.0.0.2".parse().unwrap(), 1)],
            ),
        );
        connected.connected = true;
        vrf0.insert(Prefix::expect_from(("10.0.0.0", 30)), connected);

        let mut labels = LabelRib::new();
        let swap = LabelStack::try_from_raw(&[200]).unwrap();
        labels.insert(
            label(100),
            RibRoute::from_client(
                ClientId::STATIC_ROUTE,
                NextHopEntry::forward(
                    AdminDistance::STATIC_ROUTE,
                    [NextHop::recursive("10.0.0.1".parse().unwrap()).with_labels(swap)],
                ),
            ),
        );

        resolve_labels(
            &mut labels,
            &vrf0,
            &BTreeSet::from([label(100)]),
            &BTreeSet::new(),
            TieBreak::LowestClientId,
        );

        let forward = labels.get(label(100)).unwrap().forward.clone().expect("resolved");
        let hop = forward.nhops().unwrap().first().unwrap();
        assert_eq!(hop.ifindex, Some(1));
        assert_eq!(hop.labels.labels(), [label(200)]);
    }

    #[test]
    fn test_label_reresolution_on_unicast_change() {
        let mut vrf0 = VrfRib::new("default", 0);
        let mut labels = LabelRib::new();
        labels.insert(
            label(100),
            RibRoute::from_client(
                ClientId::STATIC_ROUTE,
                NextHopEntry::forward(
                    AdminDistance::STATIC_ROUTE,
                    [NextHop::recursive("10.0.0.1".parse().unwrap())],
                ),
            ),
        );
        resolve_labels(
            &mut labels,
            &vrf0,
            &BTreeSet::from([label(100)]),
            &BTreeSet::new(),
            TieBreak::LowestClientId,
        );
        assert!(labels.get(label(100)).unwrap().forward.is_none());

        /* unicast route appears: the label is a dependent and re-resolves */
        let mut connected = RibRoute::from_client(
            ClientId::INTERFACE_ROUTE,
            NextHopEntry::forward(
                AdminDistance::DIRECTLY_CONNECTED,
                [NextHop::attached("10.0.0.2".parse().unwrap(), 3)],
            ),
        );
        connected.connected = true;
        let subnet = Prefix::expect_from(("10.0.0.0", 30));
        vrf0.insert(subnet, connected);

        resolve_labels(
            &mut labels,
            &vrf0,
            &BTreeSet::new(),
            &BTreeSet::from([subnet]),
            TieBreak::LowestClientId,
        );
        assert!(labels.get(label(100)).unwrap().forward.is_some());
    }
}
