// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-VRF RIB: the IPv4 and IPv6 route tries plus the reverse dependency
//! index the resolver maintains.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use lpm::prefix::{Ipv4Prefix, Ipv6Prefix, Prefix};
use lpm::trie::{PrefixMapTrie, TrieMap};

use crate::rib::route::RibRoute;
use crate::types::RouterId;

pub struct VrfRib {
    pub name: String,
    pub id: RouterId,
    pub(crate) routes_v4: PrefixMapTrie<Ipv4Prefix, RibRoute>,
    pub(crate) routes_v6: PrefixMapTrie<Ipv6Prefix, RibRoute>,
    /// Reverse dependency index: recursive next-hop address that some route
    /// looked up -> the prefixes whose resolution used that lookup.
    pub(crate) addr_deps: BTreeMap<IpAddr, BTreeSet<Prefix>>,
    /// Forward index for incremental maintenance: prefix -> the addresses
    /// its last resolution looked up.
    pub(crate) lookups: BTreeMap<Prefix, BTreeSet<IpAddr>>,
}

impl VrfRib {
    #[must_use]
    pub fn new(name: &str, id: RouterId) -> Self {
        Self {
            name: name.to_owned(),
            id,
            routes_v4: PrefixMapTrie::new(),
            routes_v6: PrefixMapTrie::new(),
            addr_deps: BTreeMap::new(),
            lookups: BTreeMap::new(),
        }
    }

    /////////////////////////////////////////////////////////////////////////
    // Route storage
    /////////////////////////////////////////////////////////////////////////

    pub fn insert(&mut self, prefix: Prefix, route: RibRoute) -> Option<RibRoute> {
        match prefix {
            Prefix::V4(p) => self.routes_v4.insert(p, route),
            Prefix::V6(p) => self.routes_v6.insert(p, route),
        }
    }

    pub fn remove(&mut self, prefix: Prefix) -> Option<RibRoute> {
        self.clear_lookups(prefix);
        match prefix {
            Prefix::V4(p) => self.routes_v4.remove(&p),
            Prefix::V6(p) => self.routes_v6.remove(&p),
        }
    }

    #[must_use]
    pub fn get_route(&self, prefix: Prefix) -> Option<&RibRoute> {
        match prefix {
            Prefix::V4(p) => self.routes_v4.get(&p),
            Prefix::V6(p) => self.routes_v6.get(&p),
        }
    }

    pub fn get_route_mut(&mut self, prefix: Prefix) -> Option<&mut RibRoute> {
        match prefix {
            Prefix::V4(p) => self.routes_v4.get_mut(&p),
            Prefix::V6(p) => self.routes_v6.get_mut(&p),
        }
    }

    /////////////////////////////////////////////////////////////////////////
    // LPM
    /////////////////////////////////////////////////////////////////////////

    #[must_use]
    pub fn lpm(&self, target: IpAddr) -> Option<(Prefix, &RibRoute)> {
        match target {
            IpAddr::V4(a) => self
                .routes_v4
                .lookup(&a)
                .map(|(p, r)| (Prefix::V4(*p), r)),
            IpAddr::V6(a) => self
                .routes_v6
                .lookup(&a)
                .map(|(p, r)| (Prefix::V6(*p), r)),
        }
    }

    /////////////////////////////////////////////////////////////////////////
    // Iteration and counts
    /////////////////////////////////////////////////////////////////////////

    pub fn iter_v4(&self) -> impl Iterator<Item = (&Ipv4Prefix, &RibRoute)> {
        self.routes_v4.iter()
    }
    pub fn iter_v6(&self) -> impl Iterator<Item = (&Ipv6Prefix, &RibRoute)> {
        self.routes_v6.iter()
    }
    /// All prefixes of both families, unordered.
    pub fn prefixes(&self) -> Vec<Prefix> {
        let mut out: Vec<Prefix> = Vec::with_capacity(self.len_v4() + self.len_v6());
        out.extend(self.routes_v4.iter_unordered().map(|(p, _)| Prefix::V4(*p)));
        out.extend(self.routes_v6.iter_unordered().map(|(p, _)| Prefix::V6(*p)));
        out
    }
    #[must_use]
    pub fn len_v4(&self) -> usize {
        self.routes_v4.len()
    }
    #[must_use]
    pub fn len_v6(&self) -> usize {
        self.routes_v6.len()
    }

    /////////////////////////////////////////////////////////////////////////
    // Reverse dependency index
    /////////////////////////////////////////////////////////////////////////

    /// Record the recursive-next-hop addresses a prefix's resolution looked
    /// up, replacing whatever was recorded before.
    pub fn set_lookups(&mut self, dependent: Prefix, addrs: BTreeSet<IpAddr>) {
        self.clear_lookups(dependent);
        for addr in &addrs {
            self.addr_deps.entry(*addr).or_default().insert(dependent);
        }
        if !addrs.is_empty() {
            self.lookups.insert(dependent, addrs);
        }
    }

    pub fn clear_lookups(&mut self, dependent: Prefix) {
        if let Some(addrs) = self.lookups.remove(&dependent) {
            for addr in addrs {
                if let Some(deps) = self.addr_deps.get_mut(&addr) {
                    deps.remove(&dependent);
                    if deps.is_empty() {
                        self.addr_deps.remove(&addr);
                    }
                }
            }
        }
    }

    /// The prefixes whose resolution depends on an LPM result that any of
    /// the `changed` prefixes could alter. A changed prefix affects a
    /// dependent iff it covers one of the addresses the dependent looked up.
    #[must_use]
    pub fn dependents_of(&self, changed: &BTreeSet<Prefix>) -> BTreeSet<Prefix> {
        let mut out = BTreeSet::new();
        for (addr, deps) in &self.addr_deps {
            if changed.iter().any(|p| p.covers_addr(addr)) {
                out.extend(deps.iter().copied());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexthop::{NextHop, NextHopEntry};
    use crate::rib::route::TieBreak;
    use crate::types::{AdminDistance, ClientId};

    fn route_via(addr: &str) -> RibRoute {
        RibRoute::from_client(
            ClientId::BGP,
            NextHopEntry::forward(AdminDistance::EBGP, [NextHop::recursive(addr.parse().unwrap())]),
        )
    }

    #[test]
    fn test_vrf_lpm() {
        let mut vrf = VrfRib::new("default", 0);
        vrf.insert(Prefix::expect_from(("10.0.0.0", 8)), route_via("1.1.1.1"));
        vrf.insert(Prefix::expect_from(("10.1.0.0", 16)), route_via("2.2.2.2"));

        let (longest, route) = vrf.lpm("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(longest, Prefix::expect_from(("10.1.0.0", 16)));
        let (_, entry) = route.best(TieBreak::LowestClientId).unwrap();
        assert!(entry.action.is_forward());

        let (longest, _) = vrf.lpm("10.200.0.1".parse().unwrap()).unwrap();
        assert_eq!(longest, Prefix::expect_from(("10.0.0.0", 8)));

        assert!(vrf.lpm("192.0.2.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_dependency_index() {
        let mut vrf = VrfRib::new("default", 0);
        let dependent = Prefix::expect_from(("8.0.0.0", 16));
        let looked_up: IpAddr = "10.0.0.1".parse().unwrap();
        vrf.set_lookups(dependent, BTreeSet::from([looked_up]));

        /* a change to a covering prefix affects the dependent */
        let changed = BTreeSet::from([Prefix::expect_from(("10.0.0.0", 24))]);
        assert!(vrf.dependents_of(&changed).contains(&dependent));

        /* a change elsewhere does not */
        let changed = BTreeSet::from([Prefix::expect_from(("172.16.0.0", 12))]);
        assert!(vrf.dependents_of(&changed).is_empty());

        /* clearing the lookups empties the index */
        vrf.clear_lookups(dependent);
        assert!(vrf.addr_deps.is_empty());
        assert!(vrf.lookups.is_empty());
    }
}
