// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! FIB nodes of the switch-state snapshot. A FIB holds only resolved
//! routes; unresolved RIB entries never reach it.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use lpm::prefix::Prefix;
use serde::{Deserialize, Serialize};

use crate::mpls::Label;
use crate::nexthop::NextHopEntry;
use crate::types::{ClientId, RouterId};

/// A resolved route as programmed toward hardware: the forward info plus
/// the per-client submissions kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FibRoute {
    pub prefix: Prefix,
    pub entries: BTreeMap<ClientId, NextHopEntry>,
    pub forward: NextHopEntry,
}

pub type FibMap = BTreeMap<Prefix, Arc<FibRoute>>;

/// Per-VRF FIB, both address families.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfRouteTable {
    pub id: RouterId,
    pub name: String,
    pub v4: FibMap,
    pub v6: FibMap,
}

impl VrfRouteTable {
    #[must_use]
    pub fn new(id: RouterId, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            v4: FibMap::new(),
            v6: FibMap::new(),
        }
    }

    fn family(&self, addr: &IpAddr) -> &FibMap {
        match addr {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        }
    }

    /// Longest-prefix match over the FIB.
    #[must_use]
    pub fn lpm(&self, addr: &IpAddr) -> Option<&Arc<FibRoute>> {
        self.family(addr)
            .iter()
            .filter(|(p, _)| p.covers_addr(addr))
            .max_by_key(|(p, _)| p.length())
            .map(|(_, route)| route)
    }

    /// All routes of both families, v4 first.
    pub fn routes(&self) -> impl Iterator<Item = &Arc<FibRoute>> {
        self.v4.values().chain(self.v6.values())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// All per-VRF FIBs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTables {
    pub tables: BTreeMap<RouterId, Arc<VrfRouteTable>>,
}

impl RouteTables {
    #[must_use]
    pub fn get(&self, vrf: RouterId) -> Option<&Arc<VrfRouteTable>> {
        self.tables.get(&vrf)
    }
}

/// A resolved MPLS forwarding entry, same shape as a [`FibRoute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFibEntry {
    pub label: Label,
    pub entries: BTreeMap<ClientId, NextHopEntry>,
    pub forward: NextHopEntry,
}

/// The MPLS FIB.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFib {
    pub entries: BTreeMap<Label, Arc<LabelFibEntry>>,
}

impl LabelFib {
    #[must_use]
    pub fn get(&self, label: Label) -> Option<&Arc<LabelFibEntry>> {
        self.entries.get(&label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexthop::NextHop;
    use crate::types::AdminDistance;

    fn fib_route(prefix: (&str, u8), ifindex: u32) -> Arc<FibRoute> {
        let prefix = Prefix::expect_from(prefix);
        Arc::new(FibRoute {
            prefix,
            entries: BTreeMap::new(),
            forward: NextHopEntry::forward(
                AdminDistance::EBGP,
                [NextHop::attached("10.0.0.1".parse().unwrap(), ifindex)],
            ),
        })
    }

    #[test]
    fn test_fib_lpm() {
        let mut table = VrfRouteTable::new(0, "default");
        let coarse = fib_route(("10.0.0.0", 8), 1);
        let fine = fib_route(("10.1.0.0", 16), 2);
        table.v4.insert(coarse.prefix, coarse);
        table.v4.insert(fine.prefix, fine);

        let hit = table.lpm(&"10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(hit.prefix, Prefix::expect_from(("10.1.0.0", 16)));
        let hit = table.lpm(&"10.99.0.1".parse().unwrap()).unwrap();
        assert_eq!(hit.prefix, Prefix::expect_from(("10.0.0.0", 8)));
        assert!(table.lpm(&"192.0.2.1".parse().unwrap()).is_none());
    }
}
