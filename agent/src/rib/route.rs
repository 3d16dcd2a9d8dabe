// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-prefix route state: the per-client submissions and what they derive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::nexthop::NextHopEntry;
use crate::types::ClientId;

/// Policy for choosing among clients that submitted the same admin distance.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    #[default]
    LowestClientId,
    HighestClientId,
}

/// The state of one prefix in a VRF RIB: every client's submission, the
/// derived forwarding result and whether the prefix is an interface subnet.
///
/// A `RibRoute` exists only while at least one client has a submission for
/// its prefix; the updater removes it when the map empties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RibRoute {
    entries: BTreeMap<ClientId, NextHopEntry>,
    /// Resolution result for `best`: `None` while unresolved.
    pub forward: Option<NextHopEntry>,
    pub connected: bool,
}

impl RibRoute {
    #[must_use]
    pub fn from_client(client: ClientId, entry: NextHopEntry) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(client, entry);
        Self {
            entries,
            forward: None,
            connected: false,
        }
    }

    /// Install or replace a client's submission. Returns true if the stored
    /// entry changed.
    pub fn set_entry(&mut self, client: ClientId, entry: NextHopEntry) -> bool {
        match self.entries.get(&client) {
            Some(existing) if *existing == entry => false,
            _ => {
                self.entries.insert(client, entry);
                true
            }
        }
    }

    /// Remove a client's submission, returning it if present.
    pub fn del_entry(&mut self, client: ClientId) -> Option<NextHopEntry> {
        self.entries.remove(&client)
    }

    #[must_use]
    pub fn entry_for(&self, client: ClientId) -> Option<&NextHopEntry> {
        self.entries.get(&client)
    }

    #[must_use]
    pub fn has_entries(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn iter_entries(&self) -> impl Iterator<Item = (&ClientId, &NextHopEntry)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn entries(&self) -> &BTreeMap<ClientId, NextHopEntry> {
        &self.entries
    }

    /// The winning submission: minimum admin distance, ties broken by the
    /// configured client policy. `None` iff the client map is empty.
    #[must_use]
    pub fn best(&self, tie: TieBreak) -> Option<(ClientId, &NextHopEntry)> {
        let mut winner: Option<(ClientId, &NextHopEntry)> = None;
        for (client, entry) in &self.entries {
            let better = match winner {
                None => true,
                Some((best_client, best_entry)) => {
                    if entry.distance != best_entry.distance {
                        entry.distance < best_entry.distance
                    } else {
                        match tie {
                            TieBreak::LowestClientId => *client < best_client,
                            TieBreak::HighestClientId => *client > best_client,
                        }
                    }
                }
            };
            if better {
                winner = Some((*client, entry));
            }
        }
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexthop::NextHop;
    use crate::types::AdminDistance;

    fn fwd(distance: AdminDistance, addr: &str) -> NextHopEntry {
        NextHopEntry::forward(distance, [NextHop::recursive(addr.parse().unwrap())])
    }

    #[test]
    fn test_best_by_distance() {
        let mut route = RibRoute::from_client(ClientId::BGP, fwd(AdminDistance::EBGP, "10.0.0.1"));
        route.set_entry(
            ClientId::STATIC_ROUTE,
            fwd(AdminDistance::STATIC_ROUTE, "10.0.0.2"),
        );

        let (client, entry) = route.best(TieBreak::LowestClientId).unwrap();
        assert_eq!(client, ClientId::STATIC_ROUTE);
        assert_eq!(entry.distance, AdminDistance::STATIC_ROUTE);
    }

    #[test]
    fn test_best_tie_break() {
        let mut route = RibRoute::from_client(ClientId(7), fwd(AdminDistance::OPENR, "10.0.0.1"));
        route.set_entry(ClientId(3), fwd(AdminDistance::OPENR, "10.0.0.2"));

        let (client, _) = route.best(TieBreak::LowestClientId).unwrap();
        assert_eq!(client, ClientId(3));
        let (client, _) = route.best(TieBreak::HighestClientId).unwrap();
        assert_eq!(client, ClientId(7));
    }

    #[test]
    fn test_set_entry_idempotent() {
        let mut route = RibRoute::from_client(ClientId::BGP, fwd(AdminDistance::EBGP, "10.0.0.1"));
        assert!(!route.set_entry(ClientId::BGP, fwd(AdminDistance::EBGP, "10.0.0.1")));
        assert!(route.set_entry(ClientId::BGP, fwd(AdminDistance::EBGP, "10.0.0.9")));
    }

    #[test]
    fn test_empty_map_has_no_best() {
        let mut route = RibRoute::from_client(ClientId::BGP, fwd(AdminDistance::EBGP, "10.0.0.1"));
        route.del_entry(ClientId::BGP);
        assert!(!route.has_entries());
        assert!(route.best(TieBreak::LowestClientId).is_none());
    }
}
