// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Batched RIB mutation. A `RibUpdater` collects adds, deletes and client
//! syncs, then `update_done()` recomputes bests, runs the resolver over the
//! dirty set and its dependents, and reports statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use lpm::prefix::Prefix;
use tracing::debug;

use crate::errors::AgentError;
use crate::mpls::Label;
use crate::nexthop::{NextHop, NextHopEntry};
use crate::rib::resolver::resolve_vrf;
use crate::rib::route::RibRoute;
use crate::rib::{RibTables, labels::resolve_labels};
use crate::types::{AdminDistance, ClientId, DEFAULT_VRF, InterfaceId, RouterId};

/// Counters reported by [`RibUpdater::update_done`]. Idempotent operations
/// (re-adding an identical route, deleting an absent one) increment nothing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateStatistics {
    pub v4_added: u32,
    pub v4_deleted: u32,
    pub v6_added: u32,
    pub v6_deleted: u32,
    pub duration: Duration,
}

impl UpdateStatistics {
    fn count_add(&mut self, prefix: Prefix) {
        if prefix.is_ipv4() {
            self.v4_added += 1;
        } else {
            self.v6_added += 1;
        }
    }
    fn count_del(&mut self, prefix: Prefix) {
        if prefix.is_ipv4() {
            self.v4_deleted += 1;
        } else {
            self.v6_deleted += 1;
        }
    }
}

/// What changed in a batch, for scheduling FIB rebuilds.
#[derive(Debug, Default, Clone)]
pub struct RibChanges {
    pub vrfs: BTreeSet<RouterId>,
    pub labels: bool,
}

pub struct RibUpdater<'a> {
    tables: &'a mut RibTables,
    started: Instant,
    dirty: BTreeMap<RouterId, BTreeSet<Prefix>>,
    dirty_labels: BTreeSet<Label>,
    /// Deletions deferred by `remove_all_routes_for_client`: re-adding an
    /// identical route within the batch cancels out with no net change.
    sync_candidates: BTreeMap<(RouterId, ClientId), BTreeMap<Prefix, NextHopEntry>>,
    label_sync_candidates: BTreeMap<ClientId, BTreeMap<Label, NextHopEntry>>,
    stats: UpdateStatistics,
}

impl<'a> RibUpdater<'a> {
    pub fn new(tables: &'a mut RibTables) -> Self {
        Self {
            tables,
            started: Instant::now(),
            dirty: BTreeMap::new(),
            dirty_labels: BTreeSet::new(),
            sync_candidates: BTreeMap::new(),
            label_sync_candidates: BTreeMap::new(),
            stats: UpdateStatistics::default(),
        }
    }

    fn mark_dirty(&mut self, vrf: RouterId, prefix: Prefix) {
        self.dirty.entry(vrf).or_default().insert(prefix);
    }

    /////////////////////////////////////////////////////////////////////////
    // Unicast mutations
    /////////////////////////////////////////////////////////////////////////

    /// Insert or replace one client's submission for a prefix.
    ///
    /// # Errors
    /// Fails with `NoSuchVrf` for an unknown router id.
    pub fn add_route(
        &mut self,
        vrf: RouterId,
        prefix: Prefix,
        client: ClientId,
        entry: NextHopEntry,
    ) -> Result<(), AgentError> {
        /* cancel a pending sync deletion when the re-add is identical */
        if let Some(pending) = self.sync_candidates.get_mut(&(vrf, client)) {
            if pending.get(&prefix) == Some(&entry) {
                pending.remove(&prefix);
                return Ok(());
            }
            pending.remove(&prefix);
        }

        let vrf_rib = self.tables.get_vrf_mut(vrf)?;
        let changed = if vrf_rib.get_route(prefix).is_some() {
            let route = vrf_rib
                .get_route_mut(prefix)
                .unwrap_or_else(|| unreachable!());
            route.set_entry(client, entry)
        } else {
            vrf_rib.insert(prefix, RibRoute::from_client(client, entry));
            true
        };
        if changed {
            self.stats.count_add(prefix);
            self.mark_dirty(vrf, prefix);
        }
        Ok(())
    }

    /// Remove one client's submission for a prefix. The route node is
    /// destroyed when its client map empties. Deleting an absent submission
    /// is a no-op.
    ///
    /// # Errors
    /// Fails with `NoSuchVrf` for an unknown router id.
    pub fn del_route(
        &mut self,
        vrf: RouterId,
        prefix: Prefix,
        client: ClientId,
    ) -> Result<(), AgentError> {
        let vrf_rib = self.tables.get_vrf_mut(vrf)?;
        let Some(route) = vrf_rib.get_route_mut(prefix) else {
            return Ok(());
        };
        if route.del_entry(client).is_none() {
            return Ok(());
        }
        if client == ClientId::INTERFACE_ROUTE {
            route.connected = false;
        }
        if !route.has_entries() {
            vrf_rib.remove(prefix);
        }
        self.stats.count_del(prefix);
        self.mark_dirty(vrf, prefix);
        Ok(())
    }

    /// Stage removal of every submission a client has in a VRF. Actual
    /// removal happens in `update_done()`, so a sync that re-adds the same
    /// route observes no change.
    ///
    /// # Errors
    /// Fails with `NoSuchVrf` for an unknown router id.
    pub fn remove_all_routes_for_client(
        &mut self,
        vrf: RouterId,
        client: ClientId,
    ) -> Result<(), AgentError> {
        let vrf_rib = self.tables.get_vrf(vrf)?;
        let mut pending: BTreeMap<Prefix, NextHopEntry> = BTreeMap::new();
        for (p, route) in vrf_rib.iter_v4() {
            if let Some(entry) = route.entry_for(client) {
                pending.insert(Prefix::V4(*p), entry.clone());
            }
        }
        for (p, route) in vrf_rib.iter_v6() {
            if let Some(entry) = route.entry_for(client) {
                pending.insert(Prefix::V6(*p), entry.clone());
            }
        }
        debug!(
            "staged removal of {} routes of client {client} in vrf {vrf}",
            pending.len()
        );
        self.sync_candidates
            .entry((vrf, client))
            .or_default()
            .extend(pending);
        Ok(())
    }

    /// Insert a connected route for an interface subnet.
    ///
    /// # Errors
    /// Fails with `NoSuchVrf` for an unknown router id.
    pub fn add_interface_route(
        &mut self,
        vrf: RouterId,
        prefix: Prefix,
        endpoint: IpAddr,
        ifindex: InterfaceId,
    ) -> Result<(), AgentError> {
        let entry = NextHopEntry::forward(
            AdminDistance::DIRECTLY_CONNECTED,
            [NextHop::attached(endpoint, ifindex)],
        );
        self.add_route(vrf, prefix, ClientId::INTERFACE_ROUTE, entry)?;
        let vrf_rib = self.tables.get_vrf_mut(vrf)?;
        if let Some(route) = vrf_rib.get_route_mut(prefix) {
            route.connected = true;
        }
        Ok(())
    }

    /// Idempotent insertion of fe80::/64 toward the CPU.
    ///
    /// # Errors
    /// Fails with `NoSuchVrf` for an unknown router id.
    pub fn add_link_local_routes(&mut self, vrf: RouterId) -> Result<(), AgentError> {
        let prefix = Prefix::from_str("fe80::/64").unwrap_or_else(|_| unreachable!());
        self.add_route(
            vrf,
            prefix,
            ClientId::LINKLOCAL_ROUTE,
            NextHopEntry::to_cpu(AdminDistance::DIRECTLY_CONNECTED),
        )
    }

    /////////////////////////////////////////////////////////////////////////
    // MPLS mutations
    /////////////////////////////////////////////////////////////////////////

    /// Insert or replace one client's submission for a label.
    pub fn add_label_route(&mut self, label: Label, client: ClientId, entry: NextHopEntry) {
        if let Some(pending) = self.label_sync_candidates.get_mut(&client) {
            if pending.get(&label) == Some(&entry) {
                pending.remove(&label);
                return;
            }
            pending.remove(&label);
        }
        let changed = if self.tables.labels.get(label).is_some() {
            let route = self
                .tables
                .labels
                .get_mut(label)
                .unwrap_or_else(|| unreachable!());
            route.set_entry(client, entry)
        } else {
            self.tables
                .labels
                .insert(label, RibRoute::from_client(client, entry));
            true
        };
        if changed {
            self.dirty_labels.insert(label);
        }
    }

    /// Remove one client's submission for a label.
    pub fn del_label_route(&mut self, label: Label, client: ClientId) {
        let Some(route) = self.tables.labels.get_mut(label) else {
            return;
        };
        if route.del_entry(client).is_none() {
            return;
        }
        if !route.has_entries() {
            self.tables.labels.remove(label);
        }
        self.dirty_labels.insert(label);
    }

    /// Stage removal of every label submission a client has.
    pub fn remove_all_label_routes_for_client(&mut self, client: ClientId) {
        let mut pending: BTreeMap<Label, NextHopEntry> = BTreeMap::new();
        for (label, route) in self.tables.labels.iter() {
            if let Some(entry) = route.entry_for(client) {
                pending.insert(*label, entry.clone());
            }
        }
        self.label_sync_candidates
            .entry(client)
            .or_default()
            .extend(pending);
    }

    /////////////////////////////////////////////////////////////////////////
    // Batch end
    /////////////////////////////////////////////////////////////////////////

    fn apply_staged_removals(&mut self) {
        let staged = std::mem::take(&mut self.sync_candidates);
        for ((vrf, client), pending) in staged {
            let Ok(vrf_rib) = self.tables.get_vrf_mut(vrf) else {
                continue;
            };
            for (prefix, entry) in pending {
                let Some(route) = vrf_rib.get_route_mut(prefix) else {
                    continue;
                };
                /* only remove what remove_all saw; a later add replaced it */
                if route.entry_for(client) != Some(&entry) {
                    continue;
                }
                route.del_entry(client);
                if client == ClientId::INTERFACE_ROUTE {
                    route.connected = false;
                }
                if !route.has_entries() {
                    vrf_rib.remove(prefix);
                }
                self.stats.count_del(prefix);
                self.dirty.entry(vrf).or_default().insert(prefix);
            }
        }

        let staged = std::mem::take(&mut self.label_sync_candidates);
        for (client, pending) in staged {
            for (label, entry) in pending {
                let Some(route) = self.tables.labels.get_mut(label) else {
                    continue;
                };
                if route.entry_for(client) != Some(&entry) {
                    continue;
                }
                route.del_entry(client);
                if !route.has_entries() {
                    self.tables.labels.remove(label);
                }
                self.dirty_labels.insert(label);
            }
        }
    }

    /// Finish the batch: apply staged sync removals, re-resolve the dirty
    /// prefixes and their dependents, and report what changed.
    ///
    /// # Errors
    /// Fails with `NoSuchVrf` if a dirty VRF disappeared mid-batch, which
    /// indicates a bug in the caller.
    pub fn update_done(mut self) -> Result<(UpdateStatistics, RibChanges), AgentError> {
        self.apply_staged_removals();

        let tie = self.tables.tie_break;
        for (vrf, dirty) in &self.dirty {
            let vrf_rib = self.tables.get_vrf_mut(*vrf)?;
            resolve_vrf(vrf_rib, dirty, tie);
        }

        let changed_v0 = self.dirty.get(&DEFAULT_VRF).cloned().unwrap_or_default();
        let labels_touched = !self.dirty_labels.is_empty()
            || (!changed_v0.is_empty() && !self.tables.labels.is_empty());
        if labels_touched {
            let vrf0 = self
                .tables
                .vrfs
                .get(&DEFAULT_VRF)
                .ok_or(AgentError::NoSuchVrf(DEFAULT_VRF))?;
            resolve_labels(
                &mut self.tables.labels,
                vrf0,
                &self.dirty_labels,
                &changed_v0,
                tie,
            );
        }

        let mut stats = self.stats;
        stats.duration = self.started.elapsed();
        let changes = RibChanges {
            vrfs: self.dirty.keys().copied().collect(),
            labels: labels_touched,
        };
        debug!(
            "rib update done: +{}/{} -{}/{} ({} us)",
            stats.v4_added,
            stats.v6_added,
            stats.v4_deleted,
            stats.v6_deleted,
            stats.duration.as_micros()
        );
        Ok((stats, changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::route::TieBreak;

    fn entry_via(addr: &str) -> NextHopEntry {
        NextHopEntry::forward(
            AdminDistance::EBGP,
            [NextHop::recursive(addr.parse().unwrap())],
        )
    }

    fn prefix(s: &str, len: u8) -> Prefix {
        Prefix::expect_from((s, len))
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut tables = RibTables::new(TieBreak::default());

        let mut updater = RibUpdater::new(&mut tables);
        updater
            .add_route(0, prefix("10.0.0.0", 8), ClientId::BGP, entry_via("1.1.1.1"))
            .unwrap();
        let (stats, _) = updater.update_done().unwrap();
        assert_eq!(stats.v4_added, 1);

        /* identical re-add reports nothing */
        let mut updater = RibUpdater::new(&mut tables);
        updater
            .add_route(0, prefix("10.0.0.0", 8), ClientId::BGP, entry_via("1.1.1.1"))
            .unwrap();
        let (stats, changes) = updater.update_done().unwrap();
        assert_eq!(stats.v4_added, 0);
        assert!(changes.vrfs.is_empty());
    }

    #[test]
    fn test_add_then_del_restores() {
        let mut tables = RibTables::new(TieBreak::default());
        let p = prefix("10.0.0.0", 8);

        let mut updater = RibUpdater::new(&mut tables);
        updater
            .add_route(0, p, ClientId::BGP, entry_via("1.1.1.1"))
            .unwrap();
        updater.update_done().unwrap();
        assert!(tables.get_vrf(0).unwrap().get_route(p).is_some());

        let mut updater = RibUpdater::new(&mut tables);
        updater.del_route(0, p, ClientId::BGP).unwrap();
        let (stats, _) = updater.update_done().unwrap();
        assert_eq!(stats.v4_deleted, 1);
        /* client map emptied: the prefix is gone */
        assert!(tables.get_vrf(0).unwrap().get_route(p).is_none());

        /* deleting again is a no-op */
        let mut updater = RibUpdater::new(&mut tables);
        updater.del_route(0, p, ClientId::BGP).unwrap();
        let (stats, _) = updater.update_done().unwrap();
        assert_eq!(stats.v4_deleted, 0);
    }

    #[test]
    fn test_multi_client_merge() {
        let mut tables = RibTables::new(TieBreak::default());
        let p = prefix("10.0.0.0", 8);

        let mut updater = RibUpdater::new(&mut tables);
        updater
            .add_route(0, p, ClientId::BGP, entry_via("1.1.1.1"))
            .unwrap();
        updater
            .add_route(
                0,
                p,
                ClientId::STATIC_ROUTE,
                NextHopEntry::forward(
                    AdminDistance::STATIC_ROUTE,
                    [NextHop::recursive("2.2.2.2".parse().unwrap())],
                ),
            )
            .unwrap();
        updater.update_done().unwrap();

        let route = tables.get_vrf(0).unwrap().get_route(p).unwrap();
        let (client, _) = route.best(TieBreak::LowestClientId).unwrap();
        assert_eq!(client, ClientId::STATIC_ROUTE);

        /* deleting the preferred client falls back to the other */
        let mut updater = RibUpdater::new(&mut tables);
        updater.del_route(0, p, ClientId::STATIC_ROUTE).unwrap();
        updater.update_done().unwrap();
        let route = tables.get_vrf(0).unwrap().get_route(p).unwrap();
        let (client, _) = route.best(TieBreak::LowestClientId).unwrap();
        assert_eq!(client, ClientId::BGP);
    }

    #[test]
    fn test_sync_counts_net_changes_only() {
        let mut tables = RibTables::new(TieBreak::default());

        /* client starts with 4 routes */
        let mut updater = RibUpdater::new(&mut tables);
        for i in 0..4u8 {
            updater
                .add_route(
                    0,
                    prefix(&format!("10.{i}.0.0"), 16),
                    ClientId::OPENR,
                    entry_via("1.1.1.1"),
                )
                .unwrap();
        }
        updater.update_done().unwrap();

        /* sync keeps 2, drops 2, adds 2 new */
        let mut updater = RibUpdater::new(&mut tables);
        updater.remove_all_routes_for_client(0, ClientId::OPENR).unwrap();
        for name in ["10.0.0.0", "10.1.0.0", "172.16.0.0", "172.17.0.0"] {
            updater
                .add_route(0, prefix(name, 16), ClientId::OPENR, entry_via("1.1.1.1"))
                .unwrap();
        }
        let (stats, _) = updater.update_done().unwrap();
        assert_eq!(stats.v4_added, 2);
        assert_eq!(stats.v4_deleted, 2);

        let vrf = tables.get_vrf(0).unwrap();
        assert!(vrf.get_route(prefix("10.2.0.0", 16)).is_none());
        assert!(vrf.get_route(prefix("172.16.0.0", 16)).is_some());
    }

    #[test]
    fn test_link_local_idempotent() {
        let mut tables = RibTables::new(TieBreak::default());
        let mut updater = RibUpdater::new(&mut tables);
        updater.add_link_local_routes(0).unwrap();
        let (stats, _) = updater.update_done().unwrap();
        assert_eq!(stats.v6_added, 1);

        let mut updater = RibUpdater::new(&mut tables);
        updater.add_link_local_routes(0).unwrap();
        let (stats, _) = updater.update_done().unwrap();
        assert_eq!(stats.v6_added, 0);
    }

    #[test]
    fn test_unknown_vrf() {
        let mut tables = RibTables::new(TieBreak::default());
        let mut updater = RibUpdater::new(&mut tables);
        let err = updater
            .add_route(9, prefix("10.0.0.0", 8), ClientId::BGP, entry_via("1.1.1.1"))
            .unwrap_err();
        assert_eq!(err, AgentError::NoSuchVrf(9));
    }

    #[test]
    fn test_label_routes() {
        let mut tables = RibTables::new(TieBreak::default());
        let label = Label::try_new(100).unwrap();

        let mut updater = RibUpdater::new(&mut tables);
        updater.add_label_route(label, ClientId::STATIC_ROUTE, entry_via("10.0.0.1"));
        let (_, changes) = updater.update_done().unwrap();
        assert!(changes.labels);
        assert!(tables.labels().get(label).is_some());

        let mut updater = RibUpdater::new(&mut tables);
        updater.del_label_route(label, ClientId::STATIC_ROUTE);
        updater.update_done().unwrap();
        assert!(tables.labels().get(label).is_none());
    }
}
