// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rib to fib processing: project the resolved subset of the RIB into new
//! FIB nodes and package the result as a pure snapshot transform.

use std::collections::BTreeMap;
use std::sync::Arc;

use lpm::prefix::Prefix;

use crate::mpls::Label;
use crate::rib::RibTables;
use crate::rib::vrf::VrfRib;
use crate::state::SwitchState;
use crate::state::fib::{FibMap, FibRoute, LabelFib, LabelFibEntry, VrfRouteTable};
use crate::state::pipeline::StateTransform;
use crate::types::RouterId;

/// The would-be FIB of one VRF, built from its RIB under the RIB lock.
#[derive(Debug, Clone)]
pub struct VrfFibCandidate {
    pub vrf: RouterId,
    pub name: String,
    pub v4: BTreeMap<Prefix, FibRoute>,
    pub v6: BTreeMap<Prefix, FibRoute>,
}

/// Project the resolved routes of a VRF RIB.
#[must_use]
pub fn build_vrf_fib(vrf: &VrfRib) -> VrfFibCandidate {
    let mut candidate = VrfFibCandidate {
        vrf: vrf.id,
        name: vrf.name.clone(),
        v4: BTreeMap::new(),
        v6: BTreeMap::new(),
    };
    for (p, route) in vrf.iter_v4() {
        if let Some(forward) = &route.forward {
            let prefix = Prefix::V4(*p);
            candidate.v4.insert(
                prefix,
                FibRoute {
                    prefix,
                    entries: route.entries().clone(),
                    forward: forward.clone(),
                },
            );
        }
    }
    for (p, route) in vrf.iter_v6() {
        if let Some(forward) = &route.forward {
            let prefix = Prefix::V6(*p);
            candidate.v6.insert(
                prefix,
                FibRoute {
                    prefix,
                    entries: route.entries().clone(),
                    forward: forward.clone(),
                },
            );
        }
    }
    candidate
}

/// Project the resolved label routes.
#[must_use]
pub fn build_label_fib(tables: &RibTables) -> BTreeMap<Label, LabelFibEntry> {
    let mut out = BTreeMap::new();
    for (label, route) in tables.labels().iter() {
        if let Some(forward) = &route.forward {
            out.insert(
                *label,
                LabelFibEntry {
                    label: *label,
                    entries: route.entries().clone(),
                    forward: forward.clone(),
                },
            );
        }
    }
    out
}

/// Rebuild one family map, sharing the `Arc` of every route whose content
/// is unchanged so the diff engine can skip it by pointer.
fn merge_family(old: Option<&FibMap>, candidate: BTreeMap<Prefix, FibRoute>) -> FibMap {
    let mut out = FibMap::new();
    for (prefix, value) in candidate {
        let reused = old
            .and_then(|m| m.get(&prefix))
            .filter(|existing| ***existing == value)
            .cloned();
        out.insert(prefix, reused.unwrap_or_else(|| Arc::new(value)));
    }
    out
}

/// Build the snapshot transform for a batch: per-VRF FIB candidates plus an
/// optional label-FIB candidate. The transform returns `None` when the new
/// FIBs are identical to the applied ones.
#[must_use]
pub fn fib_sync_transform(
    candidates: Vec<VrfFibCandidate>,
    label_candidate: Option<BTreeMap<Label, LabelFibEntry>>,
) -> StateTransform {
    Box::new(move |state: &SwitchState| {
        let mut changed = false;

        let mut tables = (*state.route_tables).clone();
        for candidate in candidates {
            let old_table = tables.tables.get(&candidate.vrf).cloned();
            let new_table = VrfRouteTable {
                id: candidate.vrf,
                name: candidate.name.clone(),
                v4: merge_family(old_table.as_ref().map(|t| &t.v4), candidate.v4),
                v6: merge_family(old_table.as_ref().map(|t| &t.v6), candidate.v6),
            };
            match old_table {
                Some(old) if *old == new_table => {}
                _ => {
                    tables.tables.insert(candidate.vrf, Arc::new(new_table));
                    changed = true;
                }
            }
        }

        let mut next = if changed {
            state.with_route_tables(tables)
        } else {
            state.clone()
        };

        if let Some(candidate) = label_candidate {
            let old = &state.label_fib.entries;
            let mut entries = BTreeMap::new();
            for (label, value) in candidate {
                let reused = old
                    .get(&label)
                    .filter(|existing| ***existing == value)
                    .cloned();
                entries.insert(label, reused.unwrap_or_else(|| Arc::new(value)));
            }
            if entries != *old {
                next = next.with_label_fib(LabelFib { entries });
                changed = true;
            }
        }

        changed.then_some(next)
    })
}

/// Transform dropping a VRF's FIB after the VRF is removed from the RIB.
#[must_use]
pub fn remove_vrf_transform(vrf: RouterId) -> StateTransform {
    Box::new(move |state: &SwitchState| {
        if !state.route_tables.tables.contains_key(&vrf) {
            return None;
        }
        let mut tables = (*state.route_tables).clone();
        tables.tables.remove(&vrf);
        Some(state.with_route_tables(tables))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexthop::{NextHop, NextHopEntry};
    use crate::rib::route::RibRoute;
    use crate::types::{AdminDistance, ClientId};

    fn resolved_route(ifindex: u32) -> RibRoute {
        let mut route = RibRoute::from_client(
            ClientId::BGP,
            NextHopEntry::forward(
                AdminDistance::EBGP,
                [NextHop::recursive("10.0.0.1".parse().unwrap())],
            ),
        );
        route.forward = Some(NextHopEntry::forward(
            AdminDistance::EBGP,
            [NextHop::attached("10.0.0.1".parse().unwrap(), ifindex)],
        ));
        route
    }

    #[test]
    fn test_unresolved_routes_stay_out_of_fib() {
        let mut vrf = VrfRib::new("default", 0);
        vrf.insert(Prefix::expect_from(("10.0.0.0", 8)), resolved_route(1));
        let unresolved = RibRoute::from_client(
            ClientId::BGP,
            NextHopEntry::forward(
                AdminDistance::EBGP,
                [NextHop::recursive("1.2.3.4".parse().unwrap())],
            ),
        );
        vrf.insert(Prefix::expect_from(("10.1.0.0", 16)), unresolved);

        let candidate = build_vrf_fib(&vrf);
        assert_eq!(candidate.v4.len(), 1);
        assert!(candidate.v4.contains_key(&Prefix::expect_from(("10.0.0.0", 8))));
    }

    #[test]
    fn test_remove_vrf_transform() {
        let mut vrf = VrfRib::new("blue", 7);
        vrf.insert(Prefix::expect_from(("10.0.0.0", 8)), resolved_route(1));

        let state0 = SwitchState::default();
        let transform = fib_sync_transform(vec![build_vrf_fib(&vrf)], None);
        let state1 = transform(&state0).expect("vrf fib appears");
        assert!(state1.route_tables.get(7).is_some());

        let transform = remove_vrf_transform(7);
        let state2 = transform(&state1).expect("vrf fib disappears");
        assert!(state2.route_tables.get(7).is_none());

        /* removing it again is a no-op */
        let transform = remove_vrf_transform(7);
        assert!(transform(&state2).is_none());
    }

    #[test]
    fn test_transform_reuses_unchanged_routes() {
        let mut vrf = VrfRib::new("default", 0);
        vrf.insert(Prefix::expect_from(("10.0.0.0", 8)), resolved_route(1));
        vrf.insert(Prefix::expect_from(("10.1.0.0", 16)), resolved_route(2));

        let state0 = SwitchState::default();
        let transform = fib_sync_transform(vec![build_vrf_fib(&vrf)], None);
        let state1 = transform(&state0).expect("first sync changes state");

        /* change one route, leave the other alone */
        vrf.get_route_mut(Prefix::expect_from(("10.1.0.0", 16)))
            .unwrap()
            .forward = Some(NextHopEntry::drop(AdminDistance::EBGP));
        let transform = fib_sync_transform(vec![build_vrf_fib(&vrf)], None);
        let state2 = transform(&state1).expect("second sync changes state");

        let p_kept = Prefix::expect_from(("10.0.0.0", 8));
        let kept_before = &state1.route_tables.tables[&0].v4[&p_kept];
        let kept_after = &state2.route_tables.tables[&0].v4[&p_kept];
        assert!(Arc::ptr_eq(kept_before, kept_after));

        /* identical candidate produces no transform output */
        let transform = fib_sync_transform(vec![build_vrf_fib(&vrf)], None);
        assert!(transform(&state2).is_none());
    }
}
