// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Structural diff of two snapshots, producing the minimal set of FIB
//! operations the hardware layer must apply.
//!
//! The walk visits old and new trees in lockstep and skips every subtree
//! the two snapshots share by pointer. A `Replace` is emitted only when the
//! forward info differs structurally; diagnostic-only changes (the
//! per-client map) produce no operation.

use std::sync::Arc;

use crate::mpls::Label;
use crate::state::SwitchState;
use crate::state::fib::{FibMap, FibRoute, LabelFibEntry, VrfRouteTable};
use crate::types::RouterId;

#[derive(Debug, Clone)]
pub enum RouteOp {
    Add {
        vrf: RouterId,
        route: Arc<FibRoute>,
    },
    Replace {
        vrf: RouterId,
        route: Arc<FibRoute>,
        old: Arc<FibRoute>,
    },
    Remove {
        vrf: RouterId,
        old: Arc<FibRoute>,
    },
}

#[derive(Debug, Clone)]
pub enum LabelOp {
    Add(Arc<LabelFibEntry>),
    Replace {
        entry: Arc<LabelFibEntry>,
        old: Arc<LabelFibEntry>,
    },
    Remove(Arc<LabelFibEntry>),
}

#[derive(Debug, Default, Clone)]
pub struct StateDelta {
    pub routes: Vec<RouteOp>,
    pub labels: Vec<LabelOp>,
}

impl StateDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.labels.is_empty()
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len() + self.labels.len()
    }
}

fn diff_fib_maps(vrf: RouterId, old: &FibMap, new: &FibMap, out: &mut Vec<RouteOp>) {
    let mut old_iter = old.iter().peekable();
    let mut new_iter = new.iter().peekable();

    loop {
        match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => {
                let (_, route) = old_iter.next().unwrap_or_else(|| unreachable!());
                out.push(RouteOp::Remove {
                    vrf,
                    old: Arc::clone(route),
                });
            }
            (None, Some(_)) => {
                let (_, route) = new_iter.next().unwrap_or_else(|| unreachable!());
                out.push(RouteOp::Add {
                    vrf,
                    route: Arc::clone(route),
                });
            }
            (Some((old_prefix, _)), Some((new_prefix, _))) => {
                if old_prefix < new_prefix {
                    let (_, route) = old_iter.next().unwrap_or_else(|| unreachable!());
                    out.push(RouteOp::Remove {
                        vrf,
                        old: Arc::clone(route),
                    });
                } else if new_prefix < old_prefix {
                    let (_, route) = new_iter.next().unwrap_or_else(|| unreachable!());
                    out.push(RouteOp::Add {
                        vrf,
                        route: Arc::clone(route),
                    });
                } else {
                    let (_, old_route) = old_iter.next().unwrap_or_else(|| unreachable!());
                    let (_, new_route) = new_iter.next().unwrap_or_else(|| unreachable!());
                    if !Arc::ptr_eq(old_route, new_route)
                        && old_route.forward != new_route.forward
                    {
                        out.push(RouteOp::Replace {
                            vrf,
                            route: Arc::clone(new_route),
                            old: Arc::clone(old_route),
                        });
                    }
                }
            }
        }
    }
}

fn diff_vrf_tables(old: &VrfRouteTable, new: &VrfRouteTable, out: &mut Vec<RouteOp>) {
    diff_fib_maps(new.id, &old.v4, &new.v4, out);
    diff_fib_maps(new.id, &old.v6, &new.v6, out);
}

fn all_routes(vrf_table: &VrfRouteTable) -> impl Iterator<Item = &Arc<FibRoute>> {
    vrf_table.routes()
}

fn diff_route_tables(old: &SwitchState, new: &SwitchState, out: &mut Vec<RouteOp>) {
    if Arc::ptr_eq(&old.route_tables, &new.route_tables) {
        return;
    }
    let old_tables = &old.route_tables.tables;
    let new_tables = &new.route_tables.tables;

    for (vrf, old_table) in old_tables {
        match new_tables.get(vrf) {
            None => {
                out.extend(all_routes(old_table).map(|route| RouteOp::Remove {
                    vrf: *vrf,
                    old: Arc::clone(route),
                }));
            }
            Some(new_table) => {
                if !Arc::ptr_eq(old_table, new_table) {
                    diff_vrf_tables(old_table, new_table, out);
                }
            }
        }
    }
    for (vrf, new_table) in new_tables {
        if !old_tables.contains_key(vrf) {
            out.extend(all_routes(new_table).map(|route| RouteOp::Add {
                vrf: *vrf,
                route: Arc::clone(route),
            }));
        }
    }
}

fn diff_label_fib(old: &SwitchState, new: &SwitchState, out: &mut Vec<LabelOp>) {
    if Arc::ptr_eq(&old.label_fib, &new.label_fib) {
        return;
    }
    let old_entries = &old.label_fib.entries;
    let new_entries = &new.label_fib.entries;

    let labels: std::collections::BTreeSet<Label> = old_entries
        .keys()
        .chain(new_entries.keys())
        .copied()
        .collect();
    for label in labels {
        match (old_entries.get(&label), new_entries.get(&label)) {
            (None, None) => {}
            (Some(old_entry), None) => out.push(LabelOp::Remove(Arc::clone(old_entry))),
            (None, Some(new_entry)) => out.push(LabelOp::Add(Arc::clone(new_entry))),
            (Some(old_entry), Some(new_entry)) => {
                if !Arc::ptr_eq(old_entry, new_entry) && old_entry.forward != new_entry.forward {
                    out.push(LabelOp::Replace {
                        entry: Arc::clone(new_entry),
                        old: Arc::clone(old_entry),
                    });
                }
            }
        }
    }
}

/// Compute the minimal FIB delta between two snapshots.
#[must_use]
pub fn compute_delta(old: &SwitchState, new: &SwitchState) -> StateDelta {
    let mut delta = StateDelta::default();
    diff_route_tables(old, new, &mut delta.routes);
    diff_label_fib(old, new, &mut delta.labels);
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexthop::{NextHop, NextHopEntry};
    use crate::state::fib::RouteTables;
    use crate::types::{AdminDistance, ClientId};
    use lpm::prefix::Prefix;
    use std::collections::BTreeMap;

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

    fn state_with(routes: Vec<Arc<FibRoute>>) -> SwitchState {
        let mut table = VrfRouteTable::new(0, "default");
        for route in routes {
            match route.prefix {
                Prefix::V4(_) => table.v4.insert(route.prefix, route),
                Prefix::V6(_) => table.v6.insert(route.prefix, route),
            };
        }
        let mut tables = RouteTables::default();
        tables.tables.insert(0, Arc::new(table));
        SwitchState::default().with_route_tables(tables)
    }

    #[test]
    fn test_identical_snapshots_produce_no_ops() {
        let a = state_with(vec![fib_route(("10.0.0.0", 8), 1)]);
        let delta = compute_delta(&a, &a.clone());
        assert!(delta.is_empty());
    }

    #[test]
    fn test_add_remove_replace() {
        let kept = fib_route(("10.0.0.0", 8), 1);
        let old = state_with(vec![
            Arc::clone(&kept),
            fib_route(("10.1.0.0", 16), 1),
            fib_route(("10.2.0.0", 16), 1),
        ]);
        let new = state_with(vec![
            Arc::clone(&kept),              /* shared pointer: no op */
            fib_route(("10.1.0.0", 16), 2), /* forward changed: replace */
            fib_route(("10.3.0.0", 16), 1), /* added */
        ]);
        let delta = compute_delta(&old, &new);
        assert_eq!(delta.routes.len(), 3);
        assert!(delta.routes.iter().any(
            |op| matches!(op, RouteOp::Remove { old, .. } if old.prefix == Prefix::expect_from(("10.2.0.0", 16)))
        ));
        assert!(delta.routes.iter().any(
            |op| matches!(op, RouteOp::Replace { route, .. } if route.prefix == Prefix::expect_from(("10.1.0.0", 16)))
        ));
        assert!(delta.routes.iter().any(
            |op| matches!(op, RouteOp::Add { route, .. } if route.prefix == Prefix::expect_from(("10.3.0.0", 16)))
        ));
    }

    #[test]
    fn test_diag_only_change_is_suppressed() {
        let old = state_with(vec![fib_route(("10.0.0.0", 8), 1)]);
        /* same forward, different per-client map */
        let mut changed = (*old.route_tables.tables[&0].v4
            [&Prefix::expect_from(("10.0.0.0", 8))])
            .clone();
        changed.entries.insert(
            ClientId::BGP,
            NextHopEntry::drop(AdminDistance::EBGP),
        );
        let new = state_with(vec![Arc::new(changed)]);
        let delta = compute_delta(&old, &new);
        assert!(delta.is_empty());
    }
}
