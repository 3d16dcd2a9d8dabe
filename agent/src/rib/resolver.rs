// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Recursive next-hop resolution: flattening each route's best entry into a
//! set of directly-attached next-hops.
//!
//! Resolution expands every recursive hop through longest-prefix matches
//! down to attached hops, with an explicit work list instead of program
//! recursion. The addresses looked up along the way are recorded in the
//! VRF's reverse dependency index, so a later change to any covering prefix
//! re-resolves exactly the routes it can affect.

use std::collections::BTreeSet;
use std::net::IpAddr;

use lpm::prefix::Prefix;
use tracing::debug;

use crate::nexthop::{MAX_NEXTHOP_WEIGHT, NextHop, NextHopEntry, RouteAction};
use crate::rib::route::TieBreak;
use crate::rib::vrf::VrfRib;

fn combine_weights(outer: u32, inner: u32) -> u32 {
    outer.saturating_mul(inner).min(MAX_NEXTHOP_WEIGHT)
}

/// One pending expansion: a not-yet-attached hop and the prefixes already
/// traversed to reach it, for loop detection.
struct WorkItem {
    hop: NextHop,
    chain: Vec<Prefix>,
}

/// Flatten a best entry into attached next-hops via LPM in `vrf`.
///
/// `origin` is the prefix being resolved, seeding the traversal chain; label
/// routes resolve with no origin prefix. Returns the computed forward
/// (`None` = unresolved) and the set of addresses looked up.
pub(crate) fn flatten_entry(
    vrf: &VrfRib,
    origin: Option<Prefix>,
    best: &NextHopEntry,
    tie: TieBreak,
) -> (Option<NextHopEntry>, BTreeSet<IpAddr>) {
    let mut lookups: BTreeSet<IpAddr> = BTreeSet::new();

    let hops = match &best.action {
        RouteAction::Drop => return (Some(NextHopEntry::drop(best.distance)), lookups),
        RouteAction::ToCpu => return (Some(NextHopEntry::to_cpu(best.distance)), lookups),
        RouteAction::Forward(hops) => hops,
    };

    let seed_chain: Vec<Prefix> = origin.into_iter().collect();
    let mut work: Vec<WorkItem> = hops
        .iter()
        .map(|hop| WorkItem {
            hop: hop.clone(),
            chain: seed_chain.clone(),
        })
        .collect();

    let mut resolved: BTreeSet<NextHop> = BTreeSet::new();
    let mut saw_drop = false;
    let mut saw_to_cpu = false;

    while let Some(item) = work.pop() {
        if item.hop.is_resolved() {
            resolved.insert(item.hop);
            continue;
        }
        lookups.insert(item.hop.addr);

        let Some((matched, mroute)) = vrf.lpm(item.hop.addr) else {
            /* nothing covers this hop; it contributes no paths */
            continue;
        };
        if item.chain.contains(&matched) {
            debug!("resolution loop through {matched}: marking unresolved");
            return (None, lookups);
        }
        let Some((_, mbest)) = mroute.best(tie) else {
            continue;
        };
        match &mbest.action {
            RouteAction::Drop => saw_drop = true,
            RouteAction::ToCpu => saw_to_cpu = true,
            RouteAction::Forward(mhops) => {
                for m in mhops {
                    let weight = combine_weights(item.hop.weight, m.weight);
                    let labels = item.hop.labels.compose(&m.labels);
                    if let Some(ifindex) = m.ifindex {
                        /* A connected match supplies the interface; the
                        address stays the one we were resolving, since that
                        is the neighbor traffic is sent toward. */
                        let addr = if mroute.connected { item.hop.addr } else { m.addr };
                        resolved.insert(NextHop {
                            addr,
                            ifindex: Some(ifindex),
                            weight,
                            labels,
                        });
                    } else {
                        let mut chain = item.chain.clone();
                        chain.push(matched);
                        work.push(WorkItem {
                            hop: NextHop {
                                addr: m.addr,
                                ifindex: None,
                                weight,
                                labels,
                            },
                            chain,
                        });
                    }
                }
            }
        }
    }

    let forward = if saw_drop {
        Some(NextHopEntry::drop(best.distance))
    } else if saw_to_cpu {
        Some(NextHopEntry::to_cpu(best.distance))
    } else if resolved.is_empty() {
        None
    } else {
        Some(NextHopEntry {
            distance: best.distance,
            action: RouteAction::Forward(resolved),
        })
    };
    (forward, lookups)
}

/// Re-resolve the dirty prefixes of a VRF plus every dependent the reverse
/// index names. Stores the recomputed forwards and refreshed lookup sets.
pub(crate) fn resolve_vrf(vrf: &mut VrfRib, dirty: &BTreeSet<Prefix>, tie: TieBreak) {
    let mut work = dirty.clone();
    work.extend(vrf.dependents_of(dirty));

    let mut results: Vec<(Prefix, Option<NextHopEntry>, BTreeSet<IpAddr>)> = Vec::new();
    for prefix in &work {
        let Some(route) = vrf.get_route(*prefix) else {
            continue; /* deleted this batch; dependents are already in the work set */
        };
        let Some((_, best)) = route.best(tie) else {
            unreachable!("route {prefix} with empty client map survived the updater");
        };
        let best = best.clone();
        let (forward, lookups) = flatten_entry(vrf, Some(*prefix), &best, tie);
        results.push((*prefix, forward, lookups));
    }

    for (prefix, forward, lookups) in results {
        vrf.set_lookups(prefix, lookups);
        if let Some(route) = vrf.get_route_mut(prefix) {
            route.forward = forward;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpls::LabelStack;
    use crate::rib::route::RibRoute;
    use crate::types::{AdminDistance, ClientId};

    fn addr(s: &str) -> IpAddr {
        s.parse().expect("bad address")
    }

    fn connected(vrf: &mut VrfRib, prefix: (&str, u8), endpoint: &str, ifindex: u32) {
        let p = Prefix::expect_from(prefix);
        let mut route = RibRoute::from_client(
            ClientId::INTERFACE_ROUTE,
            NextHopEntry::forward(
                AdminDistance::DIRECTLY_CONNECTED,
                [NextHop::attached(addr(endpoint), ifindex)],
            ),
        );
        route.connected = true;
        vrf.insert(p, route);
    }

    fn add_via(vrf: &mut VrfRib, prefix: (&str, u8), hops: Vec<NextHop>) -> Prefix {
        let p = Prefix::expect_from(prefix);
        vrf.insert(
            p,
            RibRoute::from_client(
                ClientId::BGP,
                NextHopEntry::forward(AdminDistance::EBGP, hops),
            ),
        );
        p
    }

    fn resolve_all(vrf: &mut VrfRib) {
        let dirty: BTreeSet<Prefix> = vrf.prefixes().into_iter().collect();
        resolve_vrf(vrf, &dirty, TieBreak::LowestClientId);
    }

    #[test]
    fn test_recursive_resolution_through_connected() {
        let mut vrf = VrfRib::new("default", 0);
        connected(&mut vrf, ("192.0.2.0", 30), "192.0.2.2", 1);
        let p = add_via(&mut vrf, ("10.1.0.0", 16), vec![NextHop::recursive(addr("192.0.2.1"))]);
        resolve_all(&mut vrf);

        let forward = vrf.get_route(p).unwrap().forward.clone().expect("resolved");
        let hops = forward.nhops().unwrap();
        assert_eq!(hops.len(), 1);
        let hop = hops.first().unwrap();
        /* keeps the neighbor address, takes the interface from the subnet */
        assert_eq!(hop.addr, addr("192.0.2.1"));
        assert_eq!(hop.ifindex, Some(1));
        assert_eq!(hop.weight, 1);
    }

    #[test]
    fn test_multilevel_recursion_and_weights() {
        let mut vrf = VrfRib::new("default", 0);
        connected(&mut vrf, ("10.0.0.0", 30), "10.0.0.2", 1);
        connected(&mut vrf, ("10.0.0.4", 30), "10.0.0.6", 2);
        /* 8.0.0.1/32 spreads over both subnets with weights */
        add_via(
            &mut vrf,
            ("8.0.0.1", 32),
            vec![
                NextHop::recursive(addr("10.0.0.1")).with_weight(2),
                NextHop::recursive(addr("10.0.0.5")).with_weight(3),
            ],
        );
        /* 7.0.0.0/24 goes via 8.0.0.1 with weight 5 */
        let p = add_via(
            &mut vrf,
            ("7.0.0.0", 24),
            vec![NextHop::recursive(addr("8.0.0.1")).with_weight(5)],
        );
        resolve_all(&mut vrf);

        let forward = vrf.get_route(p).unwrap().forward.clone().expect("resolved");
        let hops = forward.nhops().unwrap();
        assert_eq!(hops.len(), 2);
        assert!(
            hops.iter()
                .any(|h| h.addr == addr("10.0.0.1") && h.ifindex == Some(1) && h.weight == 10)
        );
        assert!(
            hops.iter()
                .any(|h| h.addr == addr("10.0.0.5") && h.ifindex == Some(2) && h.weight == 15)
        );
    }

    #[test]
    fn test_drop_propagates() {
        let mut vrf = VrfRib::new("default", 0);
        let null = Prefix::expect_from(("10.0.0.0", 8));
        vrf.insert(
            null,
            RibRoute::from_client(
                ClientId::STATIC_ROUTE,
                NextHopEntry::drop(AdminDistance::STATIC_ROUTE),
            ),
        );
        let p = add_via(&mut vrf, ("7.0.0.0", 24), vec![NextHop::recursive(addr("10.0.0.1"))]);
        resolve_all(&mut vrf);

        let forward = vrf.get_route(p).unwrap().forward.clone().expect("resolved");
        assert_eq!(forward.action, RouteAction::Drop);
        assert_eq!(forward.distance, AdminDistance::EBGP);
    }

    #[test]
    fn test_resolution_loop_is_unresolved() {
        let mut vrf = VrfRib::new("default", 0);
        /* two routes resolving through each other */
        add_via(&mut vrf, ("1.0.0.0", 24), vec![NextHop::recursive(addr("2.0.0.1"))]);
        add_via(&mut vrf, ("2.0.0.0", 24), vec![NextHop::recursive(addr("1.0.0.1"))]);
        resolve_all(&mut vrf);

        assert!(vrf.get_route(Prefix::expect_from(("1.0.0.0", 24))).unwrap().forward.is_none());
        assert!(vrf.get_route(Prefix::expect_from(("2.0.0.0", 24))).unwrap().forward.is_none());
    }

    #[test]
    fn test_unmatched_hop_is_unresolved() {
        let mut vrf = VrfRib::new("default", 0);
        let p = add_via(&mut vrf, ("7.0.0.0", 24), vec![NextHop::recursive(addr("10.0.0.1"))]);
        resolve_all(&mut vrf);
        assert!(vrf.get_route(p).unwrap().forward.is_none());
    }

    #[test]
    fn test_label_stack_composition() {
        let mut vrf = VrfRib::new("default", 0);
        connected(&mut vrf, ("10.0.0.0", 30), "10.0.0.2", 1);
        /* inner route pushes 200 */
        add_via(
            &mut vrf,
            ("8.0.0.1", 32),
            vec![
                NextHop::recursive(addr("10.0.0.1"))
                    .with_labels(LabelStack::try_from_raw(&[200]).unwrap()),
            ],
        );
        /* outer route pushes 100; outer label must end up outermost */
        let p = add_via(
            &mut vrf,
            ("7.0.0.0", 24),
            vec![
                NextHop::recursive(addr("8.0.0.1"))
                    .with_labels(LabelStack::try_from_raw(&[100]).unwrap()),
            ],
        );
        resolve_all(&mut vrf);

        let forward = vrf.get_route(p).unwrap().forward.clone().expect("resolved");
        let hop = forward.nhops().unwrap().first().unwrap();
        let raw: Vec<u32> = hop.labels.iter().map(|l| l.as_u32()).collect();
        assert_eq!(raw, [100, 200]);
    }

    #[test]
    fn test_incremental_dependent_reresolution() {
        let mut vrf = VrfRib::new("default", 0);
        connected(&mut vrf, ("192.0.2.0", 30), "192.0.2.2", 1);
        let p = add_via(&mut vrf, ("10.1.0.0", 16), vec![NextHop::recursive(addr("192.0.2.1"))]);
        resolve_all(&mut vrf);
        assert!(vrf.get_route(p).unwrap().forward.is_some());

        /* delete the connected subnet; only it is dirty, but the dependent
        must be re-resolved through the reverse index */
        let subnet = Prefix::expect_from(("192.0.2.0", 30));
        vrf.remove(subnet);
        resolve_vrf(&mut vrf, &BTreeSet::from([subnet]), TieBreak::LowestClientId);
        assert!(vrf.get_route(p).unwrap().forward.is_none());

        /* adding a more specific covering prefix re-resolves it again */
        connected(&mut vrf, ("192.0.2.0", 31), "192.0.2.0", 9);
        let added = Prefix::expect_from(("192.0.2.0", 31));
        resolve_vrf(&mut vrf, &BTreeSet::from([added]), TieBreak::LowestClientId);
        let forward = vrf.get_route(p).unwrap().forward.clone().expect("resolved");
        assert_eq!(forward.nhops().unwrap().first().unwrap().ifindex, Some(9));
    }
}
