// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end tests driving the full agent against the software device.

use std::net::IpAddr;
use std::sync::Arc;

use lpm::prefix::Prefix;
use tracing_test::traced_test;

use crate::agent::{AgentStatus, SwitchAgent};
use crate::config::{AgentConfig, AgentConfigBuilder, InterfaceConfig};
use crate::cpi::proto::{IpPrefix, MplsRoute, NextHop as WireHop, UnicastRoute};
use crate::errors::AgentError;
use crate::hw::device::{EgressProgram, SoftSwitch, SwitchDevice};
use crate::neighbors::{Mac, NeighborEntry};
use crate::nexthop::RouteAction;
use crate::types::{ClientId, InterfaceId};

fn addr(s: &str) -> IpAddr {
    s.parse().expect("bad address")
}

fn test_config() -> AgentConfig {
    AgentConfigBuilder::default()
        .interfaces(vec![
            InterfaceConfig {
                id: 1,
                name: "if1".to_string(),
                vrf: 0,
                vlan: None,
                addresses: vec![(addr("192.0.2.2"), 30)],
            },
            InterfaceConfig {
                id: 2,
                name: "if2".to_string(),
                vrf: 0,
                vlan: None,
                addresses: vec![(addr("192.0.2.6"), 30)],
            },
            InterfaceConfig {
                id: 3,
                name: "if3".to_string(),
                vrf: 0,
                vlan: None,
                addresses: vec![(addr("192.0.2.10"), 30)],
            },
        ])
        .build()
        .expect("config must build")
}

fn started_agent(device: &SoftSwitch) -> SwitchAgent {
    let mut agent =
        SwitchAgent::new(test_config(), Box::new(device.clone())).expect("agent must boot");
    agent.start().expect("agent must start");
    agent
}

fn neighbor(a: &str, ifindex: InterfaceId) -> NeighborEntry {
    NeighborEntry {
        addr: addr(a),
        ifindex,
        mac: Mac([0, 0, 0, 0, 0xaa, ifindex as u8]),
    }
}

fn unicast(dest: (&str, u8), hops: &[&str]) -> UnicastRoute {
    UnicastRoute {
        dest: IpPrefix {
            ip: addr(dest.0),
            prefix_length: dest.1,
        },
        next_hops: hops.iter().map(|h| WireHop::via(addr(h))).collect(),
        next_hop_addrs: vec![],
        admin_distance: None,
    }
}

fn fib_forward(agent: &SwitchAgent, dest: IpAddr) -> crate::nexthop::NextHopEntry {
    agent
        .get_ip_route_details(dest, 0)
        .expect("route must exist")
        .forward
}

/// Scenario 1: a route with no next-hops is a drop route, end to end.
#[traced_test]
#[test]
fn test_drop_route() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    agent.sync_fib(ClientId::OPENR, &[]).unwrap();

    let stats = agent
        .add_unicast_routes(ClientId::OPENR, &[unicast(("10.0.0.0", 8), &[])])
        .unwrap();
    assert_eq!(stats.v4_added, 1);

    let prefix = Prefix::expect_from(("10.0.0.0", 8));

    /* RIB: entry with action drop, resolved to drop */
    {
        let tables = agent.rib.lock();
        let route = tables.get_vrf(0).unwrap().get_route(prefix).unwrap();
        let entry = route.entry_for(ClientId::OPENR).unwrap();
        assert_eq!(entry.action, RouteAction::Drop);
        assert_eq!(route.forward.as_ref().unwrap().action, RouteAction::Drop);
    }

    /* FIB */
    let forward = fib_forward(&agent, addr("10.1.2.3"));
    assert_eq!(forward.action, RouteAction::Drop);

    /* HW: the route references the canonical drop egress */
    let (egress, ecmp) = device.get_route(0, prefix).expect("route programmed");
    assert_eq!(egress, device.drop_egress());
    assert!(!ecmp);
}

/// Scenario 2: a recursive next-hop flattens through a connected subnet.
#[traced_test]
#[test]
fn test_recursive_resolution() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();
    agent.sync_fib(ClientId::STATIC_ROUTE, &[]).unwrap();

    agent
        .add_unicast_routes(
            ClientId::STATIC_ROUTE,
            &[unicast(("10.1.0.0", 16), &["192.0.2.1"])],
        )
        .unwrap();

    let forward = fib_forward(&agent, addr("10.1.0.1"));
    let hops = forward.nhops().expect("forwarding entry");
    assert_eq!(hops.len(), 1);
    let hop = hops.first().unwrap();
    assert_eq!(hop.addr, addr("192.0.2.1"));
    assert_eq!(hop.ifindex, Some(1));
    assert_eq!(hop.weight, 1);

    /* HW: single resolved egress, no ECMP group */
    let prefix = Prefix::expect_from(("10.1.0.0", 16));
    let (egress, ecmp) = device.get_route(0, prefix).expect("route programmed");
    assert!(!ecmp);
    assert_eq!(
        device.get_egress(egress),
        Some(EgressProgram::Forward {
            addr: addr("192.0.2.1"),
            ifindex: 1,
            labels: crate::mpls::LabelStack::new(),
        })
    );
    assert_eq!(device.ecmp_group_count(), 0);
}

/// Scenario 3: same prefix from two clients at the same distance; the
/// lowest client id wins and its two-hop set becomes ECMP.
#[traced_test]
#[test]
fn test_ecmp_and_admin_distance_tie_break() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();
    agent.neighbor_resolved(neighbor("192.0.2.5", 2)).unwrap();
    agent.sync_fib(ClientId::STATIC_ROUTE, &[]).unwrap();

    let client_a = ClientId(5);
    let client_b = ClientId(9);
    let mut two_hop = unicast(("2001:db8::", 32), &["192.0.2.1", "192.0.2.5"]);
    two_hop.admin_distance = Some(10);
    let mut one_hop = unicast(("2001:db8::", 32), &["192.0.2.1"]);
    one_hop.admin_distance = Some(10);

    agent.add_unicast_routes(client_a, &[two_hop]).unwrap();
    agent.add_unicast_routes(client_b, &[one_hop]).unwrap();

    let forward = fib_forward(&agent, addr("2001:db8::1"));
    let hops = forward.nhops().expect("forwarding entry");
    assert_eq!(hops.len(), 2, "client {client_a} must win the tie-break");

    let prefix = Prefix::expect_from(("2001:db8::", 32));
    let (group, ecmp) = device.get_route(0, prefix).expect("route programmed");
    assert!(ecmp);
    let members = device.get_ecmp_members(group).expect("group exists");
    assert_eq!(members.len(), 2);
}

/// Scenario 4: a sync that keeps half the routes reports only the net
/// change and produces exactly one hardware operation per changed route.
#[traced_test]
#[test]
fn test_sync_fib_churn() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();

    let original: Vec<UnicastRoute> = (0..50)
        .map(|i| unicast((&format!("10.{i}.0.0"), 16), &["192.0.2.1"]))
        .collect();
    let stats = agent.sync_fib(ClientId::BGP, &original).unwrap();
    assert_eq!(stats.v4_added, 50);

    /* keep 25, drop 25, add 25 new */
    let mut next: Vec<UnicastRoute> = original[..25].to_vec();
    next.extend((0..25).map(|i| unicast((&format!("10.{}.0.0", 100 + i), 16), &["192.0.2.1"])));

    let ops_before = device.write_ops();
    let stats = agent.sync_fib(ClientId::BGP, &next).unwrap();
    assert_eq!(stats.v4_added, 25);
    assert_eq!(stats.v4_deleted, 25);

    /* 25 route writes + 25 route deletes; the shared egress is untouched
    and the unchanged 25 produce nothing */
    assert_eq!(device.write_ops() - ops_before, 50);
}

/// Scenario 5: a neighbor flap shrinks and re-expands ECMP groups without
/// changing the group id or re-programming the route.
#[traced_test]
#[test]
fn test_neighbor_flap_mid_flight() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    for (a, ifindex) in [("192.0.2.1", 1), ("192.0.2.5", 2), ("192.0.2.9", 3)] {
        agent.neighbor_resolved(neighbor(a, ifindex)).unwrap();
    }
    agent
        .sync_fib(
            ClientId::BGP,
            &[unicast(("10.0.0.0", 8), &["192.0.2.1", "192.0.2.5", "192.0.2.9"])],
        )
        .unwrap();

    let prefix = Prefix::expect_from(("10.0.0.0", 8));
    let (group, ecmp) = device.get_route(0, prefix).expect("route programmed");
    assert!(ecmp);
    assert_eq!(device.get_ecmp_members(group).unwrap().len(), 3);

    /* flap down: one egress punt + one path shrink, nothing else */
    let ops_before = device.write_ops();
    agent.neighbor_unresolved(addr("192.0.2.5"), 2).unwrap();
    assert_eq!(device.write_ops() - ops_before, 2);
    assert_eq!(device.get_route(0, prefix).unwrap().0, group);
    assert_eq!(device.get_ecmp_members(group).unwrap().len(), 2);

    /* flap up: restored in place */
    let ops_before = device.write_ops();
    agent.neighbor_resolved(neighbor("192.0.2.5", 2)).unwrap();
    assert_eq!(device.write_ops() - ops_before, 2);
    assert_eq!(device.get_route(0, prefix).unwrap().0, group);
    assert_eq!(device.get_ecmp_members(group).unwrap().len(), 3);
}

/// Scenario 6: an out-of-range label is rejected with no state change.
#[traced_test]
#[test]
fn test_mpls_label_out_of_range() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    let before = agent.state_reader().snapshot();

    let err = agent
        .add_mpls_routes(
            ClientId::STATIC_ROUTE,
            &[MplsRoute {
                top_label: 1_048_576,
                next_hops: vec![WireHop::via(addr("192.0.2.1"))],
                admin_distance: None,
            }],
        )
        .unwrap_err();
    assert_eq!(err, AgentError::InvalidLabel(1_048_576));

    assert!(Arc::ptr_eq(&before, &agent.state_reader().snapshot()));
    assert!(agent.rib.lock().labels().is_empty());
}

#[traced_test]
#[test]
fn test_mpls_route_end_to_end() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();

    agent
        .add_mpls_routes(
            ClientId::STATIC_ROUTE,
            &[MplsRoute {
                top_label: 100,
                next_hops: vec![WireHop {
                    address: addr("192.0.2.1"),
                    if_name: None,
                    weight: 1,
                    label_stack: Some(vec![200]),
                }],
                admin_distance: None,
            }],
        )
        .unwrap();

    let label = crate::mpls::Label::try_new(100).unwrap();
    let snapshot = agent.state_reader().snapshot();
    let entry = snapshot.label_fib.get(label).expect("label in FIB");
    let hop = entry.forward.nhops().unwrap().first().unwrap();
    assert_eq!(hop.ifindex, Some(1));
    assert_eq!(
        crate::mpls::MplsAction::from_stack(&hop.labels),
        crate::mpls::MplsAction::Swap(crate::mpls::Label::try_new(200).unwrap())
    );

    let (egress, ecmp) = device.get_label_entry(label).expect("label programmed");
    assert!(!ecmp);
    assert!(matches!(
        device.get_egress(egress),
        Some(EgressProgram::Forward { .. })
    ));
}

#[traced_test]
#[test]
fn test_mutation_gating() {
    let device = SoftSwitch::new();
    let mut agent =
        SwitchAgent::new(test_config(), Box::new(device.clone())).expect("agent must boot");

    /* not started yet */
    assert_eq!(agent.get_status(), AgentStatus::Starting);
    let err = agent
        .add_unicast_routes(ClientId::BGP, &[unicast(("10.0.0.0", 8), &[])])
        .unwrap_err();
    assert!(matches!(err, AgentError::NotReady(_)));

    /* alive but fib not synced: adds and deletes are still gated */
    agent.start().unwrap();
    assert_eq!(agent.get_status(), AgentStatus::Alive);
    let err = agent
        .add_unicast_routes(ClientId::BGP, &[unicast(("10.0.0.0", 8), &[])])
        .unwrap_err();
    assert!(matches!(err, AgentError::NotReady(_)));

    /* syncFib latches the gate open */
    agent.sync_fib(ClientId::BGP, &[]).unwrap();
    agent
        .add_unicast_routes(ClientId::BGP, &[unicast(("10.0.0.0", 8), &[])])
        .unwrap();
}

#[traced_test]
#[test]
fn test_idempotent_add_and_restoring_delete() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();
    agent.sync_fib(ClientId::BGP, &[]).unwrap();

    let route = unicast(("10.0.0.0", 8), &["192.0.2.1"]);
    let stats = agent
        .add_unicast_routes(ClientId::BGP, std::slice::from_ref(&route))
        .unwrap();
    assert_eq!(stats.v4_added, 1);
    let snapshot_after_add = agent.state_reader().snapshot();

    /* add(r) ; add(r): same observable state, zero stats, zero writes */
    let ops_before = device.write_ops();
    let stats = agent
        .add_unicast_routes(ClientId::BGP, std::slice::from_ref(&route))
        .unwrap();
    assert_eq!(stats.v4_added, 0);
    assert_eq!(device.write_ops(), ops_before);
    assert!(Arc::ptr_eq(
        &snapshot_after_add,
        &agent.state_reader().snapshot()
    ));

    /* add(r) ; del(r): the RIB returns to its prior state */
    let baseline = agent.get_route_table().len();
    let stats = agent
        .delete_unicast_routes(
            ClientId::BGP,
            &[IpPrefix {
                ip: addr("10.0.0.0"),
                prefix_length: 8,
            }],
        )
        .unwrap();
    assert_eq!(stats.v4_deleted, 1);
    assert_eq!(agent.get_route_table().len(), baseline - 1);
    assert!(
        agent
            .rib
            .lock()
            .get_vrf(0)
            .unwrap()
            .get_route(Prefix::expect_from(("10.0.0.0", 8)))
            .is_none()
    );
}

#[traced_test]
#[test]
fn test_host_route_fast_path() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();

    agent
        .sync_fib(ClientId::BGP, &[unicast(("10.9.9.9", 32), &["192.0.2.1"])])
        .unwrap();

    /* a /32 lands in the host table, not the LPM table */
    assert_eq!(
        device
            .get_host_route(0, addr("10.9.9.9"))
            .map(|(_, ecmp)| ecmp),
        Some(false)
    );
    assert!(
        device
            .get_route(0, Prefix::expect_from(("10.9.9.9", 32)))
            .is_none()
    );
}

#[traced_test]
#[test]
fn test_host_route_without_host_table() {
    let device = SoftSwitch::without_host_table();
    let agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();

    agent
        .sync_fib(ClientId::BGP, &[unicast(("10.9.9.9", 32), &["192.0.2.1"])])
        .unwrap();

    /* no fast path: the /32 stays in the LPM table */
    assert!(device.get_host_route(0, addr("10.9.9.9")).is_none());
    assert!(
        device
            .get_route(0, Prefix::expect_from(("10.9.9.9", 32)))
            .is_some()
    );
}

#[traced_test]
#[test]
fn test_egress_refcount_law() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();
    agent.neighbor_resolved(neighbor("192.0.2.5", 2)).unwrap();

    /* connected + link-local routes from start() */
    let base_egresses = device.egress_count();

    agent
        .sync_fib(
            ClientId::BGP,
            &[
                unicast(("10.0.0.0", 16), &["192.0.2.1"]),
                unicast(("10.1.0.0", 16), &["192.0.2.1"]), /* shares the egress */
                unicast(("10.2.0.0", 16), &["192.0.2.1", "192.0.2.5"]),
            ],
        )
        .unwrap();

    /* two unique descriptors were added, and one ECMP group */
    assert_eq!(device.egress_count(), base_egresses + 2);
    assert_eq!(device.ecmp_group_count(), 1);

    /* dropping every client route releases exactly what they referenced */
    agent.sync_fib(ClientId::BGP, &[]).unwrap();
    assert_eq!(device.egress_count(), base_egresses);
    assert_eq!(device.ecmp_group_count(), 0);
}

#[traced_test]
#[test]
fn test_warm_boot_restart() {
    let device = SoftSwitch::new();
    let mut agent = started_agent(&device);
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();
    agent.neighbor_resolved(neighbor("192.0.2.5", 2)).unwrap();

    let kept = unicast(("10.0.0.0", 16), &["192.0.2.1"]);
    let dropped = unicast(("10.1.0.0", 16), &["192.0.2.5"]);
    agent
        .sync_fib(ClientId::BGP, &[kept.clone(), dropped])
        .unwrap();
    let routes_before = device.route_count();

    let dump = agent.stop().unwrap();
    drop(agent);

    /* the device keeps forwarding while the agent restarts, and its own
    read-back agrees with the dump */
    assert_eq!(device.route_count(), routes_before);
    assert_eq!(device.dump().routes.len(), dump.routes.len());

    let mut agent =
        SwitchAgent::new_warm(test_config(), Box::new(device.clone()), dump).expect("warm boot");
    /* the neighbor cache converges before the restore */
    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();
    agent.neighbor_resolved(neighbor("192.0.2.5", 2)).unwrap();
    let ops_before = device.write_ops();
    agent.start().unwrap();
    /* everything restored is claimed: not a single device write */
    assert_eq!(device.write_ops(), ops_before);

    /* the first sync keeps one route; the other is torn down, and its
    now-unreferenced egress goes with it */
    agent.sync_fib(ClientId::BGP, &[kept]).unwrap();
    assert!(
        device
            .get_route(0, Prefix::expect_from(("10.1.0.0", 16)))
            .is_none()
    );
    assert!(
        device
            .get_route(0, Prefix::expect_from(("10.0.0.0", 16)))
            .is_some()
    );
    assert_eq!(device.route_count(), routes_before - 1);
}

#[traced_test]
#[test]
fn test_state_json_endpoints() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);

    /* whole state round-trips */
    let json = agent.get_current_state_json("").unwrap();
    let state = crate::state::SwitchState::from_json(&json).unwrap();
    assert_eq!(state, *agent.state_reader().snapshot());

    /* pointer access */
    let json = agent.get_current_state_json("/interfaces/1/name").unwrap();
    assert_eq!(json.trim(), "\"if1\"");
    assert!(agent.get_current_state_json("/nonsense").is_err());

    /* mutations are feature-gated off by default */
    let err = agent
        .patch_current_state_json("/interfaces/1/name", serde_json::json!("renamed"))
        .unwrap_err();
    assert!(matches!(err, AgentError::InvalidArgument(_)));
}

#[traced_test]
#[test]
fn test_patch_state_json_when_enabled() {
    let device = SoftSwitch::new();
    let mut config = test_config();
    config.enable_running_config_mutations = true;
    let mut agent = SwitchAgent::new(config, Box::new(device.clone())).expect("agent must boot");
    agent.start().unwrap();

    agent
        .patch_current_state_json("/interfaces/1/name", serde_json::json!("renamed"))
        .unwrap();
    assert_eq!(
        agent.state_reader().snapshot().interfaces[&1].name,
        "renamed"
    );

    let err = agent
        .patch_current_state_json("/no/such/pointer", serde_json::json!(1))
        .unwrap_err();
    assert!(matches!(err, AgentError::InvalidArgument(_)));
}

#[traced_test]
#[test]
fn test_neighbor_subscription_stream() {
    let device = SoftSwitch::new();
    let agent = started_agent(&device);
    let mut rx = agent.subscribe_neighbor_changed();

    agent.neighbor_resolved(neighbor("192.0.2.1", 1)).unwrap();
    let delta = rx.try_recv().expect("delta streamed");
    assert_eq!(delta.added.len(), 1);
    assert_eq!(delta.added[0].addr, addr("192.0.2.1"));

    agent.neighbor_unresolved(addr("192.0.2.1"), 1).unwrap();
    let delta = rx.try_recv().expect("delta streamed");
    assert_eq!(delta.removed.len(), 1);
}
