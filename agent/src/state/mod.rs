// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The immutable switch-state snapshot tree.
//!
//! Every child hangs off the root behind an `Arc`; deriving the next
//! snapshot clones the spine and shares every unmodified subtree, which the
//! diff engine observes through pointer equality.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::AgentError;
use crate::nexthop::RouteAction;

pub mod diff;
pub mod fib;
pub mod pipeline;
pub mod topology;

use fib::{LabelFib, RouteTables};
use topology::{AclMap, AggregatePortMap, InterfaceMap, PortMap, VlanMap};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchState {
    pub ports: Arc<PortMap>,
    pub vlans: Arc<VlanMap>,
    pub interfaces: Arc<InterfaceMap>,
    pub aggregate_ports: Arc<AggregatePortMap>,
    pub acls: Arc<AclMap>,
    pub route_tables: Arc<RouteTables>,
    pub label_fib: Arc<LabelFib>,
}

impl SwitchState {
    /// Derive a snapshot with new route tables; every other child is shared.
    #[must_use]
    pub fn with_route_tables(&self, route_tables: RouteTables) -> SwitchState {
        SwitchState {
            route_tables: Arc::new(route_tables),
            ..self.clone()
        }
    }

    /// Derive a snapshot with a new label FIB.
    #[must_use]
    pub fn with_label_fib(&self, label_fib: LabelFib) -> SwitchState {
        SwitchState {
            label_fib: Arc::new(label_fib),
            ..self.clone()
        }
    }

    /// Derive a snapshot with a new interface map.
    #[must_use]
    pub fn with_interfaces(&self, interfaces: InterfaceMap) -> SwitchState {
        SwitchState {
            interfaces: Arc::new(interfaces),
            ..self.clone()
        }
    }

    /// Canonical JSON form of the snapshot.
    ///
    /// # Errors
    /// Fails if serialization fails.
    pub fn to_json(&self) -> Result<String, AgentError> {
        serde_json::to_string_pretty(self).map_err(|e| {
            warn!("failed to serialize switch state: {e}");
            AgentError::Internal("switch state serialization failed")
        })
    }

    /// Rebuild a snapshot from its canonical JSON form.
    ///
    /// # Errors
    /// Fails with `InvalidArgument` on malformed input.
    pub fn from_json(json: &str) -> Result<SwitchState, AgentError> {
        serde_json::from_str(json)
            .map_err(|e| AgentError::InvalidArgument(format!("bad switch state json: {e}")))
    }
}

/// Validate a candidate snapshot before it is diffed and applied.
///
/// # Errors
/// Fails with `InvalidStateTransition` when the candidate violates a FIB
/// invariant: an unresolved or empty forward in a FIB, or an MPLS entry
/// with no usable next-hop given the candidate's interfaces.
pub fn is_valid_state_update(
    _old: &SwitchState,
    new: &SwitchState,
) -> Result<(), AgentError> {
    for table in new.route_tables.tables.values() {
        for route in table.routes() {
            match &route.forward.action {
                RouteAction::Drop | RouteAction::ToCpu => {}
                RouteAction::Forward(hops) => {
                    if hops.is_empty() {
                        return Err(AgentError::InvalidStateTransition(format!(
                            "route {} has an empty next-hop set",
                            route.prefix
                        )));
                    }
                    if let Some(bad) = hops.iter().find(|h| !h.is_resolved()) {
                        return Err(AgentError::InvalidStateTransition(format!(
                            "route {} carries unresolved next-hop {}",
                            route.prefix, bad.addr
                        )));
                    }
                }
            }
        }
    }

    for entry in new.label_fib.entries.values() {
        if let RouteAction::Forward(hops) = &entry.forward.action {
            let usable = hops.iter().any(|h| {
                h.ifindex
                    .is_some_and(|ifindex| new.interfaces.contains_key(&ifindex))
            });
            if !usable {
                return Err(AgentError::InvalidStateTransition(format!(
                    "label {} has no usable next-hop for the current interfaces",
                    entry.label
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexthop::{NextHop, NextHopEntry};
    use crate::state::fib::{FibRoute, LabelFibEntry, VrfRouteTable};
    use crate::types::AdminDistance;
    use lpm::prefix::Prefix;
    use std::collections::BTreeMap;

    fn state_with_route(forward: NextHopEntry) -> SwitchState {
        let prefix = Prefix::expect_from(("10.0.0.0", 8));
        let mut table = VrfRouteTable::new(0, "default");
        table.v4.insert(
            prefix,
            Arc::new(FibRoute {
                prefix,
                entries: BTreeMap::new(),
                forward,
            }),
        );
        let mut tables = RouteTables::default();
        tables.tables.insert(0, Arc::new(table));
        SwitchState::default().with_route_tables(tables)
    }

    #[test]
    fn test_cow_sharing() {
        let base = SwitchState::default();
        let next = state_with_route(NextHopEntry::drop(AdminDistance::STATIC_ROUTE));
        /* only the modified subtree is new */
        assert!(Arc::ptr_eq(&base.ports, &next.ports));
        assert!(Arc::ptr_eq(&base.interfaces, &next.interfaces));
        assert!(!Arc::ptr_eq(&base.route_tables, &next.route_tables));
    }

    #[test]
    fn test_json_round_trip() {
        let state = state_with_route(NextHopEntry::forward(
            AdminDistance::EBGP,
            [NextHop::attached("10.0.0.1".parse().unwrap(), 4)],
        ));
        let json = state.to_json().unwrap();
        let back = SwitchState::from_json(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_validator_rejects_unresolved() {
        let old = SwitchState::default();
        let bad = state_with_route(NextHopEntry::forward(
            AdminDistance::EBGP,
            [NextHop::recursive("10.0.0.1".parse().unwrap())],
        ));
        assert!(matches!(
            is_valid_state_update(&old, &bad),
            Err(AgentError::InvalidStateTransition(_))
        ));

        let good = state_with_route(NextHopEntry::forward(
            AdminDistance::EBGP,
            [NextHop::attached("10.0.0.1".parse().unwrap(), 4)],
        ));
        assert!(is_valid_state_update(&old, &good).is_ok());
    }

    #[test]
    fn test_validator_rejects_label_without_interface() {
        use crate::mpls::Label;
        let old = SwitchState::default();
        let label = Label::try_new(100).unwrap();
        let mut label_fib = LabelFib::default();
        label_fib.entries.insert(
            label,
            Arc::new(LabelFibEntry {
                label,
                entries: BTreeMap::new(),
                forward: NextHopEntry::forward(
                    AdminDistance::STATIC_ROUTE,
                    [NextHop::attached("10.0.0.1".parse().unwrap(), 7)],
                ),
            }),
        );
        /* interface 7 does not exist in the candidate */
        let bad = SwitchState::default().with_label_fib(label_fib.clone());
        assert!(is_valid_state_update(&old, &bad).is_err());

        /* with the interface present the update passes */
        let mut interfaces = topology::InterfaceMap::new();
        interfaces.insert(7, topology::SwitchInterface::new(7, "eth7", 0));
        let good = SwitchState::default()
            .with_interfaces(interfaces)
            .with_label_fib(label_fib);
        assert!(is_valid_state_update(&old, &good).is_ok());
    }
}
