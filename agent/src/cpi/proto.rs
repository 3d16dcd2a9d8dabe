// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Wire shapes of the control surface and their conversions into RIB
//! types. The RPC server itself lives outside the core; these are the
//! messages it hands us.

use std::collections::BTreeMap;
use std::net::IpAddr;

use lpm::prefix::Prefix;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::mpls::{Label, LabelStack};
use crate::nexthop::{NextHopEntry, RouteAction};
use crate::types::{AdminDistance, ClientId, InterfaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPrefix {
    pub ip: IpAddr,
    pub prefix_length: u8,
}

impl IpPrefix {
    /// Canonicalize wire input: host bits are masked, not rejected.
    ///
    /// # Errors
    /// Fails on an invalid mask length.
    pub fn canonicalized(&self) -> Result<Prefix, AgentError> {
        Ok(Prefix::canonicalize(self.ip, self.prefix_length)?)
    }
}

impl From<Prefix> for IpPrefix {
    fn from(prefix: Prefix) -> Self {
        Self {
            ip: prefix.as_address(),
            prefix_length: prefix.length(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHop {
    pub address: IpAddr,
    pub if_name: Option<String>,
    pub weight: u32,
    pub label_stack: Option<Vec<u32>>,
}

impl NextHop {
    #[must_use]
    pub fn via(address: IpAddr) -> Self {
        Self {
            address,
            if_name: None,
            weight: 1,
            label_stack: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnicastRoute {
    pub dest: IpPrefix,
    pub next_hops: Vec<NextHop>,
    /// Legacy field: plain addresses, synthesized into unit-weight
    /// next-hops when `next_hops` is empty.
    #[serde(default)]
    pub next_hop_addrs: Vec<IpAddr>,
    pub admin_distance: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MplsRoute {
    pub top_label: u32,
    pub next_hops: Vec<NextHop>,
    pub admin_distance: Option<u8>,
}

/// Diagnostic view of a route: every client's submission plus the
/// resolution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDetails {
    pub dest: IpPrefix,
    pub entries: BTreeMap<ClientId, NextHopEntry>,
    pub forward: NextHopEntry,
}

fn wire_hop(
    hop: &NextHop,
    interfaces_by_name: &BTreeMap<String, InterfaceId>,
) -> Result<crate::nexthop::NextHop, AgentError> {
    let ifindex = match &hop.if_name {
        None => None,
        Some(name) => Some(*interfaces_by_name.get(name).ok_or_else(|| {
            AgentError::InvalidArgument(format!("unknown interface name '{name}'"))
        })?),
    };
    let labels = match &hop.label_stack {
        None => LabelStack::new(),
        Some(raw) => LabelStack::try_from_raw(raw)?,
    };
    Ok(crate::nexthop::NextHop {
        addr: hop.address,
        ifindex,
        weight: hop.weight.max(1),
        labels,
    })
}

/// Turn a wire route into (prefix, entry). An empty next-hop set is a null
/// route and becomes `Drop`.
pub(crate) fn unicast_route_entry(
    route: &UnicastRoute,
    default_distance: AdminDistance,
    interfaces_by_name: &BTreeMap<String, InterfaceId>,
) -> Result<(Prefix, NextHopEntry), AgentError> {
    let prefix = route.dest.canonicalized()?;
    let distance = route.admin_distance.map_or(default_distance, AdminDistance);

    let mut hops: Vec<crate::nexthop::NextHop> = route
        .next_hops
        .iter()
        .map(|h| wire_hop(h, interfaces_by_name))
        .collect::<Result<_, _>>()?;
    if hops.is_empty() {
        hops = route
            .next_hop_addrs
            .iter()
            .map(|addr| crate::nexthop::NextHop::recursive(*addr))
            .collect();
    }
    Ok((prefix, NextHopEntry::forward(distance, hops)))
}

/// Turn a wire MPLS route into (label, entry).
pub(crate) fn mpls_route_entry(
    route: &MplsRoute,
    default_distance: AdminDistance,
    interfaces_by_name: &BTreeMap<String, InterfaceId>,
) -> Result<(Label, NextHopEntry), AgentError> {
    let label = Label::try_new(route.top_label)?;
    let distance = route.admin_distance.map_or(default_distance, AdminDistance);
    let hops: Vec<crate::nexthop::NextHop> = route
        .next_hops
        .iter()
        .map(|h| wire_hop(h, interfaces_by_name))
        .collect::<Result<_, _>>()?;
    Ok((label, NextHopEntry::forward(distance, hops)))
}

/// Render forward info back into wire next-hops. Drop and to-CPU actions
/// render as an empty list, like the original control surface.
pub(crate) fn wire_hops_of(entry: &NextHopEntry) -> Vec<NextHop> {
    match &entry.action {
        RouteAction::Drop | RouteAction::ToCpu => Vec::new(),
        RouteAction::Forward(hops) => hops
            .iter()
            .map(|hop| NextHop {
                address: hop.addr,
                if_name: None,
                weight: hop.weight,
                label_stack: if hop.labels.is_empty() {
                    None
                } else {
                    Some(hop.labels.iter().map(|l| l.as_u32()).collect())
                },
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_next_hop_addrs_synthesis() {
        let route = UnicastRoute {
            dest: IpPrefix {
                ip: "10.0.0.0".parse().unwrap(),
                prefix_length: 8,
            },
            next_hops: vec![],
            next_hop_addrs: vec!["1.1.1.1".parse().unwrap(), "2.2.2.2".parse().unwrap()],
            admin_distance: None,
        };
        let (_, entry) =
            unicast_route_entry(&route, AdminDistance::EBGP, &BTreeMap::new()).unwrap();
        let hops = entry.nhops().expect("forwarding entry");
        assert_eq!(hops.len(), 2);
        assert!(hops.iter().all(|h| h.weight == 1 && h.ifindex.is_none()));
    }

    #[test]
    fn test_empty_route_is_drop() {
        let route = UnicastRoute {
            dest: IpPrefix {
                ip: "10.0.0.1".parse().unwrap(), /* host bits masked */
                prefix_length: 8,
            },
            next_hops: vec![],
            next_hop_addrs: vec![],
            admin_distance: Some(200),
        };
        let (prefix, entry) =
            unicast_route_entry(&route, AdminDistance::EBGP, &BTreeMap::new()).unwrap();
        assert_eq!(prefix.to_string(), "10.0.0.0/8");
        assert_eq!(entry.action, RouteAction::Drop);
        assert_eq!(entry.distance, AdminDistance(200));
    }

    #[test]
    fn test_bad_label_is_invalid_argument() {
        let route = MplsRoute {
            top_label: 1_048_576,
            next_hops: vec![NextHop::via("10.0.0.1".parse().unwrap())],
            admin_distance: None,
        };
        let err =
            mpls_route_entry(&route, AdminDistance::STATIC_ROUTE, &BTreeMap::new()).unwrap_err();
        assert_eq!(err, AgentError::InvalidLabel(1_048_576));
    }

    #[test]
    fn test_unknown_interface_name() {
        let hop = NextHop {
            address: "10.0.0.1".parse().unwrap(),
            if_name: Some("eth99".to_string()),
            weight: 1,
            label_stack: None,
        };
        let route = UnicastRoute {
            dest: IpPrefix {
                ip: "10.0.0.0".parse().unwrap(),
                prefix_length: 8,
            },
            next_hops: vec![hop],
            next_hop_addrs: vec![],
            admin_distance: None,
        };
        let err =
            unicast_route_entry(&route, AdminDistance::EBGP, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
    }
}
