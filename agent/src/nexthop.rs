// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Value objects for route next-hops and per-client route entries.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::mpls::LabelStack;
use crate::types::{AdminDistance, InterfaceId};

/// Upper bound for a combined next-hop weight. Recursive resolution
/// multiplies weights and saturates here.
pub const MAX_NEXTHOP_WEIGHT: u32 = 1 << 16;

/// A single next-hop of a route. The next-hop is resolved when the egress
/// interface is known; otherwise it is a recursive next-hop that must be
/// flattened through another route.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NextHop {
    pub addr: IpAddr,
    pub ifindex: Option<InterfaceId>,
    pub weight: u32,
    pub labels: LabelStack,
}

impl NextHop {
    #[must_use]
    pub fn recursive(addr: IpAddr) -> Self {
        Self {
            addr,
            ifindex: None,
            weight: 1,
            labels: LabelStack::new(),
        }
    }

    #[must_use]
    pub fn attached(addr: IpAddr, ifindex: InterfaceId) -> Self {
        Self {
            addr,
            ifindex: Some(ifindex),
            weight: 1,
            labels: LabelStack::new(),
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.clamp(1, MAX_NEXTHOP_WEIGHT);
        self
    }

    #[must_use]
    pub fn with_labels(mut self, labels: LabelStack) -> Self {
        self.labels = labels;
        self
    }

    /// A next-hop is resolved when its egress interface is known.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.ifindex.is_some()
    }
}

impl Display for NextHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "via {}", self.addr)?;
        if let Some(ifindex) = self.ifindex {
            write!(f, " dev {ifindex}")?;
        }
        if self.weight != 1 {
            write!(f, " weight {}", self.weight)?;
        }
        if !self.labels.is_empty() {
            write!(f, " labels {}", self.labels)?;
        }
        Ok(())
    }
}

/// What a route does with matching packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteAction {
    Drop,
    ToCpu,
    /// Forward over a canonically-ordered set of next-hops.
    Forward(BTreeSet<NextHop>),
}

impl RouteAction {
    #[must_use]
    pub fn is_forward(&self) -> bool {
        matches!(self, RouteAction::Forward(_))
    }
}

/// One client's submission for a prefix: a preference plus an action.
/// Equality is structural; the next-hop set order is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHopEntry {
    pub distance: AdminDistance,
    pub action: RouteAction,
}

impl NextHopEntry {
    #[must_use]
    pub fn drop(distance: AdminDistance) -> Self {
        Self {
            distance,
            action: RouteAction::Drop,
        }
    }

    #[must_use]
    pub fn to_cpu(distance: AdminDistance) -> Self {
        Self {
            distance,
            action: RouteAction::ToCpu,
        }
    }

    /// Build a forwarding entry. An empty next-hop set is a null route and
    /// collapses to `Drop`.
    #[must_use]
    pub fn forward(distance: AdminDistance, hops: impl IntoIterator<Item = NextHop>) -> Self {
        let set: BTreeSet<NextHop> = hops.into_iter().collect();
        if set.is_empty() {
            return Self::drop(distance);
        }
        Self {
            distance,
            action: RouteAction::Forward(set),
        }
    }

    /// The next-hop set, when the action forwards.
    #[must_use]
    pub fn nhops(&self) -> Option<&BTreeSet<NextHop>> {
        match &self.action {
            RouteAction::Forward(set) => Some(set),
            _ => None,
        }
    }

    /// Tell if every next-hop of the entry has a known egress interface.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        match &self.action {
            RouteAction::Drop | RouteAction::ToCpu => true,
            RouteAction::Forward(set) => set.iter().all(NextHop::is_resolved),
        }
    }
}

impl Display for NextHopEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.action {
            RouteAction::Drop => write!(f, "drop")?,
            RouteAction::ToCpu => write!(f, "to-cpu")?,
            RouteAction::Forward(set) => {
                let hops: Vec<String> = set.iter().map(ToString::to_string).collect();
                write!(f, "{}", hops.join(", "))?;
            }
        }
        write!(f, " (distance {})", self.distance)
    }
}
