// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Identifiers shared across the RIB, switch state and hardware layers.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Every VRF is univocally identified with a numerical router id.
pub type RouterId = u32;

/// The default VRF. Unicast route mutations from clients land here.
pub const DEFAULT_VRF: RouterId = 0;

/// Kernel-style interface index.
pub type InterfaceId = u32;

/// A route source. Each client owns its submissions independently of the
/// others; merging happens per prefix by admin distance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const BGP: ClientId = ClientId(0);
    pub const STATIC_ROUTE: ClientId = ClientId(1);
    pub const INTERFACE_ROUTE: ClientId = ClientId(2);
    pub const LINKLOCAL_ROUTE: ClientId = ClientId(3);
    pub const OPENR: ClientId = ClientId(786);
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ClientId::BGP => write!(f, "bgp"),
            ClientId::STATIC_ROUTE => write!(f, "static"),
            ClientId::INTERFACE_ROUTE => write!(f, "interface"),
            ClientId::LINKLOCAL_ROUTE => write!(f, "link-local"),
            ClientId::OPENR => write!(f, "openr"),
            ClientId(other) => write!(f, "client-{other}"),
        }
    }
}

/// Route preference. Lower wins.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdminDistance(pub u8);

impl AdminDistance {
    pub const DIRECTLY_CONNECTED: AdminDistance = AdminDistance(0);
    pub const STATIC_ROUTE: AdminDistance = AdminDistance(1);
    pub const OPENR: AdminDistance = AdminDistance(10);
    pub const EBGP: AdminDistance = AdminDistance(20);
    pub const IBGP: AdminDistance = AdminDistance(200);
    pub const MAX: AdminDistance = AdminDistance(255);

    /// Default preference for a client that the running config does not name.
    #[must_use]
    pub fn default_for(client: ClientId) -> AdminDistance {
        match client {
            ClientId::INTERFACE_ROUTE | ClientId::LINKLOCAL_ROUTE => Self::DIRECTLY_CONNECTED,
            ClientId::STATIC_ROUTE => Self::STATIC_ROUTE,
            ClientId::OPENR => Self::OPENR,
            ClientId::BGP => Self::EBGP,
            _ => Self::MAX,
        }
    }
}

impl Display for AdminDistance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
