// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Topology nodes of the switch-state snapshot: ports, VLANs, interfaces,
//! aggregates and ACLs. These carry what the routing core needs of them;
//! their managers are external collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::types::{InterfaceId, RouterId};

/// An address and mask length assigned to an interface.
pub type IfAddress = (IpAddr, u8);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: u32,
    pub name: String,
    pub up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    pub id: u16,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchInterface {
    pub id: InterfaceId,
    pub name: String,
    pub router_id: RouterId,
    pub vlan: Option<u16>,
    pub addresses: BTreeSet<IfAddress>,
}

impl SwitchInterface {
    #[must_use]
    pub fn new(id: InterfaceId, name: &str, router_id: RouterId) -> Self {
        Self {
            id,
            name: name.to_owned(),
            router_id,
            vlan: None,
            addresses: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatePort {
    pub id: u32,
    pub name: String,
    pub members: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub name: String,
    pub priority: u32,
}

pub type PortMap = BTreeMap<u32, Port>;
pub type VlanMap = BTreeMap<u16, Vlan>;
pub type InterfaceMap = BTreeMap<InterfaceId, SwitchInterface>;
pub type AggregatePortMap = BTreeMap<u32, AggregatePort>;
pub type AclMap = BTreeMap<String, Acl>;
