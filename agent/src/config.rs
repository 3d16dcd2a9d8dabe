// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Agent configuration: VRFs, interfaces, the client admin-distance table
//! and feature flags. N.B. we derive a builder type `AgentConfigBuilder`
//! and provide defaults for each field.

use std::net::IpAddr;
use std::path::PathBuf;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::rib::route::TieBreak;
use crate::types::{AdminDistance, ClientId, InterfaceId, RouterId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfConfig {
    pub id: RouterId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub id: InterfaceId,
    pub name: String,
    pub vrf: RouterId,
    pub vlan: Option<u16>,
    /// Subnets assigned to the interface, as (address, mask length).
    pub addresses: Vec<(IpAddr, u8)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: ClientId,
    pub name: String,
    pub admin_distance: AdminDistance,
}

#[derive(Builder, Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[builder(setter(into), default = "switch-agent".to_string())]
    pub name: String,

    /// Config generation, bumped on every reload.
    #[builder(default)]
    pub genid: i64,

    #[builder(default)]
    pub vrfs: Vec<VrfConfig>,

    #[builder(default)]
    pub interfaces: Vec<InterfaceConfig>,

    /// Per-client admin distances; clients not listed get their defaults.
    #[builder(default)]
    pub clients: Vec<ClientConfig>,

    #[builder(default)]
    pub tie_break: TieBreak,

    /// Guards `patchCurrentStateJSON`.
    #[builder(default)]
    pub enable_running_config_mutations: bool,

    /// Where the warm-boot dump is written on graceful exit.
    #[builder(default)]
    pub warm_boot_file: Option<PathBuf>,
}

impl AgentConfig {
    #[must_use]
    pub fn genid(&self) -> i64 {
        self.genid
    }

    /// The admin distance for a client's submissions when the route itself
    /// does not carry one.
    #[must_use]
    pub fn admin_distance_for(&self, client: ClientId) -> AdminDistance {
        self.clients
            .iter()
            .find(|c| c.id == client)
            .map_or_else(|| AdminDistance::default_for(client), |c| c.admin_distance)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfigBuilder::default()
            .build()
            .unwrap_or_else(|_| unreachable!("all config fields have defaults"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = AgentConfigBuilder::default().build().unwrap();
        assert_eq!(config.name, "switch-agent");
        assert!(!config.enable_running_config_mutations);
        assert_eq!(config.tie_break, TieBreak::LowestClientId);
    }

    #[test]
    fn test_admin_distance_lookup() {
        let config = AgentConfigBuilder::default()
            .clients(vec![ClientConfig {
                id: ClientId::OPENR,
                name: "openr".to_string(),
                admin_distance: AdminDistance(15),
            }])
            .build()
            .unwrap();
        assert_eq!(config.admin_distance_for(ClientId::OPENR), AdminDistance(15));
        assert_eq!(
            config.admin_distance_for(ClientId::BGP),
            AdminDistance::EBGP
        );
        assert_eq!(config.admin_distance_for(ClientId(42)), AdminDistance::MAX);
    }
}
