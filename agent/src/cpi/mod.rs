// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control-plane interface (CPI): the entry points the control RPC server
//! calls on the core. Mutations are gated on agent status and the
//! fib-synced latch; reads run against the applied snapshot without locks.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;

use lpm::prefix::Prefix;
use serde_json::Value;
use tracing::info;

use crate::agent::{AgentStatus, SwitchAgent};
use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::mpls::Label;
use crate::rib::updater::UpdateStatistics;
use crate::state::SwitchState;
use crate::state::fib::VrfRouteTable;
use crate::types::{ClientId, DEFAULT_VRF, InterfaceId, RouterId};

pub mod proto;

use proto::{IpPrefix, MplsRoute, RouteDetails, UnicastRoute};

fn wire_route(dest: Prefix, entry: &crate::nexthop::NextHopEntry) -> UnicastRoute {
    UnicastRoute {
        dest: IpPrefix::from(dest),
        next_hops: proto::wire_hops_of(entry),
        next_hop_addrs: vec![],
        admin_distance: Some(entry.distance.0),
    }
}

impl SwitchAgent {
    fn ensure_alive(&self) -> Result<(), AgentError> {
        if self.status() != AgentStatus::Alive {
            return Err(AgentError::NotReady("switch is not fully configured"));
        }
        Ok(())
    }

    fn ensure_fib_synced(&self) -> Result<(), AgentError> {
        if !self.fib_synced.load(Ordering::Acquire) {
            return Err(AgentError::NotReady("FIB has not been synced yet"));
        }
        Ok(())
    }

    fn interfaces_by_name(&self) -> BTreeMap<String, InterfaceId> {
        self.reader
            .snapshot()
            .interfaces
            .values()
            .map(|iface| (iface.name.clone(), iface.id))
            .collect()
    }

    fn default_distance(&self, client: ClientId) -> crate::types::AdminDistance {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .admin_distance_for(client)
    }

    fn mark_fib_synced(&self) -> Result<(), AgentError> {
        self.hw
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .mark_fib_synced()?;
        self.fib_synced.store(true, Ordering::Release);
        Ok(())
    }

    /////////////////////////////////////////////////////////////////////////
    // Unicast route mutations
    /////////////////////////////////////////////////////////////////////////

    /// Install routes for a client in the default VRF.
    ///
    /// # Errors
    /// `NotReady` unless alive and fib-synced; `InvalidArgument` on a
    /// malformed route; hardware failures from the apply.
    pub fn add_unicast_routes(
        &self,
        client: ClientId,
        routes: &[UnicastRoute],
    ) -> Result<UpdateStatistics, AgentError> {
        self.ensure_alive()?;
        self.ensure_fib_synced()?;
        let distance = self.default_distance(client);
        let ifmap = self.interfaces_by_name();
        /* convert everything up front so a bad route changes nothing */
        let converted: Vec<_> = routes
            .iter()
            .map(|r| proto::unicast_route_entry(r, distance, &ifmap))
            .collect::<Result<_, _>>()?;

        self.update_rib(move |updater| {
            for (prefix, entry) in converted {
                updater.add_route(DEFAULT_VRF, prefix, client, entry)?;
            }
            Ok(())
        })
    }

    /// Remove a client's routes by prefix.
    ///
    /// # Errors
    /// `NotReady` unless alive and fib-synced.
    pub fn delete_unicast_routes(
        &self,
        client: ClientId,
        prefixes: &[IpPrefix],
    ) -> Result<UpdateStatistics, AgentError> {
        self.ensure_alive()?;
        self.ensure_fib_synced()?;
        let converted: Vec<Prefix> = prefixes
            .iter()
            .map(IpPrefix::canonicalized)
            .collect::<Result<_, _>>()?;

        self.update_rib(move |updater| {
            for prefix in converted {
                updater.del_route(DEFAULT_VRF, prefix, client)?;
            }
            Ok(())
        })
    }

    /// Atomically replace all of a client's routes, and latch "fib synced"
    /// on first success.
    ///
    /// # Errors
    /// `NotReady` unless alive; conversion and hardware failures.
    pub fn sync_fib(
        &self,
        client: ClientId,
        routes: &[UnicastRoute],
    ) -> Result<UpdateStatistics, AgentError> {
        self.ensure_alive()?;
        let distance = self.default_distance(client);
        let ifmap = self.interfaces_by_name();
        let converted: Vec<_> = routes
            .iter()
            .map(|r| proto::unicast_route_entry(r, distance, &ifmap))
            .collect::<Result<_, _>>()?;

        let stats = self.update_rib(move |updater| {
            updater.remove_all_routes_for_client(DEFAULT_VRF, client)?;
            for (prefix, entry) in converted {
                updater.add_route(DEFAULT_VRF, prefix, client, entry)?;
            }
            Ok(())
        })?;
        self.mark_fib_synced()?;
        Ok(stats)
    }

    /////////////////////////////////////////////////////////////////////////
    // MPLS route mutations
    /////////////////////////////////////////////////////////////////////////

    /// Install label routes for a client.
    ///
    /// # Errors
    /// `NotReady` unless alive; `InvalidLabel` outside [1, 2^20-1].
    pub fn add_mpls_routes(
        &self,
        client: ClientId,
        routes: &[MplsRoute],
    ) -> Result<(), AgentError> {
        self.ensure_alive()?;
        let distance = self.default_distance(client);
        let ifmap = self.interfaces_by_name();
        let converted: Vec<_> = routes
            .iter()
            .map(|r| proto::mpls_route_entry(r, distance, &ifmap))
            .collect::<Result<_, _>>()?;

        self.update_rib(move |updater| {
            for (label, entry) in converted {
                updater.add_label_route(label, client, entry);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Remove a client's label routes.
    ///
    /// # Errors
    /// `NotReady` unless alive; `InvalidLabel` for out-of-range labels.
    pub fn delete_mpls_routes(
        &self,
        client: ClientId,
        top_labels: &[u32],
    ) -> Result<(), AgentError> {
        self.ensure_alive()?;
        let labels: Vec<Label> = top_labels
            .iter()
            .map(|l| Label::try_new(*l))
            .collect::<Result<_, _>>()?;

        self.update_rib(move |updater| {
            for label in labels {
                updater.del_label_route(label, client);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Atomically replace all of a client's label routes.
    ///
    /// # Errors
    /// `NotReady` unless alive; conversion and hardware failures.
    pub fn sync_mpls_fib(
        &self,
        client: ClientId,
        routes: &[MplsRoute],
    ) -> Result<(), AgentError> {
        self.ensure_alive()?;
        let distance = self.default_distance(client);
        let ifmap = self.interfaces_by_name();
        let converted: Vec<_> = routes
            .iter()
            .map(|r| proto::mpls_route_entry(r, distance, &ifmap))
            .collect::<Result<_, _>>()?;

        self.update_rib(move |updater| {
            updater.remove_all_label_routes_for_client(client);
            for (label, entry) in converted {
                updater.add_label_route(label, client, entry);
            }
            Ok(())
        })?;
        Ok(())
    }

    /////////////////////////////////////////////////////////////////////////
    // Reads over the applied snapshot
    /////////////////////////////////////////////////////////////////////////

    fn vrf_table(
        state: &SwitchState,
        vrf: RouterId,
    ) -> Result<std::sync::Arc<VrfRouteTable>, AgentError> {
        state
            .route_tables
            .get(vrf)
            .cloned()
            .ok_or(AgentError::NoSuchVrf(vrf))
    }

    /// All resolved routes of the default VRF.
    #[must_use]
    pub fn get_route_table(&self) -> Vec<UnicastRoute> {
        let state = self.reader.snapshot();
        let Some(table) = state.route_tables.get(DEFAULT_VRF) else {
            return Vec::new();
        };
        table
            .routes()
            .map(|route| wire_route(route.prefix, &route.forward))
            .collect()
    }

    /// The submissions one client has in the FIB's diagnostic map.
    #[must_use]
    pub fn get_route_table_by_client(&self, client: ClientId) -> Vec<UnicastRoute> {
        let state = self.reader.snapshot();
        let Some(table) = state.route_tables.get(DEFAULT_VRF) else {
            return Vec::new();
        };
        table
            .routes()
            .filter_map(|route| {
                route
                    .entries
                    .get(&client)
                    .map(|entry| wire_route(route.prefix, entry))
            })
            .collect()
    }

    /// Per-route diagnostics: every client's submission plus the forward.
    #[must_use]
    pub fn get_route_table_details(&self) -> Vec<RouteDetails> {
        let state = self.reader.snapshot();
        let Some(table) = state.route_tables.get(DEFAULT_VRF) else {
            return Vec::new();
        };
        table
            .routes()
            .map(|route| RouteDetails {
                dest: IpPrefix::from(route.prefix),
                entries: route.entries.clone(),
                forward: route.forward.clone(),
            })
            .collect()
    }

    /// Longest-prefix match in a VRF's FIB.
    ///
    /// # Errors
    /// `NoSuchVrf` / `NoSuchRoute` on lookup failure.
    pub fn get_ip_route(&self, addr: IpAddr, vrf: RouterId) -> Result<UnicastRoute, AgentError> {
        let state = self.reader.snapshot();
        let table = Self::vrf_table(&state, vrf)?;
        let route = table.lpm(&addr).ok_or(AgentError::NoSuchRoute)?;
        Ok(wire_route(route.prefix, &route.forward))
    }

    /// Longest-prefix match with full diagnostics.
    ///
    /// # Errors
    /// `NoSuchVrf` / `NoSuchRoute` on lookup failure.
    pub fn get_ip_route_details(
        &self,
        addr: IpAddr,
        vrf: RouterId,
    ) -> Result<RouteDetails, AgentError> {
        let state = self.reader.snapshot();
        let table = Self::vrf_table(&state, vrf)?;
        let route = table.lpm(&addr).ok_or(AgentError::NoSuchRoute)?;
        Ok(RouteDetails {
            dest: IpPrefix::from(route.prefix),
            entries: route.entries.clone(),
            forward: route.forward.clone(),
        })
    }

    /////////////////////////////////////////////////////////////////////////
    // Operational surface
    /////////////////////////////////////////////////////////////////////////

    #[must_use]
    pub fn get_status(&self) -> AgentStatus {
        self.status()
    }

    /// Swap in a new running config and re-apply it.
    ///
    /// # Errors
    /// Surfaces apply failures; the config is stored regardless so a
    /// subsequent reload can fix it.
    pub fn reload_config(&self, config: AgentConfig) -> Result<(), AgentError> {
        info!("reloading config, generation {}", config.genid());
        {
            let mut current = self
                .config
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *current = config;
        }
        self.apply_config()
    }

    #[must_use]
    pub fn get_running_config(&self) -> AgentConfig {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// JSON view of the applied snapshot at a JSON-pointer path (empty
    /// pointer = whole state).
    ///
    /// # Errors
    /// `InvalidArgument` for a pointer that resolves to nothing.
    pub fn get_current_state_json(&self, pointer: &str) -> Result<String, AgentError> {
        let state = self.reader.snapshot();
        let value = serde_json::to_value(&*state)
            .map_err(|_| AgentError::Internal("switch state serialization failed"))?;
        let target = if pointer.is_empty() {
            &value
        } else {
            value.pointer(pointer).ok_or_else(|| {
                AgentError::InvalidArgument(format!("no state at pointer '{pointer}'"))
            })?
        };
        serde_json::to_string_pretty(target)
            .map_err(|_| AgentError::Internal("switch state serialization failed"))
    }

    /// Replace the JSON subtree at a pointer path and apply the result as
    /// a state update. Disabled unless the running config enables it.
    ///
    /// # Errors
    /// `InvalidArgument` when disabled or the patch does not produce a
    /// deserializable state; validation and hardware failures from apply.
    pub fn patch_current_state_json(&self, pointer: &str, patch: Value) -> Result<(), AgentError> {
        let enabled = self
            .config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .enable_running_config_mutations;
        if !enabled {
            return Err(AgentError::InvalidArgument(
                "running-config mutations are disabled".to_string(),
            ));
        }

        /* validate against the current snapshot before enqueueing */
        apply_json_patch(&self.reader.snapshot(), pointer, &patch)?;

        let pointer = pointer.to_string();
        self.updater.update_blocking(
            "patch state json",
            Box::new(move |state| match apply_json_patch(state, &pointer, &patch) {
                Ok(next) if next != *state => Some(next),
                _ => None,
            }),
        )
    }
}

fn apply_json_patch(
    state: &SwitchState,
    pointer: &str,
    patch: &Value,
) -> Result<SwitchState, AgentError> {
    let mut value = serde_json::to_value(state)
        .map_err(|_| AgentError::Internal("switch state serialization failed"))?;
    let slot = if pointer.is_empty() {
        &mut value
    } else {
        value.pointer_mut(pointer).ok_or_else(|| {
            AgentError::InvalidArgument(format!("no state at pointer '{pointer}'"))
        })?
    };
    *slot = patch.clone();
    serde_json::from_value(value)
        .map_err(|e| AgentError::InvalidArgument(format!("patched state is invalid: {e}")))
}
