// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The switch agent: wires the RIB, state pipeline, hardware manager and
//! neighbor cache together and owns the lifecycle.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lpm::prefix::Prefix;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::hw::HwSwitch;
use crate::hw::device::SwitchDevice;
use crate::hw::warmboot::{WarmBootCache, WarmBootDump};
use crate::neighbors::{NeighborCache, NeighborDelta, NeighborEntry, NeighborReader};
use crate::rib::rib2fib::{build_label_fib, build_vrf_fib, fib_sync_transform};
use crate::rib::updater::{RibUpdater, UpdateStatistics};
use crate::rib::Rib;
use crate::state::SwitchState;
use crate::state::pipeline::{StateReader, StateUpdater};
use crate::state::topology::{InterfaceMap, SwitchInterface};
use crate::types::{DEFAULT_VRF, InterfaceId};

/// Process exit codes: normal shutdown, and a hardware fault the agent
/// cannot recover from.
pub const EXIT_OK: i32 = 0;
pub const EXIT_HW_FAULT: i32 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentStatus {
    Starting = 0,
    Alive = 1,
    Stopping = 2,
}

pub struct SwitchAgent {
    pub(crate) config: RwLock<AgentConfig>,
    pub(crate) rib: Rib,
    pub(crate) hw: Arc<Mutex<HwSwitch>>,
    pub(crate) updater: StateUpdater,
    pub(crate) reader: StateReader,
    pub(crate) neighbors: Mutex<NeighborCache>,
    neighbor_reader: NeighborReader,
    status: AtomicU8,
    pub(crate) fib_synced: AtomicBool,
    /// Warm-boot state to restore on start, if any.
    warm_state: Option<SwitchState>,
}

impl SwitchAgent {
    /// Cold boot: the device starts (or is assumed) empty.
    ///
    /// # Errors
    /// Fails if the state pipeline cannot start.
    pub fn new(config: AgentConfig, device: Box<dyn SwitchDevice>) -> Result<Self, AgentError> {
        Self::boot(config, device, None)
    }

    /// Warm boot: adopt the device objects recorded in the dump, deleting
    /// whatever the first FIB sync does not claim.
    ///
    /// # Errors
    /// Fails if the state pipeline cannot start.
    pub fn new_warm(
        config: AgentConfig,
        device: Box<dyn SwitchDevice>,
        dump: WarmBootDump,
    ) -> Result<Self, AgentError> {
        Self::boot(config, device, Some(dump))
    }

    fn boot(
        config: AgentConfig,
        device: Box<dyn SwitchDevice>,
        dump: Option<WarmBootDump>,
    ) -> Result<Self, AgentError> {
        let (cache, warm_state) = match dump {
            Some(dump) => (WarmBootCache::from_dump(&dump), Some(dump.switch_state)),
            None => (WarmBootCache::cold(), None),
        };

        let hw = Arc::new(Mutex::new(HwSwitch::new(device, cache)));
        let (updater, reader) = StateUpdater::new(SwitchState::default(), Arc::clone(&hw))?;
        let (neighbors, neighbor_reader) = NeighborCache::new(Arc::clone(&hw));
        let rib = Rib::new(config.tie_break);

        Ok(Self {
            config: RwLock::new(config),
            rib,
            hw,
            updater,
            reader,
            neighbors: Mutex::new(neighbors),
            neighbor_reader,
            status: AtomicU8::new(AgentStatus::Starting as u8),
            fib_synced: AtomicBool::new(false),
            warm_state,
        })
    }

    /// Bring the agent up: restore warm-boot state, apply the configured
    /// topology and routes, and go `Alive`.
    ///
    /// # Errors
    /// Surfaces pipeline and hardware failures.
    pub fn start(&mut self) -> Result<(), AgentError> {
        if let Some(warm) = self.warm_state.take() {
            info!("restoring warm-boot switch state");
            let restored = warm.clone();
            self.updater
                .update_blocking("warm-boot restore", Box::new(move |_| Some(warm.clone())))?;
            self.seed_rib_from_state(&restored)?;
        }
        self.apply_config()?;
        self.status
            .store(AgentStatus::Alive as u8, Ordering::Release);
        info!("switch agent is alive");
        Ok(())
    }

    /// Rebuild the RIB from a restored snapshot's per-client maps, so the
    /// FIBs the next batches produce agree with what the hardware already
    /// holds.
    fn seed_rib_from_state(&self, state: &SwitchState) -> Result<(), AgentError> {
        {
            let mut tables = self.rib.lock();
            for (vrf, table) in &state.route_tables.tables {
                if tables.get_vrf(*vrf).is_err() {
                    tables.add_vrf(&table.name, *vrf)?;
                }
            }
        }
        let state = state.clone();
        self.update_rib(move |updater| {
            for (vrf, table) in &state.route_tables.tables {
                for route in table.routes() {
                    for (client, entry) in &route.entries {
                        if *client == crate::types::ClientId::INTERFACE_ROUTE {
                            let hop = entry.nhops().and_then(|hops| hops.first());
                            if let Some(hop) = hop {
                                if let Some(ifindex) = hop.ifindex {
                                    updater.add_interface_route(
                                        *vrf,
                                        route.prefix,
                                        hop.addr,
                                        ifindex,
                                    )?;
                                    continue;
                                }
                            }
                        }
                        updater.add_route(*vrf, route.prefix, *client, entry.clone())?;
                    }
                }
            }
            for entry in state.label_fib.entries.values() {
                for (client, submission) in &entry.entries {
                    updater.add_label_route(entry.label, *client, submission.clone());
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    pub(crate) fn apply_config(&self) -> Result<(), AgentError> {
        let config = self
            .config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        debug!("applying config generation {}", config.genid());

        /* publish configured interfaces into the snapshot */
        let mut interfaces = InterfaceMap::new();
        for cfg in &config.interfaces {
            let mut interface = SwitchInterface::new(cfg.id, &cfg.name, cfg.vrf);
            interface.vlan = cfg.vlan;
            interface.addresses = cfg.addresses.iter().copied().collect();
            interfaces.insert(cfg.id, interface);
        }
        self.updater.update_blocking(
            "apply interface config",
            Box::new(move |state| {
                if *state.interfaces == interfaces {
                    None
                } else {
                    Some(state.with_interfaces(interfaces.clone()))
                }
            }),
        )?;

        /* VRFs, connected routes and link-local routes. VRFs dropped from
        the config lose their FIB as well. */
        let removed: Vec<crate::types::RouterId> = {
            let mut tables = self.rib.lock();
            for vrf in &config.vrfs {
                if tables.get_vrf(vrf.id).is_err() {
                    tables.add_vrf(&vrf.name, vrf.id)?;
                }
            }
            let keep: std::collections::BTreeSet<crate::types::RouterId> = config
                .vrfs
                .iter()
                .map(|v| v.id)
                .chain([DEFAULT_VRF])
                .collect();
            let stale: Vec<crate::types::RouterId> = tables
                .vrfs()
                .map(|v| v.id)
                .filter(|id| !keep.contains(id))
                .collect();
            for id in &stale {
                tables.remove_vrf(*id)?;
            }
            stale
        };
        for vrf in removed {
            self.updater
                .update_blocking("remove vrf fib", crate::rib::rib2fib::remove_vrf_transform(vrf))?;
        }
        self.update_rib(|updater| {
            updater.add_link_local_routes(DEFAULT_VRF)?;
            for vrf in &config.vrfs {
                updater.add_link_local_routes(vrf.id)?;
            }
            for iface in &config.interfaces {
                for (addr, len) in &iface.addresses {
                    let prefix = Prefix::canonicalize(*addr, *len)?;
                    updater.add_interface_route(iface.vrf, prefix, *addr, iface.id)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Graceful shutdown: write and return the warm-boot dump, then stop
    /// the pipeline.
    ///
    /// # Errors
    /// Fails if the dump cannot be written.
    pub fn stop(&mut self) -> Result<WarmBootDump, AgentError> {
        self.status
            .store(AgentStatus::Stopping as u8, Ordering::Release);
        let applied = self.reader.snapshot();
        let dump = self
            .hw
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .dump(&applied);

        let path = self
            .config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .warm_boot_file
            .clone();
        if let Some(path) = path {
            let json = serde_json::to_string_pretty(&dump)
                .map_err(|_| AgentError::Internal("warm-boot dump serialization failed"))?;
            std::fs::write(&path, json).map_err(|_| {
                AgentError::InvalidArgument(format!(
                    "cannot write warm-boot dump to {}",
                    path.display()
                ))
            })?;
            info!("warm-boot dump written to {}", path.display());
        }

        self.updater.stop();
        Ok(dump)
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        match self.status.load(Ordering::Acquire) {
            0 => AgentStatus::Starting,
            1 => AgentStatus::Alive,
            _ => AgentStatus::Stopping,
        }
    }

    /// Lock-free reader for the applied snapshot.
    #[must_use]
    pub fn state_reader(&self) -> StateReader {
        self.reader.clone()
    }

    #[must_use]
    pub fn neighbor_reader(&self) -> NeighborReader {
        self.neighbor_reader.clone()
    }

    /// Run a RIB batch, then push the resulting FIBs through the pipeline.
    /// The RIB lock is released before the pipeline dispatch, so it is
    /// never held across a device call.
    pub(crate) fn update_rib<F>(&self, batch: F) -> Result<UpdateStatistics, AgentError>
    where
        F: FnOnce(&mut RibUpdater<'_>) -> Result<(), AgentError>,
    {
        let (stats, candidates, label_candidate) = {
            let mut tables = self.rib.lock();
            let mut updater = RibUpdater::new(&mut tables);
            batch(&mut updater)?;
            let (stats, changes) = updater.update_done()?;

            let mut candidates = Vec::with_capacity(changes.vrfs.len());
            for vrf in &changes.vrfs {
                if let Ok(vrf_rib) = tables.get_vrf(*vrf) {
                    candidates.push(build_vrf_fib(vrf_rib));
                }
            }
            let label_candidate = changes.labels.then(|| build_label_fib(&tables));
            (stats, candidates, label_candidate)
        };

        if !candidates.is_empty() || label_candidate.is_some() {
            self.updater.update_blocking(
                "fib update",
                fib_sync_transform(candidates, label_candidate),
            )?;
        }
        Ok(stats)
    }

    /////////////////////////////////////////////////////////////////////////
    // Neighbor subsystem surface
    /////////////////////////////////////////////////////////////////////////

    /// Report a resolved neighbor.
    ///
    /// # Errors
    /// Surfaces hardware failures from dependent egress updates.
    pub fn neighbor_resolved(&self, entry: NeighborEntry) -> Result<(), AgentError> {
        self.neighbors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .add_neighbor(entry)
    }

    /// Report a neighbor that went away.
    ///
    /// # Errors
    /// Surfaces hardware failures from dependent egress updates.
    pub fn neighbor_unresolved(
        &self,
        addr: std::net::IpAddr,
        ifindex: InterfaceId,
    ) -> Result<(), AgentError> {
        self.neighbors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .del_neighbor(addr, ifindex)
    }

    /// Duplex subscription: a stream of neighbor-cache change batches.
    #[must_use]
    pub fn subscribe_neighbor_changed(&self) -> UnboundedReceiver<NeighborDelta> {
        self.neighbors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .subscribe()
    }
}

/// Read a warm-boot dump written by [`SwitchAgent::stop`].
///
/// # Errors
/// Fails on a missing or malformed file.
pub fn load_warm_boot_dump(path: &Path) -> Result<WarmBootDump, AgentError> {
    let json = std::fs::read_to_string(path).map_err(|_| {
        AgentError::InvalidArgument(format!("cannot read warm-boot dump {}", path.display()))
    })?;
    serde_json::from_str(&json)
        .map_err(|e| AgentError::InvalidArgument(format!("bad warm-boot dump: {e}")))
}
