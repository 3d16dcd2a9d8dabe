// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! RIB state: per-VRF route tables, the label table, and the batch updater
//! that mutates them under the process-wide RIB lock.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::errors::AgentError;
use crate::rib::labels::LabelRib;
use crate::rib::route::TieBreak;
use crate::rib::vrf::VrfRib;
use crate::types::{DEFAULT_VRF, RouterId};

pub mod labels;
pub mod resolver;
pub mod rib2fib;
pub mod route;
pub mod updater;
pub mod vrf;

// re-exports
pub use route::RibRoute;
pub use updater::{RibUpdater, UpdateStatistics};

/// All RIB tables. Mutated only through a [`RibUpdater`] while holding the
/// [`Rib`] lock.
pub struct RibTables {
    pub(crate) vrfs: BTreeMap<RouterId, VrfRib>,
    pub(crate) labels: LabelRib,
    pub tie_break: TieBreak,
}

impl RibTables {
    /// Create the tables with the default VRF already present.
    #[must_use]
    pub fn new(tie_break: TieBreak) -> Self {
        let mut vrfs = BTreeMap::new();
        vrfs.insert(DEFAULT_VRF, VrfRib::new("default", DEFAULT_VRF));
        Self {
            vrfs,
            labels: LabelRib::new(),
            tie_break,
        }
    }

    /// Register a VRF.
    ///
    /// # Errors
    /// Fails if a VRF with the same id exists.
    pub fn add_vrf(&mut self, name: &str, id: RouterId) -> Result<(), AgentError> {
        if self.vrfs.contains_key(&id) {
            return Err(AgentError::InvalidArgument(format!(
                "VRF {id} already exists"
            )));
        }
        self.vrfs.insert(id, VrfRib::new(name, id));
        Ok(())
    }

    /// Remove a VRF and all its routes. The default VRF cannot be removed.
    ///
    /// # Errors
    /// Fails if the VRF does not exist or is the default one.
    pub fn remove_vrf(&mut self, id: RouterId) -> Result<(), AgentError> {
        if id == DEFAULT_VRF {
            return Err(AgentError::InvalidArgument(
                "the default VRF cannot be removed".to_string(),
            ));
        }
        self.vrfs
            .remove(&id)
            .map(|_| ())
            .ok_or(AgentError::NoSuchVrf(id))
    }

    pub fn get_vrf(&self, id: RouterId) -> Result<&VrfRib, AgentError> {
        self.vrfs.get(&id).ok_or(AgentError::NoSuchVrf(id))
    }

    pub fn get_vrf_mut(&mut self, id: RouterId) -> Result<&mut VrfRib, AgentError> {
        self.vrfs.get_mut(&id).ok_or(AgentError::NoSuchVrf(id))
    }

    pub fn vrfs(&self) -> impl Iterator<Item = &VrfRib> {
        self.vrfs.values()
    }

    #[must_use]
    pub fn labels(&self) -> &LabelRib {
        &self.labels
    }
}

/// The process-wide RIB write lock. Batching happens under it; it is always
/// released before the state-update pipeline is dispatched, so it is never
/// held across a device-driver call.
pub struct Rib(Mutex<RibTables>);

impl Rib {
    #[must_use]
    pub fn new(tie_break: TieBreak) -> Self {
        Self(Mutex::new(RibTables::new(tie_break)))
    }

    pub fn lock(&self) -> MutexGuard<'_, RibTables> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
