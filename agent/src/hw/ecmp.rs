// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The refcounted ECMP group table. Groups are keyed by their member
//! multiset (weights appear as repeated members), so identical next-hop
//! sets share one device group.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ahash::RandomState;
use tracing::debug;

use crate::hw::device::{DeviceError, EgressId, SwitchDevice};
use crate::hw::warmboot::WarmBootCache;

/// Canonical group key: member ids sorted, one entry per path copy.
pub type EcmpKey = Vec<EgressId>;

#[must_use]
pub fn make_key(members: impl IntoIterator<Item = EgressId>) -> EcmpKey {
    let mut key: EcmpKey = members.into_iter().collect();
    key.sort_unstable();
    key
}

#[derive(Debug)]
pub struct EcmpGroup {
    pub egress_id: EgressId,
    /// Desired member copies, including currently-unreachable paths.
    desired: BTreeMap<EgressId, usize>,
    /// Members currently installed in the device group.
    live: BTreeSet<EgressId>,
    refcount: usize,
}

#[derive(Default)]
pub struct EcmpGroupTable {
    by_members: HashMap<EcmpKey, EcmpGroup, RandomState>,
}

impl EcmpGroupTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EcmpKey, &EcmpGroup)> {
        self.by_members.iter()
    }

    /// Take a reference on the group for a member multiset, creating it (or
    /// adopting it from the warm-boot cache) on first use.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn reference_or_emplace(
        &mut self,
        device: &mut dyn SwitchDevice,
        warmboot: &mut WarmBootCache,
        key: EcmpKey,
    ) -> Result<EgressId, DeviceError> {
        if let Some(existing) = self.by_members.get_mut(&key) {
            existing.refcount += 1;
            return Ok(existing.egress_id);
        }

        let egress_id = match warmboot.claim_ecmp_group(&key) {
            Some(id) => {
                debug!("adopted warm-boot ECMP group {id}");
                id
            }
            None => device.create_ecmp_group(&key)?,
        };
        let mut desired: BTreeMap<EgressId, usize> = BTreeMap::new();
        for member in &key {
            *desired.entry(*member).or_insert(0) += 1;
        }
        let live = desired.keys().copied().collect();
        self.by_members.insert(
            key,
            EcmpGroup {
                egress_id,
                desired,
                live,
                refcount: 1,
            },
        );
        Ok(egress_id)
    }

    /// Drop one reference; the device group is destroyed with the last one.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn release(
        &mut self,
        device: &mut dyn SwitchDevice,
        key: &EcmpKey,
    ) -> Result<bool, DeviceError> {
        let Some(existing) = self.by_members.get_mut(key) else {
            return Err(DeviceError::Rejected("release of unknown ECMP group".to_string()));
        };
        existing.refcount -= 1;
        if existing.refcount > 0 {
            return Ok(false);
        }
        let egress_id = existing.egress_id;
        self.by_members.remove(key);
        device.destroy_ecmp_group(egress_id)?;
        Ok(true)
    }

    /// Shrink every group containing an egress that became unreachable.
    /// The group id never changes and no group is rebuilt.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn path_unreachable(
        &mut self,
        device: &mut dyn SwitchDevice,
        member: EgressId,
    ) -> Result<(), DeviceError> {
        for group in self.by_members.values_mut() {
            if group.live.contains(&member) {
                device.ecmp_del_path(group.egress_id, member)?;
                group.live.remove(&member);
            }
        }
        Ok(())
    }

    /// Expand every group whose desired membership includes an egress that
    /// became reachable again.
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn path_reachable(
        &mut self,
        device: &mut dyn SwitchDevice,
        member: EgressId,
    ) -> Result<(), DeviceError> {
        for group in self.by_members.values_mut() {
            if let Some(copies) = group.desired.get(&member) {
                if !group.live.contains(&member) {
                    device.ecmp_add_path(group.egress_id, member, *copies)?;
                    group.live.insert(member);
                }
            }
        }
        Ok(())
    }
}
