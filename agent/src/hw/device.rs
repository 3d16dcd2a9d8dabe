// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The device-driver seam: the operations the hardware manager needs from a
//! forwarding ASIC, plus a software implementation used by tests and by
//! deployments without hardware.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use lpm::prefix::Prefix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mpls::{Label, LabelStack};
use crate::types::{InterfaceId, RouterId};

/// A device-side egress object identifier.
pub type EgressId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device table full: {0}")]
    TableFull(&'static str),
    #[error("device rejected operation: {0}")]
    Rejected(String),
    #[error("no such device object: {0}")]
    NoSuchObject(u64),
}

/// What a unicast egress object does with packets sent to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EgressProgram {
    Drop,
    ToCpu,
    /// Neighbor-resolved: send out an interface toward a next-hop, with an
    /// optional label stack pushed.
    Forward {
        addr: IpAddr,
        ifindex: InterfaceId,
        labels: LabelStack,
    },
    /// Pending neighbor resolution: punt to the CPU so traffic triggers
    /// discovery.
    Punt,
}

/// Everything the device remembers, read back at warm boot.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DeviceDump {
    pub routes: Vec<(RouterId, Prefix, EgressId, bool)>,
    pub host_routes: Vec<(RouterId, IpAddr, EgressId, bool)>,
    pub egresses: BTreeMap<EgressId, EgressProgram>,
    pub ecmp_groups: BTreeMap<EgressId, Vec<EgressId>>,
    pub label_entries: Vec<(Label, EgressId, bool)>,
}

/// Driver operations for route/egress programming.
///
/// Egress and ECMP ids are allocated by the device; the canonical drop and
/// to-CPU egresses always exist. `ecmp_del_path` removes every copy of a
/// member; `ecmp_add_path` installs the given number of copies.
pub trait SwitchDevice: Send {
    fn drop_egress(&self) -> EgressId;
    fn cpu_egress(&self) -> EgressId;
    fn supports_host_route_table(&self) -> bool;

    fn create_egress(&mut self, program: &EgressProgram) -> Result<EgressId, DeviceError>;
    /// Reprogram an egress in place; its id is preserved so referencing
    /// ECMP groups and routes are unaffected.
    fn update_egress(&mut self, id: EgressId, program: &EgressProgram) -> Result<(), DeviceError>;
    fn destroy_egress(&mut self, id: EgressId) -> Result<(), DeviceError>;

    fn create_ecmp_group(&mut self, members: &[EgressId]) -> Result<EgressId, DeviceError>;
    fn ecmp_add_path(
        &mut self,
        group: EgressId,
        member: EgressId,
        copies: usize,
    ) -> Result<(), DeviceError>;
    fn ecmp_del_path(&mut self, group: EgressId, member: EgressId) -> Result<(), DeviceError>;
    fn destroy_ecmp_group(&mut self, id: EgressId) -> Result<(), DeviceError>;

    fn write_route(
        &mut self,
        vrf: RouterId,
        prefix: Prefix,
        egress: EgressId,
        ecmp: bool,
        replace: bool,
    ) -> Result<(), DeviceError>;
    fn delete_route(&mut self, vrf: RouterId, prefix: Prefix) -> Result<(), DeviceError>;

    fn write_host_route(
        &mut self,
        vrf: RouterId,
        addr: IpAddr,
        egress: EgressId,
        ecmp: bool,
        replace: bool,
    ) -> Result<(), DeviceError>;
    fn delete_host_route(&mut self, vrf: RouterId, addr: IpAddr) -> Result<(), DeviceError>;

    fn write_label_entry(
        &mut self,
        label: Label,
        egress: EgressId,
        ecmp: bool,
        replace: bool,
    ) -> Result<(), DeviceError>;
    fn delete_label_entry(&mut self, label: Label) -> Result<(), DeviceError>;

    fn dump(&self) -> DeviceDump;
}

const DROP_EGRESS: EgressId = 1;
const CPU_EGRESS: EgressId = 2;
const FIRST_DYNAMIC_ID: EgressId = 100;

#[derive(Debug)]
struct SoftTables {
    next_id: EgressId,
    egresses: BTreeMap<EgressId, EgressProgram>,
    ecmp_groups: BTreeMap<EgressId, Vec<EgressId>>,
    routes: BTreeMap<(RouterId, Prefix), (EgressId, bool)>,
    host_routes: BTreeMap<(RouterId, IpAddr), (EgressId, bool)>,
    label_entries: BTreeMap<Label, (EgressId, bool)>,
    host_table_support: bool,
    write_ops: u64,
    fail_next: u32,
    fail_in: Option<u32>,
}

impl Default for SoftTables {
    fn default() -> Self {
        let mut egresses = BTreeMap::new();
        egresses.insert(DROP_EGRESS, EgressProgram::Drop);
        egresses.insert(CPU_EGRESS, EgressProgram::ToCpu);
        Self {
            next_id: FIRST_DYNAMIC_ID,
            egresses,
            ecmp_groups: BTreeMap::new(),
            routes: BTreeMap::new(),
            host_routes: BTreeMap::new(),
            label_entries: BTreeMap::new(),
            host_table_support: true,
            write_ops: 0,
            fail_next: 0,
            fail_in: None,
        }
    }
}

impl SoftTables {
    fn mutate(&mut self) -> Result<(), DeviceError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(DeviceError::Rejected("injected fault".to_string()));
        }
        match self.fail_in {
            Some(0) => {
                self.fail_in = None;
                return Err(DeviceError::Rejected("injected fault".to_string()));
            }
            Some(n) => self.fail_in = Some(n - 1),
            None => {}
        }
        self.write_ops += 1;
        Ok(())
    }

    fn egress_referenced(&self, id: EgressId) -> bool {
        self.ecmp_groups.values().any(|members| members.contains(&id))
            || self.routes.values().any(|(egress, _)| *egress == id)
            || self.host_routes.values().any(|(egress, _)| *egress == id)
            || self.label_entries.values().any(|(egress, _)| *egress == id)
    }
}

/// An in-memory [`SwitchDevice`]. Clones share the same tables, so a test
/// or a warm-booting agent can keep a handle and inspect or preserve the
/// device state across an agent instance.
#[derive(Clone, Default)]
pub struct SoftSwitch(Arc<Mutex<SoftTables>>);

impl SoftSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn without_host_table() -> Self {
        let device = Self::default();
        device.lock().host_table_support = false;
        device
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SoftTables> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of mutating driver calls performed so far.
    #[must_use]
    pub fn write_ops(&self) -> u64 {
        self.lock().write_ops
    }

    /// Make the next `n` mutating calls fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Make exactly one mutating call fail, after `skip` successful ones.
    pub fn fail_write_after(&self, skip: u32) {
        self.lock().fail_in = Some(skip);
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.lock().routes.len()
    }
    #[must_use]
    pub fn host_route_count(&self) -> usize {
        self.lock().host_routes.len()
    }
    #[must_use]
    pub fn egress_count(&self) -> usize {
        self.lock().egresses.len()
    }
    #[must_use]
    pub fn ecmp_group_count(&self) -> usize {
        self.lock().ecmp_groups.len()
    }

    #[must_use]
    pub fn get_route(&self, vrf: RouterId, prefix: Prefix) -> Option<(EgressId, bool)> {
        self.lock().routes.get(&(vrf, prefix)).copied()
    }
    #[must_use]
    pub fn get_host_route(&self, vrf: RouterId, addr: IpAddr) -> Option<(EgressId, bool)> {
        self.lock().host_routes.get(&(vrf, addr)).copied()
    }
    #[must_use]
    pub fn get_egress(&self, id: EgressId) -> Option<EgressProgram> {
        self.lock().egresses.get(&id).cloned()
    }
    #[must_use]
    pub fn get_ecmp_members(&self, id: EgressId) -> Option<Vec<EgressId>> {
        self.lock().ecmp_groups.get(&id).cloned()
    }
    #[must_use]
    pub fn get_label_entry(&self, label: Label) -> Option<(EgressId, bool)> {
        self.lock().label_entries.get(&label).copied()
    }
}

impl SwitchDevice for SoftSwitch {
    fn drop_egress(&self) -> EgressId {
        DROP_EGRESS
    }
    fn cpu_egress(&self) -> EgressId {
        CPU_EGRESS
    }
    fn supports_host_route_table(&self) -> bool {
        self.lock().host_table_support
    }

    fn create_egress(&mut self, program: &EgressProgram) -> Result<EgressId, DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        let id = tables.next_id;
        tables.next_id += 1;
        tables.egresses.insert(id, program.clone());
        Ok(id)
    }

    fn update_egress(&mut self, id: EgressId, program: &EgressProgram) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        match tables.egresses.get_mut(&id) {
            Some(existing) => {
                *existing = program.clone();
                Ok(())
            }
            None => Err(DeviceError::NoSuchObject(id)),
        }
    }

    fn destroy_egress(&mut self, id: EgressId) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        if id == DROP_EGRESS || id == CPU_EGRESS {
            return Err(DeviceError::Rejected("cannot destroy canonical egress".to_string()));
        }
        if tables.egress_referenced(id) {
            return Err(DeviceError::Rejected(format!("egress {id} is still referenced")));
        }
        tables
            .egresses
            .remove(&id)
            .map(|_| ())
            .ok_or(DeviceError::NoSuchObject(id))
    }

    fn create_ecmp_group(&mut self, members: &[EgressId]) -> Result<EgressId, DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        if members.len() < 2 {
            return Err(DeviceError::Rejected("ECMP group needs at least 2 members".to_string()));
        }
        if let Some(missing) = members.iter().find(|m| !tables.egresses.contains_key(m)) {
            return Err(DeviceError::NoSuchObject(*missing));
        }
        let id = tables.next_id;
        tables.next_id += 1;
        tables.ecmp_groups.insert(id, members.to_vec());
        Ok(id)
    }

    fn ecmp_add_path(
        &mut self,
        group: EgressId,
        member: EgressId,
        copies: usize,
    ) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        if !tables.egresses.contains_key(&member) {
            return Err(DeviceError::NoSuchObject(member));
        }
        let members = tables
            .ecmp_groups
            .get_mut(&group)
            .ok_or(DeviceError::NoSuchObject(group))?;
        members.extend(std::iter::repeat_n(member, copies));
        members.sort_unstable();
        Ok(())
    }

    fn ecmp_del_path(&mut self, group: EgressId, member: EgressId) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        let members = tables
            .ecmp_groups
            .get_mut(&group)
            .ok_or(DeviceError::NoSuchObject(group))?;
        members.retain(|m| *m != member);
        Ok(())
    }

    fn destroy_ecmp_group(&mut self, id: EgressId) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        let referenced = tables.routes.values().any(|(egress, _)| *egress == id)
            || tables.host_routes.values().any(|(egress, _)| *egress == id)
            || tables.label_entries.values().any(|(egress, _)| *egress == id);
        if referenced {
            return Err(DeviceError::Rejected(format!("ECMP group {id} is still referenced")));
        }
        tables
            .ecmp_groups
            .remove(&id)
            .map(|_| ())
            .ok_or(DeviceError::NoSuchObject(id))
    }

    fn write_route(
        &mut self,
        vrf: RouterId,
        prefix: Prefix,
        egress: EgressId,
        ecmp: bool,
        replace: bool,
    ) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        if !replace && tables.routes.contains_key(&(vrf, prefix)) {
            return Err(DeviceError::Rejected(format!("route {prefix} already exists in vrf {vrf}")));
        }
        tables.routes.insert((vrf, prefix), (egress, ecmp));
        Ok(())
    }

    fn delete_route(&mut self, vrf: RouterId, prefix: Prefix) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        tables
            .routes
            .remove(&(vrf, prefix))
            .map(|_| ())
            .ok_or_else(|| DeviceError::Rejected(format!("no route {prefix} in vrf {vrf}")))
    }

    fn write_host_route(
        &mut self,
        vrf: RouterId,
        addr: IpAddr,
        egress: EgressId,
        ecmp: bool,
        replace: bool,
    ) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        if !tables.host_table_support {
            return Err(DeviceError::Rejected("no host route table".to_string()));
        }
        if !replace && tables.host_routes.contains_key(&(vrf, addr)) {
            return Err(DeviceError::Rejected(format!("host route {addr} already exists in vrf {vrf}")));
        }
        tables.host_routes.insert((vrf, addr), (egress, ecmp));
        Ok(())
    }

    fn delete_host_route(&mut self, vrf: RouterId, addr: IpAddr) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        tables
            .host_routes
            .remove(&(vrf, addr))
            .map(|_| ())
            .ok_or_else(|| DeviceError::Rejected(format!("no host route {addr} in vrf {vrf}")))
    }

    fn write_label_entry(
        &mut self,
        label: Label,
        egress: EgressId,
        ecmp: bool,
        replace: bool,
    ) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        if !replace && tables.label_entries.contains_key(&label) {
            return Err(DeviceError::Rejected(format!("label {label} already programmed")));
        }
        tables.label_entries.insert(label, (egress, ecmp));
        Ok(())
    }

    fn delete_label_entry(&mut self, label: Label) -> Result<(), DeviceError> {
        let mut tables = self.lock();
        tables.mutate()?;
        tables
            .label_entries
            .remove(&label)
            .map(|_| ())
            .ok_or_else(|| DeviceError::Rejected(format!("no label entry {label}")))
    }

    fn dump(&self) -> DeviceDump {
        let tables = self.lock();
        DeviceDump {
            routes: tables
                .routes
                .iter()
                .map(|((vrf, prefix), (egress, ecmp))| (*vrf, *prefix, *egress, *ecmp))
                .collect(),
            host_routes: tables
                .host_routes
                .iter()
                .map(|((vrf, addr), (egress, ecmp))| (*vrf, *addr, *egress, *ecmp))
                .collect(),
            egresses: tables.egresses.clone(),
            ecmp_groups: tables.ecmp_groups.clone(),
            label_entries: tables
                .label_entries
                .iter()
                .map(|(label, (egress, ecmp))| (*label, *egress, *ecmp))
                .collect(),
        }
    }
}
