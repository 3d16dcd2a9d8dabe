// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The neighbor (ARP/NDP) cache. The discovery protocols themselves run in
//! an external subsystem; this module keeps the resolved-neighbor table
//! behind a left-right pair for lock-free readers, streams change batches
//! to subscribers, and feeds egress-resolution events into the hardware
//! manager.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use left_right::{Absorb, ReadGuard, ReadHandle, WriteHandle};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

use crate::errors::AgentError;
use crate::hw::HwSwitch;
use crate::types::InterfaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mac(pub [u8; 6]);

impl Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// A resolved neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub addr: IpAddr,
    pub ifindex: InterfaceId,
    pub mac: Mac,
}

/// The table of resolved neighbors, keyed by (ifindex, address).
#[derive(Default, Clone)]
pub struct NeighborTable(HashMap<(InterfaceId, IpAddr), NeighborEntry, RandomState>);

impl NeighborTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    #[must_use]
    pub fn get(&self, addr: IpAddr, ifindex: InterfaceId) -> Option<&NeighborEntry> {
        self.0.get(&(ifindex, addr))
    }
    pub fn values(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.0.values()
    }
    fn add(&mut self, entry: NeighborEntry) {
        self.0.insert((entry.ifindex, entry.addr), entry);
    }
    fn del(&mut self, addr: IpAddr, ifindex: InterfaceId) {
        self.0.remove(&(ifindex, addr));
    }
}

enum NeighborChange {
    Add(NeighborEntry),
    Del((IpAddr, InterfaceId)),
}

impl Absorb<NeighborChange> for NeighborTable {
    fn absorb_first(&mut self, change: &mut NeighborChange, _: &Self) {
        match change {
            NeighborChange::Add(entry) => self.add(*entry),
            NeighborChange::Del((addr, ifindex)) => self.del(*addr, *ifindex),
        }
    }
    fn drop_first(self: Box<Self>) {}
    fn sync_with(&mut self, first: &Self) {
        *self = first.clone();
    }
}

#[derive(Clone)]
pub struct NeighborReader(ReadHandle<NeighborTable>);

impl NeighborReader {
    pub fn enter(&self) -> Option<ReadGuard<'_, NeighborTable>> {
        self.0.enter()
    }
}

/// A batch of neighbor-cache changes, streamed to subscribers.
#[derive(Debug, Default, Clone)]
pub struct NeighborDelta {
    pub added: Vec<NeighborEntry>,
    pub removed: Vec<NeighborEntry>,
}

/// Writer side of the neighbor cache.
pub struct NeighborCache {
    write: WriteHandle<NeighborTable, NeighborChange>,
    hw: Arc<Mutex<HwSwitch>>,
    subscribers: Vec<UnboundedSender<NeighborDelta>>,
}

impl NeighborCache {
    #[must_use]
    pub fn new(hw: Arc<Mutex<HwSwitch>>) -> (Self, NeighborReader) {
        let (mut write, read) =
            left_right::new_from_empty::<NeighborTable, NeighborChange>(NeighborTable::new());
        write.publish();
        (
            Self {
                write,
                hw,
                subscribers: Vec::new(),
            },
            NeighborReader(read),
        )
    }

    /// Subscribe to neighbor-change batches.
    pub fn subscribe(&mut self) -> UnboundedReceiver<NeighborDelta> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, delta: &NeighborDelta) {
        self.subscribers
            .retain(|subscriber| subscriber.send(delta.clone()).is_ok());
    }

    /// A neighbor resolved: publish it, reprogram dependent egresses and
    /// notify subscribers.
    ///
    /// # Errors
    /// Surfaces hardware failures from the egress updates.
    pub fn add_neighbor(&mut self, entry: NeighborEntry) -> Result<(), AgentError> {
        debug!("neighbor {} resolved on ifindex {}", entry.addr, entry.ifindex);
        self.write.append(NeighborChange::Add(entry));
        self.write.publish();
        self.hw
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .neighbor_resolved(entry.addr, entry.ifindex)?;
        self.notify(&NeighborDelta {
            added: vec![entry],
            removed: vec![],
        });
        Ok(())
    }

    /// A neighbor expired or was flushed.
    ///
    /// # Errors
    /// Surfaces hardware failures from the egress updates.
    pub fn del_neighbor(&mut self, addr: IpAddr, ifindex: InterfaceId) -> Result<(), AgentError> {
        let existing = self
            .write
            .enter()
            .and_then(|table| table.get(addr, ifindex).copied());
        let Some(entry) = existing else {
            return Ok(());
        };
        debug!("neighbor {addr} on ifindex {ifindex} went away");
        self.write.append(NeighborChange::Del((addr, ifindex)));
        self.write.publish();
        self.hw
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .neighbor_unresolved(addr, ifindex)?;
        self.notify(&NeighborDelta {
            added: vec![],
            removed: vec![entry],
        });
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::hw::device::SoftSwitch;
    use crate::hw::warmboot::WarmBootCache;

    pub fn test_hw() -> Arc<Mutex<HwSwitch>> {
        Arc::new(Mutex::new(HwSwitch::new(
            Box::new(SoftSwitch::new()),
            WarmBootCache::cold(),
        )))
    }

    fn entry(addr: &str, ifindex: InterfaceId, last: u8) -> NeighborEntry {
        NeighborEntry {
            addr: addr.parse().unwrap(),
            ifindex,
            mac: Mac([0, 0, 0, 0, 0xaa, last]),
        }
    }

    #[test]
    fn test_neighbor_table_basic() {
        let (mut cache, reader) = NeighborCache::new(test_hw());
        cache.add_neighbor(entry("10.0.0.1", 2, 1)).unwrap();
        cache.add_neighbor(entry("10.0.0.5", 3, 5)).unwrap();

        let table = reader.enter().expect("published");
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get("10.0.0.1".parse().unwrap(), 2).unwrap().mac,
            Mac([0, 0, 0, 0, 0xaa, 1])
        );
        drop(table);

        cache.del_neighbor("10.0.0.1".parse().unwrap(), 2).unwrap();
        let table = reader.enter().expect("published");
        assert!(table.get("10.0.0.1".parse().unwrap(), 2).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_subscription_stream() {
        let (mut cache, _reader) = NeighborCache::new(test_hw());
        let mut rx = cache.subscribe();

        let added = entry("10.0.0.1", 2, 1);
        cache.add_neighbor(added).unwrap();
        let delta = rx.try_recv().expect("a delta must be streamed");
        assert_eq!(delta.added, vec![added]);
        assert!(delta.removed.is_empty());

        cache.del_neighbor("10.0.0.1".parse().unwrap(), 2).unwrap();
        let delta = rx.try_recv().expect("a delta must be streamed");
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, vec![added]);

        /* deleting an unknown neighbor streams nothing */
        cache.del_neighbor("192.0.2.9".parse().unwrap(), 2).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
