// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The serialized state-update pipeline. Every mutation of the switch
//! state is a pure `Snapshot -> Option<Snapshot>` transform; one dedicated
//! thread applies them in order, validates, pushes the diff through the
//! hardware manager and, on success, publishes the new applied snapshot.
//! Readers load the applied snapshot lock-free.

use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use left_right::{Absorb, ReadHandleFactory, WriteHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::errors::AgentError;
use crate::hw::HwSwitch;
use crate::state::diff::compute_delta;
use crate::state::{SwitchState, is_valid_state_update};

/// A pure snapshot transformation. Returning `None` means "no change".
pub type StateTransform = Box<dyn FnOnce(&SwitchState) -> Option<SwitchState> + Send>;

#[derive(Clone, Default)]
struct Applied(Arc<SwitchState>);

enum AppliedChange {
    Set(Arc<SwitchState>),
}

impl Absorb<AppliedChange> for Applied {
    fn absorb_first(&mut self, change: &mut AppliedChange, _: &Self) {
        match change {
            AppliedChange::Set(state) => self.0 = Arc::clone(state),
        }
    }
    fn drop_first(self: Box<Self>) {}
    fn sync_with(&mut self, first: &Self) {
        *self = first.clone();
    }
}

/// Lock-free access to the applied snapshot.
#[derive(Clone)]
pub struct StateReader(ReadHandleFactory<Applied>);

impl StateReader {
    /// Load the currently applied snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<SwitchState> {
        self.0
            .handle()
            .enter()
            .map(|guard| Arc::clone(&guard.0))
            .unwrap_or_default()
    }
}

struct StateUpdateRequest {
    name: String,
    transform: StateTransform,
    reply: Option<oneshot::Sender<Result<(), AgentError>>>,
}

enum PipelineMsg {
    Update(StateUpdateRequest),
    Stop,
}

/// Handle to the single state-update thread.
pub struct StateUpdater {
    tx: Sender<PipelineMsg>,
    handle: Option<JoinHandle<()>>,
}

impl StateUpdater {
    /// Spawn the update thread with an initial snapshot, immediately
    /// published as applied.
    ///
    /// # Errors
    /// Fails if the thread cannot be spawned.
    pub fn new(
        initial: SwitchState,
        hw: Arc<Mutex<HwSwitch>>,
    ) -> Result<(StateUpdater, StateReader), AgentError> {
        let (write, read) =
            left_right::new_from_empty::<Applied, AppliedChange>(Applied(Arc::new(initial.clone())));
        let reader = StateReader(read.factory());

        let (tx, rx) = channel();
        let handle = std::thread::Builder::new()
            .name("state-update".to_string())
            .spawn(move || update_loop(&rx, write, &hw, Arc::new(initial)))
            .map_err(|_| AgentError::Internal("failed to spawn state-update thread"))?;

        Ok((
            StateUpdater {
                tx,
                handle: Some(handle),
            },
            reader,
        ))
    }

    /// Enqueue a transform and wait until it is applied (or fails). The
    /// caller must not hold the RIB lock.
    ///
    /// # Errors
    /// Surfaces validation and hardware failures from the apply.
    pub fn update_blocking(&self, name: &str, transform: StateTransform) -> Result<(), AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PipelineMsg::Update(StateUpdateRequest {
                name: name.to_string(),
                transform,
                reply: Some(reply_tx),
            }))
            .map_err(|_| AgentError::Internal("state-update queue is closed"))?;
        reply_rx
            .blocking_recv()
            .map_err(|_| AgentError::Internal("state-update thread went away"))?
    }

    /// Enqueue a transform without waiting for the apply.
    ///
    /// # Errors
    /// Fails only if the pipeline is shut down.
    pub fn update(&self, name: &str, transform: StateTransform) -> Result<(), AgentError> {
        self.tx
            .send(PipelineMsg::Update(StateUpdateRequest {
                name: name.to_string(),
                transform,
                reply: None,
            }))
            .map_err(|_| AgentError::Internal("state-update queue is closed"))
    }

    /// Stop the update thread, draining already-enqueued updates first.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(PipelineMsg::Stop);
            if handle.join().is_err() {
                error!("state-update thread panicked");
            }
        }
    }
}

impl Drop for StateUpdater {
    fn drop(&mut self) {
        self.stop();
    }
}

fn update_loop(
    rx: &Receiver<PipelineMsg>,
    mut write: WriteHandle<Applied, AppliedChange>,
    hw: &Arc<Mutex<HwSwitch>>,
    mut applied: Arc<SwitchState>,
) {
    write.append(AppliedChange::Set(Arc::clone(&applied)));
    write.publish();

    while let Ok(msg) = rx.recv() {
        match msg {
            PipelineMsg::Stop => break,
            PipelineMsg::Update(request) => {
                let name = request.name;
                let result = apply_one(&mut write, hw, &mut applied, request.transform);
                if let Err(e) = &result {
                    warn!("state update '{name}' failed: {e}");
                } else {
                    debug!("state update '{name}' applied");
                }
                if let Some(reply) = request.reply {
                    /* the waiter may have detached; that does not abort the update */
                    let _ = reply.send(result);
                }
            }
        }
    }
    debug!("state-update thread exiting");
}

fn apply_one(
    write: &mut WriteHandle<Applied, AppliedChange>,
    hw: &Arc<Mutex<HwSwitch>>,
    applied: &mut Arc<SwitchState>,
    transform: StateTransform,
) -> Result<(), AgentError> {
    let Some(candidate) = transform(applied) else {
        return Ok(());
    };
    is_valid_state_update(applied, &candidate)?;
    let next = Arc::new(candidate);

    let delta = compute_delta(applied, &next);
    if !delta.is_empty() {
        let mut hw = hw.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        /* on failure the applied pointer is not advanced */
        hw.apply_delta(&delta)?;
    }

    write.append(AppliedChange::Set(Arc::clone(&next)));
    write.publish();
    *applied = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::device::SoftSwitch;
    use crate::hw::warmboot::WarmBootCache;
    use crate::nexthop::{NextHop, NextHopEntry};
    use crate::state::fib::{FibRoute, RouteTables, VrfRouteTable};
    use crate::types::AdminDistance;
    use lpm::prefix::Prefix;
    use std::collections::BTreeMap;

    fn new_pipeline(device: SoftSwitch) -> (StateUpdater, StateReader) {
        let hw = Arc::new(Mutex::new(HwSwitch::new(
            Box::new(device),
            WarmBootCache::cold(),
        )));
        StateUpdater::new(SwitchState::default(), hw).expect("pipeline must start")
    }

    fn route_tables_with(route: FibRoute) -> RouteTables {
        let mut table = VrfRouteTable::new(0, "default");
        table.v4.insert(route.prefix, Arc::new(route));
        let mut tables = RouteTables::default();
        tables.tables.insert(0, Arc::new(table));
        tables
    }

    fn drop_route(prefix: (&str, u8)) -> FibRoute {
        let prefix = Prefix::expect_from(prefix);
        FibRoute {
            prefix,
            entries: BTreeMap::new(),
            forward: NextHopEntry::drop(AdminDistance::STATIC_ROUTE),
        }
    }

    #[test]
    fn test_blocking_update_publishes() {
        let device = SoftSwitch::new();
        let (updater, reader) = new_pipeline(device.clone());

        let tables = route_tables_with(drop_route(("10.0.0.0", 8)));
        updater
            .update_blocking(
                "add drop route",
                Box::new(move |state| Some(state.with_route_tables(tables.clone()))),
            )
            .expect("update must apply");

        let snapshot = reader.snapshot();
        assert_eq!(snapshot.route_tables.tables[&0].v4.len(), 1);
        assert_eq!(device.route_count(), 1);
    }

    #[test]
    fn test_no_change_transform() {
        let device = SoftSwitch::new();
        let (updater, reader) = new_pipeline(device.clone());
        let before = reader.snapshot();

        updater
            .update_blocking("noop", Box::new(|_| None))
            .expect("noop must succeed");

        assert!(Arc::ptr_eq(&before, &reader.snapshot()));
        assert_eq!(device.write_ops(), 0);
    }

    #[test]
    fn test_invalid_candidate_is_rejected() {
        let device = SoftSwitch::new();
        let (updater, reader) = new_pipeline(device.clone());
        let before = reader.snapshot();

        let mut bad = drop_route(("10.0.0.0", 8));
        bad.forward = NextHopEntry::forward(
            AdminDistance::EBGP,
            [NextHop::recursive("1.2.3.4".parse().unwrap())],
        );
        let tables = route_tables_with(bad);
        let err = updater
            .update_blocking(
                "bad update",
                Box::new(move |state| Some(state.with_route_tables(tables.clone()))),
            )
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidStateTransition(_)));
        assert!(Arc::ptr_eq(&before, &reader.snapshot()));
        assert_eq!(device.write_ops(), 0);
    }

    #[test]
    fn test_hw_failure_keeps_applied_pointer() {
        let device = SoftSwitch::new();
        let (updater, reader) = new_pipeline(device.clone());
        let before = reader.snapshot();

        device.fail_next_writes(1);
        let tables = route_tables_with(drop_route(("10.0.0.0", 8)));
        let err = updater
            .update_blocking(
                "failing update",
                Box::new(move |state| Some(state.with_route_tables(tables.clone()))),
            )
            .unwrap_err();
        assert!(matches!(err, AgentError::HwProgrammingFailed(_)));
        assert!(Arc::ptr_eq(&before, &reader.snapshot()));
        assert_eq!(device.route_count(), 0);
    }

    #[test]
    fn test_updates_are_serialized_in_order() {
        let device = SoftSwitch::new();
        let (updater, reader) = new_pipeline(device);

        for i in 1..=3u8 {
            let tables = route_tables_with(drop_route((&format!("10.{i}.0.0"), 16)));
            updater
                .update(
                    "fire-and-forget",
                    Box::new(move |state| Some(state.with_route_tables(tables.clone()))),
                )
                .expect("enqueue must succeed");
        }
        /* a blocking update behind them observes all three applied */
        updater
            .update_blocking("barrier", Box::new(|_| None))
            .expect("barrier must succeed");

        let snapshot = reader.snapshot();
        let table = &snapshot.route_tables.tables[&0];
        assert_eq!(table.v4.len(), 1);
        assert!(table.v4.contains_key(&Prefix::expect_from(("10.3.0.0", 16))));
    }
}
