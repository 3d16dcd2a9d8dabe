// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Module that implements Display for routing objects

use std::fmt::Display;

use crate::agent::AgentStatus;
use crate::rib::updater::UpdateStatistics;
use crate::state::fib::{FibRoute, LabelFibEntry, VrfRouteTable};

impl Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Starting => write!(f, "STARTING"),
            AgentStatus::Alive => write!(f, "ALIVE"),
            AgentStatus::Stopping => write!(f, "STOPPING"),
        }
    }
}

impl Display for UpdateStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "v4: +{} -{}  v6: +{} -{}  ({} us)",
            self.v4_added,
            self.v4_deleted,
            self.v6_added,
            self.v6_deleted,
            self.duration.as_micros()
        )
    }
}

impl Display for FibRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.prefix, self.forward)?;
        for (client, entry) in &self.entries {
            write!(f, "\n    [{client}] {entry}")?;
        }
        Ok(())
    }
}

impl Display for LabelFibEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "label {} {}", self.label, self.forward)
    }
}

impl Display for VrfRouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "VRF {} ({}): {} routes", self.name, self.id, self.len())?;
        for route in self.routes() {
            writeln!(f, "  {route}")?;
        }
        Ok(())
    }
}
