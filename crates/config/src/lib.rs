// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! PilotFlow runtime configuration.
//!
//! Data Model:
//! - controller configuration
//!   - bridge descriptors (queue / pubsub, with or without addresses)
//!   - component kinds and instance counts
//!   - heartbeat and termination budgets
//! - component configuration: the per-process document a spawned component
//!   receives, with the full bridge address map merged in
//!
//! Addresses become known only after a bridge is started; the controller
//! merges the resulting address map into every component configuration
//! before that component is started.

use pilotflow_state::UnitState;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod bridge;
pub mod component;
pub mod controller;
pub mod error;

pub use bridge::{BridgeAddrs, BridgeConfig, BridgeKind, BridgeLaunchConfig};
pub use component::{ComponentConfig, PilotSlotConfig};
pub use controller::ControllerConfig;

/// The component kinds known to the compile-time registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Pulls freshly submitted units from the ingress queue and routes them
    /// into the pipeline.
    Launching,
    /// Mirrors unit state transitions into the metadata store collaborator.
    UpdateWorker,
    /// Client-side input staging.
    UmgrStagingInput,
    /// Agent-side input staging.
    AgentStagingInput,
    /// Resource allocation.
    Scheduler,
    /// External command execution.
    Executing,
    /// Agent-side output staging.
    AgentStagingOutput,
    /// Client-side output staging and finalization.
    UmgrStagingOutput,
}

impl ComponentKind {
    /// The state whose queue this component pulls from, if it pulls at all.
    ///
    /// `UpdateWorker` is purely subscription-driven and has no input queue.
    #[must_use]
    pub const fn input_state(&self) -> Option<UnitState> {
        match self {
            ComponentKind::Launching => Some(UnitState::New),
            ComponentKind::UpdateWorker => None,
            ComponentKind::UmgrStagingInput => Some(UnitState::UmgrStagingInputPending),
            ComponentKind::AgentStagingInput => Some(UnitState::AgentStagingInputPending),
            ComponentKind::Scheduler => Some(UnitState::AllocatingPending),
            ComponentKind::Executing => Some(UnitState::ExecutingPending),
            ComponentKind::AgentStagingOutput => Some(UnitState::AgentStagingOutputPending),
            ComponentKind::UmgrStagingOutput => Some(UnitState::UmgrStagingOutputPending),
        }
    }

    /// The state this component advances units to on success, if it routes
    /// them onward at all.
    #[must_use]
    pub const fn output_state(&self) -> Option<UnitState> {
        match self {
            ComponentKind::Launching => Some(UnitState::UmgrStagingInputPending),
            ComponentKind::UpdateWorker | ComponentKind::UmgrStagingOutput => None,
            ComponentKind::UmgrStagingInput => Some(UnitState::AllocatingPending),
            ComponentKind::AgentStagingInput | ComponentKind::Scheduler => {
                Some(UnitState::ExecutingPending)
            }
            ComponentKind::Executing => Some(UnitState::AgentStagingOutputPending),
            ComponentKind::AgentStagingOutput => Some(UnitState::UmgrStagingOutputPending),
        }
    }

    /// The label used to build component uids, e.g. `scheduler.0003`.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            ComponentKind::Launching => "launching",
            ComponentKind::UpdateWorker => "update_worker",
            ComponentKind::UmgrStagingInput => "umgr_staging_input",
            ComponentKind::AgentStagingInput => "agent_staging_input",
            ComponentKind::Scheduler => "scheduler",
            ComponentKind::Executing => "executing",
            ComponentKind::AgentStagingOutput => "agent_staging_output",
            ComponentKind::UmgrStagingOutput => "umgr_staging_output",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
