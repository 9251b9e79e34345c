// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the runtime core.
//!
//! Important note: It is important not to use `!Send` data types in errors (e.g. avoid using Rc) to
//! ensure these errors can be emitted in both `Send` and `!Send` contexts.

use pilotflow_state::UnitState;

/// Errors that can occur in the supervisor, controller and components.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A wrapper for configuration errors.
    #[error("Configuration error: {0}")]
    Config(#[from] pilotflow_config::error::Error),

    /// A wrapper for fabric errors.
    #[error("Fabric error: {0}")]
    Fabric(#[from] pilotflow_fabric::error::Error),

    /// A wrapper for unit data model errors.
    #[error("State error: {0}")]
    State(#[from] pilotflow_state::error::Error),

    /// A wrapper for telemetry errors.
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] pilotflow_telemetry::error::Error),

    /// An I/O error outside the fabric.
    #[error("I/O error: {details}")]
    Io {
        /// A description of the error that occurred.
        details: String,
    },

    /// A component registered a second input binding.
    #[error("Component {uid} already has an input binding")]
    InputAlreadyRegistered {
        /// The offending component.
        uid: String,
    },

    /// A transition was requested against the canonical order.
    #[error("Backward transition for unit {uid}: {from} -> {to}")]
    BackwardTransition {
        /// The unit involved.
        uid: String,
        /// The current state.
        from: UnitState,
        /// The requested state.
        to: UnitState,
    },

    /// A child failed to signal liveness within the startup timeout.
    #[error("Child {uid} did not signal liveness within {timeout_secs}s")]
    StartupTimeout {
        /// The component or bridge that never came up.
        uid: String,
        /// The budget that lapsed.
        timeout_secs: u64,
    },

    /// A child process or worker could not be spawned.
    #[error("Failed to spawn {uid}: {details}")]
    Spawn {
        /// The component involved.
        uid: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A watched subordinate died.
    #[error("Component {uid} died: {details}")]
    ComponentDied {
        /// The first subordinate observed dead.
        uid: String,
        /// The death reason reported by the watcher.
        details: String,
    },

    /// Heartbeats lapsed; the root is presumed dead.
    #[error("Heartbeat lost; last seen {silent_secs}s ago")]
    HeartbeatLost {
        /// Silence duration when the lapse was detected.
        silent_secs: u64,
    },

    /// A bridge this component depends on went away.
    #[error("Bridge `{name}` was lost")]
    BridgeLost {
        /// The bridge name.
        name: String,
    },

    /// A staging directive failed. This is a unit-level failure; the owning
    /// component advances the unit to FAILED and keeps running.
    #[error("Staging failed for unit {uid}: {details}")]
    Staging {
        /// The unit involved.
        uid: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A worker was cancelled by the supervisor after its join budget.
    #[error("Worker {name} was cancelled")]
    WorkerCancelled {
        /// The worker name.
        name: String,
    },

    /// The in-code fault-injection hook fired.
    #[error("Fault injected at `{tag}`")]
    FaultInjected {
        /// The hook tag.
        tag: String,
    },

    /// An unrecoverable invariant violation.
    #[error("Internal error: {details}")]
    Internal {
        /// A description of the error that occurred.
        details: String,
    },
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io {
            details: e.to_string(),
        }
    }
}
