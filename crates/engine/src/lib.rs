// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! The pilot-job runtime core.
//!
//! The runtime is a tree of components. Each component is an independently
//! scheduled unit of execution running a main loop, one watcher observing
//! its peers, and zero or more workers performing stage-specific work.
//! Components communicate only through the message fabric.
//!
//! This crate hosts the three tightly coupled concerns:
//!
//! - the [`supervisor`]: spawn processes and workers, watch them, and
//!   guarantee the termination cascade;
//! - the [`controller`]: bridge and component bring-up, heartbeats, and
//!   cascaded shutdown;
//! - the [`component`] base and the [`stages`] built on it: pull units
//!   from an input queue, advance them through the canonical state machine,
//!   perform the stage's side effect, and push to the next stage.
//!
//! Termination is cooperative throughout: every blocking primitive has a
//! bounded-timeout variant, and every loop observes the termination latches
//! at least once per second. No scheduling unit is detached; every worker
//! is explicitly joined.

pub mod component;
pub mod controller;
pub mod error;
pub mod fault;
pub mod heartbeat;
pub mod latch;
pub mod registry;
pub mod stages;
pub mod store;
pub mod supervisor;

pub use component::{CancelSet, Component, ComponentBase, ComponentState};
pub use controller::{Controller, Outcome, ShutdownReport, SpawnMode};
pub use error::Error;
pub use heartbeat::HeartbeatMonitor;
pub use latch::Latches;
pub use supervisor::Supervisor;

/// Cadence at which watchers poll the liveness of their peers.
pub const WATCH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Upper bound on the time between latch checks in any component loop.
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);
