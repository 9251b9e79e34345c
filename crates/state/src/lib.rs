// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! Unit data model and wire contract.
//!
//! Data Model:
//! - unit
//!   - description (command line, staging directives, stdio redirection)
//!   - state drawn from the canonical ordered state set
//!   - sandboxes, stdio tails, extension map
//!
//! Everything in this crate is part of the wire contract: units travel the
//! message fabric as JSON documents, control messages travel the `control`
//! topic as `{cmd, arg}` pairs, and state transitions travel the `state`
//! topic as the full unit document.

use serde::{Deserialize, Serialize};

pub mod control;
pub mod error;
pub mod staging;
pub mod states;
pub mod unit;

pub use control::ControlMsg;
pub use staging::{StagingAction, StagingDirective, StagingFlags};
pub use states::UnitState;
pub use unit::{Unit, UnitDescription};

/// Name of the pub/sub bridge carrying log records.
pub const LOG_PUBSUB: &str = "log_pubsub";

/// Name of the pub/sub bridge carrying control messages.
pub const CONTROL_PUBSUB: &str = "control_pubsub";

/// Name of the pub/sub bridge carrying unit state transitions.
pub const STATE_PUBSUB: &str = "state_pubsub";

/// Topic on which control messages are exchanged.
pub const CONTROL_TOPIC: &str = "control";

/// Topic on which unit state transitions are published.
pub const STATE_TOPIC: &str = "state";

/// Topic on which log records are published.
pub const LOG_TOPIC: &str = "log";

/// The `shutdown` control message target addressing every component.
pub const TARGET_ALL: &str = "all";

/// An envelope for messages published on a pub/sub bridge.
///
/// Publishers wrap their payload with the topic name; the bridge forwards
/// the whole envelope to every subscriber registered for that topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The topic this message belongs to.
    pub topic: String,
    /// The message payload.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wraps a serializable payload for the given topic.
    pub fn new<T: Serialize>(topic: &str, payload: &T) -> Result<Self, error::Error> {
        Ok(Self {
            topic: topic.to_owned(),
            payload: serde_json::to_value(payload).map_err(|e| error::Error::Serialization {
                details: e.to_string(),
            })?,
        })
    }
}
