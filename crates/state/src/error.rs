// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the unit data model.
//!
//! Important note: It is important not to use `!Send` data types in errors (e.g. avoid using Rc) to
//! ensure these errors can be emitted in both `Send` and `!Send` contexts.

use crate::states::UnitState;

/// Errors that can occur while handling unit documents and wire messages.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A state string did not name a known unit state.
    #[error("Unknown unit state: {state}")]
    UnknownState {
        /// The offending state string.
        state: String,
    },

    /// A transition was requested against the canonical state order.
    #[error("Backward transition for unit {uid}: {from} -> {to}")]
    BackwardTransition {
        /// The unit the transition was requested for.
        uid: String,
        /// The state the unit is currently in.
        from: UnitState,
        /// The requested target state.
        to: UnitState,
    },

    /// A message could not be serialized.
    #[error("Serialization error: {details}")]
    Serialization {
        /// A description of the error that occurred.
        details: String,
    },

    /// A message could not be deserialized.
    #[error("Deserialization error: {details}")]
    Deserialization {
        /// A description of the error that occurred.
        details: String,
    },
}
