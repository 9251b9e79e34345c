// SPDX-License-Identifier: Apache-2.0

//! The metadata store seam.
//!
//! The database of record persisting session and unit metadata is an
//! external collaborator; the runtime only pushes unit documents through
//! this trait. The update worker drives it from the state topic.

use crate::error::Error;
use async_trait::async_trait;
use pilotflow_state::Unit;

/// Receives every observed unit state transition.
#[async_trait]
pub trait MetadataStore: Send {
    /// Persists (or forwards) the unit document after a state change.
    async fn update(&mut self, unit: &Unit) -> Result<(), Error>;
}

/// A store that records nothing. The default when no collaborator is
/// wired in.
#[derive(Debug, Default)]
pub struct NullMetadataStore;

#[async_trait]
impl MetadataStore for NullMetadataStore {
    async fn update(&mut self, unit: &Unit) -> Result<(), Error> {
        tracing::debug!(uid = %unit.uid, state = %unit.state, "state update dropped (no store)");
        Ok(())
    }
}
