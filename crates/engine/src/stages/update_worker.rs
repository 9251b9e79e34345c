// SPDX-License-Identifier: Apache-2.0

//! The update worker: mirrors state transitions into the metadata store.

use crate::component::{Component, ComponentBase};
use crate::error::Error;
use crate::latch::Latches;
use crate::store::{MetadataStore, NullMetadataStore};
use async_trait::async_trait;
use pilotflow_config::ComponentConfig;
use pilotflow_fabric::Subscriber;
use pilotflow_state::{Unit, STATE_TOPIC};
use std::time::Duration;

/// Subscribes to the state topic and forwards every observed unit document
/// to the metadata store collaborator. Has no input queue; store failures
/// are retried on the next observation of the same unit, never surfaced.
pub struct UpdateWorker {
    base: ComponentBase,
    store: Box<dyn MetadataStore>,
    updates: Option<Subscriber>,
}

impl UpdateWorker {
    /// Builds the worker with the null store.
    pub fn new(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        Ok(Self {
            base: ComponentBase::new(cfg, latches)?,
            store: Box::new(NullMetadataStore),
            updates: None,
        })
    }

    /// Replaces the metadata store collaborator.
    pub fn with_store(mut self, store: Box<dyn MetadataStore>) -> Self {
        self.store = store;
        self
    }
}

#[async_trait]
impl Component for UpdateWorker {
    fn base(&mut self) -> &mut ComponentBase {
        &mut self.base
    }

    async fn initialize_child(&mut self) -> Result<(), Error> {
        self.updates = Some(self.base.register_subscriber(&[STATE_TOPIC]).await?);
        Ok(())
    }

    async fn work(&mut self, _units: Vec<Unit>) -> Result<(), Error> {
        // no input queue; everything arrives through the subscription
        Ok(())
    }

    async fn idle(&mut self) -> Result<(), Error> {
        loop {
            let Some(sub) = self.updates.as_mut() else {
                return Ok(());
            };
            match sub.recv_timeout(Duration::from_millis(10)).await {
                Ok(Some(envelope)) => {
                    let Ok(unit) = serde_json::from_value::<Unit>(envelope.payload) else {
                        continue;
                    };
                    if let Err(e) = self.store.update(&unit).await {
                        tracing::warn!(uid = %unit.uid, error = %e, "metadata update failed");
                    }
                }
                Ok(None) => return Ok(()),
                Err(_) => {
                    return Err(Error::BridgeLost {
                        name: STATE_TOPIC.to_owned(),
                    })
                }
            }
        }
    }
}
