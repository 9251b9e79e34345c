// SPDX-License-Identifier: Apache-2.0

//! The launching stage: routes freshly submitted units into the pipeline.

use crate::component::{Component, ComponentBase};
use crate::error::Error;
use crate::latch::Latches;
use async_trait::async_trait;
use pilotflow_config::ComponentConfig;
use pilotflow_state::{Unit, UnitState};

/// Pulls units in `NEW` from the ingress queue, assigns their sandboxes,
/// and hands them to client-side input staging.
pub struct Launching {
    base: ComponentBase,
}

impl Launching {
    /// Builds the stage.
    pub fn new(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        Ok(Self {
            base: ComponentBase::new(cfg, latches)?,
        })
    }
}

#[async_trait]
impl Component for Launching {
    fn base(&mut self) -> &mut ComponentBase {
        &mut self.base
    }

    async fn initialize_child(&mut self) -> Result<(), Error> {
        self.base
            .register_input(UnitState::New, "ingress_queue")
            .await?;
        self.base
            .register_output(
                UnitState::UmgrStagingInputPending,
                Some("umgr_staging_input_queue"),
            )
            .await
    }

    async fn work(&mut self, mut units: Vec<Unit>) -> Result<(), Error> {
        let sandbox_root = self.base.cfg().sandbox.join("units");
        for unit in &mut units {
            unit.control = "umgr".to_owned();
            if unit.unit_sandbox.is_none() {
                let name = unit
                    .description
                    .sandbox
                    .clone()
                    .unwrap_or_else(|| unit.uid.clone());
                unit.unit_sandbox = Some(sandbox_root.join(name));
            }
        }
        self.base
            .advance(
                &mut units,
                Some(UnitState::UmgrStagingInputPending),
                true,
                true,
            )
            .await
    }
}
