// SPDX-License-Identifier: Apache-2.0

//! Output staging, agent-side and client-side finalization.

use crate::component::{Component, ComponentBase};
use crate::error::Error;
use crate::latch::Latches;
use crate::stages::staging::{apply, LocalStagingBackend, StagingBackend, StagingContext};
use crate::stages::{read_tail, STDIO_TAIL};
use async_trait::async_trait;
use pilotflow_config::ComponentConfig;
use pilotflow_state::{Unit, UnitState};
use std::sync::Arc;

/// Mirrors input staging in reverse: collects the stdio tails, processes
/// the unit's `output_staging` directives, and hands the unit on towards
/// finalization.
///
/// Units whose `target_state` is not `DONE` skip the staging loop but
/// still collect stdio before moving on.
pub struct AgentStagingOutput {
    base: ComponentBase,
    backend: Arc<dyn StagingBackend>,
}

impl AgentStagingOutput {
    /// Builds the stage.
    pub fn new(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        Ok(Self {
            base: ComponentBase::new(cfg, latches)?,
            backend: Arc::new(LocalStagingBackend),
        })
    }

    /// Replaces the transfer backend.
    pub fn with_backend(mut self, backend: Arc<dyn StagingBackend>) -> Self {
        self.backend = backend;
        self
    }

    async fn collect_stdio(&self, unit: &mut Unit) {
        let Some(sandbox) = unit.unit_sandbox.clone() else {
            return;
        };
        unit.stdout = read_tail(
            &sandbox.join(unit.description.stdout_file(&unit.uid)),
            STDIO_TAIL,
        )
        .await;
        unit.stderr = read_tail(
            &sandbox.join(unit.description.stderr_file(&unit.uid)),
            STDIO_TAIL,
        )
        .await;
    }

    async fn stage_unit(&mut self, unit: &Unit) -> Result<(), String> {
        let Some(sandbox) = unit.unit_sandbox.clone() else {
            return Ok(());
        };
        let directives = unit.description.output_staging.clone();
        for directive in &directives {
            if self.base.latches().is_terminated() {
                return Err("shutdown".to_owned());
            }
            let cfg = self.base.cfg();
            let ctx = StagingContext {
                unit_sandbox: &sandbox,
                staging_area: cfg.staging_area.as_deref(),
                scheme: &cfg.staging_scheme,
            };
            apply(directive, &ctx, self.backend.as_ref())
                .await
                .map_err(|e| {
                    format!(
                        "{} {} -> {}: {e}",
                        directive.action, directive.source, directive.target
                    )
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Component for AgentStagingOutput {
    fn base(&mut self) -> &mut ComponentBase {
        &mut self.base
    }

    async fn initialize_child(&mut self) -> Result<(), Error> {
        self.base
            .register_input(
                UnitState::AgentStagingOutputPending,
                "agent_staging_output_queue",
            )
            .await?;
        self.base
            .register_output(
                UnitState::UmgrStagingOutputPending,
                Some("umgr_staging_output_queue"),
            )
            .await
    }

    async fn work(&mut self, mut units: Vec<Unit>) -> Result<(), Error> {
        self.base
            .advance(&mut units, Some(UnitState::AgentStagingOutput), true, false)
            .await?;

        let mut forwarded = Vec::with_capacity(units.len());
        for mut unit in units {
            self.collect_stdio(&mut unit).await;

            if unit.target_state == UnitState::Done {
                if let Err(cause) = self.stage_unit(&unit).await {
                    tracing::warn!(uid = %unit.uid, %cause, "output staging failed");
                    self.base.prof().prof("staging_fail", &unit.uid, "", &cause);
                    unit.annotate_cause(&cause);
                    self.base
                        .advance(
                            std::slice::from_mut(&mut unit),
                            Some(UnitState::Failed),
                            true,
                            false,
                        )
                        .await?;
                    continue;
                }
            }
            forwarded.push(unit);
        }

        self.base
            .advance(
                &mut forwarded,
                Some(UnitState::UmgrStagingOutputPending),
                true,
                true,
            )
            .await
    }
}

/// The last stage: client-side output staging bookkeeping and the final
/// transition to the unit's target state.
pub struct UmgrStagingOutput {
    base: ComponentBase,
}

impl UmgrStagingOutput {
    /// Builds the stage.
    pub fn new(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        Ok(Self {
            base: ComponentBase::new(cfg, latches)?,
        })
    }
}

#[async_trait]
impl Component for UmgrStagingOutput {
    fn base(&mut self) -> &mut ComponentBase {
        &mut self.base
    }

    async fn initialize_child(&mut self) -> Result<(), Error> {
        self.base
            .register_input(
                UnitState::UmgrStagingOutputPending,
                "umgr_staging_output_queue",
            )
            .await?;
        // terminal states are never routed onward
        self.base.register_output(UnitState::Done, None).await
    }

    async fn work(&mut self, mut units: Vec<Unit>) -> Result<(), Error> {
        self.base
            .advance(&mut units, Some(UnitState::UmgrStagingOutput), true, false)
            .await?;

        for mut unit in units {
            let target = if self.base.cancels().take(&unit.uid) {
                UnitState::Canceled
            } else if unit.target_state.is_final() {
                unit.target_state
            } else {
                UnitState::Done
            };
            self.base
                .advance(std::slice::from_mut(&mut unit), Some(target), true, false)
                .await?;
        }
        Ok(())
    }
}
