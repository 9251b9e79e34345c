// SPDX-License-Identifier: Apache-2.0

//! Input staging, client-side and agent-side.

use crate::component::{Component, ComponentBase};
use crate::error::Error;
use crate::fault;
use crate::latch::Latches;
use crate::stages::staging::{apply, LocalStagingBackend, StagingBackend, StagingContext};
use async_trait::async_trait;
use pilotflow_config::ComponentConfig;
use pilotflow_state::{Unit, UnitState};
use std::sync::Arc;

/// Materializes a unit's `input_staging` directives under the unit
/// sandbox, then hands the unit to the next stage. A single failing
/// directive fails the whole unit.
///
/// The client-side and agent-side variants differ only in the states they
/// move between and the queues they bind.
pub struct StagingInput {
    base: ComponentBase,
    backend: Arc<dyn StagingBackend>,
    input_queue: &'static str,
    input_state: UnitState,
    active_state: UnitState,
    next_state: UnitState,
    next_queue: &'static str,
}

impl StagingInput {
    /// The client-side variant: `UMGR_STAGING_INPUT_PENDING` in,
    /// `ALLOCATING_PENDING` out.
    pub fn umgr(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        Ok(Self {
            base: ComponentBase::new(cfg, latches)?,
            backend: Arc::new(LocalStagingBackend),
            input_queue: "umgr_staging_input_queue",
            input_state: UnitState::UmgrStagingInputPending,
            active_state: UnitState::UmgrStagingInput,
            next_state: UnitState::AllocatingPending,
            next_queue: "agent_scheduling_queue",
        })
    }

    /// The agent-side variant: `AGENT_STAGING_INPUT_PENDING` in,
    /// `EXECUTING_PENDING` out.
    pub fn agent(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        Ok(Self {
            base: ComponentBase::new(cfg, latches)?,
            backend: Arc::new(LocalStagingBackend),
            input_queue: "agent_staging_input_queue",
            input_state: UnitState::AgentStagingInputPending,
            active_state: UnitState::AgentStagingInput,
            next_state: UnitState::ExecutingPending,
            next_queue: "agent_executing_queue",
        })
    }

    /// Replaces the transfer backend.
    pub fn with_backend(mut self, backend: Arc<dyn StagingBackend>) -> Self {
        self.backend = backend;
        self
    }

    async fn stage_unit(&mut self, unit: &mut Unit) -> Result<(), String> {
        let sandbox = unit
            .unit_sandbox
            .clone()
            .unwrap_or_else(|| self.base.cfg().sandbox.join("units").join(&unit.uid));
        unit.unit_sandbox = Some(sandbox.clone());
        tokio::fs::create_dir_all(&sandbox)
            .await
            .map_err(|e| format!("sandbox creation failed: {e}"))?;

        let directives = unit.description.input_staging.clone();
        for directive in &directives {
            if self.base.latches().is_terminated() {
                return Err("shutdown".to_owned());
            }
            fault::raise_on("staging_input").map_err(|e| e.to_string())?;

            let cfg = self.base.cfg();
            let ctx = StagingContext {
                unit_sandbox: &sandbox,
                staging_area: cfg.staging_area.as_deref(),
                scheme: &cfg.staging_scheme,
            };
            apply(directive, &ctx, self.backend.as_ref())
                .await
                .map_err(|e| {
                    Error::Staging {
                        uid: unit.uid.clone(),
                        details: format!("{} {} -> {}: {e}", directive.action, directive.source, directive.target),
                    }
                    .to_string()
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Component for StagingInput {
    fn base(&mut self) -> &mut ComponentBase {
        &mut self.base
    }

    async fn initialize_child(&mut self) -> Result<(), Error> {
        self.base
            .register_input(self.input_state, self.input_queue)
            .await?;
        self.base
            .register_output(self.next_state, Some(self.next_queue))
            .await
    }

    async fn work(&mut self, mut units: Vec<Unit>) -> Result<(), Error> {
        let active = self.active_state;
        self.base.advance(&mut units, Some(active), true, false).await?;

        let mut staged = Vec::with_capacity(units.len());
        for mut unit in units {
            if self.base.cancels().take(&unit.uid) {
                self.base
                    .advance(
                        std::slice::from_mut(&mut unit),
                        Some(UnitState::Canceled),
                        true,
                        false,
                    )
                    .await?;
                continue;
            }
            match self.stage_unit(&mut unit).await {
                Ok(()) => staged.push(unit),
                Err(cause) => {
                    tracing::warn!(uid = %unit.uid, %cause, "input staging failed");
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
                }
            }
        }

        let next = self.next_state;
        self.base.advance(&mut staged, Some(next), true, true).await
    }
}
