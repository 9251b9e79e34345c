// SPDX-License-Identifier: Apache-2.0

//! The compile-time component registry.
//!
//! Component kinds map to constructors here; there is no string-keyed
//! dynamic class loading anywhere in the runtime.

use crate::component::Component;
use crate::error::Error;
use crate::latch::Latches;
use crate::stages::{
    AgentStagingOutput, Executing, Launching, Scheduler, StagingInput, UmgrStagingOutput,
    UpdateWorker,
};
use pilotflow_config::{ComponentConfig, ComponentKind};

/// A constructor for one component kind.
pub struct ComponentFactory {
    /// The kind this factory builds.
    pub kind: ComponentKind,
    /// The constructor.
    pub create: fn(ComponentConfig, Latches) -> Result<Box<dyn Component>, Error>,
}

fn create_launching(cfg: ComponentConfig, latches: Latches) -> Result<Box<dyn Component>, Error> {
    Ok(Box::new(Launching::new(cfg, latches)?))
}

fn create_update_worker(
    cfg: ComponentConfig,
    latches: Latches,
) -> Result<Box<dyn Component>, Error> {
    Ok(Box::new(UpdateWorker::new(cfg, latches)?))
}

fn create_umgr_staging_input(
    cfg: ComponentConfig,
    latches: Latches,
) -> Result<Box<dyn Component>, Error> {
    Ok(Box::new(StagingInput::umgr(cfg, latches)?))
}

fn create_agent_staging_input(
    cfg: ComponentConfig,
    latches: Latches,
) -> Result<Box<dyn Component>, Error> {
    Ok(Box::new(StagingInput::agent(cfg, latches)?))
}

fn create_scheduler(cfg: ComponentConfig, latches: Latches) -> Result<Box<dyn Component>, Error> {
    Ok(Box::new(Scheduler::new(cfg, latches)?))
}

fn create_executing(cfg: ComponentConfig, latches: Latches) -> Result<Box<dyn Component>, Error> {
    Ok(Box::new(Executing::new(cfg, latches)?))
}

fn create_agent_staging_output(
    cfg: ComponentConfig,
    latches: Latches,
) -> Result<Box<dyn Component>, Error> {
    Ok(Box::new(AgentStagingOutput::new(cfg, latches)?))
}

fn create_umgr_staging_output(
    cfg: ComponentConfig,
    latches: Latches,
) -> Result<Box<dyn Component>, Error> {
    Ok(Box::new(UmgrStagingOutput::new(cfg, latches)?))
}

/// All known component factories.
pub static FACTORIES: &[ComponentFactory] = &[
    ComponentFactory {
        kind: ComponentKind::Launching,
        create: create_launching,
    },
    ComponentFactory {
        kind: ComponentKind::UpdateWorker,
        create: create_update_worker,
    },
    ComponentFactory {
        kind: ComponentKind::UmgrStagingInput,
        create: create_umgr_staging_input,
    },
    ComponentFactory {
        kind: ComponentKind::AgentStagingInput,
        create: create_agent_staging_input,
    },
    ComponentFactory {
        kind: ComponentKind::Scheduler,
        create: create_scheduler,
    },
    ComponentFactory {
        kind: ComponentKind::Executing,
        create: create_executing,
    },
    ComponentFactory {
        kind: ComponentKind::AgentStagingOutput,
        create: create_agent_staging_output,
    },
    ComponentFactory {
        kind: ComponentKind::UmgrStagingOutput,
        create: create_umgr_staging_output,
    },
];

/// Builds the component instance for a configuration.
pub fn create_component(
    cfg: ComponentConfig,
    latches: Latches,
) -> Result<Box<dyn Component>, Error> {
    let kind = cfg.kind;
    let factory = FACTORIES
        .iter()
        .find(|f| f.kind == kind)
        .ok_or_else(|| Error::Internal {
            details: format!("no factory for component kind `{kind}`"),
        })?;
    (factory.create)(cfg, latches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_factory() {
        for kind in [
            ComponentKind::Launching,
            ComponentKind::UpdateWorker,
            ComponentKind::UmgrStagingInput,
            ComponentKind::AgentStagingInput,
            ComponentKind::Scheduler,
            ComponentKind::Executing,
            ComponentKind::AgentStagingOutput,
            ComponentKind::UmgrStagingOutput,
        ] {
            assert!(FACTORIES.iter().any(|f| f.kind == kind));
        }
    }
}
