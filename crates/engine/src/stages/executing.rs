// SPDX-License-Identifier: Apache-2.0

//! The executing stage: launches the external command.

use crate::component::{Component, ComponentBase};
use crate::error::Error;
use crate::fault;
use crate::latch::Latches;
use crate::POLL_INTERVAL;
use async_trait::async_trait;
use pilotflow_config::ComponentConfig;
use pilotflow_state::{Unit, UnitState};
use std::path::PathBuf;
use std::process::Stdio;

/// Pulls units in `EXECUTING_PENDING`, runs the external command with the
/// unit sandbox as working directory and stdio redirected to files, and
/// hands the unit to agent-side output staging with `target_state` set
/// from the exit code.
///
/// Both a pending cancel and the termination latches are observed between
/// wait polls, so a running command is killed within one poll interval.
pub struct Executing {
    base: ComponentBase,
}

enum RunEnd {
    Exited(std::process::ExitStatus),
    Canceled,
    Shutdown,
}

impl Executing {
    /// Builds the stage.
    pub fn new(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        Ok(Self {
            base: ComponentBase::new(cfg, latches)?,
        })
    }

    fn sandbox_of(&self, unit: &Unit) -> PathBuf {
        unit.unit_sandbox
            .clone()
            .unwrap_or_else(|| self.base.cfg().sandbox.join("units").join(&unit.uid))
    }

    async fn run_unit(&mut self, unit: &mut Unit) -> Result<RunEnd, String> {
        fault::raise_on("executing").map_err(|e| e.to_string())?;

        let sandbox = self.sandbox_of(unit);
        tokio::fs::create_dir_all(&sandbox)
            .await
            .map_err(|e| format!("sandbox creation failed: {e}"))?;
        unit.unit_sandbox = Some(sandbox.clone());

        let stdout_path = sandbox.join(unit.description.stdout_file(&unit.uid));
        let stderr_path = sandbox.join(unit.description.stderr_file(&unit.uid));
        let stdout = std::fs::File::create(&stdout_path)
            .map_err(|e| format!("cannot open {}: {e}", stdout_path.display()))?;
        let stderr = std::fs::File::create(&stderr_path)
            .map_err(|e| format!("cannot open {}: {e}", stderr_path.display()))?;

        let mut child = tokio::process::Command::new(&unit.description.executable)
            .args(&unit.description.arguments)
            .envs(&unit.description.environment)
            .current_dir(&sandbox)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("launch of {} failed: {e}", unit.description.executable))?;

        self.base.prof().prof("exec_start", &unit.uid, "", "");
        loop {
            match tokio::time::timeout(POLL_INTERVAL, child.wait()).await {
                Ok(Ok(status)) => return Ok(RunEnd::Exited(status)),
                Ok(Err(e)) => return Err(format!("wait failed: {e}")),
                Err(_) => {
                    if self.base.cancels().take(&unit.uid) {
                        kill_and_reap(&mut child).await;
                        return Ok(RunEnd::Canceled);
                    }
                    if self.base.latches().is_terminated() {
                        kill_and_reap(&mut child).await;
                        return Ok(RunEnd::Shutdown);
                    }
                }
            }
        }
    }
}

async fn kill_and_reap(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "kill failed; process already gone");
    }
    let _ = child.wait().await;
}

#[async_trait]
impl Component for Executing {
    fn base(&mut self) -> &mut ComponentBase {
        &mut self.base
    }

    async fn initialize_child(&mut self) -> Result<(), Error> {
        self.base
            .register_input(UnitState::ExecutingPending, "agent_executing_queue")
            .await?;
        self.base
            .register_output(
                UnitState::AgentStagingOutputPending,
                Some("agent_staging_output_queue"),
            )
            .await
    }

    async fn work(&mut self, units: Vec<Unit>) -> Result<(), Error> {
        for mut unit in units {
            self.base
                .advance(
                    std::slice::from_mut(&mut unit),
                    Some(UnitState::Executing),
                    true,
                    false,
                )
                .await?;

            match self.run_unit(&mut unit).await {
                Ok(RunEnd::Exited(status)) => {
                    self.base.prof().prof(
                        "exec_stop",
                        &unit.uid,
                        "",
                        &status.code().map_or_else(String::new, |c| c.to_string()),
                    );
                    unit.exit_code = status.code();
                    unit.target_state = if status.success() {
                        UnitState::Done
                    } else {
                        UnitState::Failed
                    };
                    self.base
                        .advance(
                            std::slice::from_mut(&mut unit),
                            Some(UnitState::AgentStagingOutputPending),
                            true,
                            true,
                        )
                        .await?;
                }
                Ok(RunEnd::Canceled) => {
                    self.base
                        .advance(
                            std::slice::from_mut(&mut unit),
                            Some(UnitState::Canceled),
                            true,
                            false,
                        )
                        .await?;
                }
                Ok(RunEnd::Shutdown) => {
                    unit.annotate_cause("shutdown");
                    self.base
                        .advance(
                            std::slice::from_mut(&mut unit),
                            Some(UnitState::Failed),
                            true,
                            false,
                        )
                        .await?;
                }
                Err(cause) => {
                    tracing::warn!(uid = %unit.uid, %cause, "execution failed");
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
        Ok(())
    }
}
