// SPDX-License-Identifier: Apache-2.0

//! The unit document: the work item flowing through the pipeline.

use crate::staging::StagingDirective;
use crate::states::UnitState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// What to run, and which files to move before and after.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitDescription {
    /// The executable to launch.
    pub executable: String,

    /// Arguments passed to the executable.
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Environment entries set for the executable.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Cores requested from the scheduler (default 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,

    /// File operations performed before execution.
    #[serde(default)]
    pub input_staging: Vec<StagingDirective>,

    /// File operations performed after execution.
    #[serde(default)]
    pub output_staging: Vec<StagingDirective>,

    /// File name for stdout redirection, relative to the unit sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// File name for stderr redirection, relative to the unit sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    /// Sandbox hint: a directory name to use instead of the uid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

impl UnitDescription {
    /// Cores requested, defaulting to one.
    #[must_use]
    pub fn cores(&self) -> u32 {
        self.cores.unwrap_or(1).max(1)
    }

    /// Stdout file name, defaulting to `<uid>.out`.
    #[must_use]
    pub fn stdout_file(&self, uid: &str) -> String {
        self.stdout.clone().unwrap_or_else(|| format!("{uid}.out"))
    }

    /// Stderr file name, defaulting to `<uid>.err`.
    #[must_use]
    pub fn stderr_file(&self, uid: &str) -> String {
        self.stderr.clone().unwrap_or_else(|| format!("{uid}.err"))
    }
}

/// The work item.
///
/// A unit is owned by exactly one component at a time; ownership transfers
/// by enqueueing to the next stage's input queue, after the state publish.
/// The pusher must not mutate the document after the push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    /// Unique identifier, assigned at submission.
    pub uid: String,

    /// What to run.
    pub description: UnitDescription,

    /// Current position in the canonical state order.
    #[serde(default = "default_state")]
    pub state: UnitState,

    /// The desired terminal state, typically `DONE`.
    #[serde(default = "default_target_state")]
    pub target_state: UnitState,

    /// Tag naming the next owner of the unit.
    #[serde(default)]
    pub control: String,

    /// Working directory of the unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_sandbox: Option<PathBuf>,

    /// Sandbox of the pilot hosting the unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pilot_sandbox: Option<PathBuf>,

    /// Sandbox of the resource hosting the pilot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_sandbox: Option<PathBuf>,

    /// Captured tail of the unit's stdout.
    #[serde(default)]
    pub stdout: String,

    /// Captured tail of the unit's stderr.
    #[serde(default)]
    pub stderr: String,

    /// Exit code of the external command, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Backend-specific annotations (e.g. the scheduler's allocation).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extension: serde_json::Map<String, serde_json::Value>,
}

const fn default_state() -> UnitState {
    UnitState::New
}

const fn default_target_state() -> UnitState {
    UnitState::Done
}

impl Unit {
    /// Creates a new unit in state `NEW` with target `DONE`.
    #[must_use]
    pub fn new(uid: impl Into<String>, description: UnitDescription) -> Self {
        Self {
            uid: uid.into(),
            description,
            state: UnitState::New,
            target_state: UnitState::Done,
            control: String::new(),
            unit_sandbox: None,
            pilot_sandbox: None,
            resource_sandbox: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            extension: serde_json::Map::new(),
        }
    }

    /// Records a failure cause in the extension map.
    pub fn annotate_cause(&mut self, cause: &str) {
        let _ = self.extension.insert(
            "cause".to_owned(),
            serde_json::Value::String(cause.to_owned()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_document_deserializes() {
        let unit: Unit = serde_json::from_str(
            r#"{
                "uid": "unit.000000",
                "description": {"executable": "/bin/echo", "arguments": ["hi"]}
            }"#,
        )
        .unwrap();
        assert_eq!(unit.state, UnitState::New);
        assert_eq!(unit.target_state, UnitState::Done);
        assert_eq!(unit.description.cores(), 1);
        assert_eq!(unit.description.stdout_file(&unit.uid), "unit.000000.out");
    }

    #[test]
    fn extension_survives_round_trip() {
        let mut unit = Unit::new("unit.000001", UnitDescription::default());
        unit.annotate_cause("shutdown");
        let json = serde_json::to_string(&unit).unwrap();
        let back: Unit = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.extension.get("cause").and_then(|v| v.as_str()),
            Some("shutdown")
        );
    }
}
