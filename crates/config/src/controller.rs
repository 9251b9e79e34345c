// SPDX-License-Identifier: Apache-2.0

//! The controller configuration contract.

use crate::bridge::{BridgeConfig, BridgeKind};
use crate::error::Error;
use crate::ComponentKind;
use pilotflow_state::{CONTROL_PUBSUB, LOG_PUBSUB, STATE_PUBSUB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration consumed by a controller: which bridges to start or join,
/// which components to bring up, and the heartbeat/termination budgets for
/// the owned subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Identity used to tag profile and log output.
    pub owner: String,

    /// Session id; generated at startup when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    /// Bridge descriptors by name. `log_pubsub` and `control_pubsub` must
    /// be present; entries without addresses are started by the controller.
    pub bridges: BTreeMap<String, BridgeConfig>,

    /// Identity of the heartbeat emitter. When absent and this controller
    /// starts the control bridge, the controller becomes the heart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart: Option<String>,

    /// Interval between heartbeats.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Silence after which a component assumes root death.
    #[serde(with = "humantime_serde", default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: Duration,

    /// How long a spawned child may take to signal liveness.
    #[serde(with = "humantime_serde", default = "default_startup_timeout")]
    pub startup_timeout: Duration,

    /// Component kinds and their instance counts.
    #[serde(default)]
    pub components: BTreeMap<ComponentKind, u32>,

    /// Position of this controller in the process hierarchy; the root is 0.
    /// Termination budgets are divided by `depth + 1`.
    #[serde(default)]
    pub depth: u32,

    /// Logging verbosity hint, an `EnvFilter` directive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,

    /// Session sandbox; defaults to `./<session>` under the working
    /// directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,

    /// Shared staging area resolved by the `staging:` URL scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_area: Option<PathBuf>,

    /// URL scheme that resolves against the staging area.
    #[serde(default = "default_staging_scheme")]
    pub staging_scheme: String,

    /// The pilot slot pool the scheduler allocates from. When empty the
    /// scheduler falls back to a single local pilot.
    #[serde(default)]
    pub pilots: Vec<crate::component::PilotSlotConfig>,
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_startup_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_staging_scheme() -> String {
    "staging".to_owned()
}

impl ControllerConfig {
    /// Loads and validates a controller configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        let mut cfg: Self =
            serde_json::from_str(&text).map_err(|e| Error::Deserialization {
                details: e.to_string(),
            })?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fills in the bridge entries the configured components imply: the
    /// state pubsub and one queue per component input state.
    pub fn normalize(&mut self) {
        let _ = self
            .bridges
            .entry(STATE_PUBSUB.to_owned())
            .or_insert_with(BridgeConfig::pubsub);
        for kind in self.components.keys() {
            for state in [kind.input_state(), kind.output_state()] {
                if let Some(queue) = state.and_then(|s| s.input_queue()) {
                    let _ = self
                        .bridges
                        .entry(queue.to_owned())
                        .or_insert_with(BridgeConfig::queue);
                }
            }
        }
    }

    /// Checks the structural invariants of the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.owner.is_empty() {
            return Err(Error::InvalidConfiguration {
                details: "`owner` must not be empty".to_owned(),
            });
        }
        for required in [LOG_PUBSUB, CONTROL_PUBSUB] {
            match self.bridges.get(required) {
                None => {
                    return Err(Error::MissingBridge {
                        name: required.to_owned(),
                    });
                }
                Some(bridge) if bridge.kind != BridgeKind::Pubsub => {
                    return Err(Error::InvalidConfiguration {
                        details: format!("bridge `{required}` must be a pubsub bridge"),
                    });
                }
                Some(_) => {}
            }
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(Error::InvalidConfiguration {
                details: "`heartbeat_timeout` must not be smaller than `heartbeat_interval`"
                    .to_owned(),
            });
        }
        Ok(())
    }

    /// `true` if this controller is responsible for starting the named
    /// bridge (the entry exists and has no addresses yet).
    #[must_use]
    pub fn starts_bridge(&self, name: &str) -> bool {
        self.bridges
            .get(name)
            .is_some_and(|bridge| !bridge.is_external())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal() -> ControllerConfig {
        serde_json::from_str(
            r#"{
                "owner": "pmgr.0000",
                "bridges": {
                    "log_pubsub": {"kind": "pubsub"},
                    "control_pubsub": {"kind": "pubsub"}
                },
                "components": {"scheduler": 1, "executing": 2}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply() {
        let cfg = minimal();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(cfg.startup_timeout, Duration::from_secs(60));
        assert_eq!(cfg.staging_scheme, "staging");
        assert_eq!(cfg.depth, 0);
    }

    #[test]
    fn normalize_adds_implied_bridges() {
        let mut cfg = minimal();
        cfg.normalize();
        assert!(cfg.bridges.contains_key(STATE_PUBSUB));
        assert!(cfg.bridges.contains_key("agent_scheduling_queue"));
        assert!(cfg.bridges.contains_key("agent_executing_queue"));
        assert!(cfg.starts_bridge("agent_scheduling_queue"));
    }

    #[test]
    fn control_bridge_is_required() {
        let mut cfg = minimal();
        let _ = cfg.bridges.remove(CONTROL_PUBSUB);
        assert!(matches!(
            cfg.validate(),
            Err(Error::MissingBridge { name }) if name == CONTROL_PUBSUB
        ));
    }

    #[test]
    fn external_bridge_is_not_restarted() {
        let mut cfg = minimal();
        if let Some(bridge) = cfg.bridges.get_mut(CONTROL_PUBSUB) {
            bridge.addr_in = Some("192.0.2.1:5000".to_owned());
            bridge.addr_out = Some("192.0.2.1:5001".to_owned());
        }
        assert!(!cfg.starts_bridge(CONTROL_PUBSUB));
        assert!(cfg.starts_bridge(LOG_PUBSUB));
    }
}
