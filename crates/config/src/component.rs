// SPDX-License-Identifier: Apache-2.0

//! The per-component configuration document.
//!
//! This is what a spawned component process reads on startup: its own
//! identity, the fully resolved bridge address map, and the budgets
//! inherited from the owning controller.

use crate::bridge::BridgeConfig;
use crate::controller::ControllerConfig;
use crate::error::Error;
use crate::ComponentKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One pilot in the scheduler's slot pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotSlotConfig {
    /// Pilot uid.
    pub uid: String,
    /// Cores the pilot offers.
    pub cores: u32,
    /// Sandbox of the pilot, when staging needs it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,
}

/// Configuration handed to one component instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// This component's uid, e.g. `executing.0001`.
    pub uid: String,

    /// The component kind, keyed into the compile-time registry.
    pub kind: ComponentKind,

    /// Identity of the owning controller.
    pub owner: String,

    /// Session id.
    pub session: String,

    /// Bridge descriptors with all addresses resolved.
    pub bridges: BTreeMap<String, BridgeConfig>,

    /// Interval between heartbeats of the heart.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which this component self-terminates.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Hierarchy depth of the owning controller plus one.
    pub depth: u32,

    /// Session sandbox this component works under.
    pub sandbox: PathBuf,

    /// Shared staging area resolved by the staging URL scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_area: Option<PathBuf>,

    /// URL scheme that resolves against the staging area.
    pub staging_scheme: String,

    /// Logging verbosity hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,

    /// Pilot slot pool, used by the scheduler kind only.
    #[serde(default)]
    pub pilots: Vec<PilotSlotConfig>,
}

impl ComponentConfig {
    /// Derives the configuration of one component instance from its owning
    /// controller's configuration and the resolved bridge address map.
    #[must_use]
    pub fn derive(
        controller: &ControllerConfig,
        session: &str,
        sandbox: &Path,
        kind: ComponentKind,
        instance: u32,
        bridges: BTreeMap<String, BridgeConfig>,
    ) -> Self {
        Self {
            uid: format!("{}.{instance:04}", kind.label()),
            kind,
            owner: controller.owner.clone(),
            session: session.to_owned(),
            bridges,
            heartbeat_interval: controller.heartbeat_interval,
            heartbeat_timeout: controller.heartbeat_timeout,
            depth: controller.depth + 1,
            sandbox: sandbox.to_path_buf(),
            staging_area: controller.staging_area.clone(),
            staging_scheme: controller.staging_scheme.clone(),
            debug: controller.debug.clone(),
            pilots: controller.pilots.clone(),
        }
    }

    /// Loads a component configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| Error::Deserialization {
            details: e.to_string(),
        })
    }

    /// Writes this configuration to a JSON file, for exec-on-spawn.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        let text = serde_json::to_string_pretty(self).map_err(|e| Error::Deserialization {
            details: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(|e| Error::FileWrite {
            path: path.display().to_string(),
            details: e.to_string(),
        })
    }

    /// Resolved `(addr_in, addr_out)` of the named bridge.
    pub fn bridge_addrs(&self, name: &str) -> Result<(String, String), Error> {
        let bridge = self.bridges.get(name).ok_or_else(|| Error::MissingBridge {
            name: name.to_owned(),
        })?;
        bridge.addrs(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derive_increments_depth_and_numbers_instances() {
        let controller: ControllerConfig = serde_json::from_str(
            r#"{
                "owner": "pmgr.0000",
                "bridges": {
                    "log_pubsub": {"kind": "pubsub"},
                    "control_pubsub": {"kind": "pubsub"}
                },
                "depth": 1
            }"#,
        )
        .unwrap();

        let cfg = ComponentConfig::derive(
            &controller,
            "session.0001",
            Path::new("/tmp/session.0001"),
            ComponentKind::Executing,
            3,
            BTreeMap::new(),
        );
        assert_eq!(cfg.uid, "executing.0003");
        assert_eq!(cfg.depth, 2);
        assert_eq!(cfg.session, "session.0001");
    }

    #[test]
    fn store_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("component.json");

        let mut bridges = BTreeMap::new();
        let mut control = BridgeConfig::pubsub();
        control.addr_in = Some("127.0.0.1:4000".to_owned());
        control.addr_out = Some("127.0.0.1:4001".to_owned());
        let _ = bridges.insert("control_pubsub".to_owned(), control);

        let cfg = ComponentConfig {
            uid: "scheduler.0000".to_owned(),
            kind: ComponentKind::Scheduler,
            owner: "pmgr.0000".to_owned(),
            session: "session.0002".to_owned(),
            bridges,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            depth: 1,
            sandbox: dir.path().to_path_buf(),
            staging_area: None,
            staging_scheme: "staging".to_owned(),
            debug: None,
            pilots: vec![],
        };
        cfg.store(&path).unwrap();

        let back = ComponentConfig::load(&path).unwrap();
        assert_eq!(back.uid, "scheduler.0000");
        let (addr_in, addr_out) = back.bridge_addrs("control_pubsub").unwrap();
        assert_eq!(addr_in, "127.0.0.1:4000");
        assert_eq!(addr_out, "127.0.0.1:4001");
        assert!(back.bridge_addrs("state_pubsub").is_err());
    }
}
