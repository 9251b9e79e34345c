// SPDX-License-Identifier: Apache-2.0

//! Bridge descriptors.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The two bridge kinds of the message fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeKind {
    /// Point-to-fan-in channel: many producers, one consumer per pull.
    Queue,
    /// Fan-out topic: every subscriber receives every message.
    Pubsub,
}

/// Descriptor for one bridge.
///
/// An entry with both addresses present describes an external bridge the
/// controller merely connects to; an entry without addresses instructs the
/// controller to start the bridge itself and fill the addresses in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Queue or pubsub.
    pub kind: BridgeKind,

    /// Ingress address, `host:port`, known once the bridge is started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr_in: Option<String>,

    /// Egress address, `host:port`, known once the bridge is started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr_out: Option<String>,

    /// Buffer bound for queue bridges.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Drop-oldest instead of blocking producers when the buffer is full.
    #[serde(default)]
    pub lossy: bool,
}

const fn default_capacity() -> usize {
    1024
}

impl BridgeConfig {
    /// A queue bridge descriptor to be started by the controller.
    #[must_use]
    pub fn queue() -> Self {
        Self {
            kind: BridgeKind::Queue,
            addr_in: None,
            addr_out: None,
            capacity: default_capacity(),
            lossy: false,
        }
    }

    /// A pubsub bridge descriptor to be started by the controller.
    #[must_use]
    pub fn pubsub() -> Self {
        Self {
            kind: BridgeKind::Pubsub,
            addr_in: None,
            addr_out: None,
            capacity: default_capacity(),
            lossy: false,
        }
    }

    /// `true` when both endpoints are already known, i.e. the bridge is
    /// operated elsewhere and must not be started here.
    #[must_use]
    pub const fn is_external(&self) -> bool {
        self.addr_in.is_some() && self.addr_out.is_some()
    }

    /// Both addresses, or an error naming the bridge if unresolved.
    pub fn addrs(&self, name: &str) -> Result<(String, String), Error> {
        match (&self.addr_in, &self.addr_out) {
            (Some(addr_in), Some(addr_out)) => Ok((addr_in.clone(), addr_out.clone())),
            _ => Err(Error::MissingAddress {
                name: name.to_owned(),
            }),
        }
    }
}

/// The document a bridge child process reads on startup: the descriptor
/// plus the bridge name, for exec-on-spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeLaunchConfig {
    /// The bridge name.
    pub name: String,

    /// Queue or pubsub.
    pub kind: BridgeKind,

    /// Buffer bound for queue bridges.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Drop-oldest instead of blocking producers when the buffer is full.
    #[serde(default)]
    pub lossy: bool,
}

impl BridgeLaunchConfig {
    /// Builds the launch document for one controller-started bridge.
    #[must_use]
    pub fn derive(name: &str, bridge: &BridgeConfig) -> Self {
        Self {
            name: name.to_owned(),
            kind: bridge.kind,
            capacity: bridge.capacity,
            lossy: bridge.lossy,
        }
    }

    /// Loads a bridge launch document from a JSON file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| Error::Deserialization {
            details: e.to_string(),
        })
    }

    /// Writes this document to a JSON file, for exec-on-spawn.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        let text = serde_json::to_string_pretty(self).map_err(|e| Error::Deserialization {
            details: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(|e| Error::FileWrite {
            path: path.display().to_string(),
            details: e.to_string(),
        })
    }
}

/// The address pair a started bridge advertises to its spawner, one JSON
/// line on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeAddrs {
    /// Ingress address, `host:port`.
    pub addr_in: String,
    /// Egress address, `host:port`.
    pub addr_out: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn launch_document_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_scheduling_queue.bridge.json");

        let mut entry = BridgeConfig::queue();
        entry.capacity = 64;
        entry.lossy = true;
        let launch = BridgeLaunchConfig::derive("agent_scheduling_queue", &entry);
        launch.store(&path).unwrap();

        let back = BridgeLaunchConfig::load(&path).unwrap();
        assert_eq!(back.name, "agent_scheduling_queue");
        assert_eq!(back.kind, BridgeKind::Queue);
        assert_eq!(back.capacity, 64);
        assert!(back.lossy);
    }

    #[test]
    fn advertisement_is_one_json_object() {
        let addrs = BridgeAddrs {
            addr_in: "192.0.2.1:5000".to_owned(),
            addr_out: "192.0.2.1:5001".to_owned(),
        };
        let line = serde_json::to_string(&addrs).unwrap();
        assert!(!line.contains('\n'));
        let back: BridgeAddrs = serde_json::from_str(&line).unwrap();
        assert_eq!(back.addr_out, "192.0.2.1:5001");
    }
}
