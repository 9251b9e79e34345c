// SPDX-License-Identifier: Apache-2.0

//! Control messages exchanged on the `control` topic.
//!
//! Every message is a JSON `{cmd, arg}` pair. The recognized commands and
//! their argument shapes are fixed; unknown commands are rejected at
//! deserialization time so that a misbehaving publisher is caught early.

use serde::{Deserialize, Serialize};

/// A `{cmd, arg}` pair on the `control` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "arg", rename_all = "snake_case")]
pub enum ControlMsg {
    /// A component signals that it came up and connected to the fabric.
    Alive {
        /// The component's uid.
        sender: String,
    },

    /// A component signals that it is about to exit.
    Final {
        /// The component's uid.
        sender: String,
        /// The failure cause, if the exit is not a normal one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },

    /// The heart signals liveness of the runtime tree root.
    Heartbeat {
        /// Identity of the heartbeat emitter.
        sender: String,
    },

    /// Request cancellation of one unit, wherever it currently is.
    CancelUnit {
        /// The uid of the unit to cancel.
        uid: String,
    },

    /// Request termination of one component, or of all of them.
    Shutdown {
        /// A component uid, or [`crate::TARGET_ALL`].
        target: String,
    },
}

impl ControlMsg {
    /// Returns `true` if this message asks `uid` (or everybody) to shut down.
    #[must_use]
    pub fn is_shutdown_for(&self, uid: &str) -> bool {
        match self {
            ControlMsg::Shutdown { target } => target == uid || target == crate::TARGET_ALL,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_shape_is_cmd_arg() {
        let msg = ControlMsg::Heartbeat {
            sender: "controller.0000".to_owned(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"cmd": "heartbeat", "arg": {"sender": "controller.0000"}})
        );
    }

    #[test]
    fn final_omits_empty_cause() {
        let msg = ControlMsg::Final {
            sender: "c.1".to_owned(),
            cause: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("cause"));

        let back: ControlMsg = serde_json::from_str(
            r#"{"cmd": "final", "arg": {"sender": "c.1", "cause": "invariant violated"}}"#,
        )
        .unwrap();
        assert_eq!(
            back,
            ControlMsg::Final {
                sender: "c.1".to_owned(),
                cause: Some("invariant violated".to_owned()),
            }
        );
    }

    #[test]
    fn cancel_and_shutdown_round_trip() {
        let cancel: ControlMsg =
            serde_json::from_str(r#"{"cmd": "cancel_unit", "arg": {"uid": "unit.000001"}}"#)
                .unwrap();
        assert_eq!(
            cancel,
            ControlMsg::CancelUnit {
                uid: "unit.000001".to_owned()
            }
        );

        let shutdown = ControlMsg::Shutdown {
            target: crate::TARGET_ALL.to_owned(),
        };
        assert!(shutdown.is_shutdown_for("anyone"));
        assert!(
            ControlMsg::Shutdown {
                target: "c.2".to_owned()
            }
            .is_shutdown_for("c.2")
        );
        assert!(
            !ControlMsg::Shutdown {
                target: "c.2".to_owned()
            }
            .is_shutdown_for("c.3")
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = serde_json::from_str::<ControlMsg>(r#"{"cmd": "reboot", "arg": {}}"#);
        assert!(err.is_err());
    }
}
