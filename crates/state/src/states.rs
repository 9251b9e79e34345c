// SPDX-License-Identifier: Apache-2.0

//! The canonical unit state set and its total order.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The states a unit progresses through on its way to a terminal state.
///
/// The declaration order is the canonical order. Transitions skipping
/// forward are legal, backward transitions are not, and the three terminal
/// states share the final position in the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    /// The unit exists but no component has touched it yet.
    New,
    /// Queued for client-side input staging.
    UmgrStagingInputPending,
    /// Client-side input staging in progress.
    UmgrStagingInput,
    /// Queued for resource allocation.
    AllocatingPending,
    /// Resource allocation in progress.
    Allocating,
    /// Queued for agent-side input staging.
    AgentStagingInputPending,
    /// Agent-side input staging in progress.
    AgentStagingInput,
    /// Queued for execution.
    ExecutingPending,
    /// The external command is running.
    Executing,
    /// Queued for agent-side output staging.
    AgentStagingOutputPending,
    /// Agent-side output staging in progress.
    AgentStagingOutput,
    /// Queued for client-side output staging.
    UmgrStagingOutputPending,
    /// Client-side output staging in progress.
    UmgrStagingOutput,
    /// Terminal: the unit completed.
    Done,
    /// Terminal: the unit was canceled.
    Canceled,
    /// Terminal: the unit failed.
    Failed,
}

impl UnitState {
    /// Position of this state in the canonical order.
    ///
    /// All terminal states share the same rank, so no terminal state
    /// precedes another.
    #[must_use]
    pub const fn canonical_rank(&self) -> u8 {
        match self {
            UnitState::New => 0,
            UnitState::UmgrStagingInputPending => 1,
            UnitState::UmgrStagingInput => 2,
            UnitState::AllocatingPending => 3,
            UnitState::Allocating => 4,
            UnitState::AgentStagingInputPending => 5,
            UnitState::AgentStagingInput => 6,
            UnitState::ExecutingPending => 7,
            UnitState::Executing => 8,
            UnitState::AgentStagingOutputPending => 9,
            UnitState::AgentStagingOutput => 10,
            UnitState::UmgrStagingOutputPending => 11,
            UnitState::UmgrStagingOutput => 12,
            UnitState::Done | UnitState::Canceled | UnitState::Failed => 13,
        }
    }

    /// Returns `true` for `DONE`, `FAILED` and `CANCELED`.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(
            self,
            UnitState::Done | UnitState::Canceled | UnitState::Failed
        )
    }

    /// Returns `true` if advancing from `self` to `to` respects the
    /// canonical order.
    ///
    /// Forward jumps are legal; a move to any terminal state is always
    /// legal; anything strictly backward is not.
    #[must_use]
    pub fn can_advance_to(&self, to: UnitState) -> bool {
        to.is_final() || to.canonical_rank() >= self.canonical_rank()
    }

    /// The canonical state name as it appears on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnitState::New => "NEW",
            UnitState::UmgrStagingInputPending => "UMGR_STAGING_INPUT_PENDING",
            UnitState::UmgrStagingInput => "UMGR_STAGING_INPUT",
            UnitState::AllocatingPending => "ALLOCATING_PENDING",
            UnitState::Allocating => "ALLOCATING",
            UnitState::AgentStagingInputPending => "AGENT_STAGING_INPUT_PENDING",
            UnitState::AgentStagingInput => "AGENT_STAGING_INPUT",
            UnitState::ExecutingPending => "EXECUTING_PENDING",
            UnitState::Executing => "EXECUTING",
            UnitState::AgentStagingOutputPending => "AGENT_STAGING_OUTPUT_PENDING",
            UnitState::AgentStagingOutput => "AGENT_STAGING_OUTPUT",
            UnitState::UmgrStagingOutputPending => "UMGR_STAGING_OUTPUT_PENDING",
            UnitState::UmgrStagingOutput => "UMGR_STAGING_OUTPUT",
            UnitState::Done => "DONE",
            UnitState::Canceled => "CANCELED",
            UnitState::Failed => "FAILED",
        }
    }

    /// The queue a unit in this state is pulled from, if any.
    ///
    /// Only the `*_PENDING` states (and `NEW`) are routed through queues;
    /// the active and terminal states have no input queue.
    #[must_use]
    pub const fn input_queue(&self) -> Option<&'static str> {
        match self {
            UnitState::New => Some("ingress_queue"),
            UnitState::UmgrStagingInputPending => Some("umgr_staging_input_queue"),
            UnitState::AllocatingPending => Some("agent_scheduling_queue"),
            UnitState::AgentStagingInputPending => Some("agent_staging_input_queue"),
            UnitState::ExecutingPending => Some("agent_executing_queue"),
            UnitState::AgentStagingOutputPending => Some("agent_staging_output_queue"),
            UnitState::UmgrStagingOutputPending => Some("umgr_staging_output_queue"),
            _ => None,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(UnitState::New),
            "UMGR_STAGING_INPUT_PENDING" => Ok(UnitState::UmgrStagingInputPending),
            "UMGR_STAGING_INPUT" => Ok(UnitState::UmgrStagingInput),
            "ALLOCATING_PENDING" => Ok(UnitState::AllocatingPending),
            "ALLOCATING" => Ok(UnitState::Allocating),
            "AGENT_STAGING_INPUT_PENDING" => Ok(UnitState::AgentStagingInputPending),
            "AGENT_STAGING_INPUT" => Ok(UnitState::AgentStagingInput),
            "EXECUTING_PENDING" => Ok(UnitState::ExecutingPending),
            "EXECUTING" => Ok(UnitState::Executing),
            "AGENT_STAGING_OUTPUT_PENDING" => Ok(UnitState::AgentStagingOutputPending),
            "AGENT_STAGING_OUTPUT" => Ok(UnitState::AgentStagingOutput),
            "UMGR_STAGING_OUTPUT_PENDING" => Ok(UnitState::UmgrStagingOutputPending),
            "UMGR_STAGING_OUTPUT" => Ok(UnitState::UmgrStagingOutput),
            "DONE" => Ok(UnitState::Done),
            "CANCELED" => Ok(UnitState::Canceled),
            "FAILED" => Ok(UnitState::Failed),
            other => Err(Error::UnknownState {
                state: other.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn canonical_order_is_total() {
        let states = [
            UnitState::New,
            UnitState::UmgrStagingInputPending,
            UnitState::UmgrStagingInput,
            UnitState::AllocatingPending,
            UnitState::Allocating,
            UnitState::AgentStagingInputPending,
            UnitState::AgentStagingInput,
            UnitState::ExecutingPending,
            UnitState::Executing,
            UnitState::AgentStagingOutputPending,
            UnitState::AgentStagingOutput,
            UnitState::UmgrStagingOutputPending,
            UnitState::UmgrStagingOutput,
            UnitState::Done,
        ];
        for pair in states.windows(2) {
            assert!(pair[0].canonical_rank() < pair[1].canonical_rank() || pair[1].is_final());
            assert!(pair[0].can_advance_to(pair[1]));
            assert!(!pair[1].can_advance_to(pair[0]) || pair[0].is_final());
        }
    }

    #[test]
    fn forward_skips_are_legal() {
        assert!(UnitState::AllocatingPending.can_advance_to(UnitState::ExecutingPending));
        assert!(UnitState::New.can_advance_to(UnitState::Done));
    }

    #[test]
    fn terminal_is_always_reachable() {
        assert!(UnitState::Executing.can_advance_to(UnitState::Canceled));
        assert!(UnitState::Done.can_advance_to(UnitState::Failed));
    }

    #[test]
    fn wire_names_round_trip() {
        for s in [
            UnitState::New,
            UnitState::UmgrStagingInput,
            UnitState::AgentStagingOutputPending,
            UnitState::Done,
            UnitState::Canceled,
            UnitState::Failed,
        ] {
            assert_eq!(s.as_str().parse::<UnitState>().unwrap(), s);
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s.as_str()));
        }
    }
}
