// SPDX-License-Identifier: Apache-2.0

//! The scheduler stage: first-fit slot allocation across the pilot pool.

use crate::component::{Component, ComponentBase};
use crate::error::Error;
use crate::latch::Latches;
use async_trait::async_trait;
use pilotflow_config::{ComponentConfig, PilotSlotConfig};
use pilotflow_fabric::Subscriber;
use pilotflow_state::{Unit, UnitState, STATE_TOPIC};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// The allocation annotated onto a scheduled unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// The pilot that hosts the unit.
    pub pilot: String,
    /// The core slots taken on that pilot.
    pub slots: Vec<usize>,
}

/// Core occupancy of one pilot.
#[derive(Debug)]
struct PilotSlots {
    uid: String,
    free: Vec<bool>,
}

/// The free pool the scheduler allocates from.
#[derive(Debug)]
pub(crate) struct SlotPool {
    pilots: Vec<PilotSlots>,
}

impl SlotPool {
    /// Builds the pool from configuration, falling back to a single local
    /// pilot sized to the machine's core count.
    fn from_config(pilots: &[PilotSlotConfig]) -> Self {
        let pilots = if pilots.is_empty() {
            let cores = core_affinity::get_core_ids().map_or(4, |ids| ids.len().max(1));
            vec![PilotSlots {
                uid: "pilot.0000".to_owned(),
                free: vec![true; cores],
            }]
        } else {
            pilots
                .iter()
                .map(|p| PilotSlots {
                    uid: p.uid.clone(),
                    free: vec![true; usize::try_from(p.cores).unwrap_or(1).max(1)],
                })
                .collect()
        };
        Self { pilots }
    }

    /// First fit across pilots, in configuration order.
    fn allocate(&mut self, cores: u32) -> Option<Allocation> {
        let wanted = usize::try_from(cores).unwrap_or(1).max(1);
        for pilot in &mut self.pilots {
            let free: Vec<usize> = pilot
                .free
                .iter()
                .enumerate()
                .filter_map(|(i, free)| free.then_some(i))
                .take(wanted)
                .collect();
            if free.len() == wanted {
                for slot in &free {
                    pilot.free[*slot] = false;
                }
                return Some(Allocation {
                    pilot: pilot.uid.clone(),
                    slots: free,
                });
            }
        }
        None
    }

    fn release(&mut self, allocation: &Allocation) {
        if let Some(pilot) = self.pilots.iter_mut().find(|p| p.uid == allocation.pilot) {
            for slot in &allocation.slots {
                if let Some(flag) = pilot.free.get_mut(*slot) {
                    *flag = true;
                }
            }
        }
    }
}

/// Pulls units in `ALLOCATING_PENDING`, annotates them with an allocation
/// from the free pool, and pushes them to the executing queue.
///
/// On exhaustion the unit waits inside the scheduler; every completion
/// observed on the state topic releases its allocation and re-triggers
/// placement of the waiting units.
pub struct Scheduler {
    base: ComponentBase,
    pool: SlotPool,
    waiting: VecDeque<Unit>,
    issued: HashMap<String, Allocation>,
    completions: Option<Subscriber>,
}

impl Scheduler {
    /// Builds the stage.
    pub fn new(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        let pool = SlotPool::from_config(&cfg.pilots);
        Ok(Self {
            base: ComponentBase::new(cfg, latches)?,
            pool,
            waiting: VecDeque::new(),
            issued: HashMap::new(),
            completions: None,
        })
    }

    /// Attempts placement; hands the unit back when nothing fits.
    async fn try_place(&mut self, mut unit: Unit) -> Result<Option<Unit>, Error> {
        let Some(allocation) = self.pool.allocate(unit.description.cores()) else {
            return Ok(Some(unit));
        };
        let _ = self.issued.insert(unit.uid.clone(), allocation.clone());
        let _ = unit.extension.insert(
            "allocation".to_owned(),
            serde_json::to_value(&allocation).unwrap_or_default(),
        );
        self.base
            .advance(
                std::slice::from_mut(&mut unit),
                Some(UnitState::ExecutingPending),
                true,
                true,
            )
            .await?;
        Ok(None)
    }

    /// Releases allocations of units that moved past execution.
    async fn drain_completions(&mut self) -> Result<bool, Error> {
        let mut released = false;
        loop {
            let Some(sub) = self.completions.as_mut() else {
                return Ok(released);
            };
            match sub.recv_timeout(Duration::from_millis(10)).await {
                Ok(Some(envelope)) => {
                    let Ok(unit) = serde_json::from_value::<Unit>(envelope.payload) else {
                        continue;
                    };
                    let past_executing = unit.state.is_final()
                        || unit.state.canonical_rank() > UnitState::Executing.canonical_rank();
                    if past_executing {
                        if let Some(allocation) = self.issued.remove(&unit.uid) {
                            self.pool.release(&allocation);
                            self.base.prof().prof("unschedule", &unit.uid, "", "");
                            released = true;
                        }
                    }
                }
                Ok(None) => return Ok(released),
                Err(_) => {
                    return Err(Error::BridgeLost {
                        name: STATE_TOPIC.to_owned(),
                    })
                }
            }
        }
    }

    async fn retry_waiting(&mut self) -> Result<(), Error> {
        // drop waiting units with a pending cancel first
        let mut kept = VecDeque::with_capacity(self.waiting.len());
        while let Some(mut unit) = self.waiting.pop_front() {
            if self.base.cancels().take(&unit.uid) {
                self.base
                    .advance(
                        std::slice::from_mut(&mut unit),
                        Some(UnitState::Canceled),
                        true,
                        false,
                    )
                    .await?;
            } else {
                kept.push_back(unit);
            }
        }
        self.waiting = kept;

        while let Some(unit) = self.waiting.pop_front() {
            if let Some(unit) = self.try_place(unit).await? {
                // the head does not fit; later units cannot jump the queue
                self.waiting.push_front(unit);
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Component for Scheduler {
    fn base(&mut self) -> &mut ComponentBase {
        &mut self.base
    }

    async fn initialize_child(&mut self) -> Result<(), Error> {
        self.base
            .register_input(UnitState::AllocatingPending, "agent_scheduling_queue")
            .await?;
        self.base
            .register_output(UnitState::ExecutingPending, Some("agent_executing_queue"))
            .await?;
        self.completions = Some(self.base.register_subscriber(&[STATE_TOPIC]).await?);
        Ok(())
    }

    async fn work(&mut self, mut units: Vec<Unit>) -> Result<(), Error> {
        self.base
            .advance(&mut units, Some(UnitState::Allocating), true, false)
            .await?;
        for unit in units {
            if let Some(unit) = self.try_place(unit).await? {
                self.base.prof().prof("schedule_wait", &unit.uid, "", "");
                self.waiting.push_back(unit);
            }
        }
        Ok(())
    }

    async fn idle(&mut self) -> Result<(), Error> {
        let released = self.drain_completions().await?;
        if released || !self.waiting.is_empty() {
            self.retry_waiting().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool(cores: u32) -> SlotPool {
        SlotPool::from_config(&[PilotSlotConfig {
            uid: "pilot.0000".to_owned(),
            cores,
            sandbox: None,
        }])
    }

    #[test]
    fn first_fit_fills_and_releases() {
        let mut pool = pool(4);
        let a = pool.allocate(2).unwrap();
        let b = pool.allocate(2).unwrap();
        assert_eq!(a.pilot, "pilot.0000");
        assert!(pool.allocate(1).is_none());

        pool.release(&a);
        let c = pool.allocate(1).unwrap();
        assert_eq!(c.slots, vec![0]);
        pool.release(&b);
        pool.release(&c);
        assert_eq!(pool.allocate(4).unwrap().slots, vec![0, 1, 2, 3]);
    }

    #[test]
    fn spills_to_the_next_pilot() {
        let mut pool = SlotPool::from_config(&[
            PilotSlotConfig {
                uid: "pilot.0000".to_owned(),
                cores: 1,
                sandbox: None,
            },
            PilotSlotConfig {
                uid: "pilot.0001".to_owned(),
                cores: 4,
                sandbox: None,
            },
        ]);
        assert_eq!(pool.allocate(1).unwrap().pilot, "pilot.0000");
        assert_eq!(pool.allocate(2).unwrap().pilot, "pilot.0001");
    }

    #[test]
    fn oversized_requests_never_fit() {
        let mut pool = pool(2);
        assert!(pool.allocate(3).is_none());
        // the pool is untouched
        assert!(pool.allocate(2).is_some());
    }
}
