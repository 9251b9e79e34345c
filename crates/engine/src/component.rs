// SPDX-License-Identifier: Apache-2.0

//! The component base: fabric bindings, the `advance` primitive, and the
//! main loop every stage runs on.
//!
//! A component pulls units from at most one input queue, advances them
//! through the canonical state machine, performs its stage-specific side
//! effect, and pushes them to the next stage's queue. The state publish
//! always happens before the push, so subscribers observe a transition no
//! later than the next owning component.

use crate::error::Error;
use crate::heartbeat::HeartbeatMonitor;
use crate::latch::Latches;
use crate::POLL_INTERVAL;
use async_trait::async_trait;
use parking_lot::Mutex;
use pilotflow_config::ComponentConfig;
use pilotflow_fabric::{Publisher, QueueGetter, QueuePutter, Subscriber};
use pilotflow_state::{
    ControlMsg, Unit, UnitState, CONTROL_PUBSUB, CONTROL_TOPIC, LOG_PUBSUB, LOG_TOPIC,
    STATE_PUBSUB, STATE_TOPIC,
};
use pilotflow_telemetry::{ProfileSink, Profiler};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Pending unit cancellations, shared between the control listener and the
/// component loop.
///
/// A component not owning a unit records the cancel here; the check happens
/// when the unit arrives, or at the next suspension boundary if the unit is
/// already being worked on.
#[derive(Debug, Clone, Default)]
pub struct CancelSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl CancelSet {
    /// Records a pending cancel.
    pub fn add(&self, uid: &str) {
        let _ = self.inner.lock().insert(uid.to_owned());
    }

    /// `true` if a cancel is pending for `uid`; does not consume it.
    #[must_use]
    pub fn contains(&self, uid: &str) -> bool {
        self.inner.lock().contains(uid)
    }

    /// Consumes a pending cancel, reporting whether one was present.
    #[must_use]
    pub fn take(&self, uid: &str) -> bool {
        self.inner.lock().remove(uid)
    }
}

/// Lifecycle of one component instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// Constructed, fabric not yet attached.
    Init,
    /// Signalled `alive`, pulling work.
    Alive,
    /// Termination observed, finishing up.
    Draining,
    /// `final` sent; nothing runs anymore.
    Dead,
}

/// The bridge a topic lives on.
fn bridge_for_topic(topic: &str) -> &'static str {
    match topic {
        CONTROL_TOPIC => CONTROL_PUBSUB,
        STATE_TOPIC => STATE_PUBSUB,
        LOG_TOPIC => LOG_PUBSUB,
        _ => STATE_PUBSUB,
    }
}

/// Shared state and fabric bindings of one component instance.
pub struct ComponentBase {
    cfg: ComponentConfig,
    latches: Latches,
    prof: ProfileSink,
    heartbeat: HeartbeatMonitor,
    cancels: CancelSet,
    lifecycle: ComponentState,
    input: Option<(UnitState, String, QueueGetter)>,
    outputs: HashMap<UnitState, Option<QueuePutter>>,
    default_output: Option<UnitState>,
    publishers: HashMap<String, Publisher>,
}

impl ComponentBase {
    /// Builds the base for one component instance. Fabric connections are
    /// made later, through the `register_*` calls.
    pub fn new(cfg: ComponentConfig, latches: Latches) -> Result<Self, Error> {
        let prof_dir = cfg.sandbox.join("profiles").join(&cfg.session);
        let prof = Arc::new(Profiler::from_env(&cfg.uid, &prof_dir)?);
        let heartbeat = HeartbeatMonitor::new(cfg.heartbeat_timeout);
        Ok(Self {
            cfg,
            latches,
            prof,
            heartbeat,
            cancels: CancelSet::default(),
            lifecycle: ComponentState::Init,
            input: None,
            outputs: HashMap::new(),
            default_output: None,
            publishers: HashMap::new(),
        })
    }

    /// Where this component is in its lifecycle.
    #[must_use]
    pub const fn lifecycle(&self) -> ComponentState {
        self.lifecycle
    }

    /// This component's uid.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.cfg.uid
    }

    /// The component configuration.
    #[must_use]
    pub fn cfg(&self) -> &ComponentConfig {
        &self.cfg
    }

    /// The termination latches.
    #[must_use]
    pub fn latches(&self) -> &Latches {
        &self.latches
    }

    /// The profile sink.
    #[must_use]
    pub fn prof(&self) -> &ProfileSink {
        &self.prof
    }

    /// The heartbeat monitor.
    #[must_use]
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// The pending-cancel set.
    #[must_use]
    pub fn cancels(&self) -> &CancelSet {
        &self.cancels
    }

    /// The state whose queue this component pulls from, if an input is
    /// registered.
    #[must_use]
    pub fn input_state(&self) -> Option<UnitState> {
        self.input.as_ref().map(|(state, _, _)| *state)
    }

    /// Binds the input: units in `state` are pulled from `queue_name`.
    /// At most one input binding is permitted.
    pub async fn register_input(&mut self, state: UnitState, queue_name: &str) -> Result<(), Error> {
        if self.input.is_some() {
            return Err(Error::InputAlreadyRegistered {
                uid: self.cfg.uid.clone(),
            });
        }
        let (_, addr_out) = self.cfg.bridge_addrs(queue_name)?;
        let getter = QueueGetter::connect(&addr_out).await?;
        self.input = Some((state, queue_name.to_owned(), getter));
        Ok(())
    }

    /// Declares the next-stage queue for units reaching `state`. A `None`
    /// queue means "drop": the unit is no longer routed, but a registered
    /// publisher still observes the transition.
    pub async fn register_output(
        &mut self,
        state: UnitState,
        queue_name: Option<&str>,
    ) -> Result<(), Error> {
        let putter = match queue_name {
            Some(name) => {
                let (addr_in, _) = self.cfg.bridge_addrs(name)?;
                Some(QueuePutter::connect(&addr_in).await?)
            }
            None => None,
        };
        if self.default_output.is_none() {
            self.default_output = Some(state);
        }
        let _ = self.outputs.insert(state, putter);
        Ok(())
    }

    /// Connects a publisher for the given topic.
    pub async fn register_publisher(&mut self, topic: &str) -> Result<(), Error> {
        if self.publishers.contains_key(topic) {
            return Ok(());
        }
        let (addr_in, _) = self.cfg.bridge_addrs(bridge_for_topic(topic))?;
        let publisher = Publisher::connect(&addr_in).await?;
        let _ = self.publishers.insert(topic.to_owned(), publisher);
        Ok(())
    }

    /// Connects a subscriber for the given topics (which must live on the
    /// same bridge). The caller owns the subscription and drives it.
    pub async fn register_subscriber(&self, topics: &[&str]) -> Result<Subscriber, Error> {
        let first = topics.first().copied().unwrap_or(CONTROL_TOPIC);
        let (_, addr_out) = self.cfg.bridge_addrs(bridge_for_topic(first))?;
        Ok(Subscriber::connect(&addr_out, topics).await?)
    }

    /// Publishes a message on a previously registered topic.
    pub async fn publish<T: Serialize>(&mut self, topic: &str, msg: &T) -> Result<(), Error> {
        let publisher = self
            .publishers
            .get_mut(topic)
            .ok_or_else(|| Error::Internal {
                details: format!("no publisher registered for topic `{topic}`"),
            })?;
        publisher.put(topic, msg).await.map_err(Error::from)
    }

    /// The central transition primitive.
    ///
    /// For every unit: when `new_state` is given, the unit moves there
    /// (duplicate transitions to the same state collapse; backward
    /// transitions are an invariant violation); when `publish` is set, the
    /// transition goes out on the state topic before any push; when `push`
    /// is set, the unit is enqueued onto the output registered for its
    /// state (falling back to the first registered output for units passing
    /// through). A terminal state forces `push` off.
    pub async fn advance(
        &mut self,
        units: &mut [Unit],
        new_state: Option<UnitState>,
        publish: bool,
        push: bool,
    ) -> Result<(), Error> {
        for unit in units.iter_mut() {
            let mut changed = new_state.is_none();
            if let Some(to) = new_state {
                if to == unit.state {
                    changed = false;
                } else if !unit.state.can_advance_to(to) {
                    return Err(Error::BackwardTransition {
                        uid: unit.uid.clone(),
                        from: unit.state,
                        to,
                    });
                } else {
                    unit.state = to;
                    changed = true;
                }
            }

            let state = unit.state;
            if publish && (changed || new_state.is_none()) {
                self.prof.prof("advance", &unit.uid, state.as_str(), "");
                self.publish(STATE_TOPIC, unit).await?;
            }

            if !push || state.is_final() || !(changed || new_state.is_none()) {
                continue;
            }
            let route = if self.outputs.contains_key(&state) {
                Some(state)
            } else {
                self.default_output
            };
            let Some(route) = route else {
                tracing::debug!(uid = %unit.uid, state = %state, "no output route; unit dropped");
                continue;
            };
            match self.outputs.get_mut(&route) {
                Some(Some(putter)) => {
                    putter.put(unit).await?;
                    self.prof.prof("put", &unit.uid, state.as_str(), "");
                }
                Some(None) => {
                    self.prof.prof("drop", &unit.uid, state.as_str(), "");
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Pulls the next raw input message, bounded by the poll interval.
    async fn pull(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match &mut self.input {
            Some((_, queue_name, getter)) => match getter.get_timeout(POLL_INTERVAL).await {
                Ok(raw) => Ok(raw),
                Err(_) => Err(Error::BridgeLost {
                    name: queue_name.clone(),
                }),
            },
            None => {
                tokio::time::sleep(POLL_INTERVAL).await;
                Ok(None)
            }
        }
    }
}

/// One pipeline stage (or supporting role) running on the component base.
///
/// The lifecycle hooks are invoked exactly once each, in declaration
/// order, under normal operation.
#[async_trait]
pub trait Component: Send {
    /// The shared base.
    fn base(&mut self) -> &mut ComponentBase;

    /// Main-scheduling-unit initialization, before the fabric is attached.
    async fn initialize(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Child initialization, after the control plane is attached. Register
    /// inputs, outputs and publishers here.
    async fn initialize_child(&mut self) -> Result<(), Error>;

    /// The stage handler, invoked with the batch pulled from the input
    /// queue. Implementations must tolerate both single units and bulks;
    /// the runner normalizes both into a vector.
    async fn work(&mut self, units: Vec<Unit>) -> Result<(), Error>;

    /// Invoked when an input pull times out (and, for input-less
    /// components, once per poll interval).
    async fn idle(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Child finalization, before the `final` control message goes out.
    async fn finalize_child(&mut self) {}

    /// Main-scheduling-unit finalization.
    async fn finalize(&mut self) {}
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum UnitBatch {
    One(Box<Unit>),
    Many(Vec<Unit>),
}

impl UnitBatch {
    fn into_vec(self) -> Vec<Unit> {
        match self {
            UnitBatch::One(unit) => vec![*unit],
            UnitBatch::Many(units) => units,
        }
    }
}

/// Listens on the control topic and maintains the shared component state:
/// heartbeats, pending cancels, and shutdown requests.
async fn control_listener(
    mut sub: Subscriber,
    uid: String,
    heartbeat: HeartbeatMonitor,
    cancels: CancelSet,
    latches: Latches,
) {
    loop {
        if latches.is_terminated() {
            break;
        }
        match sub.recv_timeout(POLL_INTERVAL).await {
            Ok(Some(envelope)) => {
                match serde_json::from_value::<ControlMsg>(envelope.payload) {
                    Ok(ControlMsg::Heartbeat { .. }) => heartbeat.beat(),
                    Ok(ControlMsg::CancelUnit { uid: unit_uid }) => cancels.add(&unit_uid),
                    Ok(msg) if msg.is_shutdown_for(&uid) => {
                        tracing::info!(component = %uid, "shutdown requested over control topic");
                        latches.terminate();
                        break;
                    }
                    Ok(_) | Err(_) => {}
                }
            }
            Ok(None) => {}
            Err(_) => {
                // loss of the control bridge is fatal for every subscriber
                tracing::warn!(component = %uid, "control bridge lost");
                latches.terminate();
                break;
            }
        }
    }
}

/// Drives one component through its full lifecycle: hooks, liveness
/// signalling, the pull/advance/push loop, and the `final` message.
pub async fn run(mut component: Box<dyn Component>) -> Result<(), Error> {
    component.initialize().await?;

    let (uid, heartbeat, cancels, latches) = {
        let base = component.base();
        (
            base.uid().to_owned(),
            base.heartbeat().clone(),
            base.cancels().clone(),
            base.latches().clone(),
        )
    };

    component.base().register_publisher(CONTROL_TOPIC).await?;
    component.base().register_publisher(STATE_TOPIC).await?;
    let control_sub = component.base().register_subscriber(&[CONTROL_TOPIC]).await?;
    let listener = tokio::spawn(control_listener(
        control_sub,
        uid.clone(),
        heartbeat,
        cancels,
        latches,
    ));

    component.initialize_child().await?;
    component
        .base()
        .publish(CONTROL_TOPIC, &ControlMsg::Alive { sender: uid.clone() })
        .await?;
    component.base().lifecycle = ComponentState::Alive;
    component.base().prof().prof("alive", "", "", "");
    tracing::info!(component = %uid, "component up");

    let outcome = main_loop(&mut component).await;

    component.base().lifecycle = ComponentState::Draining;
    component.finalize_child().await;
    let cause = outcome.as_ref().err().map(ToString::to_string);
    if let Err(e) = component
        .base()
        .publish(
            CONTROL_TOPIC,
            &ControlMsg::Final {
                sender: uid.clone(),
                cause: cause.clone(),
            },
        )
        .await
    {
        tracing::debug!(component = %uid, error = %e, "final message not delivered");
    }
    component.finalize().await;
    component.base().lifecycle = ComponentState::Dead;
    component.base().prof().close();
    listener.abort();

    tracing::info!(component = %uid, cause = ?cause, "component down");
    outcome
}

async fn main_loop(component: &mut Box<dyn Component>) -> Result<(), Error> {
    loop {
        {
            let base = component.base();
            if base.latches().is_terminated() {
                return Ok(());
            }
            if base.heartbeat().expired() {
                let silent_secs = base.heartbeat().silence().as_secs();
                base.latches().terminate();
                return Err(Error::HeartbeatLost { silent_secs });
            }
        }

        let pulled = {
            let base = component.base();
            let pulled = base.pull().await;
            match pulled {
                Ok(raw) => raw,
                Err(e) => {
                    base.latches().terminate();
                    return Err(e);
                }
            }
        };

        match pulled {
            Some(raw) => match serde_json::from_slice::<UnitBatch>(&raw) {
                Ok(batch) => dispatch(component, batch.into_vec()).await?,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unparsable input message");
                }
            },
            None => component.idle().await?,
        }
    }
}

/// Applies pending cancels and drain-mode forwarding, then hands the
/// remaining batch to the stage handler.
async fn dispatch(component: &mut Box<dyn Component>, units: Vec<Unit>) -> Result<(), Error> {
    let expected = component.base().input_state();
    let mut batch = Vec::with_capacity(units.len());

    for mut unit in units {
        if component.base().cancels().take(&unit.uid) {
            component
                .base()
                .advance(
                    std::slice::from_mut(&mut unit),
                    Some(UnitState::Canceled),
                    true,
                    false,
                )
                .await?;
            continue;
        }
        match expected {
            Some(expected) if unit.state.canonical_rank() > expected.canonical_rank() => {
                // drain mode: the unit is ahead of this stage; forward it
                // unchanged without processing
                component
                    .base()
                    .advance(std::slice::from_mut(&mut unit), None, false, true)
                    .await?;
            }
            _ => batch.push(unit),
        }
    }

    if batch.is_empty() {
        Ok(())
    } else {
        component.work(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilotflow_config::{BridgeConfig, ComponentConfig, ComponentKind};
    use pilotflow_fabric::{PubSubBridge, QueueBridge};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn test_base(
        dir: &std::path::Path,
    ) -> (ComponentBase, PubSubBridge, QueueBridge, Subscriber) {
        let state_bridge = PubSubBridge::start(STATE_PUBSUB).await.unwrap();
        let out_queue = QueueBridge::start("agent_scheduling_queue", 64, false)
            .await
            .unwrap();

        let mut bridges = BTreeMap::new();
        let mut state_cfg = BridgeConfig::pubsub();
        state_cfg.addr_in = Some(state_bridge.addr_in().to_owned());
        state_cfg.addr_out = Some(state_bridge.addr_out().to_owned());
        let _ = bridges.insert(STATE_PUBSUB.to_owned(), state_cfg);
        let mut queue_cfg = BridgeConfig::queue();
        queue_cfg.addr_in = Some(out_queue.addr_in().to_owned());
        queue_cfg.addr_out = Some(out_queue.addr_out().to_owned());
        let _ = bridges.insert("agent_scheduling_queue".to_owned(), queue_cfg);

        let cfg = ComponentConfig {
            uid: "umgr_staging_input.0000".to_owned(),
            kind: ComponentKind::UmgrStagingInput,
            owner: "test".to_owned(),
            session: "session.test".to_owned(),
            bridges,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            depth: 1,
            sandbox: dir.to_path_buf(),
            staging_area: None,
            staging_scheme: "staging".to_owned(),
            debug: None,
            pilots: vec![],
        };

        let mut base = ComponentBase::new(cfg, Latches::new()).unwrap();
        base.register_publisher(STATE_TOPIC).await.unwrap();
        let state_sub = base.register_subscriber(&[STATE_TOPIC]).await.unwrap();
        (base, state_bridge, out_queue, state_sub)
    }

    fn unit(uid: &str, state: UnitState) -> Unit {
        let mut unit = Unit::new(uid, pilotflow_state::UnitDescription::default());
        unit.state = state;
        unit
    }

    #[tokio::test]
    async fn duplicate_advance_publishes_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut base, _ps, _q, mut state_sub) = test_base(dir.path()).await;

        let mut units = vec![unit("unit.1", UnitState::UmgrStagingInputPending)];
        base.advance(&mut units, Some(UnitState::UmgrStagingInput), true, false)
            .await
            .unwrap();
        base.advance(&mut units, Some(UnitState::UmgrStagingInput), true, false)
            .await
            .unwrap();

        let first = state_sub
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = state_sub
            .recv_timeout(Duration::from_millis(300))
            .await
            .unwrap();
        assert!(second.is_none(), "duplicate transition must collapse");
    }

    #[tokio::test]
    async fn null_output_drops_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut base, _ps, _q, mut state_sub) = test_base(dir.path()).await;
        base.register_output(UnitState::AllocatingPending, None)
            .await
            .unwrap();

        let mut units = vec![unit("unit.2", UnitState::UmgrStagingInput)];
        base.advance(&mut units, Some(UnitState::AllocatingPending), true, true)
            .await
            .unwrap();

        // the publish still happened
        let envelope = state_sub
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let published: Unit = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(published.state, UnitState::AllocatingPending);
    }

    #[tokio::test]
    async fn push_routes_to_registered_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (mut base, _ps, out_queue, _sub) = test_base(dir.path()).await;
        base.register_output(UnitState::AllocatingPending, Some("agent_scheduling_queue"))
            .await
            .unwrap();
        let mut getter = QueueGetter::connect(out_queue.addr_out()).await.unwrap();

        let mut units = vec![unit("unit.3", UnitState::UmgrStagingInput)];
        base.advance(&mut units, Some(UnitState::AllocatingPending), false, true)
            .await
            .unwrap();

        let raw = getter
            .get_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let pushed: Unit = serde_json::from_slice(&raw).unwrap();
        assert_eq!(pushed.uid, "unit.3");
        assert_eq!(pushed.state, UnitState::AllocatingPending);
    }

    #[tokio::test]
    async fn terminal_state_forces_push_off() {
        let dir = tempfile::tempdir().unwrap();
        let (mut base, _ps, out_queue, _sub) = test_base(dir.path()).await;
        base.register_output(UnitState::Failed, Some("agent_scheduling_queue"))
            .await
            .unwrap();
        let mut getter = QueueGetter::connect(out_queue.addr_out()).await.unwrap();

        let mut units = vec![unit("unit.4", UnitState::Executing)];
        base.advance(&mut units, Some(UnitState::Failed), false, true)
            .await
            .unwrap();
        assert!(getter
            .get_timeout(Duration::from_millis(300))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn backward_transition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut base, _ps, _q, _sub) = test_base(dir.path()).await;

        let mut units = vec![unit("unit.5", UnitState::Executing)];
        let err = base
            .advance(&mut units, Some(UnitState::AllocatingPending), false, false)
            .await;
        assert!(matches!(err, Err(Error::BackwardTransition { .. })));
    }

    #[tokio::test]
    async fn second_input_binding_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut base, _ps, _q, _sub) = test_base(dir.path()).await;
        base.register_input(UnitState::AllocatingPending, "agent_scheduling_queue")
            .await
            .unwrap();
        let err = base
            .register_input(UnitState::AllocatingPending, "agent_scheduling_queue")
            .await;
        assert!(matches!(err, Err(Error::InputAlreadyRegistered { .. })));
    }
}
