// SPDX-License-Identifier: Apache-2.0

//! The controller: one per process tree root (and, recursively, per
//! nested subtree).
//!
//! Bring-up order: bridges without addresses are started first, the log
//! pubsub before the control pubsub before everything else; the resulting
//! address map is merged into every component configuration before that
//! component is started. The heart emits heartbeats on the control topic;
//! a watcher polls every owned bridge and component, and the first
//! observed death triggers a controlled shutdown of the whole owned
//! subtree. Bridges are torn down last, so terminating components can
//! still publish their `final` messages.

use crate::component;
use crate::error::Error;
use crate::heartbeat::HeartbeatMonitor;
use crate::latch::Latches;
use crate::registry;
use crate::supervisor::{self, AliveRegistry, BridgeProcessHandle, Supervisor};
use crate::{POLL_INTERVAL, WATCH_INTERVAL};
use parking_lot::Mutex;
use pilotflow_config::{
    BridgeConfig, BridgeKind, BridgeLaunchConfig, ComponentConfig, ControllerConfig,
};
use pilotflow_fabric::{Bridge, PubSubBridge, Publisher, QueueBridge, QueuePutter, Subscriber};
use pilotflow_state::{
    ControlMsg, Unit, UnitState, CONTROL_PUBSUB, CONTROL_TOPIC, LOG_PUBSUB, STATE_PUBSUB,
    STATE_TOPIC, TARGET_ALL,
};
use pilotflow_telemetry::{ProfileSink, Profiler};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How components are brought up: as OS processes (exec-on-spawn of the
/// runtime binary) or as in-process workers on dedicated threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// One OS process per component instance.
    Process,
    /// One worker thread per component instance, sharing this process.
    Worker,
}

/// Why the controller's main loop returned.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Termination was requested through the latches (signal or `stop`).
    Terminated,
    /// A watched subordinate died first.
    ComponentDied {
        /// The first subordinate observed dead.
        uid: String,
        /// The death reason.
        reason: String,
    },
    /// The external heart went silent.
    HeartbeatLost,
}

/// What the shutdown cascade left behind, for the diagnostic summary.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// The first component observed dead, if any.
    pub first_death: Option<(String, String)>,
    /// `final` messages collected before teardown: uid to cause.
    pub finals: Vec<(String, Option<String>)>,
    /// Units still in flight at shutdown, failed with `cause=shutdown`.
    pub failed_units: Vec<String>,
}

type SharedUnits = Arc<Mutex<HashMap<String, Unit>>>;
type SharedFinals = Arc<Mutex<Vec<(String, Option<String>)>>>;

/// Grace window for a bridge process after its SIGTERM.
const BRIDGE_GRACE: Duration = Duration::from_secs(5);

/// A bridge owned by this controller: an in-process task in worker mode,
/// or a child process spawned through the `bridge` entry point in process
/// mode.
enum OwnedBridge {
    Task(Bridge),
    Process(BridgeProcessHandle),
}

impl OwnedBridge {
    fn name(&self) -> &str {
        match self {
            OwnedBridge::Task(bridge) => bridge.name(),
            OwnedBridge::Process(handle) => &handle.name,
        }
    }

    fn addr_in(&self) -> &str {
        match self {
            OwnedBridge::Task(bridge) => bridge.addr_in(),
            OwnedBridge::Process(handle) => &handle.addr_in,
        }
    }

    fn addr_out(&self) -> &str {
        match self {
            OwnedBridge::Task(bridge) => bridge.addr_out(),
            OwnedBridge::Process(handle) => &handle.addr_out,
        }
    }

    fn poll(&mut self) -> Option<String> {
        match self {
            OwnedBridge::Task(bridge) => bridge.poll(),
            OwnedBridge::Process(handle) => handle.poll(),
        }
    }

    fn request_stop(&self) {
        match self {
            OwnedBridge::Task(bridge) => bridge.stop(),
            OwnedBridge::Process(handle) => handle.terminate(),
        }
    }

    async fn teardown(&mut self) {
        match self {
            OwnedBridge::Task(bridge) => bridge.join().await,
            OwnedBridge::Process(handle) => handle.reap(BRIDGE_GRACE).await,
        }
    }
}

/// The in-process coordinator owning a subtree of components and bridges.
pub struct Controller {
    cfg: ControllerConfig,
    session: String,
    sandbox: PathBuf,
    latches: Latches,
    prof: ProfileSink,
    resolved: BTreeMap<String, BridgeConfig>,
    bridges: Vec<OwnedBridge>,
    supervisor: Supervisor,
    control_pub: Publisher,
    state_pub: Publisher,
    heartbeat: HeartbeatMonitor,
    is_heart: bool,
    heart: Option<JoinHandle<()>>,
    listener: JoinHandle<()>,
    state_task: JoinHandle<()>,
    deaths: tokio::sync::mpsc::UnboundedReceiver<(String, String)>,
    finals: SharedFinals,
    units: SharedUnits,
    entry: Option<(UnitState, QueuePutter)>,
    first_death: Option<(String, String)>,
}

impl Controller {
    /// Brings up the configured bridges and components and starts the
    /// heart and the liveness watcher.
    pub async fn start(mut cfg: ControllerConfig, mode: SpawnMode) -> Result<Self, Error> {
        cfg.normalize();
        cfg.validate()?;

        let session = cfg
            .session
            .clone()
            .unwrap_or_else(|| format!("session.{}", uuid::Uuid::new_v4().simple()));
        let sandbox = match &cfg.sandbox {
            Some(sandbox) => sandbox.clone(),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(&session),
        };
        std::fs::create_dir_all(&sandbox)?;

        let prof: ProfileSink = Arc::new(Profiler::from_env(
            &cfg.owner,
            &sandbox.join("profiles").join(&session),
        )?);
        prof.prof("setup", "", "", &session);

        let latches = Latches::new();
        let starts_control = cfg.starts_bridge(CONTROL_PUBSUB);

        // bridge bring-up, dependency order
        let mut resolved = cfg.bridges.clone();
        let mut bridges = Vec::new();
        let mut order: Vec<String> = vec![LOG_PUBSUB.to_owned(), CONTROL_PUBSUB.to_owned()];
        order.extend(
            resolved
                .keys()
                .filter(|name| *name != LOG_PUBSUB && *name != CONTROL_PUBSUB)
                .cloned(),
        );
        for name in order {
            let Some(entry) = resolved.get_mut(&name) else {
                continue;
            };
            if entry.is_external() {
                continue;
            }
            let owned = match mode {
                SpawnMode::Worker => {
                    let bridge = match entry.kind {
                        BridgeKind::Pubsub => Bridge::Pubsub(PubSubBridge::start(&name).await?),
                        BridgeKind::Queue => Bridge::Queue(
                            QueueBridge::start(&name, entry.capacity, entry.lossy).await?,
                        ),
                    };
                    OwnedBridge::Task(bridge)
                }
                SpawnMode::Process => {
                    let launch = BridgeLaunchConfig::derive(&name, entry);
                    let handle =
                        supervisor::spawn_bridge(&launch, &sandbox.join("cfg"), cfg.startup_timeout)
                            .await?;
                    OwnedBridge::Process(handle)
                }
            };
            entry.addr_in = Some(owned.addr_in().to_owned());
            entry.addr_out = Some(owned.addr_out().to_owned());
            bridges.push(owned);
        }

        // control plane attachments
        let control = resolved
            .get(CONTROL_PUBSUB)
            .ok_or_else(|| pilotflow_config::error::Error::MissingBridge {
                name: CONTROL_PUBSUB.to_owned(),
            })
            .map_err(Error::from)?;
        let (control_in, control_out) = control.addrs(CONTROL_PUBSUB).map_err(Error::from)?;
        let control_pub = Publisher::connect(&control_in).await?;
        let control_sub = Subscriber::connect(&control_out, &[CONTROL_TOPIC]).await?;

        let state = resolved
            .get(STATE_PUBSUB)
            .ok_or_else(|| pilotflow_config::error::Error::MissingBridge {
                name: STATE_PUBSUB.to_owned(),
            })
            .map_err(Error::from)?;
        let (state_in, state_out) = state.addrs(STATE_PUBSUB).map_err(Error::from)?;
        let state_pub = Publisher::connect(&state_in).await?;
        let state_sub = Subscriber::connect(&state_out, &[STATE_TOPIC]).await?;

        let heartbeat = HeartbeatMonitor::new(cfg.heartbeat_timeout);
        let alive = AliveRegistry::default();
        let finals: SharedFinals = Arc::new(Mutex::new(Vec::new()));
        let listener = tokio::spawn(control_listener(
            control_sub,
            cfg.owner.clone(),
            alive.clone(),
            finals.clone(),
            heartbeat.clone(),
            latches.clone(),
        ));

        let units: SharedUnits = Arc::new(Mutex::new(HashMap::new()));
        let state_task = tokio::spawn(track_states(state_sub, units.clone(), latches.clone()));

        // the heart: us, unless the configuration names somebody else
        let is_heart = cfg.heart.is_none() && starts_control;
        let heart = if is_heart {
            let interval = cfg.heartbeat_interval;
            let sender = cfg.owner.clone();
            let heart_latches = latches.clone();
            let addr = control_in.clone();
            Some(tokio::spawn(async move {
                let Ok(mut publisher) = Publisher::connect(&addr).await else {
                    heart_latches.terminate();
                    return;
                };
                loop {
                    if heart_latches.is_terminated() {
                        break;
                    }
                    let beat = ControlMsg::Heartbeat {
                        sender: sender.clone(),
                    };
                    if publisher.put(CONTROL_TOPIC, &beat).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(interval).await;
                }
            }))
        } else {
            None
        };

        let supervisor = Supervisor::new(latches.clone(), cfg.depth, cfg.startup_timeout, alive);
        let (death_tx, death_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut controller = Self {
            session: session.clone(),
            sandbox: sandbox.clone(),
            latches,
            prof,
            resolved,
            bridges,
            supervisor,
            control_pub,
            state_pub,
            heartbeat,
            is_heart,
            heart,
            listener,
            state_task,
            deaths: death_rx,
            finals,
            units,
            entry: None,
            first_death: None,
            cfg,
        };

        controller.start_components(mode).await?;
        controller.supervisor.start_watcher(death_tx);
        controller.connect_entry().await?;
        controller.prof.prof("start", "", "", &session);
        Ok(controller)
    }

    /// The session id.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// The session sandbox.
    #[must_use]
    pub fn sandbox(&self) -> &std::path::Path {
        &self.sandbox
    }

    /// The resolved bridge address map, as merged into component configs.
    #[must_use]
    pub fn bridge_map(&self) -> &BTreeMap<String, BridgeConfig> {
        &self.resolved
    }

    /// The termination latches of the owned subtree.
    #[must_use]
    pub fn latches(&self) -> &Latches {
        &self.latches
    }

    async fn start_components(&mut self, mode: SpawnMode) -> Result<(), Error> {
        let kinds: Vec<_> = self
            .cfg
            .components
            .iter()
            .map(|(kind, count)| (*kind, *count))
            .collect();
        for (kind, count) in kinds {
            for instance in 0..count {
                let ccfg = ComponentConfig::derive(
                    &self.cfg,
                    &self.session,
                    &self.sandbox,
                    kind,
                    instance,
                    self.resolved.clone(),
                );
                let handle = match mode {
                    SpawnMode::Process => self.supervisor.spawn_process(&ccfg).await?,
                    SpawnMode::Worker => {
                        let uid = ccfg.uid.clone();
                        let latches = self.latches.clone();
                        let handle = self.supervisor.spawn_worker(&uid, move |_hard| async move {
                            let instance = registry::create_component(ccfg, latches)?;
                            component::run(instance).await
                        })?;
                        if !self
                            .supervisor
                            .alive()
                            .wait_for(&uid, self.cfg.startup_timeout)
                            .await
                        {
                            return Err(Error::StartupTimeout {
                                uid,
                                timeout_secs: self.cfg.startup_timeout.as_secs(),
                            });
                        }
                        handle
                    }
                };
                self.supervisor.watch(handle);
            }
        }
        Ok(())
    }

    /// Connects the submission entry point: the queue of the earliest
    /// configured pipeline stage.
    async fn connect_entry(&mut self) -> Result<(), Error> {
        let mut entry: Option<UnitState> = None;
        for kind in self.cfg.components.keys() {
            if let Some(state) = kind.input_state() {
                let better = entry.is_none_or(|e| state.canonical_rank() < e.canonical_rank());
                if better {
                    entry = Some(state);
                }
            }
        }
        let Some(state) = entry else {
            return Ok(());
        };
        let Some(queue) = state.input_queue() else {
            return Ok(());
        };
        let Some(bridge) = self.resolved.get(queue) else {
            return Ok(());
        };
        let (addr_in, _) = bridge.addrs(queue).map_err(Error::from)?;
        self.entry = Some((state, QueuePutter::connect(&addr_in).await?));
        Ok(())
    }

    /// Submits units into the pipeline: each unit moves to the entry
    /// stage's pending state (published on the state topic) and lands on
    /// that stage's input queue.
    pub async fn submit(&mut self, units: Vec<Unit>) -> Result<(), Error> {
        let Some((entry_state, _)) = &self.entry else {
            return Err(Error::Internal {
                details: "no pipeline stage configured to accept submissions".to_owned(),
            });
        };
        let entry_state = *entry_state;
        for mut unit in units {
            if entry_state != UnitState::New {
                unit.state = entry_state;
            }
            self.prof
                .prof("advance", &unit.uid, unit.state.as_str(), "");
            self.state_pub.put(STATE_TOPIC, &unit).await?;
            let _ = self.units.lock().insert(unit.uid.clone(), unit.clone());
            if let Some((_, putter)) = &mut self.entry {
                putter.put(&unit).await?;
            }
        }
        Ok(())
    }

    /// Publishes a `cancel_unit` for the given unit.
    pub async fn cancel_unit(&mut self, uid: &str) -> Result<(), Error> {
        self.control_pub
            .put(
                CONTROL_TOPIC,
                &ControlMsg::CancelUnit {
                    uid: uid.to_owned(),
                },
            )
            .await
            .map_err(Error::from)
    }

    /// The last observed document of a unit, from the state topic.
    #[must_use]
    pub fn unit(&self, uid: &str) -> Option<Unit> {
        self.units.lock().get(uid).cloned()
    }

    /// Waits until the unit reaches `state` (or any terminal state), and
    /// returns its last document; `None` on timeout.
    pub async fn wait_unit(
        &self,
        uid: &str,
        state: UnitState,
        timeout: Duration,
    ) -> Option<Unit> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(unit) = self.unit(uid) {
                if unit.state == state || unit.state.is_final() {
                    return Some(unit);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Runs until something ends the session: a termination request, the
    /// death of a watched subordinate or bridge, or heartbeat loss.
    pub async fn wait(&mut self) -> Outcome {
        loop {
            tokio::select! {
                death = self.deaths.recv() => {
                    if let Some((uid, reason)) = death {
                        tracing::error!(component = %uid, %reason, "subordinate died");
                        self.first_death = Some((uid.clone(), reason.clone()));
                        return Outcome::ComponentDied { uid, reason };
                    }
                }
                () = self.latches.observed() => return Outcome::Terminated,
                () = tokio::time::sleep(WATCH_INTERVAL) => {
                    let dead_bridge = self
                        .bridges
                        .iter_mut()
                        .find_map(|b| b.poll().map(|reason| (b.name().to_owned(), reason)));
                    if let Some((name, reason)) = dead_bridge {
                        self.first_death = Some((name.clone(), reason.clone()));
                        return Outcome::ComponentDied { uid: name, reason };
                    }
                    if !self.is_heart && self.heartbeat.expired() {
                        self.latches.terminate();
                        return Outcome::HeartbeatLost;
                    }
                }
            }
        }
    }

    /// The cascaded shutdown of the owned subtree. Bridges go last.
    pub async fn stop(mut self, timeout: Duration) -> ShutdownReport {
        self.prof.prof("stop", "", "", &self.session);

        // the process-termination signal travels the fabric
        let shutdown = ControlMsg::Shutdown {
            target: TARGET_ALL.to_owned(),
        };
        if let Err(e) = self.control_pub.put(CONTROL_TOPIC, &shutdown).await {
            tracing::debug!(error = %e, "shutdown broadcast failed");
        }
        self.latches.terminate();

        self.supervisor.terminate_all(timeout).await;

        // whatever was still in flight is failed, with the cause recorded;
        // components that already failed their units during the cascade
        // are counted too
        let mut failed_units = Vec::new();
        let in_flight: Vec<Unit> = {
            let units = self.units.lock();
            for unit in units.values() {
                let failed_by_shutdown = unit.state == UnitState::Failed
                    && unit.extension.get("cause").and_then(|v| v.as_str()) == Some("shutdown");
                if failed_by_shutdown {
                    failed_units.push(unit.uid.clone());
                }
            }
            units
                .values()
                .filter(|u| !u.state.is_final())
                .cloned()
                .collect()
        };
        for mut unit in in_flight {
            unit.state = UnitState::Failed;
            unit.annotate_cause("shutdown");
            if let Err(e) = self.state_pub.put(STATE_TOPIC, &unit).await {
                tracing::debug!(uid = %unit.uid, error = %e, "final state publish failed");
            }
            failed_units.push(unit.uid.clone());
            let _ = self.units.lock().insert(unit.uid.clone(), unit);
        }

        if let Some(heart) = self.heart.take() {
            heart.abort();
        }
        self.listener.abort();
        self.state_task.abort();

        // bridges are torn down last, so `final` messages could still flow
        for bridge in &self.bridges {
            bridge.request_stop();
        }
        for bridge in &mut self.bridges {
            bridge.teardown().await;
        }

        self.prof.close();
        ShutdownReport {
            first_death: self.first_death.take(),
            finals: self.finals.lock().clone(),
            failed_units,
        }
    }
}

/// The controller's control listener: collects `alive` and `final`
/// messages, beats the heartbeat monitor, and honors shutdown requests.
async fn control_listener(
    mut sub: Subscriber,
    owner: String,
    alive: AliveRegistry,
    finals: SharedFinals,
    heartbeat: HeartbeatMonitor,
    latches: Latches,
) {
    loop {
        if latches.is_terminated() {
            break;
        }
        match sub.recv_timeout(POLL_INTERVAL).await {
            Ok(Some(envelope)) => match serde_json::from_value::<ControlMsg>(envelope.payload) {
                Ok(ControlMsg::Alive { sender }) => alive.mark(&sender),
                Ok(ControlMsg::Final { sender, cause }) => {
                    if cause.is_some() {
                        tracing::warn!(component = %sender, ?cause, "component reported fatal");
                    }
                    finals.lock().push((sender, cause));
                }
                Ok(ControlMsg::Heartbeat { .. }) => heartbeat.beat(),
                Ok(msg) if msg.is_shutdown_for(&owner) => {
                    latches.terminate();
                    break;
                }
                Ok(_) | Err(_) => {}
            },
            Ok(None) => {}
            Err(_) => {
                latches.terminate();
                break;
            }
        }
    }
}

/// Tracks the last published document of every unit.
async fn track_states(mut sub: Subscriber, units: SharedUnits, latches: Latches) {
    loop {
        if latches.is_terminated() {
            break;
        }
        match sub.recv_timeout(POLL_INTERVAL).await {
            Ok(Some(envelope)) => {
                if let Ok(unit) = serde_json::from_value::<Unit>(envelope.payload) {
                    let mut units = units.lock();
                    // a recorded terminal state never regresses, and a
                    // CANCELED never displaces another terminal state
                    let stale = units.get(&unit.uid).is_some_and(|seen| {
                        seen.state.is_final()
                            && (!unit.state.is_final() || unit.state == UnitState::Canceled)
                    });
                    if !stale {
                        let _ = units.insert(unit.uid.clone(), unit);
                    }
                }
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }
}
