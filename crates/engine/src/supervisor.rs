// SPDX-License-Identifier: Apache-2.0

//! Spawning and reaping of subordinates.
//!
//! The supervisor spawns child processes (exec-on-spawn of the runtime
//! binary) and in-process workers (dedicated threads with their own
//! single-threaded runtime), watches their liveness, and guarantees the
//! termination cascade:
//!
//! 1. trip both termination latches;
//! 2. join every subordinate within a per-entity budget, divided by the
//!    hierarchy depth to avoid compounding stalls;
//! 3. on worker timeout, cancel the worker's top-level future and join
//!    again within a short grace window;
//! 4. on process timeout, SIGTERM, grace, SIGKILL, final reap.
//!
//! Nothing here injects exceptions into threads, interrupts the main
//! thread from signal handlers, or leaves detached scheduling units
//! behind. The only hard-kill signals used are SIGTERM and SIGKILL.

use crate::error::Error;
use crate::latch::Latches;
use crate::WATCH_INTERVAL;
use parking_lot::Mutex;
use pilotflow_config::{BridgeAddrs, BridgeLaunchConfig, ComponentConfig};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Waits for a child to exit, bounded by the budget.
async fn wait_child(child: &mut tokio::process::Child, budget: Duration) -> bool {
    tokio::time::timeout(budget, child.wait()).await.is_ok()
}

/// Delivers a signal to a child, if it still has a pid.
fn signal_child(child: &tokio::process::Child, name: &str, signal: nix::sys::signal::Signal) {
    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        tracing::debug!(uid = %name, signal = %signal, error = %e, "kill failed");
    }
}

/// Liveness signals collected from the control topic: which components
/// have reported `alive` so far.
#[derive(Debug, Clone, Default)]
pub struct AliveRegistry {
    seen: Arc<Mutex<HashSet<String>>>,
    notify: Arc<tokio::sync::Notify>,
}

impl AliveRegistry {
    /// Records an `alive` message from `uid`.
    pub fn mark(&self, uid: &str) {
        let _ = self.seen.lock().insert(uid.to_owned());
        self.notify.notify_waiters();
    }

    /// Waits until `uid` has signalled liveness, bounded by `timeout`.
    pub async fn wait_for(&self, uid: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.seen.lock().contains(uid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return self.seen.lock().contains(uid);
                }
            }
        }
    }
}

/// A watched child process.
#[derive(Debug)]
pub struct ProcessHandle {
    /// The component uid the process hosts.
    pub uid: String,
    child: tokio::process::Child,
    reported: bool,
}

impl ProcessHandle {
    fn poll_death(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(format!("process exited: {status}")),
            Ok(None) => None,
            Err(e) => Some(format!("process unreachable: {e}")),
        }
    }

    async fn wait_within(&mut self, budget: Duration) -> bool {
        wait_child(&mut self.child, budget).await
    }

    fn signal(&self, signal: nix::sys::signal::Signal) {
        signal_child(&self.child, &self.uid, signal);
    }
}

/// A bridge running as its own OS process, spawned through the `bridge`
/// entry point of the runtime binary.
#[derive(Debug)]
pub struct BridgeProcessHandle {
    /// The bridge name.
    pub name: String,
    /// Ingress address the child advertised.
    pub addr_in: String,
    /// Egress address the child advertised.
    pub addr_out: String,
    child: tokio::process::Child,
}

impl BridgeProcessHandle {
    /// Liveness probe: `None` while the child runs.
    #[must_use]
    pub fn poll(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(format!("bridge process exited: {status}")),
            Ok(None) => None,
            Err(e) => Some(format!("bridge process unreachable: {e}")),
        }
    }

    /// Asks the child to stop (SIGTERM).
    pub fn terminate(&self) {
        signal_child(&self.child, &self.name, nix::sys::signal::Signal::SIGTERM);
    }

    /// Reaps the child: waits out the grace window, then SIGKILL.
    pub async fn reap(&mut self, grace: Duration) {
        if !wait_child(&mut self.child, grace).await {
            tracing::warn!(bridge = %self.name, "grace lapsed; sending SIGKILL");
            signal_child(&self.child, &self.name, nix::sys::signal::Signal::SIGKILL);
            let _ = wait_child(&mut self.child, grace).await;
        }
    }
}

/// Spawns a bridge child process and waits until it advertises its bound
/// endpoints on stdout. A child that stays silent past the startup
/// timeout is killed.
pub async fn spawn_bridge(
    launch: &BridgeLaunchConfig,
    cfg_dir: &Path,
    startup_timeout: Duration,
) -> Result<BridgeProcessHandle, Error> {
    std::fs::create_dir_all(cfg_dir)?;
    let cfg_path = cfg_dir.join(format!("{}.bridge.json", launch.name));
    launch.store(&cfg_path)?;

    let exe = std::env::current_exe().map_err(|e| Error::Spawn {
        uid: launch.name.clone(),
        details: e.to_string(),
    })?;
    let mut child = tokio::process::Command::new(exe)
        .arg("bridge")
        .arg("--config")
        .arg(&cfg_path)
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Spawn {
            uid: launch.name.clone(),
            details: e.to_string(),
        })?;

    let stdout = child.stdout.take().ok_or_else(|| Error::Spawn {
        uid: launch.name.clone(),
        details: "no stdout pipe on the bridge child".to_owned(),
    })?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();
    let advertised = tokio::time::timeout(startup_timeout, lines.next_line()).await;

    match advertised {
        Ok(Ok(Some(line))) => match serde_json::from_str::<BridgeAddrs>(&line) {
            Ok(addrs) => Ok(BridgeProcessHandle {
                name: launch.name.clone(),
                addr_in: addrs.addr_in,
                addr_out: addrs.addr_out,
                child,
            }),
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(Error::Spawn {
                    uid: launch.name.clone(),
                    details: format!("malformed address advertisement: {e}"),
                })
            }
        },
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(Error::StartupTimeout {
                uid: launch.name.clone(),
                timeout_secs: startup_timeout.as_secs(),
            })
        }
        Ok(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(Error::Spawn {
                uid: launch.name.clone(),
                details: "bridge exited before advertising its endpoints".to_owned(),
            })
        }
    }
}

/// A watched in-process worker.
#[derive(Debug)]
pub struct WorkerHandle {
    /// The worker name (doubles as its thread name).
    pub uid: String,
    hard_cancel: CancellationToken,
    thread: Option<std::thread::JoinHandle<Result<(), Error>>>,
    reported: bool,
}

impl WorkerHandle {
    fn poll_death(&self) -> Option<String> {
        self.thread
            .as_ref()
            .is_none_or(std::thread::JoinHandle::is_finished)
            .then(|| "worker exited".to_owned())
    }

    async fn join_within(&mut self, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if self
                .thread
                .as_ref()
                .is_none_or(std::thread::JoinHandle::is_finished)
            {
                if let Some(thread) = self.thread.take() {
                    match thread.join() {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!(worker = %self.uid, error = %e, "worker finished with error")
                        }
                        Err(_) => tracing::warn!(worker = %self.uid, "worker panicked"),
                    }
                }
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// One watched subordinate.
#[derive(Debug)]
pub enum Handle {
    /// A child process.
    Process(ProcessHandle),
    /// An in-process worker.
    Worker(WorkerHandle),
}

impl Handle {
    /// The uid of the subordinate.
    #[must_use]
    pub fn uid(&self) -> &str {
        match self {
            Handle::Process(p) => &p.uid,
            Handle::Worker(w) => &w.uid,
        }
    }

    fn poll_death_once(&mut self) -> Option<String> {
        let (reported, death) = match self {
            Handle::Process(p) => {
                let death = p.poll_death();
                (&mut p.reported, death)
            }
            Handle::Worker(w) => {
                let death = w.poll_death();
                (&mut w.reported, death)
            }
        };
        if *reported {
            return None;
        }
        if death.is_some() {
            *reported = true;
        }
        death
    }
}

/// Death events reported by the watcher: `(uid, reason)`.
pub type DeathSender = tokio::sync::mpsc::UnboundedSender<(String, String)>;

/// Spawns and reaps subordinate processes and workers.
pub struct Supervisor {
    latches: Latches,
    depth: u32,
    startup_timeout: Duration,
    alive: AliveRegistry,
    watched: Arc<Mutex<Vec<Handle>>>,
    watcher: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// A supervisor for one controller's subtree.
    #[must_use]
    pub fn new(
        latches: Latches,
        depth: u32,
        startup_timeout: Duration,
        alive: AliveRegistry,
    ) -> Self {
        Self {
            latches,
            depth,
            startup_timeout,
            alive,
            watched: Arc::new(Mutex::new(Vec::new())),
            watcher: None,
        }
    }

    /// The alive registry fed by the owner's control listener.
    #[must_use]
    pub fn alive(&self) -> &AliveRegistry {
        &self.alive
    }

    /// Spawns a new OS process running the component entry point of the
    /// runtime binary, and waits until the child has signalled liveness.
    /// A child that stays silent past the startup timeout is killed.
    pub async fn spawn_process(&self, cfg: &ComponentConfig) -> Result<Handle, Error> {
        let cfg_path = self.store_config(cfg)?;
        let exe = std::env::current_exe().map_err(|e| Error::Spawn {
            uid: cfg.uid.clone(),
            details: e.to_string(),
        })?;
        let child = tokio::process::Command::new(exe)
            .arg("component")
            .arg("--config")
            .arg(&cfg_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn {
                uid: cfg.uid.clone(),
                details: e.to_string(),
            })?;
        let mut handle = ProcessHandle {
            uid: cfg.uid.clone(),
            child,
            reported: false,
        };

        if !self.alive.wait_for(&cfg.uid, self.startup_timeout).await {
            let _ = handle.child.start_kill();
            let _ = handle.child.wait().await;
            return Err(Error::StartupTimeout {
                uid: cfg.uid.clone(),
                timeout_secs: self.startup_timeout.as_secs(),
            });
        }
        Ok(Handle::Process(handle))
    }

    /// Starts an in-process worker on a dedicated named thread with a
    /// single-threaded runtime. The factory receives a cancellation token
    /// that trips only when the supervisor hard-cancels the worker after
    /// its join budget; cooperative termination goes through the latches.
    pub fn spawn_worker<F, Fut>(&self, name: &str, factory: F) -> Result<Handle, Error>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + 'static,
    {
        let hard_cancel = CancellationToken::new();
        let token = hard_cancel.clone();
        let worker_name = name.to_owned();
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| Error::Spawn {
                        uid: worker_name.clone(),
                        details: e.to_string(),
                    })?;
                let local = tokio::task::LocalSet::new();
                rt.block_on(local.run_until(async {
                    let work = factory(token.clone());
                    tokio::select! {
                        () = token.cancelled() => Err(Error::WorkerCancelled { name: worker_name }),
                        result = work => result,
                    }
                }))
            })
            .map_err(|e| Error::Spawn {
                uid: name.to_owned(),
                details: e.to_string(),
            })?;

        Ok(Handle::Worker(WorkerHandle {
            uid: name.to_owned(),
            hard_cancel,
            thread: Some(thread),
            reported: false,
        }))
    }

    /// Adds a handle to the watched set.
    pub fn watch(&self, handle: Handle) {
        self.watched.lock().push(handle);
    }

    /// Starts the watcher: polls every watched handle at a steady cadence
    /// and reports each death once.
    pub fn start_watcher(&mut self, deaths: DeathSender) {
        let watched = self.watched.clone();
        let latches = self.latches.clone();
        self.watcher = Some(tokio::spawn(async move {
            loop {
                if latches.is_terminated() {
                    break;
                }
                {
                    let mut handles = watched.lock();
                    for handle in handles.iter_mut() {
                        if let Some(reason) = handle.poll_death_once() {
                            let _ = deaths.send((handle.uid().to_owned(), reason));
                        }
                    }
                }
                tokio::time::sleep(WATCH_INTERVAL).await;
            }
        }));
    }

    /// The termination cascade over all watched subordinates.
    ///
    /// The per-entity budget is `timeout` divided by this supervisor's
    /// hierarchy depth plus one, so nested controllers cannot compound
    /// stalls past the caller's budget.
    pub async fn terminate_all(&mut self, timeout: Duration) {
        self.latches.terminate();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }

        let handles: Vec<Handle> = self.watched.lock().drain(..).collect();
        let budget = timeout.div_f64(f64::from(self.depth + 1));
        let grace = budget.min(Duration::from_secs(5));

        for handle in handles {
            match handle {
                Handle::Worker(mut worker) => {
                    if !worker.join_within(budget).await {
                        tracing::warn!(worker = %worker.uid, "join budget lapsed; cancelling");
                        worker.hard_cancel.cancel();
                        if !worker.join_within(grace).await {
                            tracing::error!(worker = %worker.uid, "worker still alive after cancellation");
                        }
                    }
                }
                Handle::Process(mut process) => {
                    if !process.wait_within(budget).await {
                        tracing::warn!(uid = %process.uid, "join budget lapsed; sending SIGTERM");
                        process.signal(nix::sys::signal::Signal::SIGTERM);
                        if !process.wait_within(grace).await {
                            tracing::warn!(uid = %process.uid, "grace lapsed; sending SIGKILL");
                            process.signal(nix::sys::signal::Signal::SIGKILL);
                            let _ = process.wait_within(grace).await;
                        }
                    }
                }
            }
        }
    }

    fn store_config(&self, cfg: &ComponentConfig) -> Result<PathBuf, Error> {
        let dir = cfg.sandbox.join("cfg");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", cfg.uid));
        cfg.store(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> Supervisor {
        Supervisor::new(
            Latches::new(),
            0,
            Duration::from_secs(5),
            AliveRegistry::default(),
        )
    }

    #[tokio::test]
    async fn worker_joins_cooperatively() {
        let mut sup = supervisor();
        let latches = sup.latches.clone();
        let observed = latches.clone();
        let handle = sup
            .spawn_worker("worker.0000", move |_hard| async move {
                observed.observed().await;
                Ok(())
            })
            .unwrap();
        sup.watch(handle);

        latches.terminate();
        sup.terminate_all(Duration::from_secs(5)).await;
        assert!(sup.watched.lock().is_empty());
    }

    #[tokio::test]
    async fn stuck_worker_is_hard_cancelled() {
        let mut sup = supervisor();
        let handle = sup
            .spawn_worker("worker.0001", |_hard| async {
                // ignores the latches entirely; must be cancelled
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .unwrap();
        sup.watch(handle);

        let started = std::time::Instant::now();
        sup.terminate_all(Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn watcher_reports_first_death_once() {
        let mut sup = supervisor();
        let handle = sup
            .spawn_worker("worker.0002", |_hard| async { Ok(()) })
            .unwrap();
        sup.watch(handle);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sup.start_watcher(tx);

        let (uid, _reason) = rx.recv().await.unwrap();
        assert_eq!(uid, "worker.0002");
        // no duplicate report
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err()
        );
        sup.terminate_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn alive_registry_wakes_waiters() {
        let alive = AliveRegistry::default();
        let waiter = alive.clone();
        let task = tokio::spawn(async move {
            waiter.wait_for("executing.0000", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        alive.mark("executing.0000");
        assert!(task.await.unwrap());

        assert!(
            !alive
                .wait_for("executing.0001", Duration::from_millis(100))
                .await
        );
    }
}
