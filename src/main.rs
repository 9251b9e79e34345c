// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! The PilotFlow runtime binary.
//!
//! `pf_runtime run` brings up a controller tree from a session
//! configuration file and drives it until termination. The hidden
//! `component` and `bridge` subcommands are the exec-on-spawn entry
//! points used by the controller side: one process per component
//! (configured through a JSON file carrying the resolved bridge address
//! map) and one process per controller-started bridge (which advertises
//! its bound endpoints as a single JSON line on stdout).
//!
//! Exit codes: 0 on normal termination, 1 on uncaught failure, 130 on
//! external interrupt.

use clap::{Parser, Subcommand};
use pilotflow_config::{BridgeAddrs, BridgeKind, BridgeLaunchConfig, ComponentConfig, ControllerConfig};
use pilotflow_engine::{component, registry, Controller, Latches, Outcome, SpawnMode};
use pilotflow_fabric::{Bridge, PubSubBridge, QueueBridge};
use pilotflow_state::Unit;
use tokio::io::AsyncWriteExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Exit code reported after an external interrupt.
const EXIT_INTERRUPT: u8 = 130;

/// Budget for the full termination cascade at shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "pf_runtime", about = "PilotFlow pilot-job runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a controller tree from a session configuration file.
    Run {
        /// The controller configuration (JSON).
        #[arg(long)]
        config: PathBuf,
        /// Units to submit once the tree is up (JSON array).
        #[arg(long)]
        submit: Option<PathBuf>,
    },
    /// Host one component. Used by the supervisor's exec-on-spawn; not
    /// meant to be invoked by hand.
    #[command(hide = true)]
    Component {
        /// The component configuration (JSON).
        #[arg(long)]
        config: PathBuf,
    },
    /// Host one message-fabric bridge. Used by the controller's
    /// exec-on-spawn; not meant to be invoked by hand.
    #[command(hide = true)]
    Bridge {
        /// The bridge launch document (JSON).
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(directive: Option<&str>) {
    let filter = directive
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, submit } => run_controller(&config, submit.as_deref()),
        Command::Component { config } => run_component(&config),
        Command::Bridge { config } => run_bridge(&config),
    }
}

/// Installs the root signal policy: the first SIGTERM/SIGINT trips the
/// latches, a second one forces an immediate exit.
fn install_root_signals(latches: Latches, interrupted: Arc<AtomicBool>) {
    let _ = tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler not installed");
                    return;
                }
            };
        let mut seen = 0u32;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    interrupted.store(true, Ordering::Relaxed);
                }
                _ = sigterm.recv() => {}
            }
            seen += 1;
            if seen > 1 {
                // a second signal during termination forces the exit
                std::process::exit(i32::from(EXIT_INTERRUPT));
            }
            tracing::warn!("termination signal received");
            latches.terminate();
        }
    });
}

fn run_controller(config: &std::path::Path, submit: Option<&std::path::Path>) -> ExitCode {
    let cfg = match ControllerConfig::load(config) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(None);
            tracing::error!(error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cfg.debug.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "runtime construction failed");
            return ExitCode::FAILURE;
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let outcome = runtime.block_on(async {
        let mut controller = Controller::start(cfg, SpawnMode::Process).await?;
        install_root_signals(controller.latches().clone(), interrupted.clone());

        if let Some(path) = submit {
            let text = std::fs::read_to_string(path)?;
            let units: Vec<Unit> =
                serde_json::from_str(&text).map_err(|e| pilotflow_engine::Error::Internal {
                    details: format!("unit file rejected: {e}"),
                })?;
            controller.submit(units).await?;
        }

        let outcome = controller.wait().await;
        let report = controller.stop(STOP_TIMEOUT).await;

        if let Some((uid, reason)) = &report.first_death {
            tracing::error!(component = %uid, %reason, "first failure in the tree");
        }
        for (sender, cause) in &report.finals {
            match cause {
                Some(cause) => tracing::warn!(component = %sender, %cause, "component final"),
                None => tracing::info!(component = %sender, "component final"),
            }
        }
        if !report.failed_units.is_empty() {
            tracing::warn!(
                count = report.failed_units.len(),
                "units still in flight were failed with cause=shutdown"
            );
        }
        Ok::<Outcome, pilotflow_engine::Error>(outcome)
    });

    match outcome {
        Ok(Outcome::Terminated) if interrupted.load(Ordering::Relaxed) => {
            ExitCode::from(EXIT_INTERRUPT)
        }
        Ok(Outcome::Terminated) => ExitCode::SUCCESS,
        Ok(Outcome::ComponentDied { .. } | Outcome::HeartbeatLost) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "controller failed");
            ExitCode::FAILURE
        }
    }
}

fn run_component(config: &std::path::Path) -> ExitCode {
    let cfg = match ComponentConfig::load(config) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(None);
            tracing::error!(error = %e, "component configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cfg.debug.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "runtime construction failed");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let latches = Latches::new();

        // descendants ignore SIGINT: shutdown is parent-driven
        let _ = tokio::spawn(async {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
            }
        });
        install_component_sigterm(latches.clone());

        let instance = registry::create_component(cfg, latches)?;
        component::run(instance).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "component failed");
            ExitCode::FAILURE
        }
    }
}

fn run_bridge(config: &std::path::Path) -> ExitCode {
    let launch = match BridgeLaunchConfig::load(config) {
        Ok(launch) => launch,
        Err(e) => {
            init_tracing(None);
            tracing::error!(error = %e, "bridge launch document rejected");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(None);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "runtime construction failed");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let mut bridge = match launch.kind {
            BridgeKind::Pubsub => Bridge::Pubsub(PubSubBridge::start(&launch.name).await?),
            BridgeKind::Queue => Bridge::Queue(
                QueueBridge::start(&launch.name, launch.capacity, launch.lossy).await?,
            ),
        };

        // advertise the bound endpoints to the spawner, one JSON line
        let addrs = BridgeAddrs {
            addr_in: bridge.addr_in().to_owned(),
            addr_out: bridge.addr_out().to_owned(),
        };
        let line = serde_json::to_string(&addrs).map_err(|e| pilotflow_engine::Error::Internal {
            details: format!("address advertisement failed: {e}"),
        })?;
        let mut out = tokio::io::stdout();
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;

        // shutdown is parent-driven: SIGTERM from the controller, or the
        // parent vanishing underneath us (SIGINT is ignored)
        let _ = tokio::spawn(async {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
            }
        });
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let parent = nix::unistd::getppid();

        let failure = loop {
            tokio::select! {
                _ = sigterm.recv() => break None,
                () = tokio::time::sleep(Duration::from_secs(1)) => {
                    if nix::unistd::getppid() != parent {
                        tracing::warn!(bridge = %launch.name, "parent vanished; shutting down");
                        break None;
                    }
                    if let Some(reason) = bridge.poll() {
                        break Some(reason);
                    }
                }
            }
        };

        bridge.stop();
        bridge.join().await;
        match failure {
            None => Ok(()),
            Some(reason) => Err(pilotflow_engine::Error::Internal { details: reason }),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "bridge failed");
            ExitCode::FAILURE
        }
    }
}

/// SIGTERM in a component only trips the latches; a second one exits.
fn install_component_sigterm(latches: Latches) {
    let _ = tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler not installed");
                    return;
                }
            };
        let mut seen = 0u32;
        while sigterm.recv().await.is_some() {
            seen += 1;
            if seen > 1 {
                std::process::exit(1);
            }
            latches.terminate();
        }
    });
}
