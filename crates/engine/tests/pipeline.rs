// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline scenarios over a real fabric, with all components
//! running as in-process workers.

use pilotflow_config::{BridgeConfig, ComponentKind, ControllerConfig};
use pilotflow_engine::{Controller, Outcome, SpawnMode};
use pilotflow_fabric::Subscriber;
use pilotflow_state::{
    StagingAction, StagingDirective, StagingFlags, Unit, UnitDescription, UnitState,
    CONTROL_PUBSUB, LOG_PUBSUB, STATE_PUBSUB, STATE_TOPIC,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

fn tree_config(dir: &Path, session: &str) -> ControllerConfig {
    let mut bridges = BTreeMap::new();
    let _ = bridges.insert(LOG_PUBSUB.to_owned(), BridgeConfig::pubsub());
    let _ = bridges.insert(CONTROL_PUBSUB.to_owned(), BridgeConfig::pubsub());

    let mut components = BTreeMap::new();
    let _ = components.insert(ComponentKind::UmgrStagingInput, 1);
    let _ = components.insert(ComponentKind::Scheduler, 1);
    let _ = components.insert(ComponentKind::Executing, 1);
    let _ = components.insert(ComponentKind::AgentStagingOutput, 1);
    let _ = components.insert(ComponentKind::UmgrStagingOutput, 1);

    ControllerConfig {
        owner: "pmgr.0000".to_owned(),
        session: Some(session.to_owned()),
        bridges,
        heart: None,
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(30),
        startup_timeout: Duration::from_secs(30),
        components,
        depth: 0,
        debug: None,
        sandbox: Some(dir.to_path_buf()),
        staging_area: None,
        staging_scheme: "staging".to_owned(),
        pilots: vec![],
    }
}

async fn state_listener(controller: &Controller) -> Subscriber {
    let (_, addr_out) = controller.bridge_map()[STATE_PUBSUB]
        .addrs(STATE_PUBSUB)
        .unwrap();
    Subscriber::connect(&addr_out, &[STATE_TOPIC]).await.unwrap()
}

fn echo_unit(uid: &str) -> Unit {
    Unit::new(
        uid,
        UnitDescription {
            executable: "/bin/echo".to_owned(),
            arguments: vec!["hi".to_owned()],
            ..UnitDescription::default()
        },
    )
}

fn sleep_unit(uid: &str, seconds: u32) -> Unit {
    Unit::new(
        uid,
        UnitDescription {
            executable: "/bin/sleep".to_owned(),
            arguments: vec![seconds.to_string()],
            ..UnitDescription::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_reaches_done_with_monotonic_states() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tree_config(dir.path(), "session.happy");
    let mut controller = Controller::start(cfg, SpawnMode::Worker).await.unwrap();
    let mut states = state_listener(&controller).await;

    controller.submit(vec![echo_unit("unit.000000")]).await.unwrap();

    let done = controller
        .wait_unit("unit.000000", UnitState::Done, Duration::from_secs(30))
        .await
        .expect("unit should finish");
    assert_eq!(done.state, UnitState::Done);
    assert_eq!(done.stdout, "hi\n");
    assert_eq!(done.exit_code, Some(0));

    // published state sequence is monotonic in the canonical order and
    // ends in DONE
    let mut sequence = Vec::new();
    while let Ok(Some(envelope)) = states.recv_timeout(Duration::from_millis(500)).await {
        let unit: Unit = serde_json::from_value(envelope.payload).unwrap();
        if unit.uid == "unit.000000" {
            sequence.push(unit.state);
        }
    }
    assert!(!sequence.is_empty());
    for pair in sequence.windows(2) {
        assert!(
            pair[0].canonical_rank() <= pair[1].canonical_rank(),
            "backward transition published: {} -> {}",
            pair[0],
            pair[1]
        );
    }
    assert_eq!(*sequence.last().unwrap(), UnitState::Done);

    let report = controller.stop(Duration::from_secs(20)).await;
    assert!(report.failed_units.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn staging_failure_fails_the_unit_without_crashing_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tree_config(dir.path(), "session.stagefail");
    let mut controller = Controller::start(cfg, SpawnMode::Worker).await.unwrap();

    let mut unit = echo_unit("unit.000001");
    unit.description.input_staging = vec![StagingDirective {
        action: StagingAction::Copy,
        source: "/does/not/exist".to_owned(),
        target: "in.txt".to_owned(),
        flags: StagingFlags::empty(),
    }];
    controller.submit(vec![unit]).await.unwrap();

    let failed = controller
        .wait_unit("unit.000001", UnitState::Failed, Duration::from_secs(30))
        .await
        .expect("unit should fail");
    assert_eq!(failed.state, UnitState::Failed);
    assert_eq!(failed.stdout, "");

    // the tree survives the unit failure: another unit still runs through
    controller.submit(vec![echo_unit("unit.000002")]).await.unwrap();
    let done = controller
        .wait_unit("unit.000002", UnitState::Done, Duration::from_secs(30))
        .await
        .expect("second unit should finish");
    assert_eq!(done.state, UnitState::Done);

    let _ = controller.stop(Duration::from_secs(20)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_kills_the_running_command() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tree_config(dir.path(), "session.cancel");
    let mut controller = Controller::start(cfg, SpawnMode::Worker).await.unwrap();

    controller.submit(vec![sleep_unit("unit.000003", 60)]).await.unwrap();
    let executing = controller
        .wait_unit("unit.000003", UnitState::Executing, Duration::from_secs(30))
        .await
        .expect("unit should start executing");
    assert_eq!(executing.state, UnitState::Executing);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let cancelled_at = std::time::Instant::now();
    controller.cancel_unit("unit.000003").await.unwrap();

    let canceled = controller
        .wait_unit("unit.000003", UnitState::Canceled, Duration::from_secs(15))
        .await
        .expect("unit should cancel");
    assert_eq!(canceled.state, UnitState::Canceled);
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(5),
        "the external process must be killed within five seconds"
    );

    let _ = controller.stop(Duration::from_secs(20)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heartbeat_loss_terminates_every_descendant() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = tree_config(dir.path(), "session.silent");
    // somebody else is nominally the heart, and never beats
    cfg.heart = Some("phantom.heart".to_owned());
    cfg.heartbeat_interval = Duration::from_secs(1);
    cfg.heartbeat_timeout = Duration::from_secs(2);
    let mut components = BTreeMap::new();
    let _ = components.insert(ComponentKind::Executing, 1);
    cfg.components = components;

    let started = std::time::Instant::now();
    let mut controller = Controller::start(cfg, SpawnMode::Worker).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), controller.wait())
        .await
        .expect("heartbeat loss must be detected");
    assert!(matches!(
        outcome,
        Outcome::HeartbeatLost | Outcome::ComponentDied { .. }
    ));
    // heartbeat_timeout plus two poll intervals, with scheduling slack
    assert!(started.elapsed() < Duration::from_secs(5));

    let _ = controller.stop(Duration::from_secs(10)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_fails_in_flight_units() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tree_config(dir.path(), "session.shutdown");
    let mut controller = Controller::start(cfg, SpawnMode::Worker).await.unwrap();

    controller.submit(vec![sleep_unit("unit.000004", 60)]).await.unwrap();
    let _ = controller
        .wait_unit("unit.000004", UnitState::Executing, Duration::from_secs(30))
        .await
        .expect("unit should start executing");

    let report = controller.stop(Duration::from_secs(15)).await;
    assert!(
        report.failed_units.contains(&"unit.000004".to_owned()),
        "in-flight units must be failed with cause=shutdown, got {:?}",
        report.failed_units
    );
}
