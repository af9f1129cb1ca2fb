//! Run-set lifecycle against an in-process mock cluster.

mod common;

use common::{drain, test_config, Cluster, STANDARD};
use daq_cnc::component::{ComponentState, FlasherSetting};
use daq_cnc::coordinator::CoordinatorEvent;
use daq_cnc::error::{CncError, RpcError};
use daq_cnc::run_number::RunNumberStore;
use daq_cnc::runset::{RunOptions, RunSetState, StopReason, HISTORY_LIMIT};
use daq_cnc::tasks::MonitorTarget;
use serde_json::json;
use std::time::Duration;

fn quiet() -> RunOptions {
    RunOptions {
        monitor_target: MonitorTarget::None,
    }
}

fn flasher(hub: u32) -> FlasherSetting {
    FlasherSetting {
        hub,
        mbid: "0123456789ab".to_string(),
        brightness: 127,
        width: 64,
        delay: 0,
        mask: 0xfff,
        rate: 100,
    }
}

fn runstop_payloads(cluster: &Cluster) -> Vec<serde_json::Value> {
    cluster
        .coordinator
        .logger()
        .buffer()
        .monitor_records("runstop")
        .iter()
        .filter_map(|r| r.json())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_minimal_run() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;

    let id = cnc.make_runset(STANDARD, None).expect("make runset");
    assert_eq!(cnc.runset_state(id).unwrap(), RunSetState::Wired);
    assert!(cnc.list_components().is_empty());

    // Consumers come before producers.
    let members = cnc.runset_list(id).unwrap();
    let order = |name: &str| {
        members
            .iter()
            .find(|m| m.descriptor.name == name)
            .map(|m| m.order)
            .unwrap()
    };
    assert!(order("eventBuilder") < order("inIceTrigger"));
    assert!(order("inIceTrigger") < order("stringHub"));

    let state = cnc.runset_start_run(id, 100, quiet()).await.unwrap();
    assert_eq!(state, RunSetState::Running);
    for mock in cluster.mocks() {
        assert_eq!(mock.state(), ComponentState::Running);
        assert_eq!(mock.run_number(), Some(100));
    }

    let hub_wiring = cluster.hub.wiring();
    assert_eq!(hub_wiring.len(), 1);
    assert_eq!(hub_wiring[0].conn_type, "hit");
    assert_eq!(hub_wiring[0].port, 9001);
    assert_eq!(hub_wiring[0].name, "inIceTrigger");

    tokio::time::sleep(Duration::from_secs(5)).await;
    let state = cnc.runset_stop_run(id).await.unwrap();
    assert_eq!(state, RunSetState::Ready);

    let snapshot = cnc.runset_snapshot(id).unwrap();
    let expected = [
        RunSetState::Wired,
        RunSetState::Connecting,
        RunSetState::Connected,
        RunSetState::Configuring,
        RunSetState::Ready,
        RunSetState::Starting,
        RunSetState::Running,
        RunSetState::Stopping,
        RunSetState::Stopped,
        RunSetState::Ready,
    ];
    assert_eq!(snapshot.history, expected);

    let runstop = runstop_payloads(&cluster);
    assert_eq!(runstop.len(), 1);
    assert_eq!(runstop[0]["run"], json!(100));
    assert_eq!(runstop[0]["events"], json!(0));
    assert_eq!(runstop[0]["status"], json!("SUCCESS"));

    let run_log = cluster
        .spool_dir
        .path()
        .join("daqrun00100")
        .join(daq_cnc::runset::RUN_LOG_FILE);
    assert!(run_log.exists());

    let report = cnc.runset_break(id).await.unwrap();
    assert_eq!(report.returned.len(), 3);
    assert!(report.quarantined.is_empty());
    assert_eq!(cnc.list_components().len(), 3);
    assert!(cnc.census().is_conserved());
    for mock in cluster.mocks() {
        assert_eq!(mock.state(), ComponentState::Idle);
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_component_leaves_registry_untouched() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    cnc.unregister_component(cluster.ids[2]);

    let err = cnc.make_runset(STANDARD, None).unwrap_err();
    match err {
        CncError::IncompleteRunSet { missing } => assert_eq!(missing, vec!["eventBuilder"]),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(cnc.list_components().len(), 2);
    assert!(cnc.runset_list_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_bad_state_mid_start_resets_everyone() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    let mut events = cluster.events();
    cluster.builder.fail_with(
        "startRun",
        RpcError::Remote {
            code: "BadState".to_string(),
            message: "not ready".to_string(),
            data: Some(json!({ "expected": "ready", "actual": "error" })),
        },
    );

    let id = cnc.make_runset(STANDARD, None).unwrap();
    let err = cnc.runset_start_run(id, 7, quiet()).await.unwrap_err();
    assert!(matches!(err, CncError::BadState { .. }), "got {}", err);
    assert_eq!(err.component(), Some(cluster.ids[2]));
    assert_eq!(cnc.runset_state(id).unwrap(), RunSetState::Error);

    // The builder is first in start order, so nobody else got started.
    assert_eq!(cluster.hub.call_count("startRun"), 0);
    for mock in cluster.mocks() {
        assert_eq!(mock.state(), ComponentState::Idle);
        assert_eq!(mock.call_count("reset"), 1);
    }

    let failures = cnc.logger().buffer().monitor_records("cncError");
    assert_eq!(failures.len(), 1);
    let failure = failures[0].json().unwrap();
    assert_eq!(failure["kind"], json!("BadState"));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::Failure { kind, .. } if kind == "BadState")));

    let report = cnc.runset_break(id).await.unwrap();
    assert_eq!(report.returned.len(), 3);
    assert!(cnc.census().is_conserved());
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_reports_no_runstart() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    cluster.hub.fail_with(
        "startRun",
        RpcError::Remote {
            code: "BadState".to_string(),
            message: "not ready".to_string(),
            data: Some(json!({ "expected": "ready", "actual": "error" })),
        },
    );

    let id = cnc.make_runset(STANDARD, None).unwrap();
    cnc.runset_start_run(id, 8, quiet()).await.unwrap_err();
    assert_eq!(cnc.runset_state(id).unwrap(), RunSetState::Error);

    assert!(cnc.logger().buffer().monitor_records("runstart").is_empty());
    let runstop = runstop_payloads(&cluster);
    assert_eq!(runstop.len(), 1);
    assert_eq!(runstop[0]["run"], json!(8));
    assert_eq!(runstop[0]["status"], json!("FAIL"));
    assert_eq!(runstop[0]["reason"], json!("failure: BadState"));
}

#[tokio::test(start_paused = true)]
async fn test_closed_connection_is_unreachable() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    cluster.trigger.fail_with("startRun", RpcError::Closed);

    let id = cnc.make_runset(STANDARD, None).unwrap();
    let err = cnc.runset_start_run(id, 9, quiet()).await.unwrap_err();
    match &err {
        CncError::Unreachable { id: failed, .. } => assert_eq!(*failed, cluster.ids[1]),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(cnc.runset_state(id).unwrap(), RunSetState::Error);

    // Builder started before the trigger failed; the hub never did.
    assert_eq!(cluster.builder.call_count("startRun"), 1);
    assert_eq!(cluster.hub.call_count("startRun"), 0);
    for mock in cluster.mocks() {
        assert_eq!(mock.state(), ComponentState::Idle);
        assert_eq!(mock.call_count("reset"), 1);
    }

    let failures = cnc.logger().buffer().monitor_records("cncError");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].json().unwrap()["kind"], json!("Unreachable"));
}

#[tokio::test(start_paused = true)]
async fn test_reset_failure_quarantines() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    let mut events = cluster.events();

    let id = cnc.make_runset(STANDARD, None).unwrap();
    cnc.runset_start_run(id, 11, quiet()).await.unwrap();
    cnc.runset_stop_run(id).await.unwrap();

    cluster.hub.refuse_reset();
    let report = cnc.runset_break(id).await.unwrap();
    assert_eq!(report.quarantined, vec![cluster.ids[0]]);
    assert_eq!(report.returned.len(), 2);

    let cycle = drain(&mut events).into_iter().find_map(|e| match e {
        CoordinatorEvent::CycleRequest { components, .. } => Some(components),
        _ => None,
    });
    let cycle = cycle.expect("cycle request");
    assert_eq!(cycle.len(), 1);
    assert_eq!(cycle[0].name, "stringHub");
    assert_eq!(cnc.logger().buffer().monitor_records("cycleRequest").len(), 1);

    let census = cnc.census();
    assert_eq!(census.quarantined, 1);
    assert_eq!(census.free, 2);
    assert!(census.is_conserved());
    assert!(cnc
        .list_components()
        .iter()
        .all(|c| c.descriptor.name != "stringHub"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_start_is_guarded() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    let id = cnc.make_runset(STANDARD, None).unwrap();

    assert_eq!(cnc.runset_stop_run(id).await.unwrap(), RunSetState::Wired);

    cnc.runset_start_run(id, 1, quiet()).await.unwrap();
    let err = cnc.runset_start_run(id, 2, quiet()).await.unwrap_err();
    assert!(matches!(err, CncError::InvalidTransition { .. }));
    assert_eq!(cnc.runset_state(id).unwrap(), RunSetState::Running);

    assert_eq!(cnc.runset_stop_run(id).await.unwrap(), RunSetState::Ready);
    assert_eq!(cnc.runset_stop_run(id).await.unwrap(), RunSetState::Ready);
    assert_eq!(cluster.hub.call_count("stopRun"), 1);

    // A second run skips connect and configure.
    cnc.runset_start_run(id, 2, quiet()).await.unwrap();
    assert_eq!(cluster.hub.call_count("connect"), 1);
    assert_eq!(cluster.hub.call_count("startRun"), 2);
    cnc.runset_stop_run(id).await.unwrap();
    cnc.runset_break(id).await.unwrap();

    assert!(matches!(
        cnc.runset_break(id).await,
        Err(CncError::NotFound(_))
    ));
    assert!(matches!(cnc.runset_state(id), Err(CncError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_start_and_stop_are_serialized() {
    let cluster = Cluster::standard();
    cluster.trigger.configure_slowly(5);
    let id = cluster.coordinator.make_runset(STANDARD, None).unwrap();

    let cnc = cluster.coordinator.clone();
    let start = tokio::spawn(async move { cnc.runset_start_run(id, 21, quiet()).await });
    assert!(
        cluster
            .wait_for(id, RunSetState::Configuring, Duration::from_secs(1))
            .await
    );
    let cnc = cluster.coordinator.clone();
    let stop = tokio::spawn(async move { cnc.runset_stop_run(id).await });

    // The stop waits for the whole start instead of seeing it half done.
    assert_eq!(start.await.unwrap().unwrap(), RunSetState::Running);
    assert_eq!(stop.await.unwrap().unwrap(), RunSetState::Ready);

    let history = cluster.coordinator.runset_snapshot(id).unwrap().history;
    let expected = [
        RunSetState::Wired,
        RunSetState::Connecting,
        RunSetState::Connected,
        RunSetState::Configuring,
        RunSetState::Ready,
        RunSetState::Starting,
        RunSetState::Running,
        RunSetState::Stopping,
        RunSetState::Stopped,
        RunSetState::Ready,
    ];
    assert_eq!(history, expected);
    for mock in cluster.mocks() {
        assert_eq!(mock.call_count("startRun"), 1);
        assert_eq!(mock.state(), ComponentState::Ready);
    }
}

#[tokio::test(start_paused = true)]
async fn test_history_is_bounded() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    let id = cnc.make_runset(STANDARD, None).unwrap();

    for run in 1..=30 {
        cnc.runset_start_run(id, run, quiet()).await.unwrap();
        cnc.runset_stop_run(id).await.unwrap();
    }
    let history = cnc.runset_snapshot(id).unwrap().history;
    assert_eq!(history.len(), HISTORY_LIMIT);
    assert_eq!(history.last(), Some(&RunSetState::Ready));
    assert!(!history.contains(&RunSetState::Connecting));
}

#[tokio::test(start_paused = true)]
async fn test_hung_stop_is_forced() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    let id = cnc.make_runset(STANDARD, None).unwrap();
    cnc.runset_start_run(id, 5, quiet()).await.unwrap();

    cluster.builder.hang_on_stop();
    let state = cnc.runset_stop_run(id).await.unwrap();
    assert_eq!(state, RunSetState::Ready);
    assert_eq!(cluster.builder.call_count("forcedStop"), 1);
    assert_eq!(cluster.hub.call_count("forcedStop"), 0);

    let history = cnc.runset_snapshot(id).unwrap().history;
    assert!(history.contains(&RunSetState::ForcingStop));
    assert_eq!(history.last(), Some(&RunSetState::Ready));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    cluster.hub.fail_transiently("connect", 2);

    let id = cnc.make_runset(STANDARD, None).unwrap();
    cnc.runset_start_run(id, 3, quiet()).await.unwrap();
    assert_eq!(cluster.hub.call_count("connect"), 3);
    assert_eq!(cnc.runset_state(id).unwrap(), RunSetState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_slow_configure_is_polled() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    cluster.trigger.configure_slowly(3);

    let id = cnc.make_runset(STANDARD, None).unwrap();
    cnc.runset_start_run(id, 4, quiet()).await.unwrap();
    assert!(cluster.trigger.call_count("getState") >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_configure_timeout_fails_the_start() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    cluster.trigger.configure_slowly(10_000);

    let id = cnc.make_runset(STANDARD, None).unwrap();
    let err = cnc.runset_start_run(id, 4, quiet()).await.unwrap_err();
    assert!(matches!(err, CncError::Timeout { .. }), "got {}", err);
    assert_eq!(err.component(), Some(cluster.ids[1]));
    assert_eq!(cnc.runset_state(id).unwrap(), RunSetState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_break_cancels_a_start_in_flight() {
    let cluster = Cluster::standard();
    cluster.trigger.configure_slowly(10_000);
    let id = cluster.coordinator.make_runset(STANDARD, None).unwrap();

    let cnc = cluster.coordinator.clone();
    let start = tokio::spawn(async move { cnc.runset_start_run(id, 9, quiet()).await });
    assert!(
        cluster
            .wait_for(id, RunSetState::Configuring, Duration::from_secs(1))
            .await
    );

    let report = cluster.coordinator.runset_break(id).await.unwrap();
    assert_eq!(report.returned.len(), 3);
    let result = start.await.unwrap();
    assert!(matches!(result, Err(CncError::Cancelled)));
    for mock in cluster.mocks() {
        assert_eq!(mock.state(), ComponentState::Idle);
    }
    assert!(cluster.coordinator.census().is_conserved());
}

#[tokio::test(start_paused = true)]
async fn test_flasher_subruns() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    let id = cnc.make_runset(STANDARD, None).unwrap();

    let err = cnc.runset_subrun(id, vec![flasher(1)]).await.unwrap_err();
    assert!(matches!(err, CncError::InvalidTransition { .. }));

    cnc.runset_start_run(id, 100, quiet()).await.unwrap();
    let subrun = cnc.runset_subrun(id, vec![flasher(1)]).await.unwrap();
    assert_eq!(subrun, 1);
    assert_eq!(cluster.hub.flasher_settings(), vec![flasher(1)]);
    assert_eq!(cluster.builder.subruns(), vec![1]);

    let subrun = cnc
        .flash(id, vec![flasher(1)], Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(subrun, 2);
    assert!(cluster.hub.flasher_settings().is_empty());
    assert_eq!(cluster.builder.subruns(), vec![1, 2, 3]);
    assert_eq!(cnc.runset_state(id).unwrap(), RunSetState::Running);

    cluster
        .builder
        .set_bean("backEnd", "NumEvents", json!(1234));
    cnc.runset_stop_run(id).await.unwrap();
    let runstop = runstop_payloads(&cluster);
    assert_eq!(runstop[0]["events"], json!(1234));

    let store = RunNumberStore::new(cluster.config_dir.path().join(".run_number"));
    assert_eq!(store.load().unwrap(), (100, 3));
    assert_eq!(cnc.next_run_number().unwrap(), 101);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_stops_an_unhealthy_run() {
    let mut config = test_config();
    config.tasks.watchdog_secs = 10;
    config.tasks.watchdog_threshold = 3;
    let cluster = Cluster::with_config(config);
    let cnc = &cluster.coordinator;
    let mut events = cluster.events();

    let id = cnc.make_runset(STANDARD, None).unwrap();
    cnc.runset_start_run(id, 42, RunOptions::default())
        .await
        .unwrap();
    cluster
        .builder
        .set_bean("backEnd", "DiskAvailable", json!(0));

    assert!(
        cluster
            .wait_for(id, RunSetState::Ready, Duration::from_secs(120))
            .await
    );

    let buffer = cnc.logger().buffer();
    assert!(buffer.contains("Watchdog reports threshold components"));
    assert!(buffer.contains("Run is unhealthy (2 checks left)"));
    assert!(buffer.contains("Run is unhealthy (1 checks left)"));

    let runstop = runstop_payloads(&cluster);
    assert_eq!(runstop.len(), 1);
    assert_eq!(runstop[0]["reason"], json!("watchdog"));
    assert_eq!(runstop[0]["status"], json!("FAIL"));

    let stopped = drain(&mut events).into_iter().find_map(|e| match e {
        CoordinatorEvent::RunStopped { reason, .. } => Some(reason),
        _ => None,
    });
    assert_eq!(stopped, Some(StopReason::Watchdog));
}
