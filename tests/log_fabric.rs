//! Log fabric over real datagram sockets.

mod common;

use common::{Cluster, STANDARD};
use daq_cnc::logfabric::{replay, CncLogger, LogReceiver, LogSinks, Priority};
use daq_cnc::runset::{RunOptions, RUN_LOG_FILE};
use daq_cnc::tasks::MonitorTarget;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_open_close_routes_records() {
    let default = LogReceiver::bind("127.0.0.1:0", None).await.unwrap();
    let live = LogReceiver::bind("127.0.0.1:0", None).await.unwrap();
    let run = LogReceiver::bind("127.0.0.1:0", None).await.unwrap();

    let logger = CncLogger::new("daqcnc");
    let defaults = LogSinks::new(Some(default.sink_addr("127.0.0.1")), None);
    logger.set_default(defaults.clone());
    logger.info("before the run");

    logger.open(LogSinks::new(
        Some(run.sink_addr("127.0.0.1")),
        Some(live.sink_addr("127.0.0.1")),
    ));
    logger.info("during the run");
    logger.send_moni("runstart", &json!({ "run": 12 }), Priority::Its);

    logger.close();
    assert_eq!(logger.current(), defaults);
    logger.info("after the run");

    assert!(eventually(|| default.messages().len() >= 3).await);
    let messages = default.messages();
    assert_eq!(messages[0], "before the run");
    assert_eq!(
        messages[1],
        format!("Reset log to 127.0.0.1:{}", default.local_addr().port())
    );
    assert_eq!(messages[2], "after the run");

    assert!(eventually(|| !run.messages().is_empty()).await);
    assert_eq!(run.messages(), vec!["during the run".to_string()]);

    assert!(eventually(|| !live.records().is_empty()).await);
    let records = live.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].var(), Some("runstart"));
    assert_eq!(records[0].json(), Some(json!({ "run": 12 })));

    // Nothing left to fall back to: a second close clears both sinks.
    logger.close();
    assert!(logger.current().is_empty());
    assert!(logger.default_sinks().is_some());

    logger.reset();
    assert!(logger.default_sinks().is_none());

    for receiver in [default, live, run] {
        receiver.shutdown().await;
    }
}

#[tokio::test]
async fn test_run_logs_reach_the_run_directory() {
    let cluster = Cluster::standard();
    let cnc = &cluster.coordinator;
    let default = LogReceiver::bind("127.0.0.1:0", None).await.unwrap();
    let default_sink = default.sink_addr("127.0.0.1");
    cnc.log_to(default_sink.clone()).await;

    let id = cnc.make_runset(STANDARD, None).unwrap();
    let options = RunOptions {
        monitor_target: MonitorTarget::None,
    };
    cnc.runset_start_run(id, 250, options).await.unwrap();

    // Components log to the run receiver while running.
    let during = cluster.hub.log_sinks();
    let run_sink = during.primary.clone().expect("run sink");
    assert_ne!(run_sink, default_sink);

    let path = cluster
        .spool_dir
        .path()
        .join("daqrun00250")
        .join(RUN_LOG_FILE);
    assert!(
        eventually(|| replay(&path)
            .map(|records| records
                .iter()
                .any(|r| r.body().starts_with("Starting run 250")))
            .unwrap_or(false))
        .await
    );

    cnc.runset_stop_run(id).await.unwrap();
    for mock in cluster.mocks() {
        assert_eq!(mock.log_sinks().primary, Some(default_sink.clone()));
    }

    let reset_line = format!("Reset log to {}", default_sink);
    assert!(eventually(|| default.messages().contains(&reset_line)).await);

    cnc.runset_break(id).await.unwrap();
    default.shutdown().await;
}
