//! Coordinator and components talking over real TCP connections.

mod common;

use common::{test_config, STANDARD};
use daq_cnc::component::mock::{MockBus, MockComponent};
use daq_cnc::component::service::ComponentService;
use daq_cnc::component::{
    ComponentClient, ComponentId, ComponentRegistration, ComponentState, Connector,
    RemoteComponent,
};
use daq_cnc::coordinator::{CoordinatorClient, CoordinatorService};
use daq_cnc::env::DaqEnvironment;
use daq_cnc::error::{CncError, StatusCode};
use daq_cnc::rpc::RpcServer;
use daq_cnc::runset::{RunOptions, RunSetState};
use daq_cnc::tasks::MonitorTarget;
use daq_cnc::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Serves `mock` on an ephemeral port and returns the registration that
/// points at it.
async fn serve_mock(mock: Arc<MockComponent>, shutdown: &CancellationToken) -> ComponentRegistration {
    let service = Arc::new(ComponentService::new(
        Arc::clone(&mock) as Arc<dyn ComponentClient>
    ));
    let server = RpcServer::bind("127.0.0.1:0", service).await.unwrap();
    let port = server.local_addr().unwrap().port();
    server.spawn(shutdown.clone());

    let mut registration = mock.registration();
    registration.host = "127.0.0.1".to_string();
    registration.cmd_port = port;
    registration
}

#[tokio::test]
async fn test_remote_component_lifecycle() {
    let shutdown = CancellationToken::new();
    let mock = Arc::new(MockComponent::new(
        "stringHub",
        3,
        vec![Connector::output("hit")],
        MockBus::new(),
    ));
    let registration = serve_mock(Arc::clone(&mock), &shutdown).await;
    let remote = RemoteComponent::new(&registration, Duration::from_secs(2));

    assert_eq!(remote.connect(&[]).await.unwrap(), ComponentState::Connected);
    assert_eq!(remote.configure("standard").await.unwrap(), ComponentState::Ready);
    assert_eq!(remote.start_run(31).await.unwrap(), ComponentState::Running);
    assert_eq!(mock.run_number(), Some(31));

    // Out-of-order commands come back as a structured fault.
    let err = remote.configure("standard").await.unwrap_err();
    let err = CncError::from_rpc(ComponentId(1), "configure", err);
    match err {
        CncError::BadState { expected, actual, .. } => {
            assert_eq!(expected, "connected");
            assert_eq!(actual, "running");
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(remote.stop_run().await.unwrap(), ComponentState::Ready);
    assert_eq!(remote.reset().await.unwrap(), ComponentState::Idle);
    assert_eq!(
        mock.calls(),
        vec!["connect", "configure", "startRun", "configure", "stopRun", "reset"]
    );
    shutdown.cancel();
}

#[tokio::test]
async fn test_coordinator_service_drives_remote_cluster() {
    let shutdown = CancellationToken::new();
    let config_dir = tempfile::tempdir().unwrap();
    let spool_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        config_dir.path().join(format!("{}.toml", STANDARD)),
        "components = [\"stringHub#1\", \"inIceTrigger\", \"eventBuilder\"]\n",
    )
    .unwrap();

    let env = DaqEnvironment::new(config_dir.path(), spool_dir.path()).unwrap();
    let coordinator = Coordinator::new(test_config(), env);
    let service = Arc::new(CoordinatorService::new(coordinator.clone()));
    let server = RpcServer::bind("127.0.0.1:0", service).await.unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn(shutdown.clone());
    let client = CoordinatorClient::new(addr.to_string(), Duration::from_secs(30));

    assert_eq!(client.ping().await.unwrap(), "pong");

    let bus = MockBus::new();
    let mocks = [
        Arc::new(MockComponent::new(
            "stringHub",
            1,
            vec![Connector::output("hit")],
            bus.clone(),
        )),
        Arc::new(MockComponent::new(
            "inIceTrigger",
            0,
            vec![Connector::input("hit", 9001), Connector::output("trig")],
            bus.clone(),
        )),
        Arc::new(MockComponent::new(
            "eventBuilder",
            0,
            vec![Connector::input("trig", 9002)],
            bus,
        )),
    ];
    for mock in &mocks {
        let registration = serve_mock(Arc::clone(mock), &shutdown).await;
        client.register_component(&registration).await.unwrap();
    }
    assert_eq!(client.list_components().await.unwrap().len(), 3);

    let err = client.make_runset("nonexistent", None).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::ConfigError);
    assert_eq!(err.exit_status().code(), 2);

    let id = client.make_runset(STANDARD, None).await.unwrap();
    assert_eq!(client.runset_ids().await.unwrap(), vec![id]);
    assert_eq!(client.state(id).await.unwrap(), RunSetState::Wired);

    let options = RunOptions {
        monitor_target: MonitorTarget::None,
    };
    assert_eq!(
        client.start_run(id, 77, &options).await.unwrap(),
        RunSetState::Running
    );
    for mock in &mocks {
        assert_eq!(mock.run_number(), Some(77));
    }
    let members = client.members(id).await.unwrap();
    assert!(members.iter().all(|m| m.state == ComponentState::Running));

    let err = client.start_run(id, 78, &options).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::InvalidTransition);

    assert_eq!(client.stop_run(id).await.unwrap(), RunSetState::Ready);
    let report = client.break_runset(id).await.unwrap();
    assert_eq!(report.returned.len(), 3);

    let err = client.state(id).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::NotFound);

    let census = client.census().await.unwrap();
    assert_eq!(census.free, 3);
    assert!(census.is_conserved());
    assert_eq!(client.next_run_number().await.unwrap(), 78);

    shutdown.cancel();
}
