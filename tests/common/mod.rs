//! Shared harness: a coordinator with an in-process mock cluster.

#![allow(dead_code)]

use daq_cnc::component::mock::{MockBus, MockComponent};
use daq_cnc::component::{ComponentClient, ComponentId, Connector};
use daq_cnc::config::CncConfig;
use daq_cnc::coordinator::CoordinatorEvent;
use daq_cnc::env::DaqEnvironment;
use daq_cnc::runset::RunSetState;
use daq_cnc::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Name of the run configuration holding the standard three components.
pub const STANDARD: &str = "standard";

/// Timeouts short enough for tests, periods long enough that tasks stay
/// quiet unless a test asks for them.
pub fn test_config() -> CncConfig {
    let mut config = CncConfig::default();
    config.server.advertise_host = Some("127.0.0.1".to_string());
    config.timeouts.call_ms = 2_000;
    config.timeouts.poll_ms = 100;
    config.timeouts.configure_secs = 5;
    config.timeouts.stop_secs = 5;
    config.timeouts.force_secs = 5;
    config.timeouts.backoff_ms = 10;
    config.runset.tick_ms = 100;
    config.tasks.rate_secs = 3_600;
    config.tasks.active_channels_secs = 3_600;
    config.tasks.monitor_secs = 3_600;
    config.tasks.watchdog_secs = 3_600;
    config.tasks.radar_secs = 3_600;
    config
}

pub struct Cluster {
    pub coordinator: Coordinator,
    pub bus: MockBus,
    pub hub: Arc<MockComponent>,
    pub trigger: Arc<MockComponent>,
    pub builder: Arc<MockComponent>,
    pub ids: Vec<ComponentId>,
    pub config_dir: TempDir,
    pub spool_dir: TempDir,
}

impl Cluster {
    /// Coordinator with hub -> trigger -> builder registered.
    pub fn standard() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CncConfig) -> Self {
        let config_dir = tempfile::tempdir().expect("config dir");
        let spool_dir = tempfile::tempdir().expect("spool dir");
        std::fs::write(
            config_dir.path().join(format!("{}.toml", STANDARD)),
            "components = [\"stringHub#1\", \"inIceTrigger\", \"eventBuilder\"]\n",
        )
        .expect("write run config");

        let env = DaqEnvironment::new(config_dir.path(), spool_dir.path()).expect("environment");
        let coordinator = Coordinator::new(config, env);

        let bus = MockBus::new();
        let hub = Arc::new(MockComponent::new(
            "stringHub",
            1,
            vec![Connector::output("hit")],
            bus.clone(),
        ));
        let trigger = Arc::new(MockComponent::new(
            "inIceTrigger",
            0,
            vec![Connector::input("hit", 9001), Connector::output("trig")],
            bus.clone(),
        ));
        let builder = Arc::new(MockComponent::new(
            "eventBuilder",
            0,
            vec![Connector::input("trig", 9002)],
            bus.clone(),
        ));

        let mut ids = Vec::new();
        for mock in [&hub, &trigger, &builder] {
            let registration = coordinator
                .register_with_client(mock.registration(), Arc::clone(mock) as Arc<dyn ComponentClient>)
                .expect("register mock");
            ids.push(registration.id);
        }

        Self {
            coordinator,
            bus,
            hub,
            trigger,
            builder,
            ids,
            config_dir,
            spool_dir,
        }
    }

    pub fn mocks(&self) -> [&Arc<MockComponent>; 3] {
        [&self.hub, &self.trigger, &self.builder]
    }

    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.coordinator.subscribe()
    }

    /// Waits until run-set `id` reaches `state`.
    pub async fn wait_for(&self, id: u32, state: RunSetState, limit: Duration) -> bool {
        let Ok(mut watch) = self.coordinator.runset_watch(id) else {
            return false;
        };
        tokio::time::timeout(limit, watch.wait_for(|s| s.state == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// Drains the events received so far.
pub fn drain(events: &mut broadcast::Receiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
