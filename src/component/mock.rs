//! In-process component used by tests and demos.
//!
//! `MockComponent` follows the component lifecycle strictly and answers
//! out-of-order commands with a `BadState` fault. Faults, slow configuration
//! and hung stops can be injected per instance.

use super::client::{ComponentClient, FlasherSetting, MonitorSnapshot, WiringEntry};
use super::{ComponentRegistration, ComponentState, Connector, Role};
use crate::error::RpcError;
use crate::logfabric::LogSinks;
use crate::tasks::beans;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared end-of-stream signal. Once any source is stopped, every running
/// downstream mock on the same bus drains and reports ready.
#[derive(Clone, Default)]
pub struct MockBus {
    end_of_stream: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self) {
        self.end_of_stream.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.end_of_stream.store(false, Ordering::SeqCst);
    }

    fn drained(&self) -> bool {
        self.end_of_stream.load(Ordering::SeqCst)
    }
}

struct MockInner {
    state: ComponentState,
    run_number: Option<u32>,
    calls: Vec<String>,
    wiring: Vec<WiringEntry>,
    sinks: LogSinks,
    beans: MonitorSnapshot,
    failures: HashMap<String, RpcError>,
    transient: HashMap<String, u32>,
    configure_polls: u32,
    pending_polls: u32,
    hang_on_stop: bool,
    refuse_reset: bool,
    subruns: Vec<u32>,
    flasher: Vec<FlasherSetting>,
    latest_time: i64,
}

pub struct MockComponent {
    name: String,
    num: u32,
    role: Role,
    host: String,
    cmd_port: u16,
    connectors: Vec<Connector>,
    bus: MockBus,
    inner: Mutex<MockInner>,
}

impl MockComponent {
    pub fn new(name: &str, num: u32, connectors: Vec<Connector>, bus: MockBus) -> Self {
        let role = Role::from_name(name);
        Self {
            name: name.to_string(),
            num,
            role,
            host: "localhost".to_string(),
            cmd_port: 0,
            connectors,
            bus,
            inner: Mutex::new(MockInner {
                state: ComponentState::Idle,
                run_number: None,
                calls: Vec::new(),
                wiring: Vec::new(),
                sinks: LogSinks::default(),
                beans: default_beans(role),
                failures: HashMap::new(),
                transient: HashMap::new(),
                configure_polls: 0,
                pending_polls: 0,
                hang_on_stop: false,
                refuse_reset: false,
                subruns: Vec::new(),
                flasher: Vec::new(),
                latest_time: 0,
            }),
        }
    }

    /// Sets the address the mock registers under.
    pub fn with_address(mut self, host: &str, cmd_port: u16) -> Self {
        self.host = host.to_string();
        self.cmd_port = cmd_port;
        self
    }

    pub fn registration(&self) -> ComponentRegistration {
        ComponentRegistration {
            name: self.name.clone(),
            num: self.num,
            host: self.host.clone(),
            cmd_port: self.cmd_port,
            telemetry_port: 0,
            connectors: self.connectors.clone(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.inner.lock().state
    }

    /// Methods received so far, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.inner.lock().calls.iter().filter(|c| *c == method).count()
    }

    pub fn wiring(&self) -> Vec<WiringEntry> {
        self.inner.lock().wiring.clone()
    }

    pub fn run_number(&self) -> Option<u32> {
        self.inner.lock().run_number
    }

    pub fn log_sinks(&self) -> LogSinks {
        self.inner.lock().sinks.clone()
    }

    pub fn subruns(&self) -> Vec<u32> {
        self.inner.lock().subruns.clone()
    }

    pub fn flasher_settings(&self) -> Vec<FlasherSetting> {
        self.inner.lock().flasher.clone()
    }

    pub fn set_bean(&self, bean: &str, field: &str, value: Value) {
        self.inner
            .lock()
            .beans
            .entry(bean.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    /// Every call to `method` fails with `err` until cleared.
    pub fn fail_with(&self, method: &str, err: RpcError) {
        self.inner.lock().failures.insert(method.to_string(), err);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.transient.clear();
    }

    /// The next `times` calls to `method` answer busy.
    pub fn fail_transiently(&self, method: &str, times: u32) {
        self.inner.lock().transient.insert(method.to_string(), times);
    }

    /// Stay in `configuring` for `polls` state queries after configure.
    pub fn configure_slowly(&self, polls: u32) {
        self.inner.lock().configure_polls = polls;
    }

    /// Never drain after a stop; only a forced stop ends the run.
    pub fn hang_on_stop(&self) {
        self.inner.lock().hang_on_stop = true;
    }

    /// Reset answers with an error state.
    pub fn refuse_reset(&self) {
        self.inner.lock().refuse_reset = true;
    }

    fn enter(&self, method: &str) -> Result<parking_lot::MutexGuard<'_, MockInner>, RpcError> {
        let mut inner = self.inner.lock();
        inner.calls.push(method.to_string());
        if let Some(left) = inner.transient.get_mut(method) {
            if *left > 0 {
                *left -= 1;
                return Err(RpcError::Busy(format!("{} busy", self.name)));
            }
        }
        if let Some(err) = inner.failures.get(method) {
            return Err(err.clone());
        }
        Ok(inner)
    }
}

fn bad_state(expected: &[ComponentState], actual: ComponentState) -> RpcError {
    let expected = expected
        .iter()
        .map(ComponentState::as_str)
        .collect::<Vec<_>>()
        .join("|");
    RpcError::Remote {
        code: "BadState".to_string(),
        message: format!("expected {}, in {}", expected, actual),
        data: Some(json!({ "expected": expected, "actual": actual.as_str() })),
    }
}

fn require(inner: &MockInner, expected: &[ComponentState]) -> Result<(), RpcError> {
    if expected.contains(&inner.state) {
        Ok(())
    } else {
        Err(bad_state(expected, inner.state))
    }
}

fn default_beans(role: Role) -> MonitorSnapshot {
    let mut snapshot = MonitorSnapshot::new();
    let mut bean = |name: &str, fields: &[(&str, i64)]| {
        let map = fields
            .iter()
            .map(|(field, value)| (field.to_string(), json!(value)))
            .collect();
        snapshot.insert(name.to_string(), map);
    };
    match role {
        Role::Builder => bean(
            beans::BACKEND,
            &[
                (beans::NUM_EVENTS, 0),
                (beans::FIRST_EVENT_TIME, 0),
                (beans::LAST_PAYLOAD_TIME, 0),
                (beans::DISK_AVAILABLE, 500_000),
                (beans::NUM_READOUTS_QUEUED, 0),
            ],
        ),
        Role::Source => {
            bean(beans::STRINGHUB, &[(beans::ACTIVE_CHANNELS, 60)]);
            bean(beans::SENDER, &[(beans::NUM_REQUESTS_QUEUED, 0)]);
        }
        Role::Trigger => bean(beans::TRIGGER, &[(beans::QUEUE_SIZE, 0)]),
        Role::Other => {}
    }
    snapshot
}

#[async_trait]
impl ComponentClient for MockComponent {
    async fn connect(&self, wiring: &[WiringEntry]) -> Result<ComponentState, RpcError> {
        let mut inner = self.enter("connect")?;
        require(&inner, &[ComponentState::Idle])?;
        inner.wiring = wiring.to_vec();
        inner.state = ComponentState::Connected;
        Ok(inner.state)
    }

    async fn configure(&self, _config_name: &str) -> Result<ComponentState, RpcError> {
        let mut inner = self.enter("configure")?;
        require(&inner, &[ComponentState::Connected])?;
        inner.pending_polls = inner.configure_polls;
        inner.state = if inner.pending_polls > 0 {
            ComponentState::Configuring
        } else {
            ComponentState::Ready
        };
        Ok(inner.state)
    }

    async fn get_state(&self) -> Result<ComponentState, RpcError> {
        let mut inner = self.enter("getState")?;
        match inner.state {
            ComponentState::Configuring => {
                inner.pending_polls = inner.pending_polls.saturating_sub(1);
                if inner.pending_polls == 0 {
                    inner.state = ComponentState::Ready;
                }
            }
            ComponentState::Running | ComponentState::Stopping
                if self.role != Role::Source && self.bus.drained() && !inner.hang_on_stop =>
            {
                inner.state = ComponentState::Ready;
            }
            _ => {}
        }
        Ok(inner.state)
    }

    async fn start_run(&self, run_number: u32) -> Result<ComponentState, RpcError> {
        let mut inner = self.enter("startRun")?;
        require(&inner, &[ComponentState::Ready])?;
        self.bus.clear();
        inner.run_number = Some(run_number);
        inner.state = ComponentState::Running;
        Ok(inner.state)
    }

    async fn stop_run(&self) -> Result<ComponentState, RpcError> {
        let mut inner = self.enter("stopRun")?;
        require(&inner, &[ComponentState::Running])?;
        if inner.hang_on_stop {
            inner.state = ComponentState::Stopping;
            return Ok(inner.state);
        }
        if self.role == Role::Source {
            self.bus.signal();
        }
        inner.state = ComponentState::Ready;
        Ok(inner.state)
    }

    async fn force_stop(&self) -> Result<ComponentState, RpcError> {
        let mut inner = self.enter("forcedStop")?;
        require(
            &inner,
            &[
                ComponentState::Running,
                ComponentState::Stopping,
                ComponentState::Ready,
            ],
        )?;
        if self.role == Role::Source {
            self.bus.signal();
        }
        inner.hang_on_stop = false;
        inner.state = ComponentState::Ready;
        Ok(inner.state)
    }

    async fn reset(&self) -> Result<ComponentState, RpcError> {
        let mut inner = self.enter("reset")?;
        if inner.refuse_reset {
            inner.state = ComponentState::Error;
            return Ok(inner.state);
        }
        inner.state = ComponentState::Idle;
        inner.wiring.clear();
        inner.run_number = None;
        Ok(inner.state)
    }

    async fn log_to(&self, sinks: &LogSinks) -> Result<(), RpcError> {
        let mut inner = self.enter("logTo")?;
        inner.sinks = sinks.clone();
        Ok(())
    }

    async fn get_bean_fields(
        &self,
        bean: &str,
        fields: &[String],
    ) -> Result<Map<String, Value>, RpcError> {
        let inner = self.enter("getBeanFields")?;
        let values = inner.beans.get(bean).ok_or_else(|| RpcError::Remote {
            code: "UnknownBean".to_string(),
            message: format!("no bean '{}'", bean),
            data: None,
        })?;
        let mut out = Map::new();
        for field in fields {
            let value = values.get(field).ok_or_else(|| RpcError::Remote {
                code: "UnknownField".to_string(),
                message: format!("no field '{}.{}'", bean, field),
                data: None,
            })?;
            out.insert(field.clone(), value.clone());
        }
        Ok(out)
    }

    async fn get_monitor_snapshot(&self) -> Result<MonitorSnapshot, RpcError> {
        let inner = self.enter("getMonitorSnapshot")?;
        Ok(inner.beans.clone())
    }

    async fn prepare_subrun(&self, _subrun: u32) -> Result<(), RpcError> {
        let inner = self.enter("prepareSubrun")?;
        require(&inner, &[ComponentState::Running])
    }

    async fn start_subrun(&self, settings: &[FlasherSetting]) -> Result<i64, RpcError> {
        let mut inner = self.enter("startSubrun")?;
        require(&inner, &[ComponentState::Running])?;
        inner.flasher = settings.to_vec();
        inner.latest_time += 10_000_000_000;
        Ok(inner.latest_time)
    }

    async fn commit_subrun(&self, subrun: u32, _latest_time: i64) -> Result<(), RpcError> {
        let mut inner = self.enter("commitSubrun")?;
        require(&inner, &[ComponentState::Running])?;
        inner.subruns.push(subrun);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_is_enforced() {
        let hub = MockComponent::new("hub", 1, vec![Connector::output("hit")], MockBus::new());
        let err = hub.start_run(1).await.unwrap_err();
        match err {
            RpcError::Remote { code, data, .. } => {
                assert_eq!(code, "BadState");
                assert_eq!(data.unwrap()["actual"], "idle");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(hub.connect(&[]).await.unwrap(), ComponentState::Connected);
        assert_eq!(hub.configure("cfg").await.unwrap(), ComponentState::Ready);
        assert_eq!(hub.start_run(9).await.unwrap(), ComponentState::Running);
        assert_eq!(hub.run_number(), Some(9));
        assert_eq!(hub.stop_run().await.unwrap(), ComponentState::Ready);
        assert_eq!(hub.reset().await.unwrap(), ComponentState::Idle);
    }

    #[tokio::test]
    async fn test_downstream_drains_after_source_stops() {
        let bus = MockBus::new();
        let hub = MockComponent::new("hub", 1, vec![], bus.clone());
        let builder = MockComponent::new("builder", 0, vec![], bus);
        for c in [&hub, &builder] {
            c.connect(&[]).await.unwrap();
            c.configure("cfg").await.unwrap();
            c.start_run(1).await.unwrap();
        }
        assert_eq!(builder.get_state().await.unwrap(), ComponentState::Running);
        hub.stop_run().await.unwrap();
        assert_eq!(builder.get_state().await.unwrap(), ComponentState::Ready);
    }

    #[tokio::test]
    async fn test_slow_configure_and_transient_faults() {
        let trigger = MockComponent::new("trigger", 0, vec![], MockBus::new());
        trigger.configure_slowly(2);
        trigger.fail_transiently("connect", 1);

        assert!(trigger.connect(&[]).await.unwrap_err().is_transient());
        trigger.connect(&[]).await.unwrap();
        assert_eq!(
            trigger.configure("cfg").await.unwrap(),
            ComponentState::Configuring
        );
        assert_eq!(
            trigger.get_state().await.unwrap(),
            ComponentState::Configuring
        );
        assert_eq!(trigger.get_state().await.unwrap(), ComponentState::Ready);
        assert_eq!(trigger.call_count("connect"), 2);
    }

    #[tokio::test]
    async fn test_bean_fields() {
        let builder = MockComponent::new("builder", 0, vec![], MockBus::new());
        builder.set_bean(beans::BACKEND, beans::NUM_EVENTS, json!(42));
        let fields = builder
            .get_bean_fields(beans::BACKEND, &[beans::NUM_EVENTS.to_string()])
            .await
            .unwrap();
        assert_eq!(fields[beans::NUM_EVENTS], 42);
        assert!(builder
            .get_bean_fields("nope", &[beans::NUM_EVENTS.to_string()])
            .await
            .is_err());
    }
}
