//! The coordinator: component registration, run-set lifecycle and the
//! default log sinks, behind one cloneable handle.
//!
//! Run-sets are independent actors, so calls against distinct run-sets
//! proceed concurrently while calls against one run-set queue up behind
//! each other.

pub mod client;
mod events;
pub mod service;

pub use client::CoordinatorClient;
pub use events::CoordinatorEvent;
pub use service::CoordinatorService;

use crate::component::{
    ComponentClient, ComponentId, ComponentRegistration, ComponentSnapshot, FlasherSetting,
    RemoteComponent,
};
use crate::config::CncConfig;
use crate::env::DaqEnvironment;
use crate::error::{CncError, CncResult};
use crate::log_capture::LogBuffer;
use crate::logfabric::{CncLogger, LogSinks, SinkAddr};
use crate::ports::PortAllocator;
use crate::registry::{Census, ComponentRegistry};
use crate::run_config::{RunConfig, RunConfigStore};
use crate::run_number::RunNumberStore;
use crate::runset::{
    BreakReport, MemberStatus, RunOptions, RunSetBuilder, RunSetContext, RunSetHandle,
    RunSetSnapshot, RunSetState,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 256;

/// Creates the client used to command a newly registered component.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, registration: &ComponentRegistration) -> Arc<dyn ComponentClient>;
}

/// Talks to components over the RPC transport.
pub struct RemoteClientFactory {
    call_timeout: Duration,
}

impl RemoteClientFactory {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

impl ClientFactory for RemoteClientFactory {
    fn client_for(&self, registration: &ComponentRegistration) -> Arc<dyn ComponentClient> {
        Arc::new(RemoteComponent::new(registration, self.call_timeout))
    }
}

/// Reply to a registration: the assigned id and where to send logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: ComponentId,
    pub primary_log: Option<SinkAddr>,
    pub secondary_log: Option<SinkAddr>,
}

struct CoordinatorInner {
    config: Arc<CncConfig>,
    env: Arc<DaqEnvironment>,
    registry: Arc<ComponentRegistry>,
    run_configs: RunConfigStore,
    run_numbers: Arc<RunNumberStore>,
    ports: Arc<PortAllocator>,
    factory: Arc<dyn ClientFactory>,
    logger: CncLogger,
    events: broadcast::Sender<CoordinatorEvent>,
    runsets: RwLock<BTreeMap<u32, RunSetHandle>>,
    next_runset: AtomicU32,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// A coordinator that reaches components over the network.
    pub fn new(config: CncConfig, env: DaqEnvironment) -> Self {
        let factory = Arc::new(RemoteClientFactory::new(config.timeouts.call()));
        Self::with_factory(config, env, factory)
    }

    pub fn with_factory(
        config: CncConfig,
        env: DaqEnvironment,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let logger = CncLogger::with_buffer(config.runset.service.clone(), LogBuffer::new());
        let defaults = LogSinks::new(config.logging.primary.clone(), config.logging.live.clone());
        if !defaults.is_empty() {
            logger.set_default(defaults);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ports = PortAllocator::new(config.runset.log_port_base, config.runset.log_port_count);
        let inner = CoordinatorInner {
            registry: Arc::new(ComponentRegistry::new()),
            run_configs: RunConfigStore::new(env.config_dir()),
            run_numbers: Arc::new(RunNumberStore::new(env.run_number_file())),
            ports: Arc::new(ports),
            config: Arc::new(config),
            env: Arc::new(env),
            factory,
            logger,
            events,
            runsets: RwLock::new(BTreeMap::new()),
            next_runset: AtomicU32::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &CncConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.inner.registry
    }

    pub fn logger(&self) -> &CncLogger {
        &self.inner.logger
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    // ---- components -------------------------------------------------------

    pub fn register_component(&self, registration: ComponentRegistration) -> CncResult<Registration> {
        let client = self.inner.factory.client_for(&registration);
        self.register_with_client(registration, client)
    }

    /// Registers a component reached through an existing client.
    pub fn register_with_client(
        &self,
        registration: ComponentRegistration,
        client: Arc<dyn ComponentClient>,
    ) -> CncResult<Registration> {
        let descriptor = self.inner.registry.register(registration, client)?;
        let sinks = self.inner.logger.default_sinks().unwrap_or_default();
        Ok(Registration {
            id: descriptor.id,
            primary_log: sinks.primary,
            secondary_log: sinks.secondary,
        })
    }

    pub fn unregister_component(&self, id: ComponentId) {
        self.inner.registry.unregister(id);
    }

    pub fn list_components(&self) -> Vec<ComponentSnapshot> {
        self.inner.registry.list()
    }

    pub fn census(&self) -> Census {
        self.inner.registry.census()
    }

    // ---- run-sets ---------------------------------------------------------

    /// Builds a run-set from the named run configuration. `strict` defaults
    /// to the configured value.
    pub fn make_runset(&self, config_name: &str, strict: Option<bool>) -> CncResult<u32> {
        let run_config = self.inner.run_configs.load(config_name).map_err(|e| {
            self.inner.logger.failure(&e);
            e
        })?;
        self.make_runset_from(run_config, strict)
    }

    pub fn make_runset_from(&self, run_config: RunConfig, strict: Option<bool>) -> CncResult<u32> {
        let strict = strict.unwrap_or(self.inner.config.runset.strict);
        let builder = RunSetBuilder::new(&self.inner.registry, &self.inner.config.runset.back_edges);
        let built = match builder.build(&run_config.components, strict) {
            Ok(built) => built,
            Err(e) => {
                self.inner.logger.failure(&e);
                return Err(e);
            }
        };

        let id = self.inner.next_runset.fetch_add(1, Ordering::SeqCst) + 1;
        if !built.missing.is_empty() {
            self.inner.logger.warn(format!(
                "Run set {} is missing {}",
                id,
                built.missing.join(", ")
            ));
        }
        self.inner.logger.info(format!(
            "Created run set {} from '{}' with {} components",
            id,
            run_config.name,
            built.members.len()
        ));
        let handle = RunSetHandle::spawn(id, run_config, built, self.runset_context());
        self.inner.runsets.write().insert(id, handle);
        Ok(id)
    }

    fn runset_context(&self) -> RunSetContext {
        let inner = &self.inner;
        RunSetContext {
            registry: Arc::clone(&inner.registry),
            config: Arc::clone(&inner.config),
            env: Arc::clone(&inner.env),
            run_numbers: Arc::clone(&inner.run_numbers),
            ports: Arc::clone(&inner.ports),
            events: inner.events.clone(),
            default_sinks: inner.logger.default_sinks().unwrap_or_default(),
            advertise_host: inner.config.server.advertised_host(),
            log_buffer: inner.logger.buffer().clone(),
        }
    }

    fn runset(&self, id: u32) -> CncResult<RunSetHandle> {
        self.inner
            .runsets
            .read()
            .get(&id)
            .cloned()
            .ok_or(CncError::NotFound(id))
    }

    pub async fn runset_start_run(
        &self,
        id: u32,
        run_number: u32,
        options: RunOptions,
    ) -> CncResult<RunSetState> {
        self.runset(id)?.start_run(run_number, options).await
    }

    pub async fn runset_stop_run(&self, id: u32) -> CncResult<RunSetState> {
        self.runset(id)?.stop_run().await
    }

    pub fn runset_state(&self, id: u32) -> CncResult<RunSetState> {
        Ok(self.runset(id)?.state())
    }

    pub fn runset_snapshot(&self, id: u32) -> CncResult<RunSetSnapshot> {
        Ok(self.runset(id)?.snapshot())
    }

    pub fn runset_list_ids(&self) -> Vec<u32> {
        self.inner.runsets.read().keys().copied().collect()
    }

    pub fn runset_list(&self, id: u32) -> CncResult<Vec<MemberStatus>> {
        Ok(self.runset(id)?.snapshot().members)
    }

    /// Watches the snapshots of one run-set.
    pub fn runset_watch(
        &self,
        id: u32,
    ) -> CncResult<tokio::sync::watch::Receiver<RunSetSnapshot>> {
        Ok(self.runset(id)?.subscribe())
    }

    /// Breaks a run-set up. The id is forgotten at once, so a second break
    /// reports `NotFound`.
    pub async fn runset_break(&self, id: u32) -> CncResult<BreakReport> {
        let handle = self
            .inner
            .runsets
            .write()
            .remove(&id)
            .ok_or(CncError::NotFound(id))?;
        let report = handle.break_up().await?;
        self.inner.logger.info(format!("Broke up run set {}", id));
        Ok(report)
    }

    pub async fn runset_subrun(&self, id: u32, settings: Vec<FlasherSetting>) -> CncResult<u32> {
        self.runset(id)?.subrun(settings).await
    }

    /// Flashes for `duration`, then turns the flashers off. Returns the
    /// number of the flashing subrun.
    pub async fn flash(
        &self,
        id: u32,
        settings: Vec<FlasherSetting>,
        duration: Duration,
    ) -> CncResult<u32> {
        let handle = self.runset(id)?;
        let subrun = handle.subrun(settings).await?;
        tokio::time::sleep(duration).await;
        handle.subrun(Vec::new()).await?;
        Ok(subrun)
    }

    /// One past the last persisted run number.
    pub fn next_run_number(&self) -> CncResult<u32> {
        let (run, _) = self.inner.run_numbers.load()?;
        Ok(run + 1)
    }

    // ---- default log sinks -------------------------------------------------

    /// Sets the default primary sink handed to components at registration.
    pub async fn log_to(&self, primary: SinkAddr) {
        let secondary = self
            .inner
            .logger
            .default_sinks()
            .and_then(|s| s.secondary)
            .or_else(|| self.inner.config.logging.live.clone());
        info!("Default log sink is now {}", primary);
        let sinks = LogSinks::new(Some(primary), secondary);
        self.inner.logger.resolve_ahead(&sinks).await;
        self.inner.logger.set_default(sinks);
    }

    /// Forgets the default sinks.
    pub fn close_log(&self) {
        info!("Default log sinks cleared");
        self.inner.logger.reset();
    }

    /// Breaks every remaining run-set.
    pub async fn shutdown(&self) {
        let ids = self.runset_list_ids();
        for id in ids {
            if let Err(e) = self.runset_break(id).await {
                warn!("Cannot break run set {} on shutdown: {}", id, e);
            }
        }
    }
}
