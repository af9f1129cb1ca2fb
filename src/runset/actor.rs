//! The run-set actor.
//!
//! One actor owns the members of one run-set and drives every transition
//! on them. Commands arrive over an mpsc channel and are handled one at a
//! time, so no two transitions on a run-set ever overlap. While a run is
//! active the same loop also fires the in-run tasks on a fixed tick.
//!
//! Commands fan out level by level in start order: ascending for connect,
//! configure and start, descending for stop and reset. Within a level the
//! calls run concurrently, bounded by the configured fan-out limit.

use super::builder::{BuiltRunSet, WiringPlan};
use super::messages::RunSetCommand;
use super::state::{BreakReport, MemberStatus, RunOptions, RunSetSnapshot, RunSetState, StopReason};
use crate::component::client::methods;
use crate::component::{
    ComponentClient, ComponentId, ComponentState, FlasherSetting, RegisteredComponent, Role,
    WiringEntry,
};
use crate::config::CncConfig;
use crate::coordinator::CoordinatorEvent;
use crate::env::DaqEnvironment;
use crate::error::{CncError, CncResult, RpcError};
use crate::log_capture::LogBuffer;
use crate::logfabric::{CncLogger, LogReceiver, LogSinks, Priority};
use crate::ports::PortAllocator;
use crate::registry::ComponentRegistry;
use crate::retry::{call_with_retry, RetryPolicy};
use crate::run_config::RunConfig;
use crate::run_number::RunNumberStore;
use crate::tasks::{MonitorOutput, RunSummary, TaskMember, TaskScheduler};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the per-run log written by the run's log receiver.
pub const RUN_LOG_FILE: &str = "cnc.log";

/// Transitions kept in a run-set's history; older ones are dropped.
pub const HISTORY_LIMIT: usize = 64;

/// Shared services a run-set needs from the coordinator.
#[derive(Clone)]
pub struct RunSetContext {
    pub registry: Arc<ComponentRegistry>,
    pub config: Arc<CncConfig>,
    pub env: Arc<DaqEnvironment>,
    pub run_numbers: Arc<RunNumberStore>,
    pub ports: Arc<PortAllocator>,
    pub events: broadcast::Sender<CoordinatorEvent>,
    /// Sinks run-set logging falls back to between runs.
    pub default_sinks: LogSinks,
    /// Host components should send run logs to.
    pub advertise_host: String,
    pub log_buffer: LogBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ascending,
    Descending,
}

struct Member {
    component: RegisteredComponent,
    quarantined: bool,
}

struct ActiveRun {
    run_number: u32,
    scheduler: TaskScheduler,
    receiver: Option<LogReceiver>,
}

pub(crate) struct RunSetActor {
    id: u32,
    ctx: RunSetContext,
    run_config: RunConfig,
    members: Vec<Member>,
    plan: WiringPlan,
    state: RunSetState,
    history: Vec<RunSetState>,
    run: Option<ActiveRun>,
    subrun: u32,
    last_summary: Option<RunSummary>,
    logger: CncLogger,
    policy: RetryPolicy,
    cancel: CancellationToken,
    /// Set while members are being reset. Resets ignore cancellation and
    /// never stop at a failing level.
    resetting: bool,
    snapshot: watch::Sender<RunSetSnapshot>,
}

impl RunSetActor {
    pub(crate) fn new(
        id: u32,
        run_config: RunConfig,
        built: BuiltRunSet,
        ctx: RunSetContext,
        cancel: CancellationToken,
    ) -> Self {
        let logger = CncLogger::with_buffer(
            format!("{}-{}", ctx.config.runset.service, id),
            ctx.log_buffer.clone(),
        );
        logger.set_default(ctx.default_sinks.clone());

        let members = built
            .members
            .into_iter()
            .map(|component| Member {
                component,
                quarantined: false,
            })
            .collect();
        let policy = RetryPolicy::from(&ctx.config.timeouts);
        let (snapshot, _) = watch::channel(RunSetSnapshot {
            id,
            config: run_config.name.clone(),
            state: RunSetState::Wired,
            run_number: None,
            subrun: 0,
            members: Vec::new(),
            history: Vec::new(),
            tasks: Vec::new(),
            last_summary: None,
        });

        let actor = Self {
            id,
            ctx,
            run_config,
            members,
            plan: built.plan,
            state: RunSetState::Wired,
            history: vec![RunSetState::Wired],
            run: None,
            subrun: 0,
            last_summary: None,
            logger,
            policy,
            cancel,
            resetting: false,
            snapshot,
        };
        actor.publish();
        actor
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RunSetSnapshot> {
        self.snapshot.subscribe()
    }

    /// Runs until the run-set is broken or every handle is dropped.
    pub(crate) async fn run(mut self, mut command_rx: mpsc::Receiver<RunSetCommand>) {
        info!(
            "Run set {} ({}) started with {} members",
            self.id,
            self.run_config.name,
            self.members.len()
        );
        let mut ticker = interval(self.ctx.config.runset.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle(command).await {
                            break;
                        }
                    }
                    None => {
                        warn!("Run set {} abandoned, releasing members", self.id);
                        self.resetting = true;
                        self.break_up().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        info!("Run set {} stopped", self.id);
    }

    /// Handles one command. Returns true when the actor should exit.
    async fn handle(&mut self, command: RunSetCommand) -> bool {
        match command {
            RunSetCommand::StartRun {
                run_number,
                options,
                response,
            } => {
                let result = self.start_run(run_number, options).await;
                let result = self.settle(result).await;
                let _ = response.send(result);
                false
            }
            RunSetCommand::StopRun { response } => {
                let result = self.stop_run(StopReason::Requested).await;
                let result = self.settle(result).await;
                let _ = response.send(result);
                false
            }
            RunSetCommand::Subrun { settings, response } => {
                let result = self.subrun(settings).await;
                if let Err(e) = &result {
                    if !matches!(e, CncError::InvalidTransition { .. }) {
                        self.logger.failure(e);
                    }
                }
                let _ = response.send(result);
                false
            }
            RunSetCommand::Break { response } => {
                self.resetting = true;
                let report = self.break_up().await;
                let _ = response.send(Ok(report));
                true
            }
        }
    }

    async fn on_tick(&mut self) {
        if self.state != RunSetState::Running {
            return;
        }
        let abort = match self.run.as_mut() {
            Some(run) => run.scheduler.fire_due(&self.logger).await,
            None => None,
        };
        self.publish();

        if let Some(reason) = abort {
            self.logger.warn(format!("Stopping run: {}", reason));
            let result = self.stop_run(reason).await;
            let _ = self.settle(result).await;
        }
    }

    /// Turns a failed transition into the error state. Rejected transitions
    /// leave the run-set untouched; cancellations are left to the break that
    /// follows them.
    async fn settle<T>(&mut self, result: CncResult<T>) -> CncResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e @ CncError::InvalidTransition { .. }) => Err(e),
            Err(CncError::Cancelled) => {
                self.logger.info(format!("Run set {} transition cancelled", self.id));
                Err(CncError::Cancelled)
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    // ---- transitions ------------------------------------------------------

    async fn start_run(&mut self, run_number: u32, options: RunOptions) -> CncResult<RunSetState> {
        match self.state {
            RunSetState::Wired => {
                self.connect().await?;
                self.configure().await?;
            }
            RunSetState::Ready => {}
            other => return Err(invalid(other, "start")),
        }
        self.start(run_number, options).await?;
        Ok(self.state)
    }

    async fn connect(&mut self) -> CncResult<()> {
        self.set_state(RunSetState::Connecting);
        let all = self.active();
        self.require(&all, &[ComponentState::Idle], methods::CONNECT)?;

        let wiring: HashMap<ComponentId, Vec<WiringEntry>> = self
            .members
            .iter()
            .map(|m| {
                let id = m.component.id();
                (id, self.plan.entries_for(id))
            })
            .collect();
        self.command(
            methods::CONNECT,
            Direction::Ascending,
            &all,
            &[ComponentState::Connected],
            |client, id| {
                let entries = wiring.get(&id).cloned().unwrap_or_default();
                async move { client.connect(&entries).await }
            },
        )
        .await?;
        self.set_state(RunSetState::Connected);
        Ok(())
    }

    async fn configure(&mut self) -> CncResult<()> {
        self.set_state(RunSetState::Configuring);
        let all = self.active();
        let deadline = Instant::now() + self.ctx.config.timeouts.configure();
        let config_name = self.run_config.name.clone();
        self.logger
            .info(format!("Configuring {} components with '{}'", all.len(), config_name));

        self.command(
            methods::CONFIGURE,
            Direction::Ascending,
            &all,
            &[ComponentState::Configuring, ComponentState::Ready],
            |client, _| {
                let name = config_name.clone();
                async move { client.configure(&name).await }
            },
        )
        .await?;
        self.poll_until(methods::CONFIGURE, all, &[ComponentState::Ready], deadline)
            .await?;
        self.set_state(RunSetState::Ready);
        Ok(())
    }

    async fn start(&mut self, run_number: u32, options: RunOptions) -> CncResult<()> {
        self.set_state(RunSetState::Starting);
        let all = self.active();
        self.require(&all, &[ComponentState::Ready], methods::START_RUN)?;

        self.ctx.run_numbers.save(run_number, 0)?;
        let run_dir = self.ctx.env.run_dir(run_number);
        tokio::fs::create_dir_all(&run_dir).await?;

        let bind_addr = format!("0.0.0.0:{}", self.ctx.ports.next_port());
        let receiver = LogReceiver::bind(&bind_addr, Some(run_dir.join(RUN_LOG_FILE))).await?;
        let live = self
            .ctx
            .config
            .logging
            .live
            .clone()
            .or_else(|| self.ctx.default_sinks.secondary.clone());
        let run_sinks = LogSinks::new(Some(receiver.sink_addr(&self.ctx.advertise_host)), live);
        self.logger.resolve_ahead(&run_sinks).await;
        self.logger.open(run_sinks.clone());

        let task_members = self
            .members
            .iter()
            .filter(|m| !m.quarantined)
            .map(|m| TaskMember {
                descriptor: m.component.descriptor().clone(),
                client: m.component.client(),
            })
            .collect();
        let scheduler = TaskScheduler::new(
            &self.ctx.config.tasks,
            run_number,
            task_members,
            MonitorOutput::new(options.monitor_target, run_dir),
            self.run_config.radar.clone(),
            self.ctx.config.timeouts.call(),
        );
        self.subrun = 0;
        self.run = Some(ActiveRun {
            run_number,
            scheduler,
            receiver: Some(receiver),
        });
        self.logger.info(format!(
            "Starting run {} with {} components (monitoring: {})",
            run_number,
            all.len(),
            options.monitor_target
        ));

        let results = self
            .fan_out(methods::LOG_TO, Direction::Ascending, &all, |client, _| {
                let sinks = run_sinks.clone();
                async move { client.log_to(&sinks).await }
            })
            .await?;
        first_error(results)?;

        self.command(
            methods::START_RUN,
            Direction::Ascending,
            &all,
            &[ComponentState::Running],
            |client, _| async move { client.start_run(run_number).await },
        )
        .await?;

        if let Some(run) = self.run.as_mut() {
            run.scheduler.begin(&self.logger).await;
        }
        let _ = self.ctx.events.send(CoordinatorEvent::RunStarted {
            runset: self.id,
            run_number,
        });
        self.set_state(RunSetState::Running);
        Ok(())
    }

    async fn stop_run(&mut self, reason: StopReason) -> CncResult<RunSetState> {
        match self.state {
            RunSetState::Running => {}
            RunSetState::Ready
            | RunSetState::Stopped
            | RunSetState::Wired
            | RunSetState::Connected => return Ok(self.state),
            other => return Err(invalid(other, "stop")),
        }
        self.set_state(RunSetState::Stopping);
        self.stop_components().await?;
        self.finish_run(reason).await;
        self.set_state(RunSetState::Stopped);
        self.set_state(RunSetState::Ready);
        Ok(self.state)
    }

    /// Stops the sources, then waits for builders and everything else to
    /// drain. Members that miss the deadline are force-stopped.
    async fn stop_components(&mut self) -> CncResult<()> {
        let deadline = Instant::now() + self.ctx.config.timeouts.stop();
        let all = self.active();
        let mut sources = self.with_role(Role::Source);
        if sources.is_empty() {
            sources = all.clone();
        }
        self.require(&sources, &[ComponentState::Running], methods::STOP_RUN)?;
        self.command(
            methods::STOP_RUN,
            Direction::Descending,
            &sources,
            &[ComponentState::Stopping, ComponentState::Ready],
            |client, _| async move { client.stop_run().await },
        )
        .await?;

        let builders = self.with_role(Role::Builder);
        let drained = match self
            .poll_until(methods::STOP_RUN, builders, &[ComponentState::Ready], deadline)
            .await
        {
            Ok(()) => {
                self.poll_until(methods::STOP_RUN, all, &[ComponentState::Ready], deadline)
                    .await
            }
            Err(e) => Err(e),
        };
        match drained {
            Err(CncError::Timeout { .. }) => self.force_stop().await,
            other => other,
        }
    }

    async fn force_stop(&mut self) -> CncResult<()> {
        self.set_state(RunSetState::ForcingStop);
        let stuck: Vec<usize> = self
            .active()
            .into_iter()
            .filter(|&i| self.members[i].component.state() != ComponentState::Ready)
            .collect();
        self.logger.warn(format!(
            "Stop timed out, forcing {} components: {}",
            stuck.len(),
            self.names(&stuck)
        ));

        let deadline = Instant::now() + self.ctx.config.timeouts.force();
        self.command(
            methods::FORCED_STOP,
            Direction::Descending,
            &stuck,
            &[
                ComponentState::Stopping,
                ComponentState::ForcingStop,
                ComponentState::Ready,
            ],
            |client, _| async move { client.force_stop().await },
        )
        .await?;
        self.poll_until(methods::FORCED_STOP, stuck, &[ComponentState::Ready], deadline)
            .await
    }

    /// Ends the active run: final counts, run-stop record, components and
    /// logging pointed back at the default sinks.
    async fn finish_run(&mut self, reason: StopReason) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        let summary = run.scheduler.finish(&self.logger, &reason).await;
        self.logger.info(format!(
            "Run {} ended ({}): {} events",
            run.run_number, reason, summary.events
        ));
        let _ = self.ctx.events.send(CoordinatorEvent::RunStopped {
            runset: self.id,
            summary: summary.clone(),
            reason,
        });

        let sinks = self.logger.default_sinks().unwrap_or_default();
        let all = self.active();
        match self
            .fan_out(methods::LOG_TO, Direction::Descending, &all, |client, _| {
                let sinks = sinks.clone();
                async move { client.log_to(&sinks).await }
            })
            .await
        {
            Ok(results) => {
                for (_, result) in results {
                    if let Err(e) = result {
                        warn!("Cannot restore component logging: {}", e);
                    }
                }
            }
            Err(e) => debug!("Log restore skipped: {}", e),
        }

        self.logger.close();
        if let Some(receiver) = run.receiver.take() {
            receiver.shutdown().await;
        }
        self.last_summary = Some(summary);
    }

    async fn fail(&mut self, err: &CncError) {
        self.logger.failure(err);
        let _ = self.ctx.events.send(CoordinatorEvent::Failure {
            runset: Some(self.id),
            kind: err.kind().to_string(),
            component: err.component(),
            message: err.to_string(),
        });
        if self.run.is_some() {
            self.finish_run(StopReason::Failure(err.kind().to_string()))
                .await;
        }
        self.reset_members().await;
        self.set_state(RunSetState::Error);
    }

    /// Resets every healthy member, last level first. Members that do not
    /// return to idle are quarantined and reported for a restart.
    async fn reset_members(&mut self) {
        let was_resetting = self.resetting;
        self.resetting = true;
        self.set_state(RunSetState::Resetting);

        let targets = self.active();
        let results = match self
            .fan_out(methods::RESET, Direction::Descending, &targets, |client, _| {
                async move { client.reset().await }
            })
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!("Run set {} reset aborted: {}", self.id, e);
                Vec::new()
            }
        };

        let mut failed = Vec::new();
        for (idx, result) in results {
            let component = &mut self.members[idx].component;
            match result {
                Ok(ComponentState::Idle) => component.mark_reset(),
                Ok(state) => failed.push((idx, state.to_string())),
                Err(e) => {
                    debug!("Reset of {} failed: {}", component.descriptor(), e);
                    failed.push((idx, "unreachable".to_string()));
                }
            }
        }

        if !failed.is_empty() {
            let mut descriptors = Vec::new();
            for (idx, state) in failed {
                let member = &mut self.members[idx];
                member.quarantined = true;
                member.component.set_state(ComponentState::Quarantined);
                descriptors.push(member.component.descriptor().clone());
                self.logger.failure(&CncError::ResetFailed {
                    id: member.component.id(),
                    state,
                });
            }
            let names: Vec<String> = descriptors.iter().map(|d| d.full_name()).collect();
            self.logger
                .error(format!("Cycle required for {}", names.join(", ")));
            self.logger.send_moni(
                "cycleRequest",
                &json!({ "runset": self.id, "components": names }),
                Priority::Its,
            );
            let _ = self.ctx.events.send(CoordinatorEvent::CycleRequest {
                runset: self.id,
                components: descriptors,
            });
        }

        self.resetting = was_resetting;
        self.publish();
    }

    /// Tears the run-set down and hands its members back to the registry.
    async fn break_up(&mut self) -> BreakReport {
        if self.run.is_some() {
            self.finish_run(StopReason::Break).await;
        }
        self.reset_members().await;

        let (quarantined, returned): (Vec<Member>, Vec<Member>) =
            std::mem::take(&mut self.members)
                .into_iter()
                .partition(|m| m.quarantined);
        let report = BreakReport {
            returned: returned.iter().map(|m| m.component.id()).collect(),
            quarantined: quarantined.iter().map(|m| m.component.id()).collect(),
        };
        self.ctx
            .registry
            .return_components(returned.into_iter().map(|m| m.component).collect());
        self.ctx
            .registry
            .quarantine(quarantined.into_iter().map(|m| m.component).collect());

        self.logger.info(format!(
            "Run set {} released: {} returned, {} quarantined",
            self.id,
            report.returned.len(),
            report.quarantined.len()
        ));
        self.logger.reset();
        self.set_state(RunSetState::Released);
        report
    }

    async fn subrun(&mut self, settings: Vec<FlasherSetting>) -> CncResult<u32> {
        if self.state != RunSetState::Running {
            return Err(invalid(self.state, "start a subrun on"));
        }
        let run_number = self.run.as_ref().map(|r| r.run_number).unwrap_or_default();
        let subrun = self.subrun + 1;
        let builders = self.with_role(Role::Builder);

        let results = self
            .fan_out(
                methods::PREPARE_SUBRUN,
                Direction::Ascending,
                &builders,
                |client, _| async move { client.prepare_subrun(subrun).await },
            )
            .await?;
        first_error(results)?;

        let mut by_source: HashMap<ComponentId, Vec<FlasherSetting>> = HashMap::new();
        for idx in self.with_role(Role::Source) {
            let descriptor = self.members[idx].component.descriptor();
            let own: Vec<FlasherSetting> = settings
                .iter()
                .filter(|s| s.hub == descriptor.num)
                .cloned()
                .collect();
            if settings.is_empty() || !own.is_empty() {
                by_source.insert(descriptor.id, own);
            }
        }
        let sources: Vec<usize> = self
            .with_role(Role::Source)
            .into_iter()
            .filter(|&i| by_source.contains_key(&self.members[i].component.id()))
            .collect();
        let results = self
            .fan_out(
                methods::START_SUBRUN,
                Direction::Ascending,
                &sources,
                |client, id| {
                    let own = by_source.get(&id).cloned().unwrap_or_default();
                    async move { client.start_subrun(&own).await }
                },
            )
            .await?;
        let latest_time = first_error(results)?.into_iter().max().unwrap_or_default();

        let results = self
            .fan_out(
                methods::COMMIT_SUBRUN,
                Direction::Ascending,
                &builders,
                |client, _| async move { client.commit_subrun(subrun, latest_time).await },
            )
            .await?;
        first_error(results)?;

        self.subrun = subrun;
        self.ctx.run_numbers.save(run_number, subrun)?;
        if settings.is_empty() {
            self.logger
                .info(format!("Subrun {}.{}: flashers off", run_number, subrun));
        } else {
            self.logger.info(format!(
                "Subrun {}.{}: {} flasher settings on {} sources",
                run_number,
                subrun,
                settings.len(),
                sources.len()
            ));
        }
        let _ = self.ctx.events.send(CoordinatorEvent::SubrunStarted {
            runset: self.id,
            run_number,
            subrun,
        });
        self.publish();
        Ok(subrun)
    }

    // ---- fan-out ----------------------------------------------------------

    /// Issues `call` to `targets` level by level. Stops after the first level
    /// with a failure unless members are being reset.
    async fn fan_out<T, F, Fut>(
        &self,
        operation: &'static str,
        direction: Direction,
        targets: &[usize],
        call: F,
    ) -> CncResult<Vec<(usize, CncResult<T>)>>
    where
        T: Send,
        F: Fn(Arc<dyn ComponentClient>, ComponentId) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, RpcError>> + Send,
    {
        let mut results = Vec::with_capacity(targets.len());
        for level in self.levels(targets, direction) {
            self.check_cancel()?;
            let call = &call;
            let calls: Vec<_> = level
                .into_iter()
                .map(|idx| {
                    let component = &self.members[idx].component;
                    let client = component.client();
                    let id = component.id();
                    async move {
                        let outcome = call_with_retry(&self.policy, operation, || {
                            call(Arc::clone(&client), id)
                        })
                        .await;
                        (idx, outcome.map_err(|e| CncError::from_rpc(id, operation, e)))
                    }
                })
                .collect();
            let mut level_results: Vec<(usize, CncResult<T>)> = stream::iter(calls)
                .buffer_unordered(self.ctx.config.runset.fanout_limit.max(1))
                .collect()
                .await;
            level_results.sort_by_key(|(idx, _)| *idx);

            let failed = level_results.iter().any(|(_, r)| r.is_err());
            results.extend(level_results);
            if failed && !self.resetting {
                break;
            }
        }
        Ok(results)
    }

    /// Fans out a state-returning command and records the reported states.
    async fn command<F, Fut>(
        &mut self,
        operation: &'static str,
        direction: Direction,
        targets: &[usize],
        accepted: &[ComponentState],
        call: F,
    ) -> CncResult<()>
    where
        F: Fn(Arc<dyn ComponentClient>, ComponentId) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ComponentState, RpcError>> + Send,
    {
        let results = self.fan_out(operation, direction, targets, call).await?;
        self.apply_states(results, accepted)
    }

    /// Polls `targets` until every one reports an accepted state. A member
    /// reporting `Error` fails the wait at once.
    async fn poll_until(
        &mut self,
        operation: &'static str,
        targets: Vec<usize>,
        accepted: &[ComponentState],
        deadline: Instant,
    ) -> CncResult<()> {
        let poll = self.ctx.config.timeouts.poll();
        let mut pending: Vec<usize> = targets
            .into_iter()
            .filter(|&i| !accepted.contains(&self.members[i].component.state()))
            .collect();

        while let Some(&first) = pending.first() {
            let now = Instant::now();
            if now >= deadline {
                return Err(CncError::Timeout {
                    id: Some(self.members[first].component.id()),
                    operation: operation.to_string(),
                });
            }
            self.pause((now + poll).min(deadline)).await?;

            let results = self
                .fan_out(methods::GET_STATE, Direction::Ascending, &pending, |client, _| {
                    async move { client.get_state().await }
                })
                .await?;
            for (idx, result) in results {
                let state = result?;
                let component = &mut self.members[idx].component;
                component.set_state(state);
                if state == ComponentState::Error {
                    return Err(CncError::BadState {
                        id: component.id(),
                        expected: join_states(accepted),
                        actual: state.to_string(),
                    });
                }
            }
            self.publish();
            pending.retain(|&i| !accepted.contains(&self.members[i].component.state()));
        }
        Ok(())
    }

    /// Records reported states. The first failure in member order wins.
    fn apply_states(
        &mut self,
        results: Vec<(usize, CncResult<ComponentState>)>,
        accepted: &[ComponentState],
    ) -> CncResult<()> {
        let mut first = None;
        for (idx, result) in results {
            let component = &mut self.members[idx].component;
            match result {
                Ok(state) => {
                    component.set_state(state);
                    if first.is_none() && !accepted.contains(&state) {
                        first = Some(CncError::BadState {
                            id: component.id(),
                            expected: join_states(accepted),
                            actual: state.to_string(),
                        });
                    }
                }
                Err(e) => {
                    if first.is_none() {
                        first = Some(e);
                    }
                }
            }
        }
        self.publish();
        first.map_or(Ok(()), Err)
    }

    /// Checks the last known state of `targets` before issuing `operation`.
    fn require(&self, targets: &[usize], expected: &[ComponentState], operation: &str) -> CncResult<()> {
        for &idx in targets {
            let component = &self.members[idx].component;
            if !expected.contains(&component.state()) {
                debug!("{} refused for {}", operation, component.descriptor());
                return Err(CncError::BadState {
                    id: component.id(),
                    expected: join_states(expected),
                    actual: component.state().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn pause(&self, until: Instant) -> CncResult<()> {
        if self.resetting {
            sleep_until(until).await;
            return Ok(());
        }
        tokio::select! {
            _ = sleep_until(until) => Ok(()),
            _ = self.cancel.cancelled() => Err(CncError::Cancelled),
        }
    }

    fn check_cancel(&self) -> CncResult<()> {
        if !self.resetting && self.cancel.is_cancelled() {
            return Err(CncError::Cancelled);
        }
        Ok(())
    }

    // ---- bookkeeping ------------------------------------------------------

    /// Indices of members that are not quarantined.
    fn active(&self) -> Vec<usize> {
        (0..self.members.len())
            .filter(|&i| !self.members[i].quarantined)
            .collect()
    }

    fn with_role(&self, role: Role) -> Vec<usize> {
        self.active()
            .into_iter()
            .filter(|&i| self.members[i].component.role() == role)
            .collect()
    }

    fn levels(&self, targets: &[usize], direction: Direction) -> Vec<Vec<usize>> {
        let mut levels: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for &idx in targets {
            levels
                .entry(self.members[idx].component.order())
                .or_default()
                .push(idx);
        }
        let levels = levels.into_values();
        match direction {
            Direction::Ascending => levels.collect(),
            Direction::Descending => levels.rev().collect(),
        }
    }

    fn names(&self, targets: &[usize]) -> String {
        targets
            .iter()
            .map(|&i| self.members[i].component.descriptor().full_name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn set_state(&mut self, state: RunSetState) {
        debug!("Run set {}: {} -> {}", self.id, self.state, state);
        self.state = state;
        self.history.push(state);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
        self.publish();
    }

    fn publish(&self) {
        let members = self
            .members
            .iter()
            .map(|m| MemberStatus {
                descriptor: m.component.descriptor().clone(),
                state: m.component.state(),
                order: m.component.order(),
                quarantined: m.quarantined,
            })
            .collect();
        self.snapshot.send_replace(RunSetSnapshot {
            id: self.id,
            config: self.run_config.name.clone(),
            state: self.state,
            run_number: self.run.as_ref().map(|r| r.run_number),
            subrun: self.subrun,
            members,
            history: self.history.clone(),
            tasks: self
                .run
                .as_ref()
                .map(|r| r.scheduler.status())
                .unwrap_or_default(),
            last_summary: self.last_summary.clone(),
        });
    }
}

fn invalid(from: RunSetState, operation: &str) -> CncError {
    CncError::InvalidTransition {
        from: from.to_string(),
        operation: operation.to_string(),
    }
}

fn join_states(states: &[ComponentState]) -> String {
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

fn first_error<T>(results: Vec<(usize, CncResult<T>)>) -> CncResult<Vec<T>> {
    results.into_iter().map(|(_, r)| r).collect()
}
