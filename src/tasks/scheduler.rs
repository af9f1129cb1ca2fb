//! Fires the in-run tasks when they come due.

use super::active::ActiveChannelsTask;
use super::monitor::MonitorComponentsTask;
use super::radar::RadarTask;
use super::rate::RateTask;
use super::watchdog::{default_rules, WatchdogTask};
use super::{
    MonitorOutput, MonitorTarget, MonitorTask, RunSummary, TaskContext, TaskKind, TaskMember,
    TaskOutcome,
};
use crate::config::TaskConfig;
use crate::logfabric::CncLogger;
use crate::run_config::RadarChannel;
use crate::runset::StopReason;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

struct TaskRecord {
    kind: TaskKind,
    period: Duration,
    next_due: Instant,
    last_fire: Option<Instant>,
    fires: u64,
    skipped: u64,
    consecutive_failures: u32,
    enabled: bool,
    task: Box<dyn MonitorTask>,
}

/// Bookkeeping of one task, for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub kind: TaskKind,
    pub period_secs: u64,
    pub enabled: bool,
    pub fires: u64,
    /// Fires dropped because a previous fire overran its period.
    pub skipped: u64,
    pub consecutive_failures: u32,
}

pub struct TaskScheduler {
    records: Vec<TaskRecord>,
    members: Vec<TaskMember>,
    run_number: u32,
    output: MonitorOutput,
    call_timeout: Duration,
}

impl TaskScheduler {
    /// Arms the standard task set for one run. With [`MonitorTarget::None`]
    /// only the rate task is enabled.
    pub fn new(
        config: &TaskConfig,
        run_number: u32,
        members: Vec<TaskMember>,
        output: MonitorOutput,
        radar: Vec<RadarChannel>,
        call_timeout: Duration,
    ) -> Self {
        let tasks: Vec<(u64, Box<dyn MonitorTask>)> = vec![
            (config.rate_secs, Box::new(RateTask::new())),
            (config.active_channels_secs, Box::new(ActiveChannelsTask)),
            (config.monitor_secs, Box::new(MonitorComponentsTask)),
            (
                config.watchdog_secs,
                Box::new(WatchdogTask::new(
                    default_rules(config),
                    config.watchdog_threshold,
                )),
            ),
            (config.radar_secs, Box::new(RadarTask::new(radar))),
        ];
        Self::with_tasks(tasks, run_number, members, output, call_timeout)
    }

    pub fn with_tasks(
        tasks: Vec<(u64, Box<dyn MonitorTask>)>,
        run_number: u32,
        members: Vec<TaskMember>,
        output: MonitorOutput,
        call_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        let quiet = output.target() == MonitorTarget::None;
        let records = tasks
            .into_iter()
            .map(|(secs, task)| {
                let kind = task.kind();
                let period = Duration::from_secs(secs.max(1));
                TaskRecord {
                    kind,
                    period,
                    next_due: now + period,
                    last_fire: None,
                    fires: 0,
                    skipped: 0,
                    consecutive_failures: 0,
                    enabled: !quiet || kind == TaskKind::Rate,
                    task,
                }
            })
            .collect();
        Self {
            records,
            members,
            run_number,
            output,
            call_timeout,
        }
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    pub fn output(&self) -> &MonitorOutput {
        &self.output
    }

    /// Earliest instant at which an enabled task is due.
    pub fn next_due(&self) -> Option<Instant> {
        self.records
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.next_due)
            .min()
    }

    pub async fn begin(&mut self, logger: &CncLogger) {
        let Self {
            records,
            members,
            run_number,
            output,
            call_timeout,
        } = self;
        let ctx = TaskContext {
            run_number: *run_number,
            members,
            logger,
            output,
            call_timeout: *call_timeout,
        };
        for record in records.iter_mut().filter(|r| r.enabled) {
            record.task.begin(&ctx).await;
        }
    }

    /// Fires every task whose time has come, one at a time. Returns the
    /// stop reason as soon as a task asks to abort the run.
    pub async fn fire_due(&mut self, logger: &CncLogger) -> Option<StopReason> {
        let Self {
            records,
            members,
            run_number,
            output,
            call_timeout,
        } = self;
        let ctx = TaskContext {
            run_number: *run_number,
            members,
            logger,
            output,
            call_timeout: *call_timeout,
        };

        for record in records.iter_mut().filter(|r| r.enabled) {
            let started = Instant::now();
            if record.next_due > started {
                continue;
            }

            let outcome = record.task.fire(&ctx).await;
            record.fires += 1;
            record.last_fire = Some(started);

            let finished = Instant::now();
            let mut next = started + record.period;
            while next <= finished {
                next += record.period;
                record.skipped += 1;
            }
            record.next_due = next;

            match outcome {
                Ok(TaskOutcome::Continue) => record.consecutive_failures = 0,
                Ok(TaskOutcome::Abort(reason)) => {
                    record.consecutive_failures = 0;
                    return Some(reason);
                }
                Err(e) => {
                    record.consecutive_failures += 1;
                    warn!(
                        "{} task failed ({} in a row): {}",
                        record.kind.name(),
                        record.consecutive_failures,
                        e
                    );
                    logger.warn(format!("{} task failed: {}", record.kind.name(), e));
                }
            }
        }
        debug!("tasks fired for run {}", run_number);
        None
    }

    /// Ends the run. Returns the rate task's summary.
    pub async fn finish(&mut self, logger: &CncLogger, reason: &StopReason) -> RunSummary {
        let Self {
            records,
            members,
            run_number,
            output,
            call_timeout,
        } = self;
        let ctx = TaskContext {
            run_number: *run_number,
            members,
            logger,
            output,
            call_timeout: *call_timeout,
        };

        let mut summary = None;
        for record in records.iter_mut() {
            if let Some(s) = record.task.finish(&ctx, reason).await {
                summary = Some(s);
            }
            record.enabled = false;
        }
        summary.unwrap_or(RunSummary {
            run_number: *run_number,
            ..RunSummary::default()
        })
    }

    pub fn status(&self) -> Vec<TaskStatus> {
        self.records
            .iter()
            .map(|r| TaskStatus {
                kind: r.kind,
                period_secs: r.period.as_secs(),
                enabled: r.enabled,
                fires: r.fires,
                skipped: r.skipped,
                consecutive_failures: r.consecutive_failures,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CncResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Slow {
        kind: TaskKind,
        fires: Arc<AtomicU32>,
        work: Duration,
    }

    #[async_trait]
    impl MonitorTask for Slow {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn fire(&mut self, _ctx: &TaskContext<'_>) -> CncResult<TaskOutcome> {
            self.fires.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            Ok(TaskOutcome::Continue)
        }
    }

    fn scheduler(target: MonitorTarget, work: Duration) -> (TaskScheduler, Arc<AtomicU32>, Arc<AtomicU32>) {
        let rate = Arc::new(AtomicU32::new(0));
        let moni = Arc::new(AtomicU32::new(0));
        let tasks: Vec<(u64, Box<dyn MonitorTask>)> = vec![
            (
                10,
                Box::new(Slow {
                    kind: TaskKind::Rate,
                    fires: Arc::clone(&rate),
                    work: Duration::ZERO,
                }),
            ),
            (
                10,
                Box::new(Slow {
                    kind: TaskKind::Monitor,
                    fires: Arc::clone(&moni),
                    work,
                }),
            ),
        ];
        let output = MonitorOutput::new(target, std::env::temp_dir());
        let scheduler =
            TaskScheduler::with_tasks(tasks, 1, Vec::new(), output, Duration::from_secs(1));
        (scheduler, rate, moni)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_fire_on_their_period() {
        let logger = CncLogger::new("test");
        let (mut scheduler, rate, moni) = scheduler(MonitorTarget::Both, Duration::ZERO);

        scheduler.fire_due(&logger).await;
        assert_eq!(rate.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        scheduler.fire_due(&logger).await;
        scheduler.fire_due(&logger).await;
        assert_eq!(rate.load(Ordering::SeqCst), 1);
        assert_eq!(moni.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_drops_fires() {
        let logger = CncLogger::new("test");
        let (mut scheduler, _rate, moni) = scheduler(MonitorTarget::Both, Duration::from_secs(25));

        tokio::time::advance(Duration::from_secs(10)).await;
        scheduler.fire_due(&logger).await;
        assert_eq!(moni.load(Ordering::SeqCst), 1);

        let status = scheduler.status();
        let monitor = status.iter().find(|s| s.kind == TaskKind::Monitor).unwrap();
        assert_eq!(monitor.skipped, 2);

        // The missed fires are not replayed.
        scheduler.fire_due(&logger).await;
        assert_eq!(moni.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_none_keeps_only_rate() {
        let logger = CncLogger::new("test");
        let (mut scheduler, rate, moni) = scheduler(MonitorTarget::None, Duration::ZERO);
        tokio::time::advance(Duration::from_secs(30)).await;
        scheduler.fire_due(&logger).await;
        assert_eq!(rate.load(Ordering::SeqCst), 1);
        assert_eq!(moni.load(Ordering::SeqCst), 0);
    }
}
