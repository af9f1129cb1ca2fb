//! Event rate reporting and run summaries.

use super::{beans, MonitorTask, RunSummary, TaskContext, TaskKind, TaskMember, TaskOutcome};
use crate::component::Role;
use crate::error::{CncError, CncResult};
use crate::logfabric::Priority;
use crate::runset::StopReason;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Payload time ticks per second (0.1 ns resolution).
pub const TICKS_PER_SECOND: f64 = 1e10;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventCounts {
    pub events: u64,
    pub first_time: i64,
    pub last_time: i64,
}

impl EventCounts {
    pub fn duration_secs(&self) -> f64 {
        if self.last_time > self.first_time {
            (self.last_time - self.first_time) as f64 / TICKS_PER_SECOND
        } else {
            0.0
        }
    }

    pub fn rate_hz(&self) -> f64 {
        let secs = self.duration_secs();
        if secs > 0.0 {
            self.events as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Default)]
pub struct RateTask {
    started: bool,
    last: EventCounts,
}

impl RateTask {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read_counts(ctx: &TaskContext<'_>) -> CncResult<EventCounts> {
        let builder: &TaskMember = ctx
            .with_role(Role::Builder)
            .next()
            .ok_or_else(|| CncError::Internal("run set has no event builder".to_string()))?;
        let fields = builder
            .read_fields(
                beans::BACKEND,
                &[
                    beans::NUM_EVENTS,
                    beans::FIRST_EVENT_TIME,
                    beans::LAST_PAYLOAD_TIME,
                ],
                ctx.call_timeout,
            )
            .await?;
        let int = |key: &str| fields.get(key).and_then(Value::as_i64).unwrap_or(0);
        Ok(EventCounts {
            events: u64::try_from(int(beans::NUM_EVENTS)).unwrap_or(0),
            first_time: int(beans::FIRST_EVENT_TIME),
            last_time: int(beans::LAST_PAYLOAD_TIME),
        })
    }

    fn emit_runstart(&mut self, ctx: &TaskContext<'_>) {
        if self.started {
            return;
        }
        self.started = true;
        ctx.logger.send_moni(
            "runstart",
            &json!({ "run": ctx.run_number }),
            Priority::Its,
        );
    }
}

pub fn rate_line(counts: &EventCounts) -> String {
    format!(
        "{} physics events, {:.1} s of detector time ({:.2} Hz)",
        counts.events,
        counts.duration_secs(),
        counts.rate_hz()
    )
}

#[async_trait]
impl MonitorTask for RateTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Rate
    }

    async fn begin(&mut self, ctx: &TaskContext<'_>) {
        self.emit_runstart(ctx);
    }

    async fn fire(&mut self, ctx: &TaskContext<'_>) -> CncResult<TaskOutcome> {
        self.emit_runstart(ctx);
        let counts = Self::read_counts(ctx).await?;
        self.last = counts;
        ctx.logger.info(rate_line(&counts));
        Ok(TaskOutcome::Continue)
    }

    async fn finish(&mut self, ctx: &TaskContext<'_>, reason: &StopReason) -> Option<RunSummary> {
        match Self::read_counts(ctx).await {
            Ok(counts) => self.last = counts,
            Err(e) => ctx
                .logger
                .warn(format!("Cannot read final event counts: {}", e)),
        }
        ctx.logger.info(rate_line(&self.last));

        let status = if reason.is_success() { "SUCCESS" } else { "FAIL" };
        ctx.logger.send_moni(
            "runstop",
            &json!({
                "run": ctx.run_number,
                "events": self.last.events,
                "status": status,
                "reason": reason.to_string(),
            }),
            Priority::Its,
        );
        Some(RunSummary {
            run_number: ctx.run_number,
            events: self.last.events,
            duration_secs: self.last.duration_secs(),
            rate_hz: self.last.rate_hz(),
        })
    }
}
