//! Run health watchdog.
//!
//! Each fire evaluates a set of threshold rules against the members. A
//! member that cannot be read counts as unhealthy. After `threshold`
//! consecutive unhealthy fires the watchdog asks the run-set to stop.

use super::{beans, MonitorTask, TaskContext, TaskKind, TaskOutcome};
use crate::component::Role;
use crate::config::TaskConfig;
use crate::error::CncResult;
use crate::runset::StopReason;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// Unhealthy when the value drops below the limit.
    Below(f64),
    /// Unhealthy when the value exceeds the limit.
    Above(f64),
}

impl Threshold {
    pub fn violated(&self, value: f64) -> bool {
        match *self {
            Threshold::Below(limit) => value < limit,
            Threshold::Above(limit) => value > limit,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Below(limit) => write!(f, "below {}", limit),
            Threshold::Above(limit) => write!(f, "above {}", limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchRule {
    pub role: Role,
    pub bean: String,
    pub field: String,
    pub threshold: Threshold,
}

impl WatchRule {
    pub fn new(role: Role, bean: &str, field: &str, threshold: Threshold) -> Self {
        Self {
            role,
            bean: bean.to_string(),
            field: field.to_string(),
            threshold,
        }
    }
}

/// Disk space on builders and queue depths along the readout chain.
pub fn default_rules(config: &TaskConfig) -> Vec<WatchRule> {
    let queue_max = config.queue_max as f64;
    vec![
        WatchRule::new(
            Role::Builder,
            beans::BACKEND,
            beans::DISK_AVAILABLE,
            Threshold::Below(config.disk_min_mb as f64),
        ),
        WatchRule::new(
            Role::Builder,
            beans::BACKEND,
            beans::NUM_READOUTS_QUEUED,
            Threshold::Above(queue_max),
        ),
        WatchRule::new(
            Role::Source,
            beans::SENDER,
            beans::NUM_REQUESTS_QUEUED,
            Threshold::Above(queue_max),
        ),
        WatchRule::new(
            Role::Trigger,
            beans::TRIGGER,
            beans::QUEUE_SIZE,
            Threshold::Above(queue_max),
        ),
    ]
}

pub struct WatchdogTask {
    rules: Vec<WatchRule>,
    threshold: u32,
    unhealthy: u32,
}

impl WatchdogTask {
    pub fn new(rules: Vec<WatchRule>, threshold: u32) -> Self {
        Self {
            rules,
            threshold: threshold.max(1),
            unhealthy: 0,
        }
    }

    pub fn unhealthy_count(&self) -> u32 {
        self.unhealthy
    }

    async fn check(&self, ctx: &TaskContext<'_>) -> Vec<String> {
        let mut problems = Vec::new();
        for rule in &self.rules {
            for member in ctx.with_role(rule.role) {
                let name = member.full_name();
                match member
                    .read_fields(&rule.bean, &[rule.field.as_str()], ctx.call_timeout)
                    .await
                {
                    Ok(fields) => match fields.get(&rule.field).and_then(Value::as_f64) {
                        Some(value) if rule.threshold.violated(value) => problems.push(format!(
                            "{} {}.{} = {} ({})",
                            name, rule.bean, rule.field, value, rule.threshold
                        )),
                        Some(_) => {}
                        None => problems.push(format!(
                            "{} {}.{} not reported",
                            name, rule.bean, rule.field
                        )),
                    },
                    Err(e) => problems.push(format!("{} not responding: {}", name, e)),
                }
            }
        }
        problems
    }
}

#[async_trait]
impl MonitorTask for WatchdogTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Watchdog
    }

    async fn fire(&mut self, ctx: &TaskContext<'_>) -> CncResult<TaskOutcome> {
        let problems = self.check(ctx).await;
        if problems.is_empty() {
            if self.unhealthy > 0 {
                ctx.logger.info("Run is healthy again");
            }
            self.unhealthy = 0;
            return Ok(TaskOutcome::Continue);
        }

        self.unhealthy += 1;
        ctx.logger.error(format!(
            "Watchdog reports threshold components:\n    {}",
            problems.join("\n    ")
        ));
        if self.unhealthy >= self.threshold {
            ctx.logger.error("Run is unhealthy, stopping");
            return Ok(TaskOutcome::Abort(StopReason::Watchdog));
        }
        ctx.logger.warn(format!(
            "Run is unhealthy ({} checks left)",
            self.threshold - self.unhealthy
        ));
        Ok(TaskOutcome::Continue)
    }
}
