//! Hit rates of selected channels.

use super::{beans, MonitorTask, TaskContext, TaskKind, TaskOutcome};
use crate::component::Role;
use crate::error::CncResult;
use crate::logfabric::Priority;
use crate::run_config::RadarChannel;
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct RadarTask {
    channels: Vec<RadarChannel>,
}

impl RadarTask {
    pub fn new(channels: Vec<RadarChannel>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl MonitorTask for RadarTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Radar
    }

    async fn fire(&mut self, ctx: &TaskContext<'_>) -> CncResult<TaskOutcome> {
        if self.channels.is_empty() {
            return Ok(TaskOutcome::Continue);
        }

        let mut rates = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let Some(source) = ctx
                .with_role(Role::Source)
                .find(|m| m.descriptor.num == channel.hub)
            else {
                continue;
            };
            let bean = format!("{}{}", beans::CHANNEL_MONITOR_PREFIX, channel.mbid);
            match source
                .read_fields(&bean, &[beans::HIT_RATE], ctx.call_timeout)
                .await
            {
                Ok(fields) => {
                    let rate = fields.get(beans::HIT_RATE).cloned().unwrap_or(Value::Null);
                    rates.push(json!({ "mbid": channel.mbid, "rate": rate }));
                }
                Err(e) => ctx.logger.debug(format!(
                    "No radar rate for {} on {}: {}",
                    channel.mbid,
                    source.full_name(),
                    e
                )),
            }
        }

        ctx.output
            .publish(ctx.logger, "radarDOMs", &Value::Array(rates), Priority::Email);
        Ok(TaskOutcome::Continue)
    }
}
