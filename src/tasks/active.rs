//! Active channel count.

use super::{beans, MonitorTask, TaskContext, TaskKind, TaskOutcome};
use crate::component::Role;
use crate::error::CncResult;
use crate::logfabric::Priority;
use async_trait::async_trait;
use serde_json::{json, Value};

#[derive(Default)]
pub struct ActiveChannelsTask;

#[async_trait]
impl MonitorTask for ActiveChannelsTask {
    fn kind(&self) -> TaskKind {
        TaskKind::ActiveChannels
    }

    async fn fire(&mut self, ctx: &TaskContext<'_>) -> CncResult<TaskOutcome> {
        let mut total = 0u64;
        for source in ctx.with_role(Role::Source) {
            match source
                .read_fields(beans::STRINGHUB, &[beans::ACTIVE_CHANNELS], ctx.call_timeout)
                .await
            {
                Ok(fields) => {
                    total += fields
                        .get(beans::ACTIVE_CHANNELS)
                        .and_then(Value::as_u64)
                        .unwrap_or(0)
                }
                Err(e) => ctx.logger.warn(format!(
                    "Cannot get active channels from {}: {}",
                    source.full_name(),
                    e
                )),
            }
        }
        ctx.output
            .publish(ctx.logger, "activeDOMs", &json!(total), Priority::Its);
        ctx.output
            .append("activeDOMs.moni", &format!("{}\n", total))?;
        Ok(TaskOutcome::Continue)
    }
}
