//! Per-component bean monitoring.
//!
//! Every fire takes a full snapshot of each member. Live records use the
//! variable `<name>-<num>*<bean>+<field>`; file output appends to
//! `<run_dir>/<name>-<num>.moni`.

use super::{MonitorTask, TaskContext, TaskKind, TaskMember, TaskOutcome};
use crate::error::{CncError, CncResult, RpcError};
use crate::logfabric::Priority;
use async_trait::async_trait;
use chrono::Local;
use std::fmt::Write as _;

#[derive(Default)]
pub struct MonitorComponentsTask;

pub fn moni_var(member: &TaskMember, bean: &str, field: &str) -> String {
    format!(
        "{}-{}*{}+{}",
        member.descriptor.name, member.descriptor.num, bean, field
    )
}

async fn snapshot(
    member: &TaskMember,
    ctx: &TaskContext<'_>,
) -> CncResult<crate::component::MonitorSnapshot> {
    let id = member.descriptor.id;
    match tokio::time::timeout(ctx.call_timeout, member.client.get_monitor_snapshot()).await {
        Ok(result) => result.map_err(|e| CncError::from_rpc(id, "getMonitorSnapshot", e)),
        Err(_) => Err(CncError::from_rpc(
            id,
            "getMonitorSnapshot",
            RpcError::Timeout {
                method: "getMonitorSnapshot".to_string(),
                after: ctx.call_timeout,
            },
        )),
    }
}

#[async_trait]
impl MonitorTask for MonitorComponentsTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Monitor
    }

    async fn fire(&mut self, ctx: &TaskContext<'_>) -> CncResult<TaskOutcome> {
        let mut failures = 0;
        for member in ctx.members {
            let beans = match snapshot(member, ctx).await {
                Ok(beans) => beans,
                Err(e) => {
                    failures += 1;
                    ctx.logger.warn(format!(
                        "Cannot monitor {}: {}",
                        member.full_name(),
                        e
                    ));
                    continue;
                }
            };

            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
            let mut text = String::new();
            for (bean, fields) in &beans {
                let _ = writeln!(text, "{}: {}:", bean, stamp);
                for (field, value) in fields {
                    ctx.output.publish(
                        ctx.logger,
                        &moni_var(member, bean, field),
                        value,
                        Priority::Scp,
                    );
                    let _ = writeln!(text, "\t{}: {}", field, value);
                }
            }
            let file = format!(
                "{}-{}.moni",
                member.descriptor.name, member.descriptor.num
            );
            ctx.output.append(&file, &text)?;
        }

        if failures > 0 && failures == ctx.members.len() {
            return Err(CncError::Internal(
                "no component answered the monitor request".to_string(),
            ));
        }
        Ok(TaskOutcome::Continue)
    }
}
