//! Periodic in-run tasks.
//!
//! While a run-set is running its [`TaskScheduler`] fires a fixed set of
//! tasks: event rate, active channels, component monitoring, the health
//! watchdog and the radar. Fires are serialized with run-set transitions
//! because the run-set drives the scheduler from its own loop.

pub mod active;
pub mod monitor;
pub mod radar;
pub mod rate;
pub mod scheduler;
pub mod watchdog;

use crate::component::{ComponentClient, ComponentDescriptor, Role};
use crate::error::{CncError, CncResult, RpcError};
use crate::logfabric::{CncLogger, Priority};
use crate::runset::StopReason;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub use scheduler::{TaskScheduler, TaskStatus};

/// Bean and field names the tasks read from components.
pub mod beans {
    pub const BACKEND: &str = "backEnd";
    pub const NUM_EVENTS: &str = "NumEvents";
    pub const FIRST_EVENT_TIME: &str = "FirstEventTime";
    pub const LAST_PAYLOAD_TIME: &str = "LastPayloadTime";
    pub const DISK_AVAILABLE: &str = "DiskAvailable";
    pub const NUM_READOUTS_QUEUED: &str = "NumReadoutsQueued";

    pub const STRINGHUB: &str = "stringhub";
    pub const ACTIVE_CHANNELS: &str = "NumberOfActiveChannels";

    pub const SENDER: &str = "sender";
    pub const NUM_REQUESTS_QUEUED: &str = "NumReadoutRequestsQueued";

    pub const TRIGGER: &str = "trigger";
    pub const QUEUE_SIZE: &str = "QueueSize";

    /// Per-channel bean on a source, suffixed with the channel id.
    pub const CHANNEL_MONITOR_PREFIX: &str = "DataCollectorMonitor-";
    pub const HIT_RATE: &str = "HitRate";
}

/// Where monitoring output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorTarget {
    /// Only the rate task runs.
    None,
    /// Per-component files in the run directory.
    File,
    /// Monitor records on the live sink.
    Live,
    #[default]
    Both,
}

impl MonitorTarget {
    pub fn to_file(self) -> bool {
        matches!(self, MonitorTarget::File | MonitorTarget::Both)
    }

    pub fn to_live(self) -> bool {
        matches!(self, MonitorTarget::Live | MonitorTarget::Both)
    }
}

impl fmt::Display for MonitorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MonitorTarget::None => "none",
            MonitorTarget::File => "file",
            MonitorTarget::Live => "live",
            MonitorTarget::Both => "both",
        })
    }
}

impl FromStr for MonitorTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(MonitorTarget::None),
            "file" => Ok(MonitorTarget::File),
            "live" => Ok(MonitorTarget::Live),
            "both" => Ok(MonitorTarget::Both),
            other => Err(format!("unknown monitor target '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    Rate,
    ActiveChannels,
    Monitor,
    Watchdog,
    Radar,
}

impl TaskKind {
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::Rate => "rate",
            TaskKind::ActiveChannels => "activeChannels",
            TaskKind::Monitor => "monitor",
            TaskKind::Watchdog => "watchdog",
            TaskKind::Radar => "radar",
        }
    }
}

/// What a task fire asks of the run-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Continue,
    Abort(StopReason),
}

/// Event totals reported when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_number: u32,
    pub events: u64,
    /// Detector seconds between the first and the last event.
    pub duration_secs: f64,
    pub rate_hz: f64,
}

/// A run-set member as seen by the tasks.
#[derive(Clone)]
pub struct TaskMember {
    pub descriptor: ComponentDescriptor,
    pub client: Arc<dyn ComponentClient>,
}

impl TaskMember {
    pub fn role(&self) -> Role {
        self.descriptor.role
    }

    pub fn full_name(&self) -> String {
        self.descriptor.full_name()
    }

    pub async fn read_fields(
        &self,
        bean: &str,
        fields: &[&str],
        limit: Duration,
    ) -> CncResult<Map<String, Value>> {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        let call = self.client.get_bean_fields(bean, &fields);
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(|e| CncError::from_rpc(self.descriptor.id, "getBeanFields", e)),
            Err(_) => Err(CncError::from_rpc(
                self.descriptor.id,
                "getBeanFields",
                RpcError::Timeout {
                    method: "getBeanFields".to_string(),
                    after: limit,
                },
            )),
        }
    }
}

/// Routes task output according to the run's [`MonitorTarget`].
#[derive(Debug, Clone)]
pub struct MonitorOutput {
    target: MonitorTarget,
    run_dir: PathBuf,
}

impl MonitorOutput {
    pub fn new(target: MonitorTarget, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            target,
            run_dir: run_dir.into(),
        }
    }

    pub fn target(&self) -> MonitorTarget {
        self.target
    }

    pub fn run_dir(&self) -> &std::path::Path {
        &self.run_dir
    }

    pub fn publish(&self, logger: &CncLogger, var: &str, value: &Value, priority: Priority) {
        if self.target.to_live() {
            logger.send_moni(var, value, priority);
        }
    }

    /// Appends `text` to `<run_dir>/<file_name>` when file output is on.
    pub fn append(&self, file_name: &str, text: &str) -> io::Result<()> {
        if !self.target.to_file() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join(file_name))?;
        file.write_all(text.as_bytes())
    }
}

/// Everything a task fire may use.
pub struct TaskContext<'a> {
    pub run_number: u32,
    pub members: &'a [TaskMember],
    pub logger: &'a CncLogger,
    pub output: &'a MonitorOutput,
    pub call_timeout: Duration,
}

impl TaskContext<'_> {
    pub fn with_role(&self, role: Role) -> impl Iterator<Item = &TaskMember> + '_ {
        self.members.iter().filter(move |m| m.role() == role)
    }
}

#[async_trait]
pub trait MonitorTask: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn fire(&mut self, ctx: &TaskContext<'_>) -> CncResult<TaskOutcome>;

    /// Called once when the run starts.
    async fn begin(&mut self, _ctx: &TaskContext<'_>) {}

    /// Called once when the run ends. Only the rate task reports a summary.
    async fn finish(&mut self, _ctx: &TaskContext<'_>, _reason: &StopReason) -> Option<RunSummary> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_target() {
        assert_eq!("FILE".parse::<MonitorTarget>().unwrap(), MonitorTarget::File);
        assert!(MonitorTarget::Both.to_file() && MonitorTarget::Both.to_live());
        assert!(!MonitorTarget::None.to_file() && !MonitorTarget::None.to_live());
        assert!("loud".parse::<MonitorTarget>().is_err());
    }

    #[test]
    fn test_file_output_is_gated() {
        let dir = tempfile::tempdir().unwrap();
        let live_only = MonitorOutput::new(MonitorTarget::Live, dir.path());
        live_only.append("x.moni", "a\n").unwrap();
        assert!(!dir.path().join("x.moni").exists());

        let files = MonitorOutput::new(MonitorTarget::File, dir.path());
        files.append("x.moni", "a\n").unwrap();
        files.append("x.moni", "b\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("x.moni")).unwrap(),
            "a\nb\n"
        );
    }
}
