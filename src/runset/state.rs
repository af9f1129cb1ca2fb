//! Run-set lifecycle states and the values run-sets report.

use crate::component::{ComponentDescriptor, ComponentId, ComponentState};
use crate::tasks::{MonitorTarget, RunSummary, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunSetState {
    Wired,
    Connecting,
    Connected,
    Configuring,
    Ready,
    Starting,
    Running,
    Stopping,
    ForcingStop,
    Stopped,
    Resetting,
    Error,
    Released,
}

impl RunSetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wired => "wired",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::ForcingStop => "forcingStop",
            Self::Stopped => "stopped",
            Self::Resetting => "resetting",
            Self::Error => "error",
            Self::Released => "released",
        }
    }

    /// Position along the start path. Used to check that a start never
    /// moves backwards.
    pub fn start_rank(&self) -> Option<u8> {
        match self {
            Self::Wired => Some(0),
            Self::Connecting => Some(1),
            Self::Connected => Some(2),
            Self::Configuring => Some(3),
            Self::Ready => Some(4),
            Self::Starting => Some(5),
            Self::Running => Some(6),
            _ => None,
        }
    }
}

impl fmt::Display for RunSetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "reason", content = "detail")]
pub enum StopReason {
    /// Stop requested by the operator.
    Requested,
    /// The health watchdog gave up on the run.
    Watchdog,
    /// A transition failed; carries the failure kind.
    Failure(String),
    /// The run-set was broken while running.
    Break,
}

impl StopReason {
    pub fn is_success(&self) -> bool {
        matches!(self, StopReason::Requested)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("requested"),
            StopReason::Watchdog => f.write_str("watchdog"),
            StopReason::Failure(kind) => write!(f, "failure: {}", kind),
            StopReason::Break => f.write_str("break"),
        }
    }
}

/// Per-run options chosen by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(default)]
    pub monitor_target: MonitorTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    #[serde(flatten)]
    pub descriptor: ComponentDescriptor,
    pub state: ComponentState,
    pub order: u32,
    pub quarantined: bool,
}

/// Point-in-time view of a run-set, published on every change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSetSnapshot {
    pub id: u32,
    pub config: String,
    pub state: RunSetState,
    pub run_number: Option<u32>,
    pub subrun: u32,
    pub members: Vec<MemberStatus>,
    pub history: Vec<RunSetState>,
    pub tasks: Vec<TaskStatus>,
    pub last_summary: Option<RunSummary>,
}

/// Outcome of breaking up a run-set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakReport {
    pub returned: Vec<ComponentId>,
    pub quarantined: Vec<ComponentId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_text() {
        assert_eq!(StopReason::Watchdog.to_string(), "watchdog");
        assert_eq!(
            StopReason::Failure("BadState".into()).to_string(),
            "failure: BadState"
        );
        assert!(StopReason::Requested.is_success());
        assert!(!StopReason::Break.is_success());
    }

    #[test]
    fn test_start_rank_is_monotonic() {
        let path = [
            RunSetState::Wired,
            RunSetState::Connecting,
            RunSetState::Connected,
            RunSetState::Configuring,
            RunSetState::Ready,
            RunSetState::Starting,
            RunSetState::Running,
        ];
        assert!(path
            .windows(2)
            .all(|w| w[0].start_rank() < w[1].start_rank()));
        assert_eq!(RunSetState::Error.start_rank(), None);
    }
}
