//! Events broadcast by the coordinator and its run-sets.

use crate::component::{ComponentDescriptor, ComponentId};
use crate::runset::StopReason;
use crate::tasks::RunSummary;

/// Observable milestones. Delivery is best effort: a subscriber that falls
/// behind loses the oldest events.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    RunStarted {
        runset: u32,
        run_number: u32,
    },
    RunStopped {
        runset: u32,
        summary: RunSummary,
        reason: StopReason,
    },
    SubrunStarted {
        runset: u32,
        run_number: u32,
        subrun: u32,
    },
    /// Components that did not come back from a reset and need a restart.
    CycleRequest {
        runset: u32,
        components: Vec<ComponentDescriptor>,
    },
    Failure {
        runset: Option<u32>,
        kind: String,
        component: Option<ComponentId>,
        message: String,
    },
}

impl CoordinatorEvent {
    pub fn runset(&self) -> Option<u32> {
        match self {
            CoordinatorEvent::RunStarted { runset, .. }
            | CoordinatorEvent::RunStopped { runset, .. }
            | CoordinatorEvent::SubrunStarted { runset, .. }
            | CoordinatorEvent::CycleRequest { runset, .. } => Some(*runset),
            CoordinatorEvent::Failure { runset, .. } => *runset,
        }
    }
}
