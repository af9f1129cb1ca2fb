//! Commands accepted by a run-set actor.
//!
//! Every command carries a oneshot sender for its reply, so callers can
//! await the outcome of the transition they asked for.

use super::state::{BreakReport, RunOptions, RunSetState};
use crate::component::FlasherSetting;
use crate::error::CncResult;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum RunSetCommand {
    /// Start a run, connecting and configuring first if needed.
    StartRun {
        run_number: u32,
        options: RunOptions,
        response: oneshot::Sender<CncResult<RunSetState>>,
    },

    /// Stop the current run. A stopped run-set answers with its state.
    StopRun {
        response: oneshot::Sender<CncResult<RunSetState>>,
    },

    /// Begin the next subrun with the given flasher settings. An empty
    /// list turns the flashers off.
    Subrun {
        settings: Vec<FlasherSetting>,
        response: oneshot::Sender<CncResult<u32>>,
    },

    /// Reset every member and hand it back to the registry. The actor
    /// exits afterwards.
    Break {
        response: oneshot::Sender<CncResult<BreakReport>>,
    },
}

impl RunSetCommand {
    /// Helper to create a StartRun command
    pub fn start_run(
        run_number: u32,
        options: RunOptions,
    ) -> (Self, oneshot::Receiver<CncResult<RunSetState>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartRun {
                run_number,
                options,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StopRun command
    pub fn stop_run() -> (Self, oneshot::Receiver<CncResult<RunSetState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopRun { response: tx }, rx)
    }

    /// Helper to create a Subrun command
    pub fn subrun(settings: Vec<FlasherSetting>) -> (Self, oneshot::Receiver<CncResult<u32>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Subrun {
                settings,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Break command
    pub fn break_up() -> (Self, oneshot::Receiver<CncResult<BreakReport>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Break { response: tx }, rx)
    }
}
