//! Cloneable handle to a running run-set actor.

use super::actor::{RunSetActor, RunSetContext};
use super::builder::BuiltRunSet;
use super::messages::RunSetCommand;
use super::state::{BreakReport, RunOptions, RunSetSnapshot, RunSetState};
use crate::component::FlasherSetting;
use crate::error::{CncError, CncResult};
use crate::run_config::RunConfig;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

const COMMAND_QUEUE: usize = 16;

#[derive(Clone)]
pub struct RunSetHandle {
    id: u32,
    commands: mpsc::Sender<RunSetCommand>,
    snapshot: watch::Receiver<RunSetSnapshot>,
    cancel: CancellationToken,
}

impl RunSetHandle {
    /// Spawns the actor for a freshly built run-set.
    pub fn spawn(id: u32, config: RunConfig, built: BuiltRunSet, ctx: RunSetContext) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();
        let actor = RunSetActor::new(id, config, built, ctx, cancel.clone());
        let snapshot = actor.subscribe();
        tokio::spawn(actor.run(command_rx));
        Self {
            id,
            commands,
            snapshot,
            cancel,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> RunSetState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> RunSetSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watches every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RunSetSnapshot> {
        self.snapshot.clone()
    }

    pub async fn start_run(&self, run_number: u32, options: RunOptions) -> CncResult<RunSetState> {
        self.request(RunSetCommand::start_run(run_number, options))
            .await
    }

    pub async fn stop_run(&self) -> CncResult<RunSetState> {
        self.request(RunSetCommand::stop_run()).await
    }

    pub async fn subrun(&self, settings: Vec<FlasherSetting>) -> CncResult<u32> {
        self.request(RunSetCommand::subrun(settings)).await
    }

    /// Cancels any transition in flight, then resets and releases the
    /// members.
    pub async fn break_up(&self) -> CncResult<BreakReport> {
        self.cancel.cancel();
        self.request(RunSetCommand::break_up()).await
    }

    async fn request<T>(
        &self,
        (command, response): (RunSetCommand, oneshot::Receiver<CncResult<T>>),
    ) -> CncResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CncError::NotFound(self.id))?;
        response.await.map_err(|_| CncError::NotFound(self.id))?
    }
}
