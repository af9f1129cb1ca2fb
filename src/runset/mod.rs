//! Run-sets: building them from the registry and driving them through a
//! run.

mod actor;
pub mod builder;
mod handle;
mod messages;
pub mod state;

pub use actor::{RunSetContext, HISTORY_LIMIT, RUN_LOG_FILE};
pub use builder::{BuiltRunSet, RunSetBuilder, WiringEdge, WiringPlan, WiringTarget};
pub use handle::RunSetHandle;
pub use messages::RunSetCommand;
pub use state::{BreakReport, MemberStatus, RunOptions, RunSetSnapshot, RunSetState, StopReason};
