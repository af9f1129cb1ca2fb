//! Command-and-control core of a data-acquisition cluster.
//!
//! The coordinator keeps a registry of worker components, assembles them
//! into run-sets wired by connector type, and drives each run-set through
//! connect, configure, start, stop and reset. While a run is active it
//! fires periodic monitoring tasks and routes run logs through the log
//! fabric.
//!
//! Layout:
//! - [`rpc`]: JSON-lines request/response transport.
//! - [`logfabric`]: text and monitor records over UDP sinks.
//! - [`registry`] and [`runset`]: component bookkeeping and run-set
//!   lifecycle.
//! - [`tasks`]: in-run monitoring.
//! - [`coordinator`]: the public service tying it together.

pub mod component;
pub mod config;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod log_capture;
pub mod logfabric;
pub mod logging;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod rpc;
pub mod run_config;
pub mod run_number;
pub mod runset;
pub mod tasks;

pub use coordinator::{Coordinator, CoordinatorEvent};
pub use error::{CncError, CncResult};
