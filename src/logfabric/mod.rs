//! Log fabric: datagram delivery of human log lines and live-monitoring
//! records.

pub mod logger;
pub mod receiver;
pub mod record;

pub use logger::{CncLogger, LogSinks, SinkAddr, FAILURE_VAR};
pub use receiver::{replay, LogReceiver};
pub use record::{encode_value, LogLevel, LogRecord, MoniType, Priority};
