//! The coordinator side of the log fabric.
//!
//! A [`CncLogger`] owns up to two datagram sinks. Text records go to the
//! primary (human) sink, monitor records to the secondary (live) sink.
//! Sends never block: a send that fails is dropped with a local warning.
//! IP literals are used as given; host names are looked up once per logger
//! and remembered.

use super::record::{LogLevel, LogRecord, Priority};
use crate::error::CncError;
use crate::log_capture::LogBuffer;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use tracing::{debug, error, info, warn};

/// Monitor variable carrying structured failure records.
pub const FAILURE_VAR: &str = "cncError";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SinkAddr {
    pub host: String,
    pub port: u16,
}

impl SinkAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The address of an IP literal host, found without any lookup.
    fn literal(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    fn lookup(&self) -> Option<SocketAddr> {
        match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                warn!("cannot resolve log sink {}: {}", self, e);
                None
            }
        }
    }
}

impl fmt::Display for SinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A primary/secondary sink pair. Either side may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSinks {
    #[serde(default)]
    pub primary: Option<SinkAddr>,
    #[serde(default)]
    pub secondary: Option<SinkAddr>,
}

impl LogSinks {
    pub fn new(primary: Option<SinkAddr>, secondary: Option<SinkAddr>) -> Self {
        Self { primary, secondary }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }
}

#[derive(Default)]
struct Installed {
    sinks: LogSinks,
    primary: Option<SocketAddr>,
    secondary: Option<SocketAddr>,
}

/// Host names already looked up, by sink.
#[derive(Default)]
struct Resolver {
    known: Mutex<HashMap<SinkAddr, SocketAddr>>,
}

impl Resolver {
    fn cached(&self, sink: &SinkAddr) -> Option<SocketAddr> {
        sink.literal()
            .or_else(|| self.known.lock().get(sink).copied())
    }

    fn resolve(&self, sink: &SinkAddr) -> Option<SocketAddr> {
        if let Some(addr) = self.cached(sink) {
            return Some(addr);
        }
        let addr = sink.lookup()?;
        self.known.lock().insert(sink.clone(), addr);
        Some(addr)
    }

    async fn resolve_async(&self, sink: &SinkAddr) {
        if self.cached(sink).is_some() {
            return;
        }
        match tokio::net::lookup_host((sink.host.as_str(), sink.port)).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    self.known.lock().insert(sink.clone(), addr);
                }
            }
            Err(e) => warn!("cannot resolve log sink {}: {}", sink, e),
        }
    }

    fn install(&self, sinks: LogSinks) -> Installed {
        let primary = sinks.primary.as_ref().and_then(|s| self.resolve(s));
        let secondary = sinks.secondary.as_ref().and_then(|s| self.resolve(s));
        Installed {
            sinks,
            primary,
            secondary,
        }
    }
}

#[derive(Default)]
struct SinkTable {
    current: Installed,
    default: Option<LogSinks>,
    fallback: Option<LogSinks>,
}

pub struct CncLogger {
    service: String,
    socket: Option<UdpSocket>,
    table: Mutex<SinkTable>,
    resolver: Resolver,
    buffer: LogBuffer,
}

impl CncLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_buffer(service, LogBuffer::new())
    }

    pub fn with_buffer(service: impl Into<String>, buffer: LogBuffer) -> Self {
        let socket = match UdpSocket::bind("0.0.0.0:0").and_then(|s| {
            s.set_nonblocking(true)?;
            Ok(s)
        }) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("log fabric socket unavailable, logging locally only: {}", e);
                None
            }
        };
        Self {
            service: service.into(),
            socket,
            table: Mutex::new(SinkTable::default()),
            resolver: Resolver::default(),
            buffer,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    /// Sinks records are currently routed to.
    pub fn current(&self) -> LogSinks {
        self.table.lock().current.sinks.clone()
    }

    pub fn default_sinks(&self) -> Option<LogSinks> {
        self.table.lock().default.clone()
    }

    /// Looks up the host names in `sinks` without blocking, so installing
    /// them later finds the addresses already known.
    pub async fn resolve_ahead(&self, sinks: &LogSinks) {
        for sink in [&sinks.primary, &sinks.secondary].into_iter().flatten() {
            self.resolver.resolve_async(sink).await;
        }
    }

    /// Installs `sinks` and remembers them as the default to fall back to.
    pub fn set_default(&self, sinks: LogSinks) {
        let installed = self.resolver.install(sinks.clone());
        let mut table = self.table.lock();
        table.default = Some(sinks);
        table.current = installed;
    }

    /// Installs `sinks` for the duration of a run. The default pair becomes
    /// the fallback restored by [`close`](Self::close).
    pub fn open(&self, sinks: LogSinks) {
        let installed = self.resolver.install(sinks);
        let mut table = self.table.lock();
        table.fallback = table.default.clone();
        table.current = installed;
    }

    /// Reverts to the fallback pair, announcing the switch on the restored
    /// primary sink. Without a fallback both sinks are cleared.
    pub fn close(&self) {
        let restored = {
            let mut table = self.table.lock();
            match table.fallback.take() {
                Some(fallback) => {
                    table.current = self.resolver.install(fallback.clone());
                    Some(fallback)
                }
                None => {
                    table.current = Installed::default();
                    None
                }
            }
        };
        if let Some(primary) = restored.and_then(|sinks| sinks.primary) {
            self.log(LogLevel::Info, format!("Reset log to {}", primary));
        }
    }

    /// Forgets every sink, including the default.
    pub fn reset(&self) {
        *self.table.lock() = SinkTable::default();
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(target: "daq_cnc::fabric", "{}", message),
            LogLevel::Info => info!(target: "daq_cnc::fabric", "{}", message),
            LogLevel::Warn => warn!(target: "daq_cnc::fabric", "{}", message),
            LogLevel::Error => error!(target: "daq_cnc::fabric", "{}", message),
        }
        self.write(LogRecord::text(level, message));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Publishes a monitor value on the secondary sink.
    pub fn send_moni(&self, var: &str, value: &Value, priority: Priority) {
        debug!(target: "daq_cnc::fabric", "{} = {}", var, value);
        self.write(LogRecord::monitor(&self.service, var, value, priority));
    }

    /// Emits the structured record for a failure: a human line plus one
    /// json record under [`FAILURE_VAR`].
    pub fn failure(&self, err: &CncError) {
        self.error(err.to_string());
        let record = json!({
            "kind": err.kind(),
            "component": err.component(),
            "message": err.to_string(),
        });
        self.send_moni(FAILURE_VAR, &record, Priority::Its);
    }

    /// Routes a record to whichever sink matches its schema.
    pub fn write(&self, record: LogRecord) {
        let line = record.to_string();
        let (target, dest) = {
            let table = self.table.lock();
            if record.is_text() {
                ("primary", table.current.primary)
            } else {
                ("secondary", table.current.secondary)
            }
        };

        match (dest, &self.socket) {
            (Some(addr), Some(socket)) => {
                if let Err(e) = socket.send_to(line.as_bytes(), addr) {
                    warn!("dropped log record for {}: {}", addr, e);
                }
                self.buffer.push(target, record);
            }
            _ => self.buffer.push("local", record),
        }
    }
}
