//! UDP log receiver.
//!
//! Accepts both record schemas, keeps them in memory and optionally appends
//! them to a file. The coordinator runs one per run to collect the run log.

use super::logger::SinkAddr;
use super::record::LogRecord;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

pub struct LogReceiver {
    local_addr: SocketAddr,
    records: Arc<Mutex<Vec<LogRecord>>>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl LogReceiver {
    /// Binds `addr` and starts receiving. Records are appended to `file`
    /// when one is given.
    pub async fn bind(addr: &str, file: Option<PathBuf>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let mut out = match file {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => None,
        };

        let records = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();
        let task = {
            let records = Arc::clone(&records);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    let len = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = socket.recv_from(&mut buf) => match received {
                            Ok((len, _)) => len,
                            Err(e) => {
                                debug!("log receiver {}: {}", local_addr, e);
                                continue;
                            }
                        },
                    };
                    let text = String::from_utf8_lossy(&buf[..len]);
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        if let Some(file) = out.as_mut() {
                            append(file, line);
                        }
                        match line.parse::<LogRecord>() {
                            Ok(record) => records.lock().push(record),
                            Err(e) => warn!("unparseable log record on {}: {}", local_addr, e),
                        }
                    }
                }
            })
        };

        Ok(Self {
            local_addr,
            records,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address components should send to, advertised under `host`.
    pub fn sink_addr(&self, host: &str) -> SinkAddr {
        SinkAddr::new(host, self.local_addr.port())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.is_text())
            .map(|r| r.body().to_string())
            .collect()
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("log receiver task failed: {}", e);
        }
    }
}

fn append(file: &mut File, line: &str) {
    if let Err(e) = writeln!(file, "{}", line) {
        warn!("cannot write run log: {}", e);
    }
}

/// Reads a saved log back into records, skipping lines that do not parse.
pub fn replay(path: &Path) -> io::Result<Vec<LogRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Ok(record) = line.parse() {
            records.push(record);
        }
    }
    Ok(records)
}
